//! Router-style relay: routers push frames to a hub that fans them out.

use super::{RelayLink, RelayTopology, RelayTransport};
use crate::error::{BrokerError, Result};
use crate::types::NodeId;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

type Routers = Arc<RwLock<HashMap<NodeId, Sender<Vec<u8>>>>>;

/// Central fan-out point for router nodes.
///
/// Each attached router sends its frames upstream to the hub; the hub thread
/// forwards every frame to all other attached routers. After [`shutdown`],
/// routers can no longer reach each other but keep serving local traffic.
///
/// [`shutdown`]: RouterHub::shutdown
pub struct RouterHub {
    routers: Routers,
    upstream: Mutex<Option<Sender<(NodeId, Vec<u8>)>>>,
    shutdown: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RouterHub {
    pub fn start() -> Self {
        let routers: Routers = Arc::default();
        let (upstream_tx, upstream_rx) = unbounded::<(NodeId, Vec<u8>)>();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let fanout = routers.clone();
        let worker = thread::Builder::new()
            .name("channelcast-router-hub".to_string())
            .spawn(move || fan_out_loop(fanout, upstream_rx, shutdown_rx))
            .expect("failed to spawn channelcast router hub");

        info!("router hub started");
        Self {
            routers,
            upstream: Mutex::new(Some(upstream_tx)),
            shutdown: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Attach a router. Frames it sends reach every other attached router.
    pub fn attach(&self, node: NodeId) -> RelayLink {
        let (tx, rx) = unbounded();
        self.routers.write().insert(node, tx);
        debug!(%node, "router attached to hub");

        // A router attached after shutdown gets a closed upstream and fails
        // every send.
        let upstream = self
            .upstream
            .lock()
            .clone()
            .unwrap_or_else(|| bounded(0).0);
        RelayLink {
            transport: Box::new(HubTransport {
                node,
                upstream,
                routers: self.routers.clone(),
            }),
            inbound: rx,
        }
    }

    pub fn detach(&self, node: NodeId) {
        if self.routers.write().remove(&node).is_some() {
            debug!(%node, "router detached from hub");
        }
    }

    pub fn routers(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.routers.read().keys().copied().collect();
        nodes.sort();
        nodes
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.lock().is_some()
    }

    /// Stop fanning out. Frames already queued at the hub are discarded.
    pub fn shutdown(&self) {
        self.upstream.lock().take();
        if self.shutdown.lock().take().is_none() {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        info!("router hub stopped");
    }
}

impl RelayTopology for RouterHub {
    fn connect(&self, node: NodeId) -> RelayLink {
        self.attach(node)
    }
}

impl Drop for RouterHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fan_out_loop(
    routers: Routers,
    upstream: Receiver<(NodeId, Vec<u8>)>,
    shutdown: Receiver<()>,
) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(upstream) -> msg => {
                let Ok((origin, frame)) = msg else { break };
                let routers = routers.read();
                for (node, tx) in routers.iter() {
                    if *node != origin && tx.send(frame.clone()).is_err() {
                        warn!(%node, "router unreachable from hub");
                    }
                }
            }
        }
    }
}

struct HubTransport {
    node: NodeId,
    upstream: Sender<(NodeId, Vec<u8>)>,
    routers: Routers,
}

impl RelayTransport for HubTransport {
    fn broadcast(&self, frame: &[u8]) -> Result<()> {
        self.upstream
            .send((self.node, frame.to_vec()))
            .map_err(|_| BrokerError::Transport("router hub unavailable".into()))
    }

    fn close(&self) {
        self.routers.write().remove(&self.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_hub_fans_out_to_other_routers() {
        let hub = RouterHub::start();
        let a = hub.attach(NodeId(1));
        let b = hub.attach(NodeId(2));
        let c = hub.attach(NodeId(3));

        a.transport.broadcast(b"frame").unwrap();
        assert_eq!(b.inbound.recv_timeout(Duration::from_secs(1)).unwrap(), b"frame");
        assert_eq!(c.inbound.recv_timeout(Duration::from_secs(1)).unwrap(), b"frame");
        assert!(a.inbound.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_shutdown_stops_fan_out() {
        let hub = RouterHub::start();
        let a = hub.attach(NodeId(1));
        let _b = hub.attach(NodeId(2));
        assert!(hub.is_running());

        hub.shutdown();
        assert!(!hub.is_running());
        assert!(a.transport.broadcast(b"frame").is_err());

        let late = hub.attach(NodeId(3));
        assert!(late.transport.broadcast(b"frame").is_err());
    }

    #[test]
    fn test_detach() {
        let hub = RouterHub::start();
        let a = hub.attach(NodeId(1));
        let b = hub.attach(NodeId(2));
        hub.detach(NodeId(2));
        assert_eq!(hub.routers(), vec![NodeId(1)]);

        a.transport.broadcast(b"frame").unwrap();
        assert!(b.inbound.recv_timeout(Duration::from_millis(50)).is_err());
        a.transport.close();
        assert!(hub.routers().is_empty());
    }
}
