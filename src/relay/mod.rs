//! Cross-node message relay.
//!
//! Every publish accepted by a broker is wrapped in a [`RelayFrame`] and handed
//! to the node's [`RelayTransport`]. Frames arriving from peers are decoded on a
//! worker thread and routed through the same [`ChannelTable`] used for local
//! publishes, so filters and projections apply identically.
//!
//! Delivery across nodes is eventual and unordered between origins. Relay
//! failures are logged and counted; they never fail a publish.
//!
//! Two in-process topologies are provided:
//! - [`ReplicaSetMesh`]: each member sends to every other member directly.
//! - [`RouterHub`]: routers push to a hub that fans frames out to every other
//!   attached router.

mod frame;
mod hub;
mod mesh;

pub use frame::{decode_frame, encode_frame, RelayFrame};
pub use hub::RouterHub;
pub use mesh::ReplicaSetMesh;

use crate::channels::ChannelTable;
use crate::error::Result;
use crate::types::{incarnation, Document, NodeId};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Outbound half of a node's connection to its relay group.
pub trait RelayTransport: Send + Sync {
    /// Send an encoded frame to every peer.
    fn broadcast(&self, frame: &[u8]) -> Result<()>;

    /// Leave the group. Called once when the relay shuts down.
    fn close(&self) {}
}

/// A node's connection to its relay group.
pub struct RelayLink {
    pub transport: Box<dyn RelayTransport>,
    /// Encoded frames sent by peers.
    pub inbound: Receiver<Vec<u8>>,
}

/// A group of nodes that relay publishes to one another.
pub trait RelayTopology {
    fn connect(&self, node: NodeId) -> RelayLink;
}

#[derive(Debug, Default)]
struct RelayCounters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

/// Forwards local publishes to peers and routes peer publishes locally.
pub struct ClusterRelay {
    node: NodeId,
    incarnation: u64,
    transport: Box<dyn RelayTransport>,
    sequence: AtomicU64,
    counters: Arc<RelayCounters>,
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ClusterRelay {
    /// Start relaying for `node`. Inbound frames are routed into `table`.
    pub fn start(
        node: NodeId,
        link: RelayLink,
        table: Arc<ChannelTable>,
        dedup_capacity: usize,
    ) -> Self {
        let RelayLink { transport, inbound } = link;
        let counters = Arc::new(RelayCounters::default());
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let mut receiver = FrameReceiver {
            node,
            table,
            counters: counters.clone(),
            seen: LruCache::new(NonZeroUsize::new(dedup_capacity.max(1)).unwrap_or(NonZeroUsize::MIN)),
        };
        let worker = thread::Builder::new()
            .name(format!("channelcast-relay-{node}"))
            .spawn(move || loop {
                select! {
                    recv(shutdown_rx) -> _ => break,
                    recv(inbound) -> bytes => match bytes {
                        Ok(bytes) => receiver.handle(&bytes),
                        Err(_) => {
                            debug!(%node, "relay inbound closed");
                            break;
                        }
                    },
                }
            })
            .expect("failed to spawn channelcast relay worker");

        let incarnation = incarnation();
        debug!(%node, incarnation, "relay started");
        Self {
            node,
            incarnation,
            transport,
            sequence: AtomicU64::new(0),
            counters,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Forward a local publish to every peer.
    pub fn forward(&self, channel: &str, message: &Document) {
        let frame = RelayFrame {
            origin: self.node,
            incarnation: self.incarnation,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            channel: channel.to_string(),
            message: message.clone(),
        };
        let sent = encode_frame(&frame).and_then(|bytes| self.transport.broadcast(&bytes));
        match sent {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(node = %self.node, channel, error = %e, "relay send failed");
            }
        }
    }

    /// Frames handed to the transport.
    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Peer frames routed locally.
    pub fn received(&self) -> u64 {
        self.counters.received.load(Ordering::Relaxed)
    }

    /// Frames lost to send failures, corruption, or duplication.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for ClusterRelay {
    fn drop(&mut self) {
        self.transport.close();
        self.shutdown.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        debug!(node = %self.node, "relay stopped");
    }
}

/// Worker-side state for inbound frames.
struct FrameReceiver {
    node: NodeId,
    table: Arc<ChannelTable>,
    counters: Arc<RelayCounters>,
    seen: LruCache<(NodeId, u64, u64), ()>,
}

impl FrameReceiver {
    fn handle(&mut self, bytes: &[u8]) {
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(node = %self.node, error = %e, "dropping undecodable relay frame");
                return;
            }
        };
        if frame.origin == self.node {
            return;
        }
        let key = (frame.origin, frame.incarnation, frame.sequence);
        if self.seen.put(key, ()).is_some() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(
                origin = %frame.origin,
                incarnation = frame.incarnation,
                sequence = frame.sequence,
                "duplicate relay frame"
            );
            return;
        }
        if !self.table.has_subscribers(&frame.channel) {
            trace!(channel = %frame.channel, "no local interest");
            return;
        }
        self.table.route(&frame.channel, &frame.message);
        self.counters.received.fetch_add(1, Ordering::Relaxed);
    }
}
