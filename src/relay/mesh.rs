//! Replica-set style relay: every member sends to every other member.

use super::{RelayLink, RelayTopology, RelayTransport};
use crate::error::{BrokerError, Result};
use crate::types::NodeId;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

type Members = Arc<RwLock<HashMap<NodeId, Sender<Vec<u8>>>>>;

/// Full mesh of relay members.
///
/// Membership changes take effect for the next frame sent; a member that
/// disappears without leaving is pruned on the first failed send.
#[derive(Clone, Default)]
pub struct ReplicaSetMesh {
    members: Members,
}

impl ReplicaSetMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Rejoining replaces the previous link.
    pub fn join(&self, node: NodeId) -> RelayLink {
        let (tx, rx) = unbounded();
        self.members.write().insert(node, tx);
        info!(%node, "member joined relay mesh");
        RelayLink {
            transport: Box::new(MeshTransport {
                node,
                members: self.members.clone(),
            }),
            inbound: rx,
        }
    }

    pub fn leave(&self, node: NodeId) {
        if self.members.write().remove(&node).is_some() {
            info!(%node, "member left relay mesh");
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.members.read().keys().copied().collect();
        nodes.sort();
        nodes
    }
}

impl RelayTopology for ReplicaSetMesh {
    fn connect(&self, node: NodeId) -> RelayLink {
        self.join(node)
    }
}

struct MeshTransport {
    node: NodeId,
    members: Members,
}

impl RelayTransport for MeshTransport {
    fn broadcast(&self, frame: &[u8]) -> Result<()> {
        let mut unreachable = Vec::new();
        {
            let members = self.members.read();
            for (peer, tx) in members.iter() {
                if *peer != self.node && tx.send(frame.to_vec()).is_err() {
                    unreachable.push((*peer, tx.clone()));
                }
            }
        }
        if unreachable.is_empty() {
            return Ok(());
        }

        let mut members = self.members.write();
        for (peer, failed) in &unreachable {
            // Only prune if the link was not replaced by a rejoin meanwhile.
            if members.get(peer).is_some_and(|tx| tx.same_channel(failed)) {
                members.remove(peer);
                warn!(node = %self.node, %peer, "pruned unreachable mesh member");
            }
        }
        Err(BrokerError::Transport(format!(
            "{} mesh member(s) unreachable",
            unreachable.len()
        )))
    }

    fn close(&self) {
        let mut members = self.members.write();
        if members.remove(&self.node).is_some() {
            info!(node = %self.node, "member left relay mesh");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_broadcast_reaches_every_other_member() {
        let mesh = ReplicaSetMesh::new();
        let a = mesh.join(NodeId(1));
        let b = mesh.join(NodeId(2));
        let c = mesh.join(NodeId(3));
        assert_eq!(mesh.members(), vec![NodeId(1), NodeId(2), NodeId(3)]);

        a.transport.broadcast(b"frame").unwrap();
        assert!(a.inbound.try_recv().is_err());
        assert_eq!(b.inbound.recv_timeout(Duration::from_secs(1)).unwrap(), b"frame");
        assert_eq!(c.inbound.recv_timeout(Duration::from_secs(1)).unwrap(), b"frame");
    }

    #[test]
    fn test_leave_and_prune() {
        let mesh = ReplicaSetMesh::new();
        let a = mesh.join(NodeId(1));
        let b = mesh.join(NodeId(2));
        let c = mesh.join(NodeId(3));

        mesh.leave(NodeId(2));
        a.transport.broadcast(b"x").unwrap();
        assert!(b.inbound.try_recv().is_err());
        assert!(c.inbound.try_recv().is_ok());

        drop(c);
        assert!(a.transport.broadcast(b"y").is_err());
        assert_eq!(mesh.members(), vec![NodeId(1)]);

        a.transport.close();
        assert!(mesh.members().is_empty());
    }
}
