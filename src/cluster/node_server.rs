//! Uniform handle to a node
//!
//! A [`NodeServer`] binds one [`NetworkClusterNode`] identity to at most one
//! live channel and to the latest liveness snapshots. The local node is always
//! connected and available; a remote node is connected while it holds a
//! channel and available once it also reported a snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::node::{NetworkClusterNode, NetworkClusterNodeInfoSnapshot};
use crate::error::{OrchestrationError, Result};
use crate::network::{NetworkChannel, Packet, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeServerKind {
    /// This process
    Local,
    /// Another node, reached through a channel
    Remote,
}

#[derive(Default)]
struct Liveness {
    current: Option<NetworkClusterNodeInfoSnapshot>,
    last: Option<NetworkClusterNodeInfoSnapshot>,
    received_at: Option<Instant>,
}

pub struct NodeServer {
    kind: NodeServerKind,
    node: RwLock<NetworkClusterNode>,
    channel: RwLock<Option<Arc<dyn NetworkChannel>>>,
    liveness: RwLock<Liveness>,
}

impl NodeServer {
    pub fn local(node: NetworkClusterNode, snapshot: NetworkClusterNodeInfoSnapshot) -> Self {
        Self {
            kind: NodeServerKind::Local,
            node: RwLock::new(node),
            channel: RwLock::new(None),
            liveness: RwLock::new(Liveness {
                current: Some(snapshot),
                last: None,
                received_at: Some(Instant::now()),
            }),
        }
    }

    pub fn remote(node: NetworkClusterNode) -> Self {
        Self {
            kind: NodeServerKind::Remote,
            node: RwLock::new(node),
            channel: RwLock::new(None),
            liveness: RwLock::new(Liveness::default()),
        }
    }

    pub fn kind(&self) -> NodeServerKind {
        self.kind
    }

    pub fn is_local(&self) -> bool {
        self.kind == NodeServerKind::Local
    }

    pub fn unique_id(&self) -> String {
        self.node.read().unique_id.clone()
    }

    pub fn node(&self) -> NetworkClusterNode {
        self.node.read().clone()
    }

    /// Replace the identity record, keeping channel and snapshots
    pub fn set_node(&self, node: NetworkClusterNode) {
        *self.node.write() = node;
    }

    pub fn channel(&self) -> Option<Arc<dyn NetworkChannel>> {
        self.channel.read().clone()
    }

    /// Attach a channel if none is attached yet
    ///
    /// Returns `false` when another channel already owns this node.
    pub fn try_attach_channel(&self, channel: Arc<dyn NetworkChannel>) -> bool {
        if self.is_local() {
            return false;
        }
        let mut slot = self.channel.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(channel);
        true
    }

    /// Detach the channel, but only if it is still `channel_id`
    ///
    /// A late close notification for an already replaced channel finds a
    /// different id and changes nothing. The current snapshot moves to the
    /// previous slot so the node is unavailable until it reports again.
    pub fn detach_channel_if(&self, channel_id: Uuid) -> Option<Arc<dyn NetworkChannel>> {
        let detached = {
            let mut slot = self.channel.write();
            match slot.as_ref() {
                Some(current) if current.channel_id() == channel_id => slot.take(),
                _ => None,
            }
        };

        if detached.is_some() {
            let mut liveness = self.liveness.write();
            if let Some(current) = liveness.current.take() {
                liveness.last = Some(current);
            }
            liveness.received_at = None;
        }
        detached
    }

    pub fn is_connected(&self) -> bool {
        match self.kind {
            NodeServerKind::Local => true,
            NodeServerKind::Remote => self.channel.read().is_some(),
        }
    }

    /// Connected and reported at least one snapshot
    pub fn is_available(&self) -> bool {
        match self.kind {
            NodeServerKind::Local => true,
            NodeServerKind::Remote => {
                self.is_connected() && self.liveness.read().current.is_some()
            }
        }
    }

    pub fn node_info_snapshot(&self) -> Option<NetworkClusterNodeInfoSnapshot> {
        self.liveness.read().current.clone()
    }

    pub fn last_node_info_snapshot(&self) -> Option<NetworkClusterNodeInfoSnapshot> {
        self.liveness.read().last.clone()
    }

    /// Store a fresh snapshot; the current one becomes the previous one
    pub fn update_node_info_snapshot(&self, snapshot: NetworkClusterNodeInfoSnapshot) {
        let mut liveness = self.liveness.write();
        liveness.last = liveness.current.replace(snapshot);
        liveness.received_at = Some(Instant::now());
    }

    pub fn startup_millis(&self) -> Option<i64> {
        self.liveness.read().current.as_ref().map(|s| s.startup_millis)
    }

    /// A remote node is stale when its last snapshot is older than `timeout`
    pub fn is_stale(&self, timeout: Duration) -> bool {
        match self.kind {
            NodeServerKind::Local => false,
            NodeServerKind::Remote => match self.liveness.read().received_at {
                Some(at) => at.elapsed() > timeout,
                None => false,
            },
        }
    }

    fn remote_channel(&self) -> Result<Arc<dyn NetworkChannel>> {
        match self.kind {
            // The local node is never reached through a channel
            NodeServerKind::Local => Err(OrchestrationError::Unavailable(self.unique_id())),
            NodeServerKind::Remote => self
                .channel()
                .ok_or_else(|| OrchestrationError::Unavailable(self.unique_id())),
        }
    }

    /// Send a packet and wait up to `timeout` for its reply
    pub async fn query(&self, packet: Packet, timeout: Duration) -> Result<Reply> {
        let channel = self.remote_channel()?;
        let node = self.unique_id();
        debug!("Query {} -> {}", packet.kind(), node);

        match tokio::time::timeout(timeout, channel.send_query(packet)).await {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(OrchestrationError::Timeout { node, timeout }),
        }
    }

    /// Fire a packet without waiting for a result
    pub async fn send_packet(&self, packet: Packet, timeout: Duration) -> Result<()> {
        let channel = self.remote_channel()?;
        match tokio::time::timeout(timeout, channel.send_packet(packet)).await {
            Ok(sent) => Ok(sent?),
            Err(_) => Err(OrchestrationError::Timeout {
                node: self.unique_id(),
                timeout,
            }),
        }
    }
}

impl std::fmt::Debug for NodeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServer")
            .field("kind", &self.kind)
            .field("unique_id", &self.unique_id())
            .field("connected", &self.is_connected())
            .field("available", &self.is_available())
            .finish()
    }
}
