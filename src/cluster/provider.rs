//! Cluster-keyed node registry and head election

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::node::{NetworkCluster, NetworkClusterNode, NetworkClusterNodeInfoSnapshot};
use super::node_server::NodeServer;
use crate::network::{NetworkChannel, Packet};
use crate::service::ServiceTemplate;

/// Reasons a channel is refused for a node id
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Node {0} is not a member of this cluster")]
    UnknownNode(String),

    #[error("Node {0} is this node")]
    LocalNode(String),

    #[error("Node {0} is already connected")]
    AlreadyConnected(String),

    #[error("Cluster id mismatch: expected {expected}, got {actual}")]
    ClusterMismatch { expected: Uuid, actual: Uuid },
}

/// Outcome of [`NodeServerProvider::set_cluster_servers`]
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub added: Vec<String>,
    /// Entries dropped from the registry; connected ones still need cleanup
    pub removed: Vec<Arc<NodeServer>>,
}

impl ReconcileOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Registry of every node known to this process
pub struct NodeServerProvider {
    local: Arc<NodeServer>,
    cluster_id: RwLock<Uuid>,
    servers: DashMap<String, Arc<NodeServer>>,
    head: RwLock<Arc<NodeServer>>,
    remote_timeout: Duration,
}

impl NodeServerProvider {
    pub fn new(
        local_node: NetworkClusterNode,
        local_snapshot: NetworkClusterNodeInfoSnapshot,
        remote_timeout: Duration,
    ) -> Self {
        let local = Arc::new(NodeServer::local(local_node, local_snapshot));
        Self {
            head: RwLock::new(local.clone()),
            local,
            cluster_id: RwLock::new(Uuid::nil()),
            servers: DashMap::new(),
            remote_timeout,
        }
    }

    pub fn local_node(&self) -> Arc<NodeServer> {
        self.local.clone()
    }

    pub fn local_id(&self) -> String {
        self.local.unique_id()
    }

    pub fn cluster_id(&self) -> Uuid {
        *self.cluster_id.read()
    }

    pub fn remote_timeout(&self) -> Duration {
        self.remote_timeout
    }

    /// Current membership, local node first
    pub fn node_servers(&self) -> Vec<Arc<NodeServer>> {
        let mut servers = vec![self.local.clone()];
        servers.extend(self.remote_node_servers());
        servers
    }

    pub fn remote_node_servers(&self) -> Vec<Arc<NodeServer>> {
        let mut servers: Vec<_> = self.servers.iter().map(|e| e.value().clone()).collect();
        servers.sort_by_key(|s| s.unique_id());
        servers
    }

    pub fn node_server(&self, unique_id: &str) -> Option<Arc<NodeServer>> {
        if unique_id == self.local_id() {
            return Some(self.local.clone());
        }
        self.servers.get(unique_id).map(|e| e.value().clone())
    }

    /// Look up the node that owns an attached channel
    pub fn node_server_by_channel(&self, channel_id: Uuid) -> Option<Arc<NodeServer>> {
        self.servers
            .iter()
            .find(|e| {
                e.value()
                    .channel()
                    .is_some_and(|c| c.channel_id() == channel_id)
            })
            .map(|e| e.value().clone())
    }

    pub fn head_node(&self) -> Arc<NodeServer> {
        self.head.read().clone()
    }

    /// Recompute the head node
    ///
    /// Among the local node and every available remote node, the smallest
    /// startup timestamp wins; equal timestamps go to the smaller node id.
    pub fn refresh_head_node(&self) -> Arc<NodeServer> {
        let mut head = self.local.clone();
        let mut head_key = (
            self.local.startup_millis().unwrap_or(i64::MAX),
            self.local.unique_id(),
        );

        for server in self.servers.iter().map(|e| e.value().clone()) {
            if !server.is_available() {
                continue;
            }
            let Some(startup) = server.startup_millis() else {
                continue;
            };
            let key = (startup, server.unique_id());
            if key < head_key {
                head_key = key;
                head = server;
            }
        }

        let previous = std::mem::replace(&mut *self.head.write(), head.clone());
        if previous.unique_id() != head.unique_id() {
            info!(
                "Head node changed: {} -> {}",
                previous.unique_id(),
                head.unique_id()
            );
        }
        head
    }

    /// Reconcile the registry against a cluster descriptor
    ///
    /// Known ids keep their channel and get the new identity record, new ids
    /// are added disconnected, missing ids are removed. Calling it twice with
    /// the same descriptor changes nothing the second time.
    pub fn set_cluster_servers(&self, cluster: &NetworkCluster) -> ReconcileOutcome {
        *self.cluster_id.write() = cluster.cluster_id;
        let local_id = self.local_id();
        let mut outcome = ReconcileOutcome::default();

        for node in &cluster.nodes {
            if node.unique_id == local_id {
                self.local.set_node(node.clone());
                continue;
            }
            self.servers
                .entry(node.unique_id.clone())
                .and_modify(|server| server.set_node(node.clone()))
                .or_insert_with(|| {
                    outcome.added.push(node.unique_id.clone());
                    Arc::new(NodeServer::remote(node.clone()))
                });
        }

        self.servers.retain(|id, server| {
            let keep = cluster.node(id).is_some();
            if !keep {
                outcome.removed.push(server.clone());
            }
            keep
        });

        if !outcome.is_unchanged() {
            info!(
                "Cluster reconfigured: added={:?}, removed={:?}",
                outcome.added,
                outcome
                    .removed
                    .iter()
                    .map(|s| s.unique_id())
                    .collect::<Vec<_>>()
            );
        }

        self.refresh_head_node();
        outcome
    }

    /// Admit a channel for a node id
    ///
    /// Check and attach happen under the entry's channel lock, so two
    /// concurrent attempts for the same id cannot both succeed.
    pub fn authorize_channel(
        &self,
        unique_id: &str,
        channel: Arc<dyn NetworkChannel>,
    ) -> Result<Arc<NodeServer>, AdmissionError> {
        if unique_id == self.local_id() {
            return Err(AdmissionError::LocalNode(unique_id.to_string()));
        }
        let server = self
            .servers
            .get(unique_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| AdmissionError::UnknownNode(unique_id.to_string()))?;

        if !server.try_attach_channel(channel) {
            warn!("Rejected second channel for node {}", unique_id);
            return Err(AdmissionError::AlreadyConnected(unique_id.to_string()));
        }

        info!("Node {} connected", unique_id);
        self.refresh_head_node();
        Ok(server)
    }

    /// Check a peer's cluster id against ours
    pub fn verify_cluster(&self, cluster_id: Uuid) -> Result<(), AdmissionError> {
        let expected = self.cluster_id();
        if expected != cluster_id {
            return Err(AdmissionError::ClusterMismatch {
                expected,
                actual: cluster_id,
            });
        }
        Ok(())
    }

    /// Broadcast a packet to every connected remote node
    ///
    /// Returns how many nodes received it.
    pub async fn send_packet(&self, packet: Packet) -> usize {
        self.broadcast(packet, None).await
    }

    /// Broadcast a packet to every connected remote node except `except`
    pub async fn send_packet_except(&self, except: &str, packet: Packet) -> usize {
        self.broadcast(packet, Some(except)).await
    }

    async fn broadcast(&self, packet: Packet, except: Option<&str>) -> usize {
        let targets: Vec<Arc<NodeServer>> = self
            .servers
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| s.is_connected() && Some(s.unique_id().as_str()) != except)
            .collect();

        let sends = targets.iter().map(|server| {
            let packet = packet.clone();
            async move {
                match server.send_packet(packet, self.remote_timeout).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Broadcast to {} failed: {}", server.unique_id(), e);
                        false
                    }
                }
            }
        });

        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    /// Ship a template archive to every connected node
    pub async fn deploy_template_in_cluster(
        &self,
        template: ServiceTemplate,
        archive: Vec<u8>,
    ) -> usize {
        info!(
            "Deploying template {} ({} bytes) in cluster",
            template,
            archive.len()
        );
        self.send_packet(Packet::DeployTemplate { template, archive })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeChannel;

    fn node(id: &str) -> NetworkClusterNode {
        NetworkClusterNode::new(id, vec![])
    }

    fn snapshot(id: &str, startup: i64) -> NetworkClusterNodeInfoSnapshot {
        NetworkClusterNodeInfoSnapshot::new(node(id), startup, 1024)
    }

    fn provider(local_startup: i64) -> NodeServerProvider {
        NodeServerProvider::new(
            node("C"),
            snapshot("C", local_startup),
            Duration::from_secs(5),
        )
    }

    fn cluster(ids: &[&str]) -> NetworkCluster {
        NetworkCluster::new(Uuid::nil(), ids.iter().map(|id| node(id)).collect())
    }

    fn connect(provider: &NodeServerProvider, id: &str, startup: i64) -> Arc<FakeChannel> {
        let channel = FakeChannel::new();
        let server = provider.authorize_channel(id, channel.clone()).unwrap();
        server.update_node_info_snapshot(snapshot(id, startup));
        channel
    }

    #[test]
    fn test_head_defaults_to_local() {
        let provider = provider(200);
        provider.set_cluster_servers(&cluster(&["A", "B", "C"]));

        assert_eq!(provider.refresh_head_node().unique_id(), "C");
    }

    #[test]
    fn test_head_smallest_startup() {
        let provider = provider(200);
        provider.set_cluster_servers(&cluster(&["A", "B", "C"]));
        connect(&provider, "A", 100);
        let b = connect(&provider, "B", 50);

        assert_eq!(provider.refresh_head_node().unique_id(), "B");

        provider
            .node_server("B")
            .unwrap()
            .detach_channel_if(b.channel_id());
        assert_eq!(provider.refresh_head_node().unique_id(), "A");
    }

    #[test]
    fn test_head_tie_breaks_on_id() {
        let provider = provider(100);
        provider.set_cluster_servers(&cluster(&["A", "C"]));
        connect(&provider, "A", 100);

        assert_eq!(provider.refresh_head_node().unique_id(), "A");
    }

    #[test]
    fn test_connected_without_snapshot_is_not_head() {
        let provider = provider(200);
        provider.set_cluster_servers(&cluster(&["A"]));
        provider.authorize_channel("A", FakeChannel::new()).unwrap();

        assert_eq!(provider.refresh_head_node().unique_id(), "C");
    }

    #[test]
    fn test_reconcile_idempotent() {
        let provider = provider(200);
        let descriptor = cluster(&["A", "B", "C"]);

        let first = provider.set_cluster_servers(&descriptor);
        assert_eq!(first.added, vec!["A".to_string(), "B".to_string()]);

        let second = provider.set_cluster_servers(&descriptor);
        assert!(second.is_unchanged());
        assert_eq!(provider.node_servers().len(), 3);
    }

    #[test]
    fn test_reconcile_preserves_channel() {
        let provider = provider(200);
        provider.set_cluster_servers(&cluster(&["A", "B"]));
        connect(&provider, "A", 100);

        let mut moved = cluster(&["B", "D"]);
        moved.nodes.push(NetworkClusterNode::new(
            "A",
            vec![crate::cluster::HostAndPort::new("10.0.0.9", 1410)],
        ));
        let outcome = provider.set_cluster_servers(&moved);

        assert_eq!(outcome.added, vec!["D".to_string()]);
        assert!(outcome.removed.is_empty());
        let a = provider.node_server("A").unwrap();
        assert!(a.is_connected());
        assert_eq!(a.node().listeners[0].host, "10.0.0.9");
    }

    #[test]
    fn test_reconcile_removes_missing() {
        let provider = provider(200);
        provider.set_cluster_servers(&cluster(&["A", "B"]));
        connect(&provider, "B", 50);

        let outcome = provider.set_cluster_servers(&cluster(&["A"]));

        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].unique_id(), "B");
        assert!(provider.node_server("B").is_none());
        assert_eq!(provider.head_node().unique_id(), "C");

        let again = provider.set_cluster_servers(&cluster(&["A"]));
        assert!(again.removed.is_empty());
    }

    #[test]
    fn test_admission() {
        let provider = provider(200);
        provider.set_cluster_servers(&cluster(&["A"]));

        assert_eq!(
            provider.authorize_channel("X", FakeChannel::new()).unwrap_err(),
            AdmissionError::UnknownNode("X".into())
        );
        assert_eq!(
            provider.authorize_channel("C", FakeChannel::new()).unwrap_err(),
            AdmissionError::LocalNode("C".into())
        );

        let first = FakeChannel::new();
        provider.authorize_channel("A", first.clone()).unwrap();
        assert_eq!(
            provider.authorize_channel("A", FakeChannel::new()).unwrap_err(),
            AdmissionError::AlreadyConnected("A".into())
        );

        let a = provider.node_server_by_channel(first.channel_id()).unwrap();
        a.detach_channel_if(first.channel_id());
        assert!(provider.authorize_channel("A", FakeChannel::new()).is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_skips_disconnected() {
        let provider = provider(200);
        provider.set_cluster_servers(&cluster(&["A", "B", "D"]));
        let a = connect(&provider, "A", 100);
        let b = connect(&provider, "B", 50);

        assert_eq!(provider.send_packet(Packet::NodeShutdown).await, 2);
        assert_eq!(provider.send_packet_except("A", Packet::NodeShutdown).await, 1);

        assert_eq!(a.sent().len(), 1);
        assert_eq!(b.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_deploy_template_in_cluster() {
        let provider = provider(200);
        provider.set_cluster_servers(&cluster(&["A"]));
        let a = connect(&provider, "A", 100);

        let sent = provider
            .deploy_template_in_cluster(ServiceTemplate::new("Lobby", "default"), vec![1, 2, 3])
            .await;

        assert_eq!(sent, 1);
        assert!(matches!(
            a.sent().first(),
            Some(Packet::DeployTemplate { archive, .. }) if archive.len() == 3
        ));
    }
}
