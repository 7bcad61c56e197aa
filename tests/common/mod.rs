//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleetnet::cluster::{HostAndPort, NetworkCluster, NetworkClusterNode};
use fleetnet::config::NodeConfig;
use fleetnet::node::CloudNode;
use fleetnet::process::{LocalTemplateStorage, ProcessServiceManager};
use fleetnet::scheduler::LoadScoringScheduler;
use fleetnet::service::{ServiceTask, StaticBlueprints};
use uuid::Uuid;

/// Find an available port for testing
pub fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

pub fn member(id: &str, port: Option<u16>) -> NetworkClusterNode {
    let listeners = port
        .map(|p| vec![HostAndPort::new("127.0.0.1", p)])
        .unwrap_or_default();
    NetworkClusterNode::new(id, listeners)
}

/// A node backed by a real process manager rooted in `dir`
pub fn build_node(
    dir: &Path,
    identity: NetworkClusterNode,
    members: Vec<NetworkClusterNode>,
    startup: i64,
) -> Arc<CloudNode> {
    let id = identity.unique_id.clone();
    let base = dir.join(&id);
    let config = NodeConfig {
        identity: Some(identity),
        cluster: NetworkCluster::new(Uuid::nil(), members),
        services_dir: Some(base.join("services")),
        templates_dir: Some(base.join("templates")),
        inclusion_cache_dir: Some(base.join("cache")),
        remote_timeout_secs: 2,
        ..Default::default()
    };

    let manager = Arc::new(ProcessServiceManager::new(
        config.process_manager(),
        LocalTemplateStorage::new(config.templates_dir()),
    ));
    let blueprints = StaticBlueprints::new(
        vec![ServiceTask::new("Lobby").with_max_heap(256)],
        vec![],
    );

    let node = CloudNode::with_startup(
        &config,
        manager,
        Arc::new(LoadScoringScheduler::default()),
        Arc::new(blueprints),
        startup,
    );
    node.refresh_node_info();
    node
}

/// Poll `check` until it holds or two seconds passed
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
