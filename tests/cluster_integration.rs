//! Integration tests for clusters linked in one process
//!
//! Every node runs a real process manager in a temporary directory; the
//! nodes talk over in-process channels.

mod common;

use std::sync::Arc;

use common::{build_node, eventually, member};
use fleetnet::cluster::HostAndPort;
use fleetnet::error::OrchestrationError;
use fleetnet::network::{Packet, PacketHandler, Reply};
use fleetnet::node::CloudNode;
use fleetnet::service::{ServiceConfiguration, ServiceInfoSnapshot, ServiceLifeCycle};

fn three_nodes(dir: &std::path::Path) -> (Arc<CloudNode>, Arc<CloudNode>, Arc<CloudNode>) {
    let members = vec![member("A", None), member("B", None), member("C", None)];
    let a = build_node(dir, member("A", None), members.clone(), 100);
    let b = build_node(dir, member("B", None), members.clone(), 50);
    let c = build_node(dir, member("C", None), members, 200);

    CloudNode::link_in_process(&c, &a).unwrap();
    CloudNode::link_in_process(&c, &b).unwrap();
    CloudNode::link_in_process(&a, &b).unwrap();
    (a, b, c)
}

fn channel_id(node: &CloudNode, peer: &str) -> uuid::Uuid {
    node.nodes()
        .node_server(peer)
        .and_then(|s| s.channel())
        .map(|c| c.channel_id())
        .expect("peer is connected")
}

#[tokio::test]
async fn test_head_follows_departures() {
    let dir = tempfile::tempdir().unwrap();
    let (a, _b, c) = three_nodes(dir.path());

    assert_eq!(c.head_node().unique_id(), "B");
    assert_eq!(a.head_node().unique_id(), "B");
    assert!(!c.is_head());

    let purged = c.handle_node_disconnect("B", channel_id(&c, "B")).await;

    assert_eq!(purged, 0);
    assert_eq!(c.head_node().unique_id(), "A");
    assert!(!c.nodes().node_server("B").unwrap().is_connected());
}

#[tokio::test]
async fn test_pinned_create_runs_on_owner() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b, c) = three_nodes(dir.path());

    let configuration = ServiceConfiguration::new("Lobby", 1).pinned_to("A");
    let snapshot = c
        .factory()
        .create_cloud_service(configuration.clone())
        .await
        .unwrap();

    assert_eq!(snapshot.node_unique_id(), "A");
    assert_eq!(snapshot.lifecycle, ServiceLifeCycle::Prepared);
    assert!(a.manager().cloud_service(snapshot.unique_id()).is_some());
    assert!(c.manager().cloud_service(snapshot.unique_id()).is_none());
    assert!(c.services().service(snapshot.unique_id()).is_some());
    assert!(eventually(|| b.services().service(snapshot.unique_id()).is_some()).await);

    c.handle_node_disconnect("A", channel_id(&c, "A")).await;

    let second = c
        .factory()
        .create_cloud_service(ServiceConfiguration::new("Lobby", 2).pinned_to("A"))
        .await;
    assert!(matches!(second, Err(OrchestrationError::Unavailable(node)) if node == "A"));
    assert_eq!(c.services().service_count_by_node("A"), 0);
}

#[tokio::test]
async fn test_remote_delete_is_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let (a, _b, c) = three_nodes(dir.path());

    let snapshot = c
        .factory()
        .create_cloud_service(ServiceConfiguration::new("Lobby", 1).pinned_to("A"))
        .await
        .unwrap();
    let id = snapshot.unique_id();

    c.service_provider(id)
        .set_cloud_service_lifecycle(ServiceLifeCycle::Deleted)
        .await
        .unwrap();

    assert!(eventually(|| a.manager().cloud_service(id).is_none()).await);
    assert!(eventually(|| c.services().service(id).is_none()).await);
}

#[tokio::test]
async fn test_stop_on_unreachable_owner_keeps_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (a, _b, c) = three_nodes(dir.path());

    let running = ServiceInfoSnapshot::prepared(
        ServiceConfiguration::new("Lobby", 1).pinned_to("A"),
        HostAndPort::new("127.0.0.1", 30000),
    )
    .with_lifecycle(ServiceLifeCycle::Running);
    let id = running.unique_id();
    let reply = c
        .handle_packet("A", Packet::ServiceUpdate { snapshot: running })
        .await;
    assert!(matches!(reply, Reply::Ack));

    // A goes away without closing its channels
    drop(a);

    let result = c
        .service_provider(id)
        .set_cloud_service_lifecycle(ServiceLifeCycle::Stopped)
        .await;

    let error = result.unwrap_err();
    assert!(error.is_transient(), "unexpected error {}", error);
    assert_eq!(
        c.services().service(id).map(|s| s.lifecycle),
        Some(ServiceLifeCycle::Running)
    );
}

#[tokio::test]
async fn test_shutdown_leaves_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b, c) = three_nodes(dir.path());

    b.shutdown().await;

    assert!(!a.nodes().node_server("B").unwrap().is_connected());
    assert!(!c.nodes().node_server("B").unwrap().is_connected());
    assert_eq!(c.head_node().unique_id(), "A");
    assert!(*b.shutdown_signal().borrow());
}
