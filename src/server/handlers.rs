use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::network::http::{AUTHORIZE_PATH, PACKETS_PATH};
use crate::network::{AuthorizeRequest, Packet, PacketHandler, NODE_HEADER};
use crate::node::CloudNode;
use crate::server::state::AppState;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeStatus {
    unique_id: String,
    head_node: String,
    startup_millis: i64,
    connected_nodes: usize,
    services: usize,
    local_services: usize,
}

/// Node status endpoint
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let node = &state.node;
    let connected_nodes = node
        .nodes()
        .remote_node_servers()
        .iter()
        .filter(|s| s.is_connected())
        .count();

    Json(NodeStatus {
        unique_id: node.local_id(),
        head_node: node.head_node().unique_id(),
        startup_millis: node.startup_millis(),
        connected_nodes,
        services: node.services().service_count(),
        local_services: node.manager().cloud_services().len(),
    })
}

/// A dialing peer asks to join
pub async fn authorize(
    State(state): State<AppState>,
    Json(request): Json<AuthorizeRequest>,
) -> impl IntoResponse {
    debug!("Authorization request from {}", request.node.unique_id);
    Json(state.node.authorize_peer(request))
}

/// Packet delivery from an authorized peer
pub async fn packets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(packet): Json<Packet>,
) -> impl IntoResponse {
    let Some(sender) = headers.get(NODE_HEADER).and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("missing {} header", NODE_HEADER),
        )
            .into_response();
    };

    Json(state.node.handle_packet(sender, packet).await).into_response()
}

/// Create the Axum router
pub fn create_router(node: Arc<CloudNode>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route(AUTHORIZE_PATH, post(authorize))
        .route(PACKETS_PATH, post(packets))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NetworkCluster, NetworkClusterNode};
    use crate::config::NodeConfig;
    use crate::network::{AuthorizeResponse, Reply};
    use crate::scheduler::LoadScoringScheduler;
    use crate::service::StaticBlueprints;
    use crate::test_support::FakeManager;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    fn create_test_node() -> Arc<CloudNode> {
        let config = NodeConfig {
            identity: Some(NetworkClusterNode::new("Node-1", vec![])),
            cluster: NetworkCluster::new(
                Uuid::nil(),
                vec![
                    NetworkClusterNode::new("Node-1", vec![]),
                    NetworkClusterNode::new("Node-2", vec![]),
                ],
            ),
            ..Default::default()
        };
        CloudNode::with_startup(
            &config,
            FakeManager::new("Node-1"),
            Arc::new(LoadScoringScheduler::default()),
            Arc::new(StaticBlueprints::default()),
            100,
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(create_test_node());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let app = create_router(create_test_node());

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["uniqueId"], "Node-1");
        assert_eq!(status["headNode"], "Node-1");
        assert_eq!(status["connectedNodes"], 0);
    }

    #[tokio::test]
    async fn test_packet_without_sender_header() {
        let app = create_router(create_test_node());

        let response = app
            .oneshot(post_json(PACKETS_PATH, serde_json::to_value(Packet::NodeShutdown).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_packet_from_unknown_sender() {
        let app = create_router(create_test_node());
        let mut request =
            post_json(PACKETS_PATH, serde_json::to_value(Packet::NodeShutdown).unwrap());
        request
            .headers_mut()
            .insert(NODE_HEADER, "Node-9".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: Reply = serde_json::from_slice(&body).unwrap();
        assert!(matches!(reply, Reply::Error(_)));
    }

    #[tokio::test]
    async fn test_authorize_wrong_cluster() {
        let node = create_test_node();
        let app = create_router(node.clone());
        let mut request = AuthorizeRequest {
            cluster_id: Uuid::new_v4(),
            node: NetworkClusterNode::new("Node-2", vec![]),
            snapshot: node.refresh_node_info(),
            services: vec![],
        };
        request.snapshot.node = request.node.clone();

        let response = app
            .oneshot(post_json(AUTHORIZE_PATH, serde_json::to_value(&request).unwrap()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let answer: AuthorizeResponse = serde_json::from_slice(&body).unwrap();
        assert!(!answer.accepted);
        assert!(!node.nodes().node_server("Node-2").unwrap().is_connected());
    }
}
