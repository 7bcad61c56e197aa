//! Periodic membership upkeep
//!
//! A background task that, on every tick, publishes this node's liveness
//! snapshot, drops peers that stopped reporting and dials members that are
//! not connected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{HEARTBEAT_INTERVAL_SECS, NODE_TIMEOUT_SECS};

/// Configuration for the heartbeat task
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Tick interval in seconds (default: 5)
    pub interval_secs: u64,

    /// Peers silent for longer than this are disconnected (default: 30)
    pub node_timeout_secs: u64,

    /// Dial disconnected members on every tick
    pub connect: bool,
}

impl HeartbeatConfig {
    pub fn new() -> Self {
        Self {
            interval_secs: HEARTBEAT_INTERVAL_SECS,
            node_timeout_secs: NODE_TIMEOUT_SECS,
            connect: true,
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_node_timeout(mut self, secs: u64) -> Self {
        self.node_timeout_secs = secs;
        self
    }

    pub fn with_connect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What the heartbeat drives on every tick
#[async_trait]
pub trait ClusterMember: Send + Sync {
    /// Rebuild the local liveness snapshot and broadcast it
    async fn publish_node_info(&self);

    /// Disconnect peers without a snapshot for `timeout`; returns their ids
    async fn expire_stale_nodes(&self, timeout: Duration) -> Vec<String>;

    /// Dial members that are not connected; returns how many connected
    async fn connect_missing_nodes(&self) -> usize;
}

/// Run the heartbeat loop until the shutdown signal flips to `true`
pub async fn run_heartbeat(
    member: Arc<dyn ClusterMember>,
    config: HeartbeatConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.interval_secs.max(1));
    let timeout = Duration::from_secs(config.node_timeout_secs);

    info!(
        "Starting heartbeat: interval={}s, node_timeout={}s",
        config.interval_secs, config.node_timeout_secs
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                member.publish_node_info().await;

                let expired = member.expire_stale_nodes(timeout).await;
                if !expired.is_empty() {
                    warn!("Nodes timed out: {:?}", expired);
                }

                if config.connect {
                    let connected = member.connect_missing_nodes().await;
                    if connected > 0 {
                        debug!("Connected {} node(s)", connected);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat shutting down");
                    break;
                }
            }
        }
    }
}

/// Spawn the heartbeat as a background task
///
/// The task stops when `true` is sent on the shutdown channel.
pub fn spawn_heartbeat(
    member: Arc<dyn ClusterMember>,
    config: HeartbeatConfig,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_heartbeat(member, config, shutdown))
}
