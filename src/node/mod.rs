//! # The node process
//!
//! [`CloudNode`] wires the registry, the process manager, the scheduler and
//! the blueprints together and is the receiving end of every channel.
//!
//! ```text
//!   peers ──packets──▶ CloudNode ──▶ SpecificCloudServiceProvider ──▶ process manager
//!                        │    ▲
//!                        │    └── snapshot sink ◀── local services
//!                        ▼
//!                NodeServerProvider ──broadcast──▶ peers
//! ```
//!
//! Snapshot changes of local services are written to the aggregate view at
//! once and queued for the peers. One task drains the queue, so peers see the
//! changes of a service in the order they happened.

mod commands;
mod handler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::{
    spawn_heartbeat, AdmissionError, ClusterMember, HeartbeatConfig, NetworkCluster,
    NetworkClusterNodeInfoSnapshot, NodeServer, NodeServerProvider,
};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::logging::LogLevelHandle;
use crate::metrics::{new_shared_collector, SharedMetricsCollector};
use crate::network::{
    AuthorizeRequest, AuthorizeResponse, HttpChannel, InProcessChannel, Packet, PacketHandler,
    Reply,
};
use crate::process::{CloudServiceManager, LocalTemplateStorage, SnapshotSink};
use crate::provider::{
    ClusterContext, CloudServiceFactory, GeneralCloudServiceProvider, ServiceLocks,
    SpecificCloudServiceProvider,
};
use crate::scheduler::NodeScheduler;
use crate::service::{ServiceInfoSnapshot, ServiceTemplate, StaticBlueprints};

/// Forwards local snapshot changes to the aggregate view and the peers
struct ClusterSnapshotSink {
    services: Arc<GeneralCloudServiceProvider>,
    locks: Arc<ServiceLocks>,
    outbound: mpsc::UnboundedSender<Packet>,
}

impl ClusterSnapshotSink {
    fn queue(&self, packet: Packet) {
        if self.outbound.send(packet).is_err() {
            debug!("Outbound queue closed, dropping snapshot");
        }
    }
}

impl SnapshotSink for ClusterSnapshotSink {
    fn publish(&self, snapshot: ServiceInfoSnapshot) {
        self.services.register(snapshot.clone());
        self.queue(Packet::ServiceUpdate { snapshot });
    }

    fn unregister(&self, snapshot: ServiceInfoSnapshot) {
        self.services.unregister(snapshot.unique_id());
        self.locks.forget(snapshot.unique_id());
        self.queue(Packet::ServiceUnregister { snapshot });
    }
}

async fn drain_outbound(nodes: Arc<NodeServerProvider>, mut outbound: mpsc::UnboundedReceiver<Packet>) {
    while let Some(packet) = outbound.recv().await {
        nodes.send_packet(packet).await;
    }
}

pub struct CloudNode {
    ctx: Arc<ClusterContext>,
    factory: CloudServiceFactory,
    blueprints: Arc<StaticBlueprints>,
    templates: LocalTemplateStorage,
    metrics: SharedMetricsCollector,
    startup_millis: i64,
    max_memory: u64,
    max_cpu_usage_to_start_services: f64,
    log_level: RwLock<Option<LogLevelHandle>>,
    drain: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl CloudNode {
    /// Build a node that started now
    pub fn new(
        config: &NodeConfig,
        manager: Arc<dyn CloudServiceManager>,
        scheduler: Arc<dyn NodeScheduler>,
        blueprints: Arc<StaticBlueprints>,
    ) -> Arc<Self> {
        Self::with_startup(
            config,
            manager,
            scheduler,
            blueprints,
            Utc::now().timestamp_millis(),
        )
    }

    /// Build a node with an explicit startup timestamp, the head election key
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_startup(
        config: &NodeConfig,
        manager: Arc<dyn CloudServiceManager>,
        scheduler: Arc<dyn NodeScheduler>,
        blueprints: Arc<StaticBlueprints>,
        startup_millis: i64,
    ) -> Arc<Self> {
        let identity = config.identity();
        let mut local_snapshot =
            NetworkClusterNodeInfoSnapshot::new(identity.clone(), startup_millis, config.max_memory);
        local_snapshot.max_cpu_usage_to_start_services = config.max_cpu_usage_to_start_services;

        let nodes = Arc::new(NodeServerProvider::new(
            identity,
            local_snapshot,
            config.remote_timeout(),
        ));
        nodes.set_cluster_servers(&config.cluster());

        let services = Arc::new(GeneralCloudServiceProvider::new());
        let locks = Arc::new(ServiceLocks::default());
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_outbound(nodes.clone(), outbound_rx));
        manager.set_snapshot_sink(Arc::new(ClusterSnapshotSink {
            services: services.clone(),
            locks: locks.clone(),
            outbound,
        }));

        let ctx = Arc::new(ClusterContext::with_locks(nodes, manager, services, locks));
        let factory = CloudServiceFactory::new(ctx.clone(), scheduler, blueprints.clone());
        let (shutdown, _) = watch::channel(false);

        info!(
            "Node {} ready, cluster {} with {} member(s)",
            ctx.local_id(),
            ctx.nodes.cluster_id(),
            ctx.nodes.node_servers().len()
        );

        Arc::new(Self {
            ctx,
            factory,
            blueprints,
            templates: LocalTemplateStorage::new(config.templates_dir()),
            metrics: new_shared_collector(),
            startup_millis,
            max_memory: config.max_memory,
            max_cpu_usage_to_start_services: config.max_cpu_usage_to_start_services,
            log_level: RwLock::new(None),
            drain: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Let `SetLogLevel` packets and the `loglevel` command change the logger
    pub fn set_log_level_handle(&self, handle: LogLevelHandle) {
        *self.log_level.write() = Some(handle);
    }

    pub fn local_id(&self) -> String {
        self.ctx.local_id()
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    pub fn nodes(&self) -> &Arc<NodeServerProvider> {
        &self.ctx.nodes
    }

    pub fn services(&self) -> &Arc<GeneralCloudServiceProvider> {
        &self.ctx.services
    }

    pub fn manager(&self) -> &Arc<dyn CloudServiceManager> {
        &self.ctx.manager
    }

    pub fn factory(&self) -> &CloudServiceFactory {
        &self.factory
    }

    pub fn blueprints(&self) -> &Arc<StaticBlueprints> {
        &self.blueprints
    }

    pub fn templates(&self) -> &LocalTemplateStorage {
        &self.templates
    }

    pub fn startup_millis(&self) -> i64 {
        self.startup_millis
    }

    pub fn head_node(&self) -> Arc<NodeServer> {
        self.ctx.nodes.head_node()
    }

    pub fn is_head(&self) -> bool {
        self.head_node().is_local()
    }

    /// Control handle for one service, wherever it runs
    pub fn service_provider(&self, unique_id: Uuid) -> SpecificCloudServiceProvider {
        SpecificCloudServiceProvider::for_service(self.ctx.clone(), unique_id)
    }

    pub fn service_provider_by_name(&self, name: &str) -> SpecificCloudServiceProvider {
        SpecificCloudServiceProvider::for_name(self.ctx.clone(), name)
    }

    /// Receiver flipped to `true` when the node shuts down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Snapshots of the services this node runs
    pub fn local_services(&self) -> Vec<ServiceInfoSnapshot> {
        self.ctx
            .manager
            .cloud_services()
            .iter()
            .map(|s| s.snapshot())
            .collect()
    }

    /// Rebuild the liveness snapshot of this node and store it locally
    pub fn refresh_node_info(&self) -> NetworkClusterNodeInfoSnapshot {
        let local = self.ctx.nodes.local_node();
        let (system, process) = {
            let mut metrics = self.metrics.lock();
            (metrics.collect(), metrics.sample_self())
        };

        let mut snapshot =
            NetworkClusterNodeInfoSnapshot::new(local.node(), self.startup_millis, self.max_memory);
        snapshot.current_services_count = self.ctx.manager.cloud_services().len();
        snapshot.used_memory = self.ctx.manager.used_memory();
        snapshot.reserved_memory = self.ctx.manager.reserved_memory();
        snapshot.max_cpu_usage_to_start_services = self.max_cpu_usage_to_start_services;
        snapshot.system_cpu_usage = system.cpu_usage_percent;
        snapshot.process_snapshot = process;
        snapshot.drain = self.drain.load(Ordering::Acquire);

        local.update_node_info_snapshot(snapshot.clone());
        snapshot
    }

    fn authorize_request(&self) -> AuthorizeRequest {
        let local = self.ctx.nodes.local_node();
        AuthorizeRequest {
            cluster_id: self.ctx.nodes.cluster_id(),
            node: local.node(),
            snapshot: local
                .node_info_snapshot()
                .unwrap_or_else(|| self.refresh_node_info()),
            services: self.local_services(),
        }
    }

    /// Take over the state a freshly connected peer reported
    fn accept_peer_state(
        &self,
        server: &NodeServer,
        snapshot: Option<NetworkClusterNodeInfoSnapshot>,
        services: Vec<ServiceInfoSnapshot>,
    ) {
        let node = server.unique_id();
        if let Some(snapshot) = snapshot.filter(|s| s.unique_id() == node) {
            server.update_node_info_snapshot(snapshot);
        }
        for snapshot in services {
            if snapshot.node_unique_id() == node {
                self.ctx.services.register(snapshot);
            }
        }
        self.ctx.nodes.refresh_head_node();
    }

    /// Admit a dialing peer over HTTP
    ///
    /// Opens the channel back to the peer's first listener and answers with
    /// this node's snapshot and services.
    pub fn authorize_peer(&self, request: AuthorizeRequest) -> AuthorizeResponse {
        let node = request.node.unique_id.clone();
        if let Err(e) = self.ctx.nodes.verify_cluster(request.cluster_id) {
            warn!("Rejected node {}: {}", node, e);
            return AuthorizeResponse::rejected(e.to_string());
        }

        let listener = request.node.primary_listener().cloned().or_else(|| {
            self.ctx
                .nodes
                .node_server(&node)
                .and_then(|s| s.node().primary_listener().cloned())
        });
        let Some(listener) = listener else {
            return AuthorizeResponse::rejected(format!("node {} has no listener", node));
        };

        let channel =
            match HttpChannel::new(self.local_id(), &listener, self.ctx.nodes.remote_timeout()) {
                Ok(channel) => channel,
                Err(e) => return AuthorizeResponse::rejected(e.to_string()),
            };

        match self.ctx.nodes.authorize_channel(&node, Arc::new(channel)) {
            Ok(server) => {
                self.accept_peer_state(&server, Some(request.snapshot), request.services);
                let local = self.authorize_request();
                AuthorizeResponse::accepted(local.snapshot, local.services)
            }
            Err(e) => {
                warn!("Rejected node {}: {}", node, e);
                AuthorizeResponse::rejected(e.to_string())
            }
        }
    }

    /// Dial one member over HTTP
    async fn connect_node(&self, server: &Arc<NodeServer>) -> bool {
        let node = server.unique_id();
        let Some(listener) = server.node().primary_listener().cloned() else {
            return false;
        };

        let channel =
            match HttpChannel::new(self.local_id(), &listener, self.ctx.nodes.remote_timeout()) {
                Ok(channel) => channel,
                Err(e) => {
                    debug!("Cannot build channel to {}: {}", node, e);
                    return false;
                }
            };

        let response = match channel.authorize(&self.authorize_request()).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Node {} unreachable at {}: {}", node, listener, e);
                return false;
            }
        };
        if !response.accepted {
            debug!(
                "Node {} refused the connection: {}",
                node,
                response.reason.as_deref().unwrap_or("no reason")
            );
            return false;
        }

        match self.ctx.nodes.authorize_channel(&node, Arc::new(channel)) {
            Ok(server) => {
                self.accept_peer_state(&server, response.snapshot, response.services);
                true
            }
            // the peer dialed us first
            Err(AdmissionError::AlreadyConnected(_)) => false,
            Err(e) => {
                warn!("Cannot attach channel to {}: {}", node, e);
                false
            }
        }
    }

    /// Drop a peer's channel and every service it owned
    ///
    /// Runs once per channel: a second call with the same channel id, or a
    /// call for a channel that was already replaced, does nothing. Returns
    /// the number of services purged from the aggregate view.
    pub async fn handle_node_disconnect(&self, node_unique_id: &str, channel_id: Uuid) -> usize {
        let Some(server) = self.ctx.nodes.node_server(node_unique_id) else {
            return 0;
        };
        self.cleanup_departed(&server, channel_id).await
    }

    async fn cleanup_departed(&self, server: &NodeServer, channel_id: Uuid) -> usize {
        if server.is_local() {
            return 0;
        }
        let Some(channel) = server.detach_channel_if(channel_id) else {
            return 0;
        };
        channel.close().await;

        let node = server.unique_id();
        let purged = self.ctx.services.unregister_by_node(&node);
        for snapshot in &purged {
            self.ctx
                .nodes
                .send_packet_except(&node, Packet::ServiceUnregister {
                    snapshot: snapshot.clone(),
                })
                .await;
        }
        self.ctx.nodes.refresh_head_node();

        info!(
            "Node {} disconnected, {} service(s) removed",
            node,
            purged.len()
        );
        purged.len()
    }

    /// Apply a new cluster descriptor
    ///
    /// Members that left are cleaned up like a disconnect.
    pub async fn set_cluster(&self, cluster: &NetworkCluster) {
        let outcome = self.ctx.nodes.set_cluster_servers(cluster);
        for server in outcome.removed {
            if let Some(channel) = server.channel() {
                self.cleanup_departed(&server, channel.channel_id()).await;
            }
        }
    }

    /// Ship a local template to every connected node
    pub async fn deploy_template(&self, template: &ServiceTemplate) -> Result<usize> {
        let archive = self.templates.archive(template)?;
        Ok(self
            .ctx
            .nodes
            .deploy_template_in_cluster(template.clone(), archive)
            .await)
    }

    /// Stop accepting services, stop the local ones and leave the cluster
    pub async fn shutdown(&self) {
        info!("Node {} shutting down", self.local_id());
        self.drain.store(true, Ordering::Release);

        self.ctx.manager.shutdown_all().await;
        self.ctx.nodes.send_packet(Packet::NodeShutdown).await;

        for server in self.ctx.nodes.remote_node_servers() {
            if let Some(channel) = server.channel() {
                server.detach_channel_if(channel.channel_id());
                channel.close().await;
            }
        }
        self.shutdown.send_replace(true);
    }

    /// Start the heartbeat task; it ends with [`CloudNode::shutdown`]
    pub fn start_heartbeat(self: &Arc<Self>, config: HeartbeatConfig) -> JoinHandle<()> {
        spawn_heartbeat(self.clone(), config, self.shutdown_signal())
    }

    /// Connect two nodes of one process with in-process channels
    pub fn link_in_process(a: &Arc<CloudNode>, b: &Arc<CloudNode>) -> std::result::Result<(), AdmissionError> {
        let a_handler: Arc<dyn PacketHandler> = a.clone();
        let b_handler: Arc<dyn PacketHandler> = b.clone();

        let a_to_b = Arc::new(InProcessChannel::new(a.local_id(), &b_handler));
        let b_to_a = Arc::new(InProcessChannel::new(b.local_id(), &a_handler));

        let b_on_a = a.ctx.nodes.authorize_channel(&b.local_id(), a_to_b)?;
        let a_on_b = match b.ctx.nodes.authorize_channel(&a.local_id(), b_to_a) {
            Ok(server) => server,
            Err(e) => {
                if let Some(channel) = b_on_a.channel() {
                    b_on_a.detach_channel_if(channel.channel_id());
                }
                return Err(e);
            }
        };

        a.accept_peer_state(&b_on_a, b.ctx.nodes.local_node().node_info_snapshot(), b.local_services());
        b.accept_peer_state(&a_on_b, a.ctx.nodes.local_node().node_info_snapshot(), a.local_services());
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for CloudNode {
    async fn handle_packet(&self, sender: &str, packet: Packet) -> Reply {
        let authorized = self
            .ctx
            .nodes
            .node_server(sender)
            .filter(|s| !s.is_local() && s.is_connected());
        match authorized {
            Some(server) => self.dispatch(&server, packet).await,
            None => {
                warn!("Dropped {} from unauthorized node {}", packet.kind(), sender);
                Reply::Error(format!("node {} is not connected", sender))
            }
        }
    }
}

#[async_trait]
impl ClusterMember for CloudNode {
    async fn publish_node_info(&self) {
        let snapshot = self.refresh_node_info();
        self.ctx
            .nodes
            .send_packet(Packet::NodeInfoUpdate { snapshot })
            .await;
    }

    async fn expire_stale_nodes(&self, timeout: Duration) -> Vec<String> {
        let mut expired = vec![];
        for server in self.ctx.nodes.remote_node_servers() {
            if !server.is_stale(timeout) {
                continue;
            }
            if let Some(channel) = server.channel() {
                self.cleanup_departed(&server, channel.channel_id()).await;
                expired.push(server.unique_id());
            }
        }
        expired
    }

    async fn connect_missing_nodes(&self) -> usize {
        let mut connected = 0;
        for server in self.ctx.nodes.remote_node_servers() {
            if !server.is_connected() && self.connect_node(&server).await {
                connected += 1;
            }
        }
        connected
    }
}

impl std::fmt::Debug for CloudNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudNode")
            .field("unique_id", &self.local_id())
            .field("startup_millis", &self.startup_millis)
            .finish()
    }
}
