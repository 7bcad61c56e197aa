//! Fakes shared by the unit tests

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::cluster::{
    HostAndPort, NetworkCluster, NetworkClusterNode, NetworkClusterNodeInfoSnapshot,
    NodeServerProvider,
};
use crate::network::{ChannelError, NetworkChannel, Packet, Reply};
use crate::process::{CloudService, CloudServiceManager, ProcessError, SnapshotSink};
use crate::provider::{ClusterContext, GeneralCloudServiceProvider, ServiceLocks};
use crate::service::{
    ServiceConfiguration, ServiceDeployment, ServiceInfoSnapshot, ServiceLifeCycle,
    ServiceRemoteInclusion, ServiceTemplate,
};

pub const LOCAL_NODE: &str = "Node-1";

/// Channel that records packets and answers every query with a fixed reply
pub struct FakeChannel {
    id: Uuid,
    /// `None` never answers
    reply: Option<Reply>,
    sent: Mutex<Vec<Packet>>,
    open: AtomicBool,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Self::replying(Reply::Ack)
    }

    pub fn replying(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            reply: Some(reply),
            sent: Mutex::new(vec![]),
            open: AtomicBool::new(true),
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            reply: None,
            sent: Mutex::new(vec![]),
            open: AtomicBool::new(true),
        })
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }

    async fn answer(&self, packet: Packet) -> Result<Reply, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.id));
        }
        self.sent.lock().push(packet);
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl NetworkChannel for FakeChannel {
    fn channel_id(&self) -> Uuid {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_packet(&self, packet: Packet) -> Result<(), ChannelError> {
        self.answer(packet).await.map(|_| ())
    }

    async fn send_query(&self, packet: Packet) -> Result<Reply, ChannelError> {
        self.answer(packet).await
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Sink that keeps everything it receives
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<ServiceInfoSnapshot>>,
    unregistered: Mutex<Vec<ServiceInfoSnapshot>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<ServiceInfoSnapshot> {
        self.published.lock().clone()
    }

    pub fn unregistered(&self) -> Vec<ServiceInfoSnapshot> {
        self.unregistered.lock().clone()
    }
}

impl SnapshotSink for RecordingSink {
    fn publish(&self, snapshot: ServiceInfoSnapshot) {
        self.published.lock().push(snapshot);
    }

    fn unregister(&self, snapshot: ServiceInfoSnapshot) {
        self.unregistered.lock().push(snapshot);
    }
}

/// Sink that writes straight into an aggregate view
struct ViewSink(Arc<GeneralCloudServiceProvider>, Arc<ServiceLocks>);

impl SnapshotSink for ViewSink {
    fn publish(&self, snapshot: ServiceInfoSnapshot) {
        self.0.register(snapshot);
    }

    fn unregister(&self, snapshot: ServiceInfoSnapshot) {
        self.0.unregister(snapshot.unique_id());
        self.1.forget(snapshot.unique_id());
    }
}

/// In-memory service without a process
pub struct FakeService {
    snapshot: RwLock<ServiceInfoSnapshot>,
    commands: Mutex<Vec<String>>,
    templates: Mutex<Vec<ServiceTemplate>>,
    stop_delay: Mutex<Duration>,
    manager: Weak<FakeManager>,
}

impl FakeService {
    pub fn lifecycle(&self) -> ServiceLifeCycle {
        self.snapshot.read().lifecycle
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn templates(&self) -> Vec<ServiceTemplate> {
        self.templates.lock().clone()
    }

    /// How long a stop takes to finish
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = delay;
    }

    fn transition(&self, lifecycle: ServiceLifeCycle) -> ServiceInfoSnapshot {
        let snapshot = {
            let mut current = self.snapshot.write();
            current.lifecycle = lifecycle;
            current.clone()
        };
        if let Some(manager) = self.manager.upgrade() {
            manager.publish(snapshot.clone());
        }
        snapshot
    }
}

#[async_trait]
impl CloudService for FakeService {
    fn snapshot(&self) -> ServiceInfoSnapshot {
        self.snapshot.read().clone()
    }

    async fn start(&self) -> Result<(), ProcessError> {
        self.transition(ServiceLifeCycle::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessError> {
        let delay = *self.stop_delay.lock();
        tokio::time::sleep(delay).await;
        self.transition(ServiceLifeCycle::Stopped);
        Ok(())
    }

    async fn delete(&self) -> Result<(), ProcessError> {
        let snapshot = self.transition(ServiceLifeCycle::Deleted);
        if let Some(manager) = self.manager.upgrade() {
            manager.services.remove(&snapshot.unique_id());
            if let Some(sink) = manager.sink.read().clone() {
                sink.unregister(snapshot);
            }
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), ProcessError> {
        self.transition(ServiceLifeCycle::Running);
        Ok(())
    }

    async fn kill(&self) -> Result<(), ProcessError> {
        self.transition(ServiceLifeCycle::Stopped);
        Ok(())
    }

    async fn run_command(&self, line: &str) -> Result<(), ProcessError> {
        self.commands.lock().push(line.to_string());
        Ok(())
    }

    fn add_template(&self, template: ServiceTemplate) {
        self.templates.lock().push(template);
    }

    fn add_deployment(&self, _deployment: ServiceDeployment) {}

    fn add_inclusion(&self, _inclusion: ServiceRemoteInclusion) {}

    async fn include_waiting_templates(&self) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn include_waiting_inclusions(&self) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn deploy_resources(&self, _remove_deployments: bool) -> Result<(), ProcessError> {
        Ok(())
    }

    fn cached_log_messages(&self) -> Vec<String> {
        vec!["[fake] ready".to_string()]
    }

    fn refresh_snapshot(&self) -> ServiceInfoSnapshot {
        self.snapshot()
    }
}

/// Process manager keeping [`FakeService`]s in memory
pub struct FakeManager {
    node: String,
    me: Weak<FakeManager>,
    services: DashMap<Uuid, Arc<FakeService>>,
    sink: RwLock<Option<Arc<dyn SnapshotSink>>>,
    /// Creations left before every create fails; negative means unlimited
    remaining: AtomicI64,
}

impl FakeManager {
    pub fn new(node: impl Into<String>) -> Arc<Self> {
        let node = node.into();
        Arc::new_cyclic(|me| Self {
            node,
            me: me.clone(),
            services: DashMap::new(),
            sink: RwLock::new(None),
            remaining: AtomicI64::new(-1),
        })
    }

    pub fn fail_after(&self, creations: i64) {
        self.remaining.store(creations, Ordering::SeqCst);
    }

    pub fn service(&self, unique_id: Uuid) -> Option<Arc<FakeService>> {
        self.services.get(&unique_id).map(|s| s.value().clone())
    }

    pub fn services(&self) -> Vec<ServiceInfoSnapshot> {
        self.services.iter().map(|s| s.snapshot()).collect()
    }

    /// Insert a prepared service without going through the trait
    pub fn add(&self, configuration: ServiceConfiguration) -> ServiceInfoSnapshot {
        let configuration = configuration.pinned_to(self.node.clone());
        let port = configuration.port;
        let snapshot =
            ServiceInfoSnapshot::prepared(configuration, HostAndPort::new("127.0.0.1", port));
        let service = Arc::new(FakeService {
            snapshot: RwLock::new(snapshot.clone()),
            commands: Mutex::new(vec![]),
            templates: Mutex::new(vec![]),
            stop_delay: Mutex::new(Duration::from_millis(20)),
            manager: self.me.clone(),
        });
        self.services.insert(snapshot.unique_id(), service);
        self.publish(snapshot.clone());
        snapshot
    }

    fn publish(&self, snapshot: ServiceInfoSnapshot) {
        if let Some(sink) = self.sink.read().clone() {
            sink.publish(snapshot);
        }
    }
}

#[async_trait]
impl CloudServiceManager for FakeManager {
    async fn create_service(
        &self,
        configuration: ServiceConfiguration,
    ) -> Result<Arc<dyn CloudService>, ProcessError> {
        if let Some(node) = configuration.pinned_node() {
            if node != self.node {
                return Err(ProcessError::ConfigError(format!("pinned to {}", node)));
            }
        }
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining == 0 {
            return Err(ProcessError::OutOfMemory {
                required: configuration.process_config.max_heap_memory_size as u64,
                available: 0,
            });
        }
        if remaining > 0 {
            self.remaining.fetch_sub(1, Ordering::SeqCst);
        }

        let snapshot = self.add(configuration);
        let service = self
            .service(snapshot.unique_id())
            .ok_or(ProcessError::NotFound(snapshot.unique_id()))?;
        Ok(service)
    }

    fn cloud_service(&self, unique_id: Uuid) -> Option<Arc<dyn CloudService>> {
        self.service(unique_id)
            .map(|s| s as Arc<dyn CloudService>)
    }

    fn cloud_services(&self) -> Vec<Arc<dyn CloudService>> {
        self.services
            .iter()
            .map(|s| s.value().clone() as Arc<dyn CloudService>)
            .collect()
    }

    fn reserved_memory(&self) -> u64 {
        self.services
            .iter()
            .map(|s| s.snapshot().configuration.process_config.max_heap_memory_size as u64)
            .sum()
    }

    fn used_memory(&self) -> u64 {
        0
    }

    fn set_snapshot_sink(&self, sink: Arc<dyn SnapshotSink>) {
        *self.sink.write() = Some(sink);
    }

    async fn shutdown_all(&self) {
        let services: Vec<_> = self.services.iter().map(|s| s.value().clone()).collect();
        for service in services {
            let _ = service.delete().await;
        }
    }
}

fn node(id: &str) -> NetworkClusterNode {
    NetworkClusterNode::new(id, vec![])
}

/// Context for node `Node-1`, started at 100, alone in its cluster
pub fn test_context() -> (Arc<ClusterContext>, Arc<FakeManager>) {
    let nodes = Arc::new(NodeServerProvider::new(
        node(LOCAL_NODE),
        NetworkClusterNodeInfoSnapshot::new(node(LOCAL_NODE), 100, 4096),
        Duration::from_millis(500),
    ));
    nodes.set_cluster_servers(&NetworkCluster::new(Uuid::nil(), vec![node(LOCAL_NODE)]));

    let manager = FakeManager::new(LOCAL_NODE);
    let services = Arc::new(GeneralCloudServiceProvider::new());
    let locks = Arc::new(ServiceLocks::default());
    manager.set_snapshot_sink(Arc::new(ViewSink(services.clone(), locks.clone())));

    let ctx = ClusterContext::with_locks(nodes, manager.clone(), services, locks);
    (Arc::new(ctx), manager)
}

/// Add a disconnected member to the cluster
pub fn add_member(ctx: &ClusterContext, unique_id: &str) {
    let mut nodes: Vec<_> = ctx.nodes.node_servers().iter().map(|s| s.node()).collect();
    if !nodes.iter().any(|n| n.unique_id == unique_id) {
        nodes.push(node(unique_id));
    }
    ctx.nodes
        .set_cluster_servers(&NetworkCluster::new(ctx.nodes.cluster_id(), nodes));
}

/// Add a member, attach `channel` and record its first snapshot
pub fn connect_remote(ctx: &ClusterContext, unique_id: &str, startup: i64, channel: Arc<FakeChannel>) {
    add_member(ctx, unique_id);
    let server = ctx
        .nodes
        .authorize_channel(unique_id, channel)
        .expect("member admits a first channel");
    server.update_node_info_snapshot(NetworkClusterNodeInfoSnapshot::new(
        node(unique_id),
        startup,
        4096,
    ));
    ctx.nodes.refresh_head_node();
}

/// A `Lobby` service owned by this node
pub fn local_service(ctx: &ClusterContext, manager: &FakeManager) -> ServiceInfoSnapshot {
    let id = ctx.services.next_task_service_id("Lobby");
    manager.add(ServiceConfiguration::new("Lobby", id))
}

/// A `Lobby` service owned by another node, known only to the aggregate view
pub fn remote_service(
    ctx: &ClusterContext,
    owner: &str,
    lifecycle: ServiceLifeCycle,
) -> ServiceInfoSnapshot {
    let id = ctx.services.next_task_service_id("Lobby");
    let snapshot = ServiceInfoSnapshot::prepared(
        ServiceConfiguration::new("Lobby", id).pinned_to(owner),
        HostAndPort::new("10.0.0.2", 44955),
    )
    .with_lifecycle(lifecycle);
    ctx.services.register(snapshot.clone());
    snapshot
}
