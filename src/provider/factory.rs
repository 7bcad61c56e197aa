//! Placement and creation of new services

use std::sync::Arc;

use tracing::{info, warn};

use super::{check_reply, unexpected, ClusterContext};
use crate::error::{OrchestrationError, Result};
use crate::network::{Packet, Reply};
use crate::scheduler::NodeScheduler;
use crate::service::{
    build_configuration, GroupConfigurationProvider, ServiceConfiguration, ServiceId,
    ServiceInfoSnapshot, ServiceTask,
};

/// Decides which node hosts a new service and creates it there
///
/// A configuration pinned to a node is created on that node. Anything else is
/// placed by the [`NodeScheduler`]. Creation never falls back to this node
/// when the chosen node cannot be reached.
pub struct CloudServiceFactory {
    ctx: Arc<ClusterContext>,
    scheduler: Arc<dyn NodeScheduler>,
    groups: Arc<dyn GroupConfigurationProvider>,
}

impl CloudServiceFactory {
    pub fn new(
        ctx: Arc<ClusterContext>,
        scheduler: Arc<dyn NodeScheduler>,
        groups: Arc<dyn GroupConfigurationProvider>,
    ) -> Self {
        Self {
            ctx,
            scheduler,
            groups,
        }
    }

    fn target_node(&self, configuration: &ServiceConfiguration) -> Result<String> {
        if let Some(node) = configuration.pinned_node() {
            return Ok(node.to_string());
        }
        self.scheduler
            .search_logic_node(&self.ctx.nodes, configuration)
            .map(|snapshot| snapshot.unique_id().to_string())
            .ok_or_else(|| {
                OrchestrationError::PlacementFailed(format!(
                    "no node can host {}",
                    configuration.service_id.name()
                ))
            })
    }

    /// Create one service on the pinned or scheduled node
    pub async fn create_cloud_service(
        &self,
        configuration: ServiceConfiguration,
    ) -> Result<ServiceInfoSnapshot> {
        let node = self.target_node(&configuration)?;
        let configuration = configuration.pinned_to(node.clone());

        let snapshot = if node == self.ctx.local_id() {
            let service = self.ctx.manager.create_service(configuration).await?;
            service.snapshot()
        } else {
            let server = self
                .ctx
                .nodes
                .node_server(&node)
                .filter(|s| s.is_connected())
                .ok_or_else(|| OrchestrationError::Unavailable(node.clone()))?;

            let reply = server
                .query(
                    Packet::CreateService { configuration },
                    self.ctx.nodes.remote_timeout(),
                )
                .await?;
            match check_reply(&node, reply)? {
                Reply::Snapshot(Some(snapshot)) => snapshot,
                Reply::Snapshot(None) => {
                    return Err(OrchestrationError::PlacementFailed(format!(
                        "node {} refused the service",
                        node
                    )))
                }
                other => return Err(unexpected(&node, other)),
            }
        };

        info!("Created service {} on {}", snapshot.name(), node);
        self.ctx.services.register(snapshot.clone());
        Ok(snapshot)
    }

    /// Build the next instance of a task and create it
    ///
    /// A task bound to exactly one node is pinned to that node.
    pub async fn create_cloud_service_from_task(
        &self,
        task: &ServiceTask,
    ) -> Result<ServiceInfoSnapshot> {
        let task_service_id = self.ctx.services.next_task_service_id(&task.name);
        let mut configuration =
            build_configuration(task, self.groups.as_ref(), task_service_id);
        if let [node] = task.associated_nodes.as_slice() {
            configuration = configuration.pinned_to(node.clone());
        }
        self.create_cloud_service(configuration).await
    }

    /// Create `amount` services from one configuration on one node
    ///
    /// Every instance gets a fresh id and the next free task service id; the
    /// port counts up from the configured one and instances past `u16::MAX`
    /// are not created. Returns the services that were created. Fails only
    /// when none was, with the last error.
    pub async fn create_cloud_services(
        &self,
        node_unique_id: &str,
        amount: usize,
        configuration: ServiceConfiguration,
    ) -> Result<Vec<ServiceInfoSnapshot>> {
        let mut created = Vec::with_capacity(amount.min(usize::from(u16::MAX)));
        let mut last_error = None;

        for i in 0..amount {
            let task_name = configuration.service_id.task_name.clone();
            let Some(port) = u16::try_from(i)
                .ok()
                .and_then(|offset| configuration.port.checked_add(offset))
            else {
                warn!(
                    "No port left for {} more instance(s) of {} above {}",
                    amount - i,
                    task_name,
                    configuration.port
                );
                last_error = Some(OrchestrationError::PlacementFailed(format!(
                    "port range above {} exhausted",
                    configuration.port
                )));
                break;
            };
            let mut instance = configuration.clone();
            instance.service_id = ServiceId::new(
                task_name.as_str(),
                self.ctx.services.next_task_service_id(&task_name),
                node_unique_id,
                configuration.service_id.environment,
            );
            instance.port = port;

            match self.create_cloud_service(instance).await {
                Ok(snapshot) => created.push(snapshot),
                Err(e) => {
                    warn!(
                        "Failed to create instance {} of {} on {}: {}",
                        i + 1,
                        task_name,
                        node_unique_id,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if created.is_empty() => Err(e),
            _ => Ok(created),
        }
    }
}

/// Creates services from tasks on one fixed node
pub struct RemotePinnedServiceFactory<'a> {
    factory: &'a CloudServiceFactory,
    node_unique_id: String,
}

impl<'a> RemotePinnedServiceFactory<'a> {
    pub fn new(factory: &'a CloudServiceFactory, node_unique_id: impl Into<String>) -> Self {
        Self {
            factory,
            node_unique_id: node_unique_id.into(),
        }
    }

    pub async fn create_cloud_service_from_task(
        &self,
        task: &ServiceTask,
    ) -> Result<ServiceInfoSnapshot> {
        let mut task = task.clone();
        task.associated_nodes = vec![self.node_unique_id.clone()];
        self.factory.create_cloud_service_from_task(&task).await
    }
}
