//! Per-service control
//!
//! A [`SpecificCloudServiceProvider`] is obtained for a service id and exposes
//! every control operation on that service. Each call runs against the local
//! process manager when this node owns the service and is forwarded to the
//! owning node otherwise. A provider for an id nobody knows is `Absent`: its
//! mutators succeed without effect and its queries return empty values.

use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{check_reply, unexpected, ClusterContext};
use crate::cluster::NodeServer;
use crate::error::{OrchestrationError, Result};
use crate::network::{Packet, Reply};
use crate::process::CloudService;
use crate::service::{
    ServiceDeployment, ServiceInfoSnapshot, ServiceLifeCycle, ServiceRemoteInclusion,
    ServiceTemplate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Bound to a service running on this node
    Local,
    /// Resolves the owning node on every call
    Remote,
    /// The service does not exist
    Absent,
}

enum Target {
    Local(Arc<dyn CloudService>),
    Remote,
    Absent,
}

/// Where a call executes
enum Route {
    Local(Arc<dyn CloudService>),
    Remote(Arc<NodeServer>),
}

pub struct SpecificCloudServiceProvider {
    unique_id: Uuid,
    target: Target,
    ctx: Arc<ClusterContext>,
}

impl SpecificCloudServiceProvider {
    /// Provider for a service id
    ///
    /// Local when the process manager has the service, remote when the
    /// cluster view knows it, absent otherwise.
    pub fn for_service(ctx: Arc<ClusterContext>, unique_id: Uuid) -> Self {
        let target = if let Some(service) = ctx.manager.cloud_service(unique_id) {
            Target::Local(service)
        } else if ctx.services.service(unique_id).is_some() {
            Target::Remote
        } else {
            Target::Absent
        };
        Self {
            unique_id,
            target,
            ctx,
        }
    }

    /// Provider for a service name such as `Lobby-1`
    pub fn for_name(ctx: Arc<ClusterContext>, name: &str) -> Self {
        match ctx.services.service_by_name(name) {
            Some(snapshot) => Self::for_service(ctx, snapshot.unique_id()),
            None => Self::absent(ctx, Uuid::nil()),
        }
    }

    /// A provider that routes on every call, even for a currently unknown id
    pub fn routing(ctx: Arc<ClusterContext>, unique_id: Uuid) -> Self {
        Self {
            unique_id,
            target: Target::Remote,
            ctx,
        }
    }

    pub fn absent(ctx: Arc<ClusterContext>, unique_id: Uuid) -> Self {
        Self {
            unique_id,
            target: Target::Absent,
            ctx,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self.target {
            Target::Local(_) => ProviderKind::Local,
            Target::Remote => ProviderKind::Remote,
            Target::Absent => ProviderKind::Absent,
        }
    }

    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }

    /// Resolve where a call executes; `None` for the absent provider
    fn route(&self) -> Result<Option<Route>> {
        match &self.target {
            Target::Absent => Ok(None),
            Target::Local(service) => Ok(Some(Route::Local(service.clone()))),
            Target::Remote => {
                if let Some(service) = self.ctx.manager.cloud_service(self.unique_id) {
                    return Ok(Some(Route::Local(service)));
                }

                let snapshot = self
                    .ctx
                    .services
                    .service(self.unique_id)
                    .ok_or(OrchestrationError::ServiceNotFound(self.unique_id))?;
                let owner = snapshot.node_unique_id();
                if owner == self.ctx.local_id() {
                    // our own manager no longer has it
                    return Err(OrchestrationError::ServiceNotFound(self.unique_id));
                }

                let server = self
                    .ctx
                    .nodes
                    .node_server(owner)
                    .filter(|s| s.is_connected())
                    .ok_or_else(|| OrchestrationError::Unavailable(owner.to_string()))?;
                Ok(Some(Route::Remote(server)))
            }
        }
    }

    async fn forward(&self, server: &NodeServer, packet: Packet) -> Result<Reply> {
        let node = server.unique_id();
        debug!("Forwarding {} for {} to {}", packet.kind(), self.unique_id, node);
        let reply = server.query(packet, self.ctx.nodes.remote_timeout()).await?;
        check_reply(&node, reply)
    }

    async fn forward_ack(&self, server: &NodeServer, packet: Packet) -> Result<()> {
        match self.forward(server, packet).await? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(&server.unique_id(), other)),
        }
    }

    /// Current snapshot; the cached one for remote services
    pub fn service_info_snapshot(&self) -> Option<ServiceInfoSnapshot> {
        match &self.target {
            Target::Absent => None,
            Target::Local(service) => Some(service.snapshot()),
            Target::Remote => match self.ctx.manager.cloud_service(self.unique_id) {
                Some(service) => Some(service.snapshot()),
                None => self.ctx.services.service(self.unique_id),
            },
        }
    }

    /// Fetch a fresh snapshot from the owning node
    pub async fn force_update_service_info(&self) -> Result<Option<ServiceInfoSnapshot>> {
        match self.route()? {
            None => Ok(None),
            Some(Route::Local(service)) => Ok(Some(service.refresh_snapshot())),
            Some(Route::Remote(server)) => {
                let packet = Packet::FetchSnapshot {
                    service: self.unique_id,
                };
                match self.forward(&server, packet).await? {
                    Reply::Snapshot(Some(snapshot)) => {
                        self.ctx.services.register(snapshot.clone());
                        Ok(Some(snapshot))
                    }
                    Reply::Snapshot(None) => {
                        self.ctx.services.unregister(self.unique_id);
                        Ok(None)
                    }
                    other => Err(unexpected(&server.unique_id(), other)),
                }
            }
        }
    }

    /// `false` once the service is deleted or unknown
    pub fn is_valid(&self) -> bool {
        self.service_info_snapshot()
            .is_some_and(|s| !s.lifecycle.is_deleted())
    }

    /// Drive a lifecycle transition
    ///
    /// Starting is awaited. Stopping and deleting are scheduled and this
    /// returns once they are. Requesting the current state does nothing.
    pub async fn set_cloud_service_lifecycle(&self, lifecycle: ServiceLifeCycle) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => self.local_lifecycle(service, lifecycle).await,
            Some(Route::Remote(server)) => {
                let packet = Packet::SetLifecycle {
                    service: self.unique_id,
                    lifecycle,
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    async fn local_lifecycle(
        &self,
        service: Arc<dyn CloudService>,
        target: ServiceLifeCycle,
    ) -> Result<()> {
        if !check_transition(&service.snapshot(), target)? {
            return Ok(());
        }

        match target {
            ServiceLifeCycle::Running => {
                let _guard = self.ctx.locks.acquire(self.unique_id).await;
                let snapshot = service.snapshot();
                if !check_transition(&snapshot, target)? {
                    return Ok(());
                }
                service.start().await.map_err(|e| {
                    error!("Failed to start {}: {}", snapshot.name(), e);
                    OrchestrationError::from(e)
                })
            }
            ServiceLifeCycle::Stopped | ServiceLifeCycle::Deleted => {
                let ctx = self.ctx.clone();
                let unique_id = self.unique_id;
                tokio::spawn(async move {
                    // an earlier stop may still hold the lock
                    let _guard = ctx.locks.acquire(unique_id).await;
                    let snapshot = service.snapshot();
                    match check_transition(&snapshot, target) {
                        Ok(true) => {}
                        Ok(false) => return,
                        Err(e) => {
                            debug!("Dropping scheduled transition: {}", e);
                            return;
                        }
                    }
                    let result = if target == ServiceLifeCycle::Stopped {
                        service.stop().await
                    } else {
                        service.delete().await
                    };
                    if let Err(e) = result {
                        error!("Failed to set {} to {}: {}", snapshot.name(), target, e);
                    }
                });
                Ok(())
            }
            // Prepared is never a legal target
            ServiceLifeCycle::Prepared => Ok(()),
        }
    }

    pub async fn restart(&self) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => {
                let _guard = self.ctx.locks.acquire(self.unique_id).await;
                Ok(service.restart().await?)
            }
            Some(Route::Remote(server)) => {
                let packet = Packet::Restart {
                    service: self.unique_id,
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    pub async fn kill(&self) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => {
                let _guard = self.ctx.locks.acquire(self.unique_id).await;
                Ok(service.kill().await?)
            }
            Some(Route::Remote(server)) => {
                let packet = Packet::Kill {
                    service: self.unique_id,
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    pub async fn run_command(&self, command: &str) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => Ok(service.run_command(command).await?),
            Some(Route::Remote(server)) => {
                let packet = Packet::RunCommand {
                    service: self.unique_id,
                    command: command.to_string(),
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    pub async fn add_service_template(&self, template: ServiceTemplate) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => {
                service.add_template(template);
                Ok(())
            }
            Some(Route::Remote(server)) => {
                let packet = Packet::AddTemplate {
                    service: self.unique_id,
                    template,
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    pub async fn add_service_deployment(&self, deployment: ServiceDeployment) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => {
                service.add_deployment(deployment);
                Ok(())
            }
            Some(Route::Remote(server)) => {
                let packet = Packet::AddDeployment {
                    service: self.unique_id,
                    deployment,
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    pub async fn add_service_remote_inclusion(
        &self,
        inclusion: ServiceRemoteInclusion,
    ) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => {
                service.add_inclusion(inclusion);
                Ok(())
            }
            Some(Route::Remote(server)) => {
                let packet = Packet::AddInclusion {
                    service: self.unique_id,
                    inclusion,
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    pub async fn include_waiting_service_templates(&self) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => Ok(service.include_waiting_templates().await?),
            Some(Route::Remote(server)) => {
                let packet = Packet::IncludeWaitingTemplates {
                    service: self.unique_id,
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    pub async fn include_waiting_service_inclusions(&self) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => Ok(service.include_waiting_inclusions().await?),
            Some(Route::Remote(server)) => {
                let packet = Packet::IncludeWaitingInclusions {
                    service: self.unique_id,
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    pub async fn deploy_resources(&self, remove_deployments: bool) -> Result<()> {
        match self.route()? {
            None => Ok(()),
            Some(Route::Local(service)) => Ok(service.deploy_resources(remove_deployments).await?),
            Some(Route::Remote(server)) => {
                let packet = Packet::DeployResources {
                    service: self.unique_id,
                    remove_deployments,
                };
                self.forward_ack(&server, packet).await
            }
        }
    }

    /// Recent output lines of the service process
    pub async fn cached_log_messages(&self) -> Result<Vec<String>> {
        match self.route()? {
            None => Ok(vec![]),
            Some(Route::Local(service)) => Ok(service.cached_log_messages()),
            Some(Route::Remote(server)) => {
                let packet = Packet::FetchLog {
                    service: self.unique_id,
                };
                match self.forward(&server, packet).await? {
                    Reply::Logs(lines) => Ok(lines),
                    other => {
                        warn!("Unexpected log reply from {}", server.unique_id());
                        Err(unexpected(&server.unique_id(), other))
                    }
                }
            }
        }
    }
}

/// `Ok(false)` when the service is already in `target`
fn check_transition(snapshot: &ServiceInfoSnapshot, target: ServiceLifeCycle) -> Result<bool> {
    let current = snapshot.lifecycle;
    if current == target {
        return Ok(false);
    }
    if !current.can_transition_to(target) {
        return Err(OrchestrationError::IllegalTransition {
            service: snapshot.name(),
            from: current,
            to: target,
        });
    }
    Ok(true)
}
