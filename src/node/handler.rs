//! Execution of packets received from peers

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::CloudNode;
use crate::cluster::NodeServer;
use crate::network::{Packet, Reply};
use crate::provider::{ProviderKind, RemotePinnedServiceFactory, SpecificCloudServiceProvider};

/// `Ack` for `Ok`, `Error` with the message otherwise
fn ack<E: std::fmt::Display>(result: Result<(), E>) -> Reply {
    match result {
        Ok(()) => Reply::Ack,
        Err(e) => Reply::Error(e.to_string()),
    }
}

impl CloudNode {
    /// Provider for a service this node owns; peers never get a forwarding one
    fn owned_service(&self, unique_id: Uuid) -> Result<SpecificCloudServiceProvider, Reply> {
        let provider = self.service_provider(unique_id);
        match provider.kind() {
            ProviderKind::Local => Ok(provider),
            ProviderKind::Remote | ProviderKind::Absent => Err(Reply::Error(format!(
                "service {} is not running on {}",
                unique_id,
                self.local_id()
            ))),
        }
    }

    pub(super) async fn dispatch(&self, sender: &NodeServer, packet: Packet) -> Reply {
        let node = sender.unique_id();
        debug!("Handling {} from {}", packet.kind(), node);

        match packet {
            Packet::NodeInfoUpdate { snapshot } => {
                if snapshot.unique_id() != node {
                    return Reply::Error(format!("snapshot of {} sent by {}", snapshot.unique_id(), node));
                }
                let first = sender.node_info_snapshot().is_none();
                sender.update_node_info_snapshot(snapshot);
                if first {
                    self.nodes().refresh_head_node();
                }
                Reply::Ack
            }

            Packet::NodeShutdown => {
                if let Some(channel) = sender.channel() {
                    self.cleanup_departed(sender, channel.channel_id()).await;
                }
                Reply::Ack
            }

            Packet::CreateService { configuration } => {
                match self.manager().create_service(configuration).await {
                    Ok(service) => Reply::Snapshot(Some(service.snapshot())),
                    Err(e) => Reply::Error(e.to_string()),
                }
            }

            Packet::CreateServiceFromTask { task, node: target } => {
                let created = match target {
                    Some(target) => {
                        RemotePinnedServiceFactory::new(self.factory(), target)
                            .create_cloud_service_from_task(&task)
                            .await
                    }
                    None => self.factory().create_cloud_service_from_task(&task).await,
                };
                match created {
                    Ok(snapshot) => Reply::Snapshot(Some(snapshot)),
                    Err(e) => Reply::Error(e.to_string()),
                }
            }

            Packet::SetLifecycle { service, lifecycle } => match self.owned_service(service) {
                Ok(provider) => ack(provider.set_cloud_service_lifecycle(lifecycle).await),
                Err(reply) => reply,
            },

            Packet::Restart { service } => match self.owned_service(service) {
                Ok(provider) => ack(provider.restart().await),
                Err(reply) => reply,
            },

            Packet::Kill { service } => match self.owned_service(service) {
                Ok(provider) => ack(provider.kill().await),
                Err(reply) => reply,
            },

            Packet::RunCommand { service, command } => match self.owned_service(service) {
                Ok(provider) => ack(provider.run_command(&command).await),
                Err(reply) => reply,
            },

            Packet::AddTemplate { service, template } => match self.owned_service(service) {
                Ok(provider) => ack(provider.add_service_template(template).await),
                Err(reply) => reply,
            },

            Packet::AddDeployment {
                service,
                deployment,
            } => match self.owned_service(service) {
                Ok(provider) => ack(provider.add_service_deployment(deployment).await),
                Err(reply) => reply,
            },

            Packet::AddInclusion { service, inclusion } => match self.owned_service(service) {
                Ok(provider) => ack(provider.add_service_remote_inclusion(inclusion).await),
                Err(reply) => reply,
            },

            Packet::IncludeWaitingTemplates { service } => match self.owned_service(service) {
                Ok(provider) => ack(provider.include_waiting_service_templates().await),
                Err(reply) => reply,
            },

            Packet::IncludeWaitingInclusions { service } => match self.owned_service(service) {
                Ok(provider) => ack(provider.include_waiting_service_inclusions().await),
                Err(reply) => reply,
            },

            Packet::DeployResources {
                service,
                remove_deployments,
            } => match self.owned_service(service) {
                Ok(provider) => ack(provider.deploy_resources(remove_deployments).await),
                Err(reply) => reply,
            },

            Packet::FetchLog { service } => match self.owned_service(service) {
                Ok(provider) => match provider.cached_log_messages().await {
                    Ok(lines) => Reply::Logs(lines),
                    Err(e) => Reply::Error(e.to_string()),
                },
                Err(reply) => reply,
            },

            Packet::FetchSnapshot { service } => Reply::Snapshot(
                self.manager()
                    .cloud_service(service)
                    .map(|s| s.refresh_snapshot()),
            ),

            Packet::ServiceUpdate { snapshot } => {
                if snapshot.node_unique_id() != node {
                    warn!(
                        "Node {} sent an update for {}, owned by {}",
                        node,
                        snapshot.name(),
                        snapshot.node_unique_id()
                    );
                    return Reply::Error(format!("{} is not owned by {}", snapshot.name(), node));
                }
                self.services().register(snapshot);
                Reply::Ack
            }

            Packet::ServiceUnregister { snapshot } => {
                // a service we still run stays in the view
                if self.manager().cloud_service(snapshot.unique_id()).is_none() {
                    self.services().unregister(snapshot.unique_id());
                }
                Reply::Ack
            }

            Packet::DeployTemplate { template, archive } => {
                info!(
                    "Received template {} ({} bytes) from {}",
                    template,
                    archive.len(),
                    node
                );
                ack(self.templates().extract(&template, &archive))
            }

            Packet::SetLogLevel { level } => ack(self.apply_log_level(&level)),

            Packet::ExecuteCommand { line } => Reply::Lines(self.execute_command_line(&line).await),
        }
    }
}
