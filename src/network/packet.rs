//! Command packets exchanged between nodes
//!
//! Every packet carries enough information to run the matching provider
//! method on the receiving node. Packets that expect a result are answered
//! with exactly one [`Reply`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{NetworkClusterNode, NetworkClusterNodeInfoSnapshot};
use crate::service::{
    ServiceConfiguration, ServiceDeployment, ServiceInfoSnapshot, ServiceLifeCycle,
    ServiceRemoteInclusion, ServiceTask, ServiceTemplate,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// Liveness snapshot of the sender
    NodeInfoUpdate { snapshot: NetworkClusterNodeInfoSnapshot },

    /// The sender is going down and closes its channels
    NodeShutdown,

    /// Create a service on the receiving node
    CreateService { configuration: ServiceConfiguration },

    /// Create a service from a task; `node` pins it to one node id
    CreateServiceFromTask {
        task: ServiceTask,
        #[serde(default)]
        node: Option<String>,
    },

    SetLifecycle {
        service: Uuid,
        lifecycle: ServiceLifeCycle,
    },

    Restart { service: Uuid },

    Kill { service: Uuid },

    RunCommand { service: Uuid, command: String },

    AddTemplate {
        service: Uuid,
        template: ServiceTemplate,
    },

    AddDeployment {
        service: Uuid,
        deployment: ServiceDeployment,
    },

    AddInclusion {
        service: Uuid,
        inclusion: ServiceRemoteInclusion,
    },

    IncludeWaitingTemplates { service: Uuid },

    IncludeWaitingInclusions { service: Uuid },

    DeployResources {
        service: Uuid,
        remove_deployments: bool,
    },

    FetchLog { service: Uuid },

    FetchSnapshot { service: Uuid },

    /// A service owned by the sender was created or changed
    ServiceUpdate { snapshot: ServiceInfoSnapshot },

    /// A service is gone and must be dropped from every view
    ServiceUnregister { snapshot: ServiceInfoSnapshot },

    /// A gzipped tar archive of a template
    DeployTemplate {
        template: ServiceTemplate,
        archive: Vec<u8>,
    },

    SetLogLevel { level: String },

    ExecuteCommand { line: String },
}

impl Packet {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeInfoUpdate { .. } => "node_info_update",
            Self::NodeShutdown => "node_shutdown",
            Self::CreateService { .. } => "create_service",
            Self::CreateServiceFromTask { .. } => "create_service_from_task",
            Self::SetLifecycle { .. } => "set_lifecycle",
            Self::Restart { .. } => "restart",
            Self::Kill { .. } => "kill",
            Self::RunCommand { .. } => "run_command",
            Self::AddTemplate { .. } => "add_template",
            Self::AddDeployment { .. } => "add_deployment",
            Self::AddInclusion { .. } => "add_inclusion",
            Self::IncludeWaitingTemplates { .. } => "include_waiting_templates",
            Self::IncludeWaitingInclusions { .. } => "include_waiting_inclusions",
            Self::DeployResources { .. } => "deploy_resources",
            Self::FetchLog { .. } => "fetch_log",
            Self::FetchSnapshot { .. } => "fetch_snapshot",
            Self::ServiceUpdate { .. } => "service_update",
            Self::ServiceUnregister { .. } => "service_unregister",
            Self::DeployTemplate { .. } => "deploy_template",
            Self::SetLogLevel { .. } => "set_log_level",
            Self::ExecuteCommand { .. } => "execute_command",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Snapshot(Option<ServiceInfoSnapshot>),
    Logs(Vec<String>),
    Lines(Vec<String>),
    Error(String),
}

/// Sent by a node dialing a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub cluster_id: Uuid,
    pub node: NetworkClusterNode,
    pub snapshot: NetworkClusterNodeInfoSnapshot,
    #[serde(default)]
    pub services: Vec<ServiceInfoSnapshot>,
}

/// Answer to an [`AuthorizeRequest`]; carries the peer's own state when accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub snapshot: Option<NetworkClusterNodeInfoSnapshot>,
    #[serde(default)]
    pub services: Vec<ServiceInfoSnapshot>,
}

impl AuthorizeResponse {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            snapshot: None,
            services: vec![],
        }
    }

    pub fn accepted(
        snapshot: NetworkClusterNodeInfoSnapshot,
        services: Vec<ServiceInfoSnapshot>,
    ) -> Self {
        Self {
            accepted: true,
            reason: None,
            snapshot: Some(snapshot),
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_wire_format() {
        let packet = Packet::SetLifecycle {
            service: Uuid::nil(),
            lifecycle: ServiceLifeCycle::Stopped,
        };

        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["type"], "set_lifecycle");
        assert_eq!(json["lifecycle"], "STOPPED");
        assert_eq!(packet.kind(), "set_lifecycle");
    }

    #[test]
    fn test_unit_packet() {
        let packet: Packet = serde_json::from_str(r#"{"type":"node_shutdown"}"#).unwrap();
        assert!(matches!(packet, Packet::NodeShutdown));
    }

    #[test]
    fn test_reply_wire_format() {
        let json = serde_json::to_string(&Reply::Logs(vec!["Done (3.2s)!".into()])).unwrap();
        assert_eq!(json, r#"{"type":"logs","value":["Done (3.2s)!"]}"#);

        let ack: Reply = serde_json::from_str(r#"{"type":"ack"}"#).unwrap();
        assert!(matches!(ack, Reply::Ack));
    }
}
