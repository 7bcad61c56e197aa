//! Point-in-time view of a service instance
//!
//! Snapshots are created by the node that launches the process, refreshed on
//! every lifecycle transition and shipped to the other nodes so that every node
//! keeps the same cluster-wide view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::configuration::{ServiceConfiguration, ServiceEnvironmentType};
use crate::cluster::HostAndPort;

/// Identity of a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceId {
    pub unique_id: Uuid,
    pub task_name: String,
    pub task_service_id: u32,
    /// The one node that owns the service and executes every mutation on it
    pub node_unique_id: String,
    pub environment: ServiceEnvironmentType,
}

impl ServiceId {
    pub fn new(
        task_name: impl Into<String>,
        task_service_id: u32,
        node_unique_id: impl Into<String>,
        environment: ServiceEnvironmentType,
    ) -> Self {
        Self {
            unique_id: Uuid::new_v4(),
            task_name: task_name.into(),
            task_service_id,
            node_unique_id: node_unique_id.into(),
            environment,
        }
    }

    /// Display name, e.g. `Lobby-1`
    pub fn name(&self) -> String {
        format!("{}-{}", self.task_name, self.task_service_id)
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}@{}", self.name(), self.unique_id, self.node_unique_id)
    }
}

/// Lifecycle of a service instance
///
/// ```text
/// Prepared ──> Running ──> Stopped ──> Deleted
///    │            │                       ▲
///    └────────────┴───────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceLifeCycle {
    #[default]
    Prepared,
    Running,
    Stopped,
    Deleted,
}

impl ServiceLifeCycle {
    /// Check whether a requested transition is legal
    ///
    /// Requesting the current state is not a transition and returns `false`;
    /// callers treat it as a no-op.
    pub fn can_transition_to(&self, target: ServiceLifeCycle) -> bool {
        use ServiceLifeCycle::*;
        matches!(
            (self, target),
            (Prepared, Running)
                | (Running, Stopped)
                | (Stopped, Deleted)
                | (Prepared, Deleted)
                | (Running, Deleted)
        )
    }

    pub fn is_deleted(&self) -> bool {
        *self == ServiceLifeCycle::Deleted
    }
}

impl std::fmt::Display for ServiceLifeCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Prepared => "PREPARED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ServiceLifeCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PREPARED" => Ok(Self::Prepared),
            "RUNNING" | "START" => Ok(Self::Running),
            "STOPPED" | "STOP" => Ok(Self::Stopped),
            "DELETED" | "DELETE" => Ok(Self::Deleted),
            other => Err(format!("unknown lifecycle '{}'", other)),
        }
    }
}

/// Runtime figures of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    /// Operating system process id, `None` while the process is not running
    #[serde(default)]
    pub pid: Option<u32>,

    /// Resident memory in bytes
    #[serde(default)]
    pub heap_usage_memory: u64,

    /// Configured maximum heap in bytes
    #[serde(default)]
    pub max_heap_memory: u64,

    /// CPU usage percentage of the process
    #[serde(default)]
    pub cpu_usage: f64,

    #[serde(default)]
    pub thread_count: u32,
}

impl ProcessSnapshot {
    /// Snapshot of a process that is not running
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Point-in-time view of a service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfoSnapshot {
    pub creation_time: DateTime<Utc>,

    pub service_id: ServiceId,

    pub address: HostAndPort,

    /// Whether the game server announced itself to its proxy / the node
    #[serde(default)]
    pub connected: bool,

    #[serde(default)]
    pub connected_time: Option<DateTime<Utc>>,

    pub lifecycle: ServiceLifeCycle,

    #[serde(default)]
    pub process: ProcessSnapshot,

    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,

    pub configuration: ServiceConfiguration,
}

impl ServiceInfoSnapshot {
    /// Fresh snapshot of a just-prepared service
    pub fn prepared(configuration: ServiceConfiguration, address: HostAndPort) -> Self {
        Self {
            creation_time: Utc::now(),
            service_id: configuration.service_id.clone(),
            address,
            connected: false,
            connected_time: None,
            lifecycle: ServiceLifeCycle::Prepared,
            process: ProcessSnapshot::empty(),
            properties: configuration.properties.clone(),
            configuration,
        }
    }

    pub fn unique_id(&self) -> Uuid {
        self.service_id.unique_id
    }

    pub fn name(&self) -> String {
        self.service_id.name()
    }

    pub fn node_unique_id(&self) -> &str {
        &self.service_id.node_unique_id
    }

    pub fn task_name(&self) -> &str {
        &self.service_id.task_name
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        self.configuration.groups.iter().any(|g| g == group)
    }

    pub fn with_lifecycle(mut self, lifecycle: ServiceLifeCycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}
