//! Node identity and liveness
//!
//! A node in the fleetnet cluster is described by two records:
//! - [`NetworkClusterNode`]: static identity (unique id + listener addresses),
//!   set at cluster-configuration time and replaced wholesale on reconfiguration
//! - [`NetworkClusterNodeInfoSnapshot`]: dynamic liveness and load, published by
//!   the node itself with every heartbeat

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::ProcessSnapshot;

/// A host and port pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL for HTTP calls to this address
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Static identity of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkClusterNode {
    pub unique_id: String,

    /// Addresses where the node accepts connections from other nodes
    #[serde(default)]
    pub listeners: Vec<HostAndPort>,
}

impl NetworkClusterNode {
    pub fn new(unique_id: impl Into<String>, listeners: Vec<HostAndPort>) -> Self {
        Self {
            unique_id: unique_id.into(),
            listeners,
        }
    }

    /// First listener, the one other nodes dial
    pub fn primary_listener(&self) -> Option<&HostAndPort> {
        self.listeners.first()
    }
}

/// The cluster descriptor: every node that belongs to the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCluster {
    #[serde(default = "Uuid::new_v4")]
    pub cluster_id: Uuid,

    #[serde(default)]
    pub nodes: Vec<NetworkClusterNode>,
}

impl NetworkCluster {
    pub fn new(cluster_id: Uuid, nodes: Vec<NetworkClusterNode>) -> Self {
        Self { cluster_id, nodes }
    }

    pub fn node(&self, unique_id: &str) -> Option<&NetworkClusterNode> {
        self.nodes.iter().find(|n| n.unique_id == unique_id)
    }
}

impl Default for NetworkCluster {
    fn default() -> Self {
        Self::new(Uuid::new_v4(), vec![])
    }
}

/// Liveness and load of a node, published with every heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkClusterNodeInfoSnapshot {
    /// When this snapshot was built (milliseconds since epoch)
    pub creation_time: i64,

    /// When the node process started (milliseconds since epoch); the head
    /// election tie-breaker
    pub startup_millis: i64,

    pub node: NetworkClusterNode,

    pub version: String,

    #[serde(default)]
    pub current_services_count: usize,

    /// Memory in MiB used by running services
    #[serde(default)]
    pub used_memory: u64,

    /// Memory in MiB reserved by all services, running or not
    #[serde(default)]
    pub reserved_memory: u64,

    /// Memory in MiB the node may hand out to services
    pub max_memory: u64,

    /// Services are not started while system CPU usage is above this value
    #[serde(default = "default_max_cpu")]
    pub max_cpu_usage_to_start_services: f64,

    /// System CPU usage percentage (0.0 - 100.0)
    #[serde(default)]
    pub system_cpu_usage: f64,

    /// Figures of the node process itself
    #[serde(default)]
    pub process_snapshot: ProcessSnapshot,

    /// A draining node keeps its services but accepts no new ones
    #[serde(default)]
    pub drain: bool,

    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

fn default_max_cpu() -> f64 {
    100.0
}

impl NetworkClusterNodeInfoSnapshot {
    /// Create a snapshot with no load
    pub fn new(node: NetworkClusterNode, startup_millis: i64, max_memory: u64) -> Self {
        Self {
            creation_time: Utc::now().timestamp_millis(),
            startup_millis,
            node,
            version: env!("CARGO_PKG_VERSION").to_string(),
            current_services_count: 0,
            used_memory: 0,
            reserved_memory: 0,
            max_memory,
            max_cpu_usage_to_start_services: default_max_cpu(),
            system_cpu_usage: 0.0,
            process_snapshot: ProcessSnapshot::empty(),
            drain: false,
            properties: serde_json::Map::new(),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.node.unique_id
    }

    /// Memory in MiB still available for new services
    pub fn free_memory(&self) -> u64 {
        self.max_memory.saturating_sub(self.reserved_memory)
    }

    /// Check whether the node can take a service reserving `memory` MiB
    pub fn can_start(&self, memory: u64) -> bool {
        !self.drain
            && self.free_memory() >= memory
            && self.system_cpu_usage <= self.max_cpu_usage_to_start_services
    }

    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.creation_time)
    }
}
