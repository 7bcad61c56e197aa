//! Node configuration file
//!
//! A node reads a single YAML file (default `~/.fleetnet/node.yml`) holding
//! its identity, the cluster descriptor, resource limits, directories and the
//! task and group blueprints it serves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{
    HeartbeatConfig, HostAndPort, NetworkCluster, NetworkClusterNode, HEARTBEAT_INTERVAL_SECS,
    NODE_PORT, NODE_TIMEOUT_SECS, REMOTE_TIMEOUT_SECS,
};
use crate::process::ProcessManagerConfig;
use crate::service::{GroupConfiguration, ServiceTask};

/// Default base directory: ~/.fleetnet
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetnet")
}

/// Default config file location: ~/.fleetnet/node.yml
pub fn default_config_path() -> PathBuf {
    default_base_dir().join("node.yml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// This node; the unique id defaults to the host name
    #[serde(default)]
    pub identity: Option<NetworkClusterNode>,

    /// Every member of the cluster, this node included
    #[serde(default)]
    pub cluster: NetworkCluster,

    /// Memory in MiB all local services may claim together
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,

    #[serde(default = "default_max_cpu_usage")]
    pub max_cpu_usage_to_start_services: f64,

    #[serde(default = "default_java_command")]
    pub java_command: String,

    #[serde(default)]
    pub services_dir: Option<PathBuf>,

    #[serde(default)]
    pub templates_dir: Option<PathBuf>,

    #[serde(default)]
    pub inclusion_cache_dir: Option<PathBuf>,

    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,

    /// Lines of process output kept per service
    #[serde(default = "default_log_cache_size")]
    pub log_cache_size: usize,

    #[serde(default)]
    pub tasks: Vec<ServiceTask>,

    #[serde(default)]
    pub groups: Vec<GroupConfiguration>,
}

fn default_max_memory() -> u64 {
    2048
}

fn default_max_cpu_usage() -> f64 {
    100.0
}

fn default_java_command() -> String {
    "java".to_string()
}

fn default_remote_timeout() -> u64 {
    REMOTE_TIMEOUT_SECS
}

fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}

fn default_node_timeout() -> u64 {
    NODE_TIMEOUT_SECS
}

fn default_log_cache_size() -> usize {
    256
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: None,
            cluster: NetworkCluster::default(),
            max_memory: default_max_memory(),
            max_cpu_usage_to_start_services: default_max_cpu_usage(),
            java_command: default_java_command(),
            services_dir: None,
            templates_dir: None,
            inclusion_cache_dir: None,
            remote_timeout_secs: default_remote_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            node_timeout_secs: default_node_timeout(),
            log_cache_size: default_log_cache_size(),
            tasks: vec![],
            groups: vec![],
        }
    }
}

impl NodeConfig {
    /// Identity of this node, falling back to the host name on the default port
    pub fn identity(&self) -> NetworkClusterNode {
        self.identity.clone().unwrap_or_else(|| {
            let name = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "Node-1".to_string());
            NetworkClusterNode::new(name, vec![HostAndPort::new("127.0.0.1", NODE_PORT)])
        })
    }

    /// The cluster descriptor, with this node added when it is missing
    pub fn cluster(&self) -> NetworkCluster {
        let mut cluster = self.cluster.clone();
        let identity = self.identity();
        if cluster.node(&identity.unique_id).is_none() {
            cluster.nodes.push(identity);
        }
        cluster
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::new()
            .with_interval(self.heartbeat_interval_secs)
            .with_node_timeout(self.node_timeout_secs)
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.templates_dir
            .clone()
            .unwrap_or_else(|| default_base_dir().join("local").join("templates"))
    }

    /// Settings for the local process manager
    pub fn process_manager(&self) -> ProcessManagerConfig {
        let identity = self.identity();
        let mut config = ProcessManagerConfig::new(identity.unique_id.clone(), default_base_dir())
            .with_max_memory(self.max_memory);

        if let Some(listener) = identity.primary_listener() {
            config.host = listener.host.clone();
        }
        config.java_command = self.java_command.clone();
        config.log_cache_size = self.log_cache_size;
        if let Some(dir) = &self.services_dir {
            config.services_dir = dir.clone();
        }
        if let Some(dir) = &self.inclusion_cache_dir {
            config.inclusion_cache_dir = dir.clone();
        }
        config
    }

    /// Reject settings a node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let identity = self.identity();
        if identity.unique_id.is_empty() {
            return Err(ConfigError::Invalid("node unique id is empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.cluster.nodes {
            if !seen.insert(node.unique_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "node {} is listed twice",
                    node.unique_id
                )));
            }
        }
        if self.remote_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "remoteTimeoutSecs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a node config from YAML
pub fn parse_node_config(content: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

pub fn serialize_node_config(config: &NodeConfig) -> Result<String, ConfigError> {
    serde_yaml::to_string(config).map_err(|e| ConfigError::WriteError(e.to_string()))
}

/// Load a node config from disk; a missing file yields the defaults
pub fn load_node_config_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    if !path.exists() {
        return Ok(NodeConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_node_config(&content)
}

pub fn save_node_config_to(config: &NodeConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_node_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
