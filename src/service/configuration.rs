//! Declarative service blueprints
//!
//! A [`ServiceTask`] describes a family of services ("Lobby", "BedWars"), a
//! [`GroupConfiguration`] contributes shared templates and options to every task
//! that references it, and a [`ServiceConfiguration`] is the fully resolved
//! description of one service instance that the factory places on a node.

use serde::{Deserialize, Serialize};

use super::snapshot::ServiceId;

/// Kind of game server process a service runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceEnvironmentType {
    /// Java edition game server
    #[default]
    MinecraftServer,
    /// Java edition proxy (BungeeCord family)
    BungeeCord,
    /// Java edition proxy (Velocity)
    Velocity,
    /// Bedrock edition server
    Nukkit,
    /// Bedrock edition proxy
    Waterdog,
}

impl ServiceEnvironmentType {
    /// Whether this environment type is a proxy that fronts other services
    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::BungeeCord | Self::Velocity | Self::Waterdog)
    }

    /// Name of the application jar the process manager launches
    pub fn application_file(&self) -> &'static str {
        match self {
            Self::MinecraftServer => "server.jar",
            Self::BungeeCord => "bungee.jar",
            Self::Velocity => "velocity.jar",
            Self::Nukkit => "nukkit.jar",
            Self::Waterdog => "waterdog.jar",
        }
    }

    /// Default port of the environment, used when a task has no start port
    pub fn default_start_port(&self) -> u16 {
        match self {
            Self::MinecraftServer => 44955,
            Self::BungeeCord | Self::Velocity => 25565,
            Self::Nukkit => 44955,
            Self::Waterdog => 19132,
        }
    }
}

/// Reference to a template in a template storage (`prefix/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    pub prefix: String,
    pub name: String,
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Copy the template into static services even if they already have files
    #[serde(default)]
    pub always_copy_to_static_services: bool,
}

fn default_storage() -> String {
    "local".to_string()
}

impl ServiceTemplate {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            storage: default_storage(),
            always_copy_to_static_services: false,
        }
    }

    /// `prefix/name`, the path of the template inside its storage
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.prefix, self.name)
    }
}

impl std::fmt::Display for ServiceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.storage, self.full_name())
    }
}

/// Copy the service directory back into a template when the service is deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub template: ServiceTemplate,
    /// Relative paths (prefix match) that are not deployed
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl ServiceDeployment {
    pub fn new(template: ServiceTemplate) -> Self {
        Self {
            template,
            excludes: vec![],
        }
    }

    /// Check whether a path relative to the service directory is excluded
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.excludes
            .iter()
            .any(|exclude| relative.starts_with(exclude.as_str()))
    }
}

/// A file downloaded into the service directory before start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRemoteInclusion {
    pub url: String,
    /// Destination relative to the service directory
    pub destination: String,
}

impl ServiceRemoteInclusion {
    pub fn new(url: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
        }
    }
}

/// How the process of a service is launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfiguration {
    #[serde(default)]
    pub environment: ServiceEnvironmentType,

    /// Maximum heap in MiB, also the amount of node memory reserved for the service
    #[serde(default = "default_max_heap")]
    pub max_heap_memory_size: u32,

    #[serde(default)]
    pub jvm_options: Vec<String>,

    #[serde(default)]
    pub process_parameters: Vec<String>,
}

fn default_max_heap() -> u32 {
    512
}

impl Default for ProcessConfiguration {
    fn default() -> Self {
        Self {
            environment: ServiceEnvironmentType::default(),
            max_heap_memory_size: default_max_heap(),
            jvm_options: vec![],
            process_parameters: vec![],
        }
    }
}

/// Shared settings that tasks pull in by group name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfiguration {
    pub name: String,

    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,

    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,

    #[serde(default)]
    pub includes: Vec<ServiceRemoteInclusion>,

    #[serde(default)]
    pub jvm_options: Vec<String>,

    #[serde(default)]
    pub process_parameters: Vec<String>,

    /// Environments this group applies to even when a task does not list it
    #[serde(default)]
    pub target_environments: Vec<ServiceEnvironmentType>,
}

impl GroupConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            templates: vec![],
            deployments: vec![],
            includes: vec![],
            jvm_options: vec![],
            process_parameters: vec![],
            target_environments: vec![],
        }
    }
}

/// Blueprint of a family of services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTask {
    pub name: String,

    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default)]
    pub maintenance: bool,

    #[serde(default)]
    pub auto_delete_on_stop: bool,

    #[serde(default)]
    pub static_services: bool,

    /// Nodes allowed to host services of this task, empty means every node
    #[serde(default)]
    pub associated_nodes: Vec<String>,

    #[serde(default)]
    pub groups: Vec<String>,

    /// Paths removed from the service directory after the process stopped
    #[serde(default)]
    pub deleted_files_after_stop: Vec<String>,

    #[serde(default)]
    pub process_configuration: ProcessConfiguration,

    /// First port tried for services of this task, `None` uses the environment default
    #[serde(default)]
    pub start_port: Option<u16>,

    #[serde(default)]
    pub min_service_count: u32,

    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,

    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,

    #[serde(default)]
    pub includes: Vec<ServiceRemoteInclusion>,

    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

fn default_runtime() -> String {
    "jvm".to_string()
}

impl ServiceTask {
    /// Create a task with defaults for everything but the name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runtime: default_runtime(),
            maintenance: false,
            auto_delete_on_stop: true,
            static_services: false,
            associated_nodes: vec![],
            groups: vec![],
            deleted_files_after_stop: vec![],
            process_configuration: ProcessConfiguration::default(),
            start_port: None,
            min_service_count: 0,
            templates: vec![],
            deployments: vec![],
            includes: vec![],
            properties: serde_json::Map::new(),
        }
    }

    /// Restrict the task to the given nodes
    pub fn with_associated_nodes(mut self, nodes: Vec<String>) -> Self {
        self.associated_nodes = nodes;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_template(mut self, template: ServiceTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn with_start_port(mut self, port: u16) -> Self {
        self.start_port = Some(port);
        self
    }

    pub fn with_max_heap(mut self, mib: u32) -> Self {
        self.process_configuration.max_heap_memory_size = mib;
        self
    }
}

/// Fully resolved description of one service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfiguration {
    /// Identity; `node_unique_id` is empty until the service is placed
    pub service_id: ServiceId,

    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default)]
    pub auto_delete_on_stop: bool,

    #[serde(default)]
    pub static_service: bool,

    /// Nodes the scheduler may pick, empty means every node
    #[serde(default)]
    pub associated_nodes: Vec<String>,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub deleted_files_after_stop: Vec<String>,

    #[serde(default)]
    pub process_config: ProcessConfiguration,

    /// Requested port; the hosting node moves up to the next free one
    pub port: u16,

    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,

    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,

    #[serde(default)]
    pub includes: Vec<ServiceRemoteInclusion>,

    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ServiceConfiguration {
    /// Minimal configuration for a task name, unplaced
    pub fn new(task_name: impl Into<String>, task_service_id: u32) -> Self {
        let process_config = ProcessConfiguration::default();
        Self {
            service_id: ServiceId::new(task_name, task_service_id, "", process_config.environment),
            runtime: default_runtime(),
            auto_delete_on_stop: true,
            static_service: false,
            associated_nodes: vec![],
            groups: vec![],
            deleted_files_after_stop: vec![],
            port: process_config.environment.default_start_port(),
            process_config,
            templates: vec![],
            deployments: vec![],
            includes: vec![],
            properties: serde_json::Map::new(),
        }
    }

    /// Pin the configuration to a node
    pub fn pinned_to(mut self, node_unique_id: impl Into<String>) -> Self {
        self.service_id.node_unique_id = node_unique_id.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Node the configuration is pinned to, if any
    pub fn pinned_node(&self) -> Option<&str> {
        let node = self.service_id.node_unique_id.as_str();
        (!node.is_empty()).then_some(node)
    }

    /// Whether the scheduler may place this service on the given node
    pub fn allows_node(&self, node_unique_id: &str) -> bool {
        self.associated_nodes.is_empty()
            || self.associated_nodes.iter().any(|n| n == node_unique_id)
    }
}
