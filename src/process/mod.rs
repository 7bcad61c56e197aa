//! Local process manager
//!
//! The cluster core reaches the services running on this node only through
//! [`CloudServiceManager`] and [`CloudService`]. [`ProcessServiceManager`] is
//! the implementation backed by `tokio::process`.

pub mod fetch;
pub mod manager;
pub mod service;
pub mod template;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::service::{
    ServiceConfiguration, ServiceDeployment, ServiceInfoSnapshot, ServiceRemoteInclusion,
    ServiceTemplate,
};

pub use fetch::FetchError;
pub use manager::{ProcessManagerConfig, ProcessServiceManager};
pub use service::ProcessCloudService;
pub use template::LocalTemplateStorage;

/// Errors raised by the local process manager
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Service not found: {0}")]
    NotFound(Uuid),

    #[error("Service {0} is not running")]
    NotRunning(String),

    #[error("Not enough memory: {required} MiB required, {available} MiB available")]
    OutOfMemory { required: u64, available: u64 },

    #[error("Template {0} does not exist")]
    TemplateNotFound(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Fetch error: {0}")]
    FetchError(#[from] FetchError),
}

/// Receives every snapshot change of a local service
///
/// Implementations update the cluster-wide view and notify peers.
pub trait SnapshotSink: Send + Sync {
    fn publish(&self, snapshot: ServiceInfoSnapshot);

    fn unregister(&self, snapshot: ServiceInfoSnapshot);
}

/// A service process on this node
#[async_trait]
pub trait CloudService: Send + Sync {
    fn snapshot(&self) -> ServiceInfoSnapshot;

    fn unique_id(&self) -> Uuid {
        self.snapshot().unique_id()
    }

    async fn start(&self) -> Result<(), ProcessError>;

    async fn stop(&self) -> Result<(), ProcessError>;

    /// Stop if needed, remove files and unregister the service
    async fn delete(&self) -> Result<(), ProcessError>;

    async fn restart(&self) -> Result<(), ProcessError>;

    async fn kill(&self) -> Result<(), ProcessError>;

    async fn run_command(&self, line: &str) -> Result<(), ProcessError>;

    /// Queue a template, applied by the next `include_waiting_templates`
    fn add_template(&self, template: ServiceTemplate);

    fn add_deployment(&self, deployment: ServiceDeployment);

    fn add_inclusion(&self, inclusion: ServiceRemoteInclusion);

    async fn include_waiting_templates(&self) -> Result<(), ProcessError>;

    async fn include_waiting_inclusions(&self) -> Result<(), ProcessError>;

    /// Copy the service directory back into the deployment templates
    async fn deploy_resources(&self, remove_deployments: bool) -> Result<(), ProcessError>;

    fn cached_log_messages(&self) -> Vec<String>;

    /// Re-sample the process figures and publish the snapshot
    fn refresh_snapshot(&self) -> ServiceInfoSnapshot;
}

/// Creates and tracks the services of this node
#[async_trait]
pub trait CloudServiceManager: Send + Sync {
    /// Prepare a service; it is created in the `Prepared` state
    async fn create_service(
        &self,
        configuration: ServiceConfiguration,
    ) -> Result<Arc<dyn CloudService>, ProcessError>;

    fn cloud_service(&self, unique_id: Uuid) -> Option<Arc<dyn CloudService>>;

    fn cloud_services(&self) -> Vec<Arc<dyn CloudService>>;

    /// Memory in MiB claimed by every local service
    fn reserved_memory(&self) -> u64;

    /// Memory in MiB claimed by running local services
    fn used_memory(&self) -> u64;

    /// Route snapshot changes of local services to `sink`
    fn set_snapshot_sink(&self, sink: Arc<dyn SnapshotSink>);

    /// Stop every service; used on node shutdown
    async fn shutdown_all(&self);
}
