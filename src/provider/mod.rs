//! Service placement and control
//!
//! - [`CloudServiceFactory`]: decides where a new service runs and creates it
//!   there
//! - [`SpecificCloudServiceProvider`]: controls one service, routed to the node
//!   that owns it
//! - [`GeneralCloudServiceProvider`]: the cluster-wide view of all services

pub mod factory;
pub mod general;
pub mod specific;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::cluster::NodeServerProvider;
use crate::error::{OrchestrationError, Result};
use crate::network::Reply;
use crate::process::CloudServiceManager;

pub use factory::{CloudServiceFactory, RemotePinnedServiceFactory};
pub use general::{GeneralCloudServiceProvider, ServiceEvent};
pub use specific::{ProviderKind, SpecificCloudServiceProvider};

/// Serializes lifecycle operations per service
#[derive(Default)]
pub struct ServiceLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ServiceLocks {
    pub async fn acquire(&self, unique_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(unique_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock of a service that left the cluster
    pub fn forget(&self, unique_id: Uuid) {
        self.locks.remove(&unique_id);
    }

    pub fn contains(&self, unique_id: Uuid) -> bool {
        self.locks.contains_key(&unique_id)
    }
}

/// Collaborators shared by the factory and the providers
pub struct ClusterContext {
    pub nodes: Arc<NodeServerProvider>,
    pub manager: Arc<dyn CloudServiceManager>,
    pub services: Arc<GeneralCloudServiceProvider>,
    pub locks: Arc<ServiceLocks>,
}

impl ClusterContext {
    pub fn new(
        nodes: Arc<NodeServerProvider>,
        manager: Arc<dyn CloudServiceManager>,
        services: Arc<GeneralCloudServiceProvider>,
    ) -> Self {
        Self::with_locks(nodes, manager, services, Arc::default())
    }

    /// Share `locks` with the snapshot sink that forgets unregistered services
    pub fn with_locks(
        nodes: Arc<NodeServerProvider>,
        manager: Arc<dyn CloudServiceManager>,
        services: Arc<GeneralCloudServiceProvider>,
        locks: Arc<ServiceLocks>,
    ) -> Self {
        Self {
            nodes,
            manager,
            services,
            locks,
        }
    }

    pub fn local_id(&self) -> String {
        self.nodes.local_id()
    }
}

/// Turn a `Reply::Error` into [`OrchestrationError::Remote`]
pub(crate) fn check_reply(node: &str, reply: Reply) -> Result<Reply> {
    match reply {
        Reply::Error(message) => Err(OrchestrationError::Remote {
            node: node.to_string(),
            message,
        }),
        other => Ok(other),
    }
}

pub(crate) fn unexpected(node: &str, reply: Reply) -> OrchestrationError {
    OrchestrationError::UnexpectedReply {
        node: node.to_string(),
        reply: format!("{:?}", reply),
    }
}
