//! Crate-level orchestration errors

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::network::ChannelError;
use crate::process::ProcessError;
use crate::service::ServiceLifeCycle;

/// Errors returned by the placement factory and the service control providers
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The node is unknown, disconnected or has not reported yet
    #[error("Node {0} is not available")]
    Unavailable(String),

    #[error("Service {0} does not exist")]
    ServiceNotFound(Uuid),

    #[error("Node {node} did not reply within {timeout:?}")]
    Timeout { node: String, timeout: Duration },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The owning node executed the request and reported a failure
    #[error("Node {node} rejected the request: {message}")]
    Remote { node: String, message: String },

    #[error("Placement failed: {0}")]
    PlacementFailed(String),

    #[error("Task {0} does not exist")]
    TaskNotFound(String),

    #[error("Cannot move service {service} from {from} to {to}")]
    IllegalTransition {
        service: String,
        from: ServiceLifeCycle,
        to: ServiceLifeCycle,
    },

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Unexpected reply from node {node}: {reply}")]
    UnexpectedReply { node: String, reply: String },
}

impl OrchestrationError {
    /// Check whether the error is caused by cluster churn rather than the request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout { .. } | Self::Channel(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
