use std::sync::Arc;

use crate::node::CloudNode;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<CloudNode>,
}

impl AppState {
    pub fn new(node: Arc<CloudNode>) -> Self {
        Self { node }
    }
}
