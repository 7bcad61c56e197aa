//! Node selection for new services
//!
//! The placement factory asks a [`NodeScheduler`] which node should host a
//! service that is not pinned. [`LoadScoringScheduler`] scores every eligible
//! node by its free CPU, memory and service count and takes the best one.

use std::sync::Arc;

use crate::cluster::{NetworkClusterNodeInfoSnapshot, NodeServer, NodeServerProvider};
use crate::service::ServiceConfiguration;

pub trait NodeScheduler: Send + Sync {
    /// Pick the node for `configuration`, `None` if no node can take it
    fn search_logic_node(
        &self,
        nodes: &NodeServerProvider,
        configuration: &ServiceConfiguration,
    ) -> Option<NetworkClusterNodeInfoSnapshot>;
}

/// Weight configuration for node scoring
///
/// Weights should sum to approximately 1.0.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    /// Weight for CPU availability (default: 0.30)
    pub cpu: f64,
    /// Weight for free memory (default: 0.50)
    pub memory: f64,
    /// Weight for the number of hosted services (default: 0.20)
    pub services: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cpu: 0.30,
            memory: 0.50,
            services: 0.20,
        }
    }
}

/// Score a node from 0.0 (fully loaded) to 100.0 (idle)
pub fn calculate_node_score(
    snapshot: &NetworkClusterNodeInfoSnapshot,
    weights: &ScoringWeights,
) -> f64 {
    let cpu_score = (100.0 - snapshot.system_cpu_usage).clamp(0.0, 100.0);
    let memory_score = if snapshot.max_memory > 0 {
        snapshot.free_memory() as f64 / snapshot.max_memory as f64 * 100.0
    } else {
        0.0
    };
    // 0 services: 100, 10 services: 50, 30 services: 25
    let services_score = 100.0 / (1.0 + snapshot.current_services_count as f64 * 0.1);

    (cpu_score * weights.cpu + memory_score * weights.memory + services_score * weights.services)
        .clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Default)]
pub struct LoadScoringScheduler {
    weights: ScoringWeights,
}

impl LoadScoringScheduler {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    fn eligible(
        server: &Arc<NodeServer>,
        configuration: &ServiceConfiguration,
    ) -> Option<NetworkClusterNodeInfoSnapshot> {
        if !server.is_available() {
            return None;
        }
        let snapshot = server.node_info_snapshot()?;
        let memory = configuration.process_config.max_heap_memory_size as u64;

        (configuration.allows_node(snapshot.unique_id()) && snapshot.can_start(memory))
            .then_some(snapshot)
    }
}

impl NodeScheduler for LoadScoringScheduler {
    fn search_logic_node(
        &self,
        nodes: &NodeServerProvider,
        configuration: &ServiceConfiguration,
    ) -> Option<NetworkClusterNodeInfoSnapshot> {
        nodes
            .node_servers()
            .iter()
            .filter_map(|server| Self::eligible(server, configuration))
            .map(|snapshot| (calculate_node_score(&snapshot, &self.weights), snapshot))
            .max_by(|(a, a_snap), (b, b_snap)| {
                a.total_cmp(b)
                    // equal scores go to the smaller id
                    .then_with(|| b_snap.unique_id().cmp(a_snap.unique_id()))
            })
            .map(|(_, snapshot)| snapshot)
    }
}
