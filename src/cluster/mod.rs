//! # fleetnet cluster membership
//!
//! Every node keeps a registry of the other nodes of its cluster, the channel
//! it holds to each of them and their latest liveness snapshot.
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │      NodeServerProvider      │
//!            │  local ─ head ─ registry     │
//!            └──────────────┬───────────────┘
//!         ┌─────────────────┼─────────────────┐
//!         ▼                 ▼                 ▼
//!   ┌───────────┐     ┌───────────┐     ┌───────────┐
//!   │ Node-1    │     │ Node-2    │     │ Node-3    │
//!   │ (local)   │     │ channel ✓ │     │ channel ✗ │
//!   └───────────┘     └───────────┘     └───────────┘
//! ```
//!
//! The head node is the available node that started first.

pub mod heartbeat;
pub mod node;
pub mod node_server;
pub mod provider;

pub use heartbeat::{spawn_heartbeat, ClusterMember, HeartbeatConfig};
pub use node::{HostAndPort, NetworkCluster, NetworkClusterNode, NetworkClusterNodeInfoSnapshot};
pub use node_server::{NodeServer, NodeServerKind};
pub use provider::{AdmissionError, NodeServerProvider, ReconcileOutcome};

/// Default node-to-node port
pub const NODE_PORT: u16 = 1410;

/// Default heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Seconds without a snapshot after which a peer counts as gone
pub const NODE_TIMEOUT_SECS: u64 = 30;

/// Bound for every forwarded call, in seconds
pub const REMOTE_TIMEOUT_SECS: u64 = 5;
