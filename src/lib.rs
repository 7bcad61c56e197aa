//! # fleetnet
//!
//! Cluster core for multi-node game server hosting. Every node keeps a
//! registry of its peers, elects the head node, places new services on the
//! best node and routes control calls for a service to the node that runs it.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod node;
pub mod process;
pub mod provider;
pub mod scheduler;
pub mod server;
pub mod service;

#[cfg(test)]
mod test_support;
