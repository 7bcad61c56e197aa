use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::cluster::NODE_PORT;
use crate::config::{default_config_path, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "fleetnet")]
#[command(about = "Run a node of a game server hosting cluster")]
#[command(version)]
pub struct Args {
    /// Path to the node configuration file (YAML), defaults to ~/.fleetnet/node.yml
    #[arg(short, long, value_name = "FILE", env = "FLEETNET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate the config and show the node without starting it
    #[arg(long)]
    pub dry_run: bool,

    /// Override the address the node endpoints bind to
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the port of the node endpoints
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file loaded before the config
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

impl Args {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    /// Address for the HTTP endpoints: flags first, then the node's first listener
    pub fn bind_addr(&self, config: &NodeConfig) -> String {
        let identity = config.identity();
        let listener = identity.primary_listener();
        let port = self
            .port
            .or_else(|| listener.map(|l| l.port))
            .unwrap_or(NODE_PORT);
        let host = self.bind_addr.as_deref().unwrap_or("0.0.0.0");
        format!("{}:{}", host, port)
    }
}

// ============================================================================
// Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format a dry-run output showing the node, its cluster and its blueprints.
pub fn format_dry_run(config: &NodeConfig, args: &Args) -> String {
    let mut output = String::new();
    let identity = config.identity();
    let cluster = config.cluster();

    output.push_str(&format!(
        "fleetnet v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n", args.config_path().display()));
    output.push_str(&format!("Node: {}\n", identity.unique_id));
    output.push_str(&format!("Bind: {}\n\n", args.bind_addr(config)));

    output.push_str(&format!(
        "Cluster {} ({} nodes):\n",
        cluster.cluster_id,
        cluster.nodes.len()
    ));
    for node in &cluster.nodes {
        let listeners: Vec<String> = node.listeners.iter().map(|l| l.to_string()).collect();
        let marker = if node.unique_id == identity.unique_id {
            " (this node)"
        } else {
            ""
        };
        output.push_str(&format!(
            "  - {}{} [{}]\n",
            node.unique_id,
            marker,
            listeners.join(", ")
        ));
    }
    output.push('\n');

    output.push_str(&format!(
        "Resources: {} MiB memory, start below {}% CPU\n\n",
        config.max_memory, config.max_cpu_usage_to_start_services
    ));

    output.push_str(&format!("Tasks ({}):\n", config.tasks.len()));
    for task in &config.tasks {
        output.push_str(&format!("  - {}", task.name));
        if !task.groups.is_empty() {
            output.push_str(&format!(" groups: {}", task.groups.join(", ")));
        }
        if !task.associated_nodes.is_empty() {
            output.push_str(&format!(" nodes: {}", task.associated_nodes.join(", ")));
        }
        output.push('\n');
    }

    output.push_str(&format!("Groups ({}):\n", config.groups.len()));
    for group in &config.groups {
        output.push_str(&format!("  - {}\n", group.name));
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to start the node. Remove --dry-run to execute.\n");

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_node_config;

    #[test]
    fn test_format_dry_run_basic() {
        let yaml = r#"
identity:
  uniqueId: Node-1
  listeners: [{ host: 10.0.0.1, port: 1410 }]
cluster:
  nodes:
    - uniqueId: Node-2
      listeners: [{ host: 10.0.0.2, port: 1410 }]
tasks:
  - name: Lobby
    groups: [Global]
groups:
  - name: Global
"#;
        let config = parse_node_config(yaml).unwrap();
        let args = Args::parse_from(["fleetnet", "--dry-run"]);
        let output = format_dry_run(&config, &args);

        assert!(output.contains("Node: Node-1"));
        assert!(output.contains("(2 nodes)"));
        assert!(output.contains("Node-1 (this node) [10.0.0.1:1410]"));
        assert!(output.contains("- Lobby groups: Global"));
        assert!(output.contains("Bind: 0.0.0.0:1410"));
        assert!(output.contains("Validation: PASSED"));
    }

    #[test]
    fn test_clap_parsing() {
        let args = Args::parse_from(["fleetnet", "--config", "node.yml"]);
        assert_eq!(args.config_path(), PathBuf::from("node.yml"));
        assert!(!args.dry_run);
    }

    #[test]
    fn test_clap_verbose() {
        let args = Args::parse_from(["fleetnet", "-vvv"]);
        assert_eq!(args.verbose, 3);
    }

    #[test]
    fn test_clap_overrides() {
        let args = Args::parse_from(["fleetnet", "--bind-addr", "127.0.0.1", "--port", "9000"]);
        let config = NodeConfig::default();

        assert_eq!(args.bind_addr(&config), "127.0.0.1:9000");
    }
}
