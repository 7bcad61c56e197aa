//! Operator commands
//!
//! Lines typed on the node console, or sent by a peer in an `ExecuteCommand`
//! packet, run here and answer with plain text lines.

use tracing::info;

use super::CloudNode;
use crate::error::OrchestrationError;
use crate::logging::LoggingError;
use crate::network::{Packet, Reply};
use crate::provider::ProviderKind;
use crate::service::{ServiceLifeCycle, ServiceTaskProvider, ServiceTemplate};

const HELP: &[&str] = &[
    "nodes                                  list cluster members",
    "head                                   show the head node",
    "services [task]                        list services",
    "create <task> [amount]                 create services from a task",
    "service <name> start|stop|restart|delete|kill",
    "service <name> cmd <line>              send a line to the service console",
    "service <name> log                     show cached output",
    "deploy <prefix>/<name>                 ship a local template to every node",
    "loglevel <level>                       change the log level on every node",
    "node <id> <command>                    run a command on another node",
];

impl CloudNode {
    pub(super) fn apply_log_level(&self, level: &str) -> Result<(), LoggingError> {
        match self.log_level.read().as_ref() {
            Some(handle) => handle.set_level(level),
            None => Ok(()),
        }
    }

    /// Run a command line on a remote node
    pub async fn execute_command_on(
        &self,
        node_unique_id: &str,
        line: &str,
    ) -> crate::error::Result<Vec<String>> {
        let server = self
            .nodes()
            .node_server(node_unique_id)
            .filter(|s| s.is_connected() && !s.is_local())
            .ok_or_else(|| OrchestrationError::Unavailable(node_unique_id.to_string()))?;

        let reply = server
            .query(
                Packet::ExecuteCommand {
                    line: line.to_string(),
                },
                self.nodes().remote_timeout(),
            )
            .await?;
        match reply {
            Reply::Lines(lines) => Ok(lines),
            Reply::Error(message) => Err(OrchestrationError::Remote {
                node: node_unique_id.to_string(),
                message,
            }),
            other => Err(OrchestrationError::UnexpectedReply {
                node: node_unique_id.to_string(),
                reply: format!("{:?}", other),
            }),
        }
    }

    /// Run one command line on this node
    pub async fn execute_command_line(&self, line: &str) -> Vec<String> {
        let args: Vec<&str> = line.split_whitespace().collect();
        match args.as_slice() {
            [] => vec![],
            ["help"] => HELP.iter().map(|l| l.to_string()).collect(),
            ["nodes"] => self.list_nodes(),
            ["head"] => vec![format!("Head node: {}", self.head_node().unique_id())],
            ["services"] => self.list_services(None),
            ["services", task] => self.list_services(Some(*task)),
            ["create", task] => self.create_from_task(task, 1).await,
            ["create", task, amount] => match amount.parse::<usize>() {
                Ok(amount) if amount > 0 => self.create_from_task(task, amount).await,
                _ => vec![format!("Invalid amount '{}'", amount)],
            },
            ["service", name, "cmd", rest @ ..] if !rest.is_empty() => {
                let provider = self.service_provider_by_name(name);
                if provider.kind() == ProviderKind::Absent {
                    return vec![format!("Service {} not found", name)];
                }
                match provider.run_command(&rest.join(" ")).await {
                    Ok(()) => vec![format!("Sent command to {}", name)],
                    Err(e) => vec![format!("Command failed: {}", e)],
                }
            }
            ["service", name, "log"] => {
                let provider = self.service_provider_by_name(name);
                match provider.cached_log_messages().await {
                    Ok(lines) => lines,
                    Err(e) => vec![format!("Cannot read log of {}: {}", name, e)],
                }
            }
            ["service", name, action] => self.control_service(name, action).await,
            ["deploy", template] => self.deploy_command(template).await,
            ["loglevel", level] => {
                if let Err(e) = self.apply_log_level(level) {
                    return vec![e.to_string()];
                }
                let sent = self
                    .nodes()
                    .send_packet(Packet::SetLogLevel {
                        level: level.to_string(),
                    })
                    .await;
                vec![format!("Log level set to {} here and on {} node(s)", level, sent)]
            }
            ["node", id, rest @ ..] if !rest.is_empty() => {
                match self.execute_command_on(id, &rest.join(" ")).await {
                    Ok(lines) => lines,
                    Err(e) => vec![e.to_string()],
                }
            }
            _ => vec![format!("Unknown command '{}', try 'help'", line.trim())],
        }
    }

    fn list_nodes(&self) -> Vec<String> {
        let head = self.head_node().unique_id();
        self.nodes()
            .node_servers()
            .iter()
            .map(|server| {
                let id = server.unique_id();
                let mut flags = vec![];
                if server.is_local() {
                    flags.push("local");
                }
                if id == head {
                    flags.push("head");
                }
                flags.push(if server.is_available() {
                    "available"
                } else if server.is_connected() {
                    "connected"
                } else {
                    "disconnected"
                });
                let services = self.services().service_count_by_node(&id);
                format!("{} [{}] services={}", id, flags.join(", "), services)
            })
            .collect()
    }

    fn list_services(&self, task: Option<&str>) -> Vec<String> {
        let services = match task {
            Some(task) => self.services().services_by_task(task),
            None => self.services().services(),
        };
        if services.is_empty() {
            return vec!["No services".to_string()];
        }
        services
            .iter()
            .map(|s| {
                format!(
                    "{} {} on {} at {}",
                    s.name(),
                    s.lifecycle,
                    s.node_unique_id(),
                    s.address
                )
            })
            .collect()
    }

    async fn create_from_task(&self, task_name: &str, amount: usize) -> Vec<String> {
        let Some(task) = self.blueprints().service_task(task_name) else {
            return vec![OrchestrationError::TaskNotFound(task_name.to_string()).to_string()];
        };

        let mut lines = Vec::with_capacity(amount);
        for _ in 0..amount {
            match self.factory().create_cloud_service_from_task(&task).await {
                Ok(snapshot) => lines.push(format!(
                    "Created {} on {}",
                    snapshot.name(),
                    snapshot.node_unique_id()
                )),
                Err(e) => lines.push(format!("Failed to create {}: {}", task.name, e)),
            }
        }
        lines
    }

    async fn control_service(&self, name: &str, action: &str) -> Vec<String> {
        let provider = self.service_provider_by_name(name);
        if provider.kind() == ProviderKind::Absent {
            return vec![format!("Service {} not found", name)];
        }

        let result = match action {
            "restart" => provider.restart().await,
            "kill" => provider.kill().await,
            other => match other.parse::<ServiceLifeCycle>() {
                Ok(lifecycle) => provider.set_cloud_service_lifecycle(lifecycle).await,
                Err(e) => return vec![e],
            },
        };

        match result {
            Ok(()) => {
                info!("Service {}: {}", name, action);
                vec![format!("{}: {} done", name, action)]
            }
            Err(e) => vec![format!("{}: {} failed: {}", name, action, e)],
        }
    }

    async fn deploy_command(&self, template: &str) -> Vec<String> {
        let Some((prefix, name)) = template.split_once('/') else {
            return vec!["Template must be given as <prefix>/<name>".to_string()];
        };
        let template = ServiceTemplate::new(prefix, name);
        match self.deploy_template(&template).await {
            Ok(sent) => vec![format!("Deployed {} to {} node(s)", template, sent)],
            Err(e) => vec![format!("Deploy of {} failed: {}", template, e)],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::cluster::{NetworkCluster, NetworkClusterNode};
    use crate::config::NodeConfig;
    use crate::scheduler::LoadScoringScheduler;
    use crate::service::{ServiceTask, StaticBlueprints};
    use crate::test_support::FakeManager;

    fn node(id: &str, startup: i64) -> (Arc<CloudNode>, Arc<FakeManager>) {
        let config = NodeConfig {
            identity: Some(NetworkClusterNode::new(id, vec![])),
            cluster: NetworkCluster::new(
                Uuid::nil(),
                vec![
                    NetworkClusterNode::new("A", vec![]),
                    NetworkClusterNode::new("B", vec![]),
                ],
            ),
            ..Default::default()
        };
        let manager = FakeManager::new(id);
        let blueprints = StaticBlueprints::new(vec![ServiceTask::new("Lobby")], vec![]);
        let node = CloudNode::with_startup(
            &config,
            manager.clone(),
            Arc::new(LoadScoringScheduler::default()),
            Arc::new(blueprints),
            startup,
        );
        (node, manager)
    }

    #[tokio::test]
    async fn test_nodes_and_head() {
        let (a, _) = node("A", 200);
        let (b, _) = node("B", 100);
        CloudNode::link_in_process(&a, &b).unwrap();

        let lines = a.execute_command_line("nodes").await;
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("A [local, available]"));
        assert!(lines[1].starts_with("B [head, available]"));
        assert_eq!(a.execute_command_line("head").await, vec!["Head node: B"]);
    }

    #[tokio::test]
    async fn test_create_and_control_by_name() {
        let (a, manager) = node("A", 200);

        let lines = a.execute_command_line("create Lobby 2").await;
        assert_eq!(lines, vec!["Created Lobby-1 on A", "Created Lobby-2 on A"]);

        let lines = a.execute_command_line("service Lobby-1 start").await;
        assert_eq!(lines, vec!["Lobby-1: start done"]);
        a.execute_command_line("service lobby-1 cmd say hello world").await;

        let lobby = a.services().service_by_name("Lobby-1").unwrap();
        let service = manager.service(lobby.unique_id()).unwrap();
        assert_eq!(service.lifecycle(), ServiceLifeCycle::Running);
        assert_eq!(service.commands(), vec!["say hello world".to_string()]);
        assert_eq!(a.execute_command_line("services Lobby").await.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_inputs() {
        let (a, _) = node("A", 200);

        assert!(a.execute_command_line("create Nope").await[0].contains("Nope"));
        assert_eq!(
            a.execute_command_line("service Lobby-9 stop").await,
            vec!["Service Lobby-9 not found"]
        );
        assert!(a.execute_command_line("fly").await[0].starts_with("Unknown command"));
        assert!(a.execute_command_line("").await.is_empty());
    }

    #[tokio::test]
    async fn test_command_on_remote_node() {
        let (a, _) = node("A", 200);
        let (b, _) = node("B", 100);
        CloudNode::link_in_process(&a, &b).unwrap();

        let lines = a.execute_command_line("node B head").await;
        assert_eq!(lines, vec!["Head node: B"]);

        let unreachable = a.execute_command_on("C", "head").await;
        assert!(matches!(unreachable, Err(OrchestrationError::Unavailable(_))));
    }
}
