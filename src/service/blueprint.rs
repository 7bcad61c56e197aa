//! Read-only blueprint lookups
//!
//! Tasks and groups are owned outside the cluster core. The core only reads
//! them when it turns a [`ServiceTask`] into a placeable [`ServiceConfiguration`].

use dashmap::DashMap;

use super::configuration::{GroupConfiguration, ServiceConfiguration, ServiceTask};
use super::snapshot::ServiceId;

/// Lookup of service tasks by name
pub trait ServiceTaskProvider: Send + Sync {
    fn service_task(&self, name: &str) -> Option<ServiceTask>;

    fn service_tasks(&self) -> Vec<ServiceTask>;
}

/// Lookup of group configurations by name
pub trait GroupConfigurationProvider: Send + Sync {
    fn group_configuration(&self, name: &str) -> Option<GroupConfiguration>;

    fn group_configurations(&self) -> Vec<GroupConfiguration>;
}

/// In-memory blueprint store, seeded from the node configuration file
#[derive(Default)]
pub struct StaticBlueprints {
    tasks: DashMap<String, ServiceTask>,
    groups: DashMap<String, GroupConfiguration>,
}

impl StaticBlueprints {
    pub fn new(tasks: Vec<ServiceTask>, groups: Vec<GroupConfiguration>) -> Self {
        let store = Self::default();
        for task in tasks {
            store.tasks.insert(task.name.clone(), task);
        }
        for group in groups {
            store.groups.insert(group.name.clone(), group);
        }
        store
    }

    pub fn add_task(&self, task: ServiceTask) {
        self.tasks.insert(task.name.clone(), task);
    }

    pub fn add_group(&self, group: GroupConfiguration) {
        self.groups.insert(group.name.clone(), group);
    }
}

impl ServiceTaskProvider for StaticBlueprints {
    fn service_task(&self, name: &str) -> Option<ServiceTask> {
        self.tasks
            .iter()
            .find(|t| t.key().eq_ignore_ascii_case(name))
            .map(|t| t.value().clone())
    }

    fn service_tasks(&self) -> Vec<ServiceTask> {
        self.tasks.iter().map(|t| t.value().clone()).collect()
    }
}

impl GroupConfigurationProvider for StaticBlueprints {
    fn group_configuration(&self, name: &str) -> Option<GroupConfiguration> {
        self.groups.get(name).map(|g| g.clone())
    }

    fn group_configurations(&self) -> Vec<GroupConfiguration> {
        self.groups.iter().map(|g| g.value().clone()).collect()
    }
}

/// Resolve a task into the configuration of its next service instance
///
/// Groups named by the task, plus groups targeting the task's environment,
/// contribute their templates, deployments, inclusions and process options.
/// Templates are copied in list order, so group templates go first and the
/// task's own templates overwrite their files.
pub fn build_configuration(
    task: &ServiceTask,
    groups: &dyn GroupConfigurationProvider,
    task_service_id: u32,
) -> ServiceConfiguration {
    let environment = task.process_configuration.environment;

    let mut applied: Vec<GroupConfiguration> = task
        .groups
        .iter()
        .filter_map(|name| groups.group_configuration(name))
        .collect();
    for group in groups.group_configurations() {
        let targets_env = group.target_environments.contains(&environment);
        if targets_env && !applied.iter().any(|g| g.name == group.name) {
            applied.push(group);
        }
    }

    let mut process_config = task.process_configuration.clone();
    let mut templates = Vec::new();
    let mut deployments = task.deployments.clone();
    let mut includes = task.includes.clone();
    let mut group_names = task.groups.clone();

    for group in &applied {
        if !group_names.contains(&group.name) {
            group_names.push(group.name.clone());
        }
        for template in &group.templates {
            if !templates.contains(template) {
                templates.push(template.clone());
            }
        }
        deployments.extend(group.deployments.iter().cloned());
        includes.extend(group.includes.iter().cloned());
        process_config.jvm_options.extend(group.jvm_options.iter().cloned());
        process_config
            .process_parameters
            .extend(group.process_parameters.iter().cloned());
    }
    for template in &task.templates {
        templates.retain(|t| t != template);
        templates.push(template.clone());
    }

    ServiceConfiguration {
        service_id: ServiceId::new(&task.name, task_service_id, "", environment),
        runtime: task.runtime.clone(),
        auto_delete_on_stop: task.auto_delete_on_stop,
        static_service: task.static_services,
        associated_nodes: task.associated_nodes.clone(),
        groups: group_names,
        deleted_files_after_stop: task.deleted_files_after_stop.clone(),
        process_config,
        port: task
            .start_port
            .unwrap_or_else(|| environment.default_start_port()),
        templates,
        deployments,
        includes,
        properties: task.properties.clone(),
    }
}
