//! Service process manager
//!
//! Creates service directories, assigns ports, enforces the node memory limit
//! and tracks every local service until it is deleted.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use super::service::ProcessCloudService;
use super::template::LocalTemplateStorage;
use super::{CloudService, CloudServiceManager, ProcessError, SnapshotSink};
use crate::cluster::HostAndPort;
use crate::metrics::{new_shared_collector, SharedMetricsCollector};
use crate::service::{ServiceConfiguration, ServiceInfoSnapshot, ServiceLifeCycle};

#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    pub node_unique_id: String,
    /// Host written into service addresses
    pub host: String,
    pub java_command: String,
    /// Temporary services live in `temp/`, static ones in `static/`
    pub services_dir: PathBuf,
    pub inclusion_cache_dir: PathBuf,
    /// Memory in MiB all local services may claim together
    pub max_memory: u64,
    /// Lines of process output kept per service
    pub log_cache_size: usize,
    /// Grace period between the stop command and a kill
    pub stop_timeout: Duration,
}

impl ProcessManagerConfig {
    pub fn new(node_unique_id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            node_unique_id: node_unique_id.into(),
            host: "127.0.0.1".to_string(),
            java_command: "java".to_string(),
            services_dir: base_dir.join("services"),
            inclusion_cache_dir: base_dir.join("cache").join("inclusions"),
            max_memory: 2048,
            log_cache_size: 64,
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_max_memory(mut self, mib: u64) -> Self {
        self.max_memory = mib;
        self
    }
}

type ServiceMap = DashMap<Uuid, Arc<ProcessCloudService>>;

/// State shared by the manager and its services
pub(crate) struct ServiceContext {
    pub config: ProcessManagerConfig,
    pub templates: LocalTemplateStorage,
    pub metrics: SharedMetricsCollector,
    sink: RwLock<Option<Arc<dyn SnapshotSink>>>,
    services: Weak<ServiceMap>,
}

impl ServiceContext {
    pub fn publish(&self, snapshot: ServiceInfoSnapshot) {
        if let Some(sink) = self.sink.read().clone() {
            sink.publish(snapshot);
        }
    }

    pub fn unregister(&self, snapshot: ServiceInfoSnapshot) {
        if let Some(sink) = self.sink.read().clone() {
            sink.unregister(snapshot);
        }
    }

    pub fn remove(&self, unique_id: Uuid) {
        if let Some(services) = self.services.upgrade() {
            services.remove(&unique_id);
        }
    }

    /// Memory in MiB claimed by running services
    pub fn running_memory(&self) -> u64 {
        self.services
            .upgrade()
            .map(|services| {
                services
                    .iter()
                    .filter(|s| s.lifecycle() == ServiceLifeCycle::Running)
                    .map(|s| s.reserved_memory())
                    .sum()
            })
            .unwrap_or(0)
    }
}

pub struct ProcessServiceManager {
    ctx: Arc<ServiceContext>,
    services: Arc<ServiceMap>,
}

impl ProcessServiceManager {
    pub fn new(config: ProcessManagerConfig, templates: LocalTemplateStorage) -> Self {
        let services = Arc::new(ServiceMap::new());
        let ctx = Arc::new(ServiceContext {
            config,
            templates,
            metrics: new_shared_collector(),
            sink: RwLock::new(None),
            services: Arc::downgrade(&services),
        });
        Self { ctx, services }
    }

    pub fn config(&self) -> &ProcessManagerConfig {
        &self.ctx.config
    }

    pub fn templates(&self) -> &LocalTemplateStorage {
        &self.ctx.templates
    }

    /// First port at or above `base` that no local service uses and that is free
    fn next_available_port(&self, base: u16) -> u16 {
        let used: Vec<u16> = self.services.iter().map(|s| s.port()).collect();

        let mut port = base;
        while used.contains(&port) || TcpListener::bind(("0.0.0.0", port)).is_err() {
            match port.checked_add(1) {
                Some(next) => port = next,
                None => return base,
            }
        }
        port
    }

    fn service_directory(&self, configuration: &ServiceConfiguration) -> PathBuf {
        let id = &configuration.service_id;
        if configuration.static_service {
            self.ctx.config.services_dir.join("static").join(id.name())
        } else {
            self.ctx
                .config
                .services_dir
                .join("temp")
                .join(format!("{}_{}", id.name(), id.unique_id))
        }
    }
}

#[async_trait]
impl CloudServiceManager for ProcessServiceManager {
    async fn create_service(
        &self,
        mut configuration: ServiceConfiguration,
    ) -> Result<Arc<dyn CloudService>, ProcessError> {
        let local = &self.ctx.config.node_unique_id;
        match configuration.pinned_node() {
            Some(node) if node != local => {
                return Err(ProcessError::ConfigError(format!(
                    "service is pinned to node {}",
                    node
                )))
            }
            _ => configuration.service_id.node_unique_id = local.clone(),
        }

        let required = configuration.process_config.max_heap_memory_size as u64;
        let available = self
            .ctx
            .config
            .max_memory
            .saturating_sub(self.reserved_memory());
        if required > available {
            return Err(ProcessError::OutOfMemory {
                required,
                available,
            });
        }

        let port = self.next_available_port(configuration.port);
        configuration.port = port;
        let directory = self.service_directory(&configuration);
        let snapshot = ServiceInfoSnapshot::prepared(
            configuration,
            HostAndPort::new(self.ctx.config.host.clone(), port),
        );

        info!(
            "Prepared service {} on port {} in {}",
            snapshot.name(),
            port,
            directory.display()
        );

        let service = ProcessCloudService::new(self.ctx.clone(), directory, snapshot.clone());
        self.services.insert(snapshot.unique_id(), service.clone());
        self.ctx.publish(snapshot);
        Ok(service)
    }

    fn cloud_service(&self, unique_id: Uuid) -> Option<Arc<dyn CloudService>> {
        self.services
            .get(&unique_id)
            .map(|s| s.value().clone() as Arc<dyn CloudService>)
    }

    fn cloud_services(&self) -> Vec<Arc<dyn CloudService>> {
        self.services
            .iter()
            .map(|s| s.value().clone() as Arc<dyn CloudService>)
            .collect()
    }

    fn reserved_memory(&self) -> u64 {
        self.services.iter().map(|s| s.reserved_memory()).sum()
    }

    fn used_memory(&self) -> u64 {
        self.ctx.running_memory()
    }

    fn set_snapshot_sink(&self, sink: Arc<dyn SnapshotSink>) {
        *self.ctx.sink.write() = Some(sink);
    }

    async fn shutdown_all(&self) {
        info!("Shutting down all services");

        let services: Vec<_> = self.services.iter().map(|s| s.value().clone()).collect();
        for service in services {
            let is_static = service.snapshot().configuration.static_service;
            let result = if is_static {
                service.stop().await
            } else {
                service.delete().await
            };
            if let Err(e) = result {
                error!("Failed to shut down {:?}: {}", service, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceTemplate;
    use crate::test_support::RecordingSink;

    fn manager(dir: &std::path::Path) -> ProcessServiceManager {
        let config = ProcessManagerConfig::new("Node-1", dir).with_max_memory(1024);
        ProcessServiceManager::new(config, LocalTemplateStorage::new(dir.join("templates")))
    }

    #[tokio::test]
    async fn test_create_service_prepared() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let sink = RecordingSink::new();
        manager.set_snapshot_sink(sink.clone());

        let service = manager
            .create_service(ServiceConfiguration::new("Lobby", 1).with_port(41000))
            .await
            .unwrap();
        let snapshot = service.snapshot();

        assert_eq!(snapshot.lifecycle, ServiceLifeCycle::Prepared);
        assert_eq!(snapshot.node_unique_id(), "Node-1");
        assert!(snapshot.address.port >= 41000);
        assert_eq!(sink.published().len(), 1);
        assert!(manager.cloud_service(snapshot.unique_id()).is_some());
    }

    #[tokio::test]
    async fn test_ports_are_not_shared() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let first = manager
            .create_service(ServiceConfiguration::new("Lobby", 1).with_port(41100))
            .await
            .unwrap();
        let second = manager
            .create_service(ServiceConfiguration::new("Lobby", 2).with_port(41100))
            .await
            .unwrap();

        assert_ne!(first.snapshot().address.port, second.snapshot().address.port);
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let mut config = ServiceConfiguration::new("BedWars", 1);
        config.process_config.max_heap_memory_size = 768;
        manager.create_service(config.clone()).await.unwrap();
        assert_eq!(manager.reserved_memory(), 768);

        config.service_id.task_service_id = 2;
        let result = manager.create_service(config).await;
        assert!(matches!(result, Err(ProcessError::OutOfMemory { available: 256, .. })));
    }

    #[tokio::test]
    async fn test_rejects_foreign_pin() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let result = manager
            .create_service(ServiceConfiguration::new("Lobby", 1).pinned_to("Node-2"))
            .await;
        assert!(matches!(result, Err(ProcessError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_delete_prepared_service() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let sink = RecordingSink::new();
        manager.set_snapshot_sink(sink.clone());

        let service = manager
            .create_service(ServiceConfiguration::new("Lobby", 1))
            .await
            .unwrap();
        let id = service.unique_id();

        service.delete().await.unwrap();

        assert!(manager.cloud_service(id).is_none());
        assert_eq!(sink.unregistered().len(), 1);
        assert_eq!(sink.unregistered()[0].lifecycle, ServiceLifeCycle::Deleted);
        assert_eq!(manager.reserved_memory(), 0);
    }

    #[tokio::test]
    async fn test_waiting_templates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let template = ServiceTemplate::new("Lobby", "default");
        manager.templates().create(&template).unwrap();
        std::fs::write(
            manager.templates().template_dir(&template).join("motd.txt"),
            "hello",
        )
        .unwrap();

        let mut config = ServiceConfiguration::new("Lobby", 1);
        config.static_service = true;
        let service = manager.create_service(config).await.unwrap();
        service.add_template(template);
        service.include_waiting_templates().await.unwrap();

        let target = dir.path().join("services/static/Lobby-1/motd.txt");
        assert_eq!(std::fs::read_to_string(target).unwrap(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_lifecycle() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-java.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho started\nwhile read line; do\n  echo \"> $line\"\n  [ \"$line\" = stop ] && exit 0\ndone\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = ProcessManagerConfig::new("Node-1", dir.path()).with_max_memory(1024);
        config.java_command = script.to_string_lossy().to_string();
        let manager =
            ProcessServiceManager::new(config, LocalTemplateStorage::new(dir.path().join("t")));

        let mut service_config = ServiceConfiguration::new("Lobby", 1);
        service_config.auto_delete_on_stop = false;
        let service = manager.create_service(service_config).await.unwrap();

        service.start().await.unwrap();
        assert_eq!(service.snapshot().lifecycle, ServiceLifeCycle::Running);
        assert_eq!(manager.used_memory(), 512);

        service.run_command("say hi").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let logs = service.cached_log_messages();
        assert!(logs.contains(&"started".to_string()));
        assert!(logs.contains(&"> say hi".to_string()));

        service.stop().await.unwrap();
        assert_eq!(service.snapshot().lifecycle, ServiceLifeCycle::Stopped);
        assert!(service.run_command("say hi").await.is_err());
        assert!(manager.cloud_service(service.unique_id()).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_survives_late_exit_of_old_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-java.sh");
        // the background sleep keeps stdout open after the shell exits
        std::fs::write(
            &script,
            "#!/bin/sh\necho started\n(sleep 1) &\nwhile read line; do\n  [ \"$line\" = stop ] && exit 0\ndone\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = ProcessManagerConfig::new("Node-1", dir.path()).with_max_memory(1024);
        config.java_command = script.to_string_lossy().to_string();
        let manager =
            ProcessServiceManager::new(config, LocalTemplateStorage::new(dir.path().join("t")));

        let mut service_config = ServiceConfiguration::new("Lobby", 1);
        service_config.auto_delete_on_stop = true;
        let service = manager.create_service(service_config).await.unwrap();
        let id = service.unique_id();

        service.start().await.unwrap();
        service.restart().await.unwrap();
        assert_eq!(service.snapshot().lifecycle, ServiceLifeCycle::Running);

        tokio::time::sleep(Duration::from_millis(1800)).await;

        assert_eq!(service.snapshot().lifecycle, ServiceLifeCycle::Running);
        assert!(manager.cloud_service(id).is_some());
        service.kill().await.unwrap();
    }
}
