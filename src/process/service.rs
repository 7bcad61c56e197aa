//! A service process managed by this node

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};

use super::manager::ServiceContext;
use super::{fetch, CloudService, ProcessError};
use crate::service::{
    ProcessSnapshot, ServiceDeployment, ServiceInfoSnapshot, ServiceLifeCycle,
    ServiceRemoteInclusion, ServiceTemplate,
};

pub struct ProcessCloudService {
    me: Weak<ProcessCloudService>,
    ctx: Arc<ServiceContext>,
    directory: PathBuf,
    snapshot: RwLock<ServiceInfoSnapshot>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    logs: Arc<Mutex<VecDeque<String>>>,
    waiting_templates: Mutex<Vec<ServiceTemplate>>,
    waiting_inclusions: Mutex<Vec<ServiceRemoteInclusion>>,
    deployments: Mutex<Vec<ServiceDeployment>>,
    first_start: Mutex<bool>,
    /// Bumped on every spawn; exit notices of older processes are ignored
    generation: AtomicU64,
}

impl ProcessCloudService {
    pub(crate) fn new(
        ctx: Arc<ServiceContext>,
        directory: PathBuf,
        snapshot: ServiceInfoSnapshot,
    ) -> Arc<Self> {
        let deployments = snapshot.configuration.deployments.clone();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            directory,
            snapshot: RwLock::new(snapshot),
            child: tokio::sync::Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
            logs: Arc::new(Mutex::new(VecDeque::new())),
            waiting_templates: Mutex::new(vec![]),
            waiting_inclusions: Mutex::new(vec![]),
            deployments: Mutex::new(deployments),
            first_start: Mutex::new(true),
            generation: AtomicU64::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn lifecycle(&self) -> ServiceLifeCycle {
        self.snapshot.read().lifecycle
    }

    /// Memory in MiB this service claims on the node
    pub fn reserved_memory(&self) -> u64 {
        self.snapshot
            .read()
            .configuration
            .process_config
            .max_heap_memory_size as u64
    }

    pub fn port(&self) -> u16 {
        self.snapshot.read().address.port
    }

    fn name(&self) -> String {
        self.snapshot.read().name()
    }

    fn set_lifecycle(&self, lifecycle: ServiceLifeCycle) -> ServiceInfoSnapshot {
        let mut snapshot = self.snapshot.write();
        snapshot.lifecycle = lifecycle;
        if lifecycle != ServiceLifeCycle::Running {
            snapshot.process = ProcessSnapshot::empty();
            snapshot.connected = false;
            snapshot.connected_time = None;
        }
        snapshot.clone()
    }

    fn push_log(logs: &Mutex<VecDeque<String>>, capacity: usize, line: String) {
        let mut logs = logs.lock();
        if logs.len() >= capacity {
            logs.pop_front();
        }
        logs.push_back(line);
    }

    /// Copy templates and download inclusions before the process starts
    async fn prepare_directory(&self) -> Result<(), ProcessError> {
        tokio::fs::create_dir_all(&self.directory).await?;

        let (templates, includes, is_static) = {
            let snapshot = self.snapshot.read();
            (
                snapshot.configuration.templates.clone(),
                snapshot.configuration.includes.clone(),
                snapshot.configuration.static_service,
            )
        };
        let first_start = std::mem::replace(&mut *self.first_start.lock(), false);

        for template in &templates {
            let copy = first_start || !is_static || template.always_copy_to_static_services;
            if !copy {
                continue;
            }
            if let Err(e) = self.ctx.templates.copy_to(template, &self.directory) {
                warn!("Template {} not applied to {}: {}", template, self.name(), e);
            }
        }
        self.include_waiting_templates().await?;

        for inclusion in &includes {
            fetch::include(inclusion, &self.ctx.config.inclusion_cache_dir, &self.directory)
                .await?;
        }
        self.include_waiting_inclusions().await?;
        Ok(())
    }

    fn command(&self) -> Command {
        let snapshot = self.snapshot.read();
        let process = &snapshot.configuration.process_config;

        let mut command = Command::new(&self.ctx.config.java_command);
        command
            .args(&process.jvm_options)
            .arg(format!("-Xmx{}M", process.max_heap_memory_size))
            .arg("-jar")
            .arg(process.environment.application_file())
            .args(&process.process_parameters)
            .current_dir(&self.directory)
            .env("FLEETNET_SERVICE_NAME", snapshot.name())
            .env("FLEETNET_SERVICE_ID", snapshot.unique_id().to_string())
            .env("FLEETNET_SERVICE_PORT", snapshot.address.port.to_string())
            .env("FLEETNET_NODE", &snapshot.service_id.node_unique_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_log_readers(&self, child: &mut Child, generation: u64) {
        let capacity = self.ctx.config.log_cache_size.max(1);

        if let Some(stderr) = child.stderr.take() {
            let logs = self.logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    Self::push_log(&logs, capacity, line);
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            let logs = self.logs.clone();
            let me = self.me.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    Self::push_log(&logs, capacity, line);
                }
                // stdout closes when the process exits
                if let Some(service) = me.upgrade() {
                    service.on_process_exit(generation).await;
                }
            });
        }
    }

    /// Handle a process that exited without a stop request
    async fn on_process_exit(&self, generation: u64) {
        if generation != self.generation.load(Ordering::Acquire) {
            debug!("Ignoring exit of a replaced process of {}", self.name());
            return;
        }
        if self.lifecycle() != ServiceLifeCycle::Running {
            return;
        }
        info!("Service {} exited", self.name());
        if let Err(e) = self.stop_process(false).await {
            error!("Cleanup of {} failed: {}", self.name(), e);
        }
        self.after_stop().await;
    }

    /// Stop the process; `force` kills it right away
    async fn stop_process(&self, force: bool) -> Result<(), ProcessError> {
        let snapshot = self.set_lifecycle(ServiceLifeCycle::Stopped);
        let stop_command = if snapshot.service_id.environment.is_proxy() {
            "end"
        } else {
            "stop"
        };

        if !force {
            if let Some(stdin) = self.stdin.lock().await.as_mut() {
                let _ = stdin.write_all(format!("{}\n", stop_command).as_bytes()).await;
                let _ = stdin.flush().await;
            }
        }
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            let exited = if force {
                false
            } else {
                tokio::time::timeout(self.ctx.config.stop_timeout, child.wait())
                    .await
                    .is_ok()
            };
            if !exited {
                debug!("Killing {}", snapshot.name());
                child.kill().await?;
            }
        }

        for path in &snapshot.configuration.deleted_files_after_stop {
            match fetch::destination_path(&self.directory, path) {
                Ok(path) if path.is_dir() => {
                    let _ = tokio::fs::remove_dir_all(path).await;
                }
                Ok(path) => {
                    let _ = tokio::fs::remove_file(path).await;
                }
                Err(e) => warn!("Skipping deleted file entry: {}", e),
            }
        }

        info!("Service {} stopped", snapshot.name());
        self.ctx.publish(snapshot);
        Ok(())
    }

    /// Auto deletion of stopped services
    async fn after_stop(&self) {
        let auto_delete = self.snapshot.read().configuration.auto_delete_on_stop;
        if auto_delete {
            if let Err(e) = self.delete().await {
                error!("Auto delete of {} failed: {}", self.name(), e);
            }
        }
    }
}

#[async_trait]
impl CloudService for ProcessCloudService {
    fn snapshot(&self) -> ServiceInfoSnapshot {
        self.snapshot.read().clone()
    }

    async fn start(&self) -> Result<(), ProcessError> {
        match self.lifecycle() {
            ServiceLifeCycle::Running => return Ok(()),
            ServiceLifeCycle::Deleted => return Err(ProcessError::NotRunning(self.name())),
            _ => {}
        }

        let required = self.reserved_memory();
        let available = self
            .ctx
            .config
            .max_memory
            .saturating_sub(self.ctx.running_memory());
        if required > available {
            return Err(ProcessError::OutOfMemory {
                required,
                available,
            });
        }

        self.prepare_directory().await?;

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| ProcessError::SpawnError(format!("{}: {}", self.name(), e)))?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.spawn_log_readers(&mut child, generation);
        *self.stdin.lock().await = child.stdin.take();
        let pid = child.id();
        *self.child.lock().await = Some(child);

        let snapshot = {
            let mut snapshot = self.snapshot.write();
            snapshot.lifecycle = ServiceLifeCycle::Running;
            snapshot.process.pid = pid;
            snapshot.clone()
        };
        info!("Service {} started (pid {:?})", snapshot.name(), pid);
        self.ctx.publish(snapshot);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessError> {
        if self.lifecycle() != ServiceLifeCycle::Running {
            return Ok(());
        }
        self.stop_process(false).await?;
        self.after_stop().await;
        Ok(())
    }

    async fn delete(&self) -> Result<(), ProcessError> {
        match self.lifecycle() {
            ServiceLifeCycle::Deleted => return Ok(()),
            ServiceLifeCycle::Running => self.stop_process(false).await?,
            _ => {}
        }

        self.deploy_resources(true).await?;

        let is_static = self.snapshot.read().configuration.static_service;
        if !is_static && self.directory.exists() {
            tokio::fs::remove_dir_all(&self.directory).await?;
        }

        let snapshot = self.set_lifecycle(ServiceLifeCycle::Deleted);
        self.ctx.remove(snapshot.unique_id());
        info!("Service {} deleted", snapshot.name());
        self.ctx.unregister(snapshot);
        Ok(())
    }

    async fn restart(&self) -> Result<(), ProcessError> {
        if self.lifecycle() == ServiceLifeCycle::Running {
            self.stop_process(false).await?;
        }
        self.start().await
    }

    async fn kill(&self) -> Result<(), ProcessError> {
        if self.lifecycle() != ServiceLifeCycle::Running {
            return Ok(());
        }
        self.stop_process(true).await?;
        self.after_stop().await;
        Ok(())
    }

    async fn run_command(&self, line: &str) -> Result<(), ProcessError> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| ProcessError::NotRunning(self.name()))?;
        stdin.write_all(format!("{}\n", line).as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn add_template(&self, template: ServiceTemplate) {
        self.waiting_templates.lock().push(template);
    }

    fn add_deployment(&self, deployment: ServiceDeployment) {
        self.deployments.lock().push(deployment);
    }

    fn add_inclusion(&self, inclusion: ServiceRemoteInclusion) {
        self.waiting_inclusions.lock().push(inclusion);
    }

    async fn include_waiting_templates(&self) -> Result<(), ProcessError> {
        let templates = std::mem::take(&mut *self.waiting_templates.lock());
        for template in &templates {
            self.ctx.templates.copy_to(template, &self.directory)?;
        }
        Ok(())
    }

    async fn include_waiting_inclusions(&self) -> Result<(), ProcessError> {
        let inclusions = std::mem::take(&mut *self.waiting_inclusions.lock());
        for inclusion in &inclusions {
            fetch::include(inclusion, &self.ctx.config.inclusion_cache_dir, &self.directory)
                .await?;
        }
        Ok(())
    }

    async fn deploy_resources(&self, remove_deployments: bool) -> Result<(), ProcessError> {
        let deployments = if remove_deployments {
            std::mem::take(&mut *self.deployments.lock())
        } else {
            self.deployments.lock().clone()
        };
        if !self.directory.exists() {
            return Ok(());
        }
        for deployment in &deployments {
            self.ctx.templates.deploy(&self.directory, deployment)?;
        }
        Ok(())
    }

    fn cached_log_messages(&self) -> Vec<String> {
        self.logs.lock().iter().cloned().collect()
    }

    fn refresh_snapshot(&self) -> ServiceInfoSnapshot {
        let (pid, max_heap) = {
            let snapshot = self.snapshot.read();
            (
                snapshot.process.pid,
                snapshot.configuration.process_config.max_heap_memory_size as u64,
            )
        };

        let snapshot = {
            let process = match pid {
                Some(pid) => self.ctx.metrics.lock().sample_process(pid, max_heap),
                None => ProcessSnapshot::empty(),
            };
            let mut snapshot = self.snapshot.write();
            if snapshot.lifecycle == ServiceLifeCycle::Running {
                snapshot.process = process;
                if snapshot.process.pid.is_none() {
                    snapshot.process.pid = pid;
                }
            }
            snapshot.clone()
        };
        self.ctx.publish(snapshot.clone());
        snapshot
    }
}

impl std::fmt::Debug for ProcessCloudService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCloudService")
            .field("name", &self.name())
            .field("lifecycle", &self.lifecycle())
            .field("directory", &self.directory)
            .finish()
    }
}
