//! Cluster-wide view of every service

use std::collections::{BTreeSet, HashMap};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::service::{ServiceEnvironmentType, ServiceInfoSnapshot};

const EVENT_CAPACITY: usize = 256;

/// Change notifications of the aggregate view
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Registered(ServiceInfoSnapshot),
    Updated(ServiceInfoSnapshot),
    Unregistered(ServiceInfoSnapshot),
}

impl ServiceEvent {
    pub fn snapshot(&self) -> &ServiceInfoSnapshot {
        match self {
            Self::Registered(s) | Self::Updated(s) | Self::Unregistered(s) => s,
        }
    }
}

/// Snapshots of every service in the cluster, local and remote
pub struct GeneralCloudServiceProvider {
    services: DashMap<Uuid, ServiceInfoSnapshot>,
    events: broadcast::Sender<ServiceEvent>,
}

impl GeneralCloudServiceProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            services: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ServiceEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Insert or replace a snapshot; a deleted snapshot unregisters instead
    ///
    /// Returns `true` when the service was not known before.
    pub fn register(&self, snapshot: ServiceInfoSnapshot) -> bool {
        if snapshot.lifecycle.is_deleted() {
            self.unregister(snapshot.unique_id());
            return false;
        }

        let previous = self.services.insert(snapshot.unique_id(), snapshot.clone());
        let is_new = previous.is_none();
        if is_new {
            debug!("Registered service {}", snapshot.service_id);
            self.emit(ServiceEvent::Registered(snapshot));
        } else {
            self.emit(ServiceEvent::Updated(snapshot));
        }
        is_new
    }

    /// Drop a snapshot; the event fires only for the call that removed it
    pub fn unregister(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        let (_, snapshot) = self.services.remove(&unique_id)?;
        debug!("Unregistered service {}", snapshot.service_id);
        self.emit(ServiceEvent::Unregistered(snapshot.clone()));
        Some(snapshot)
    }

    /// Drop every snapshot owned by a node, one event per snapshot
    pub fn unregister_by_node(&self, node_unique_id: &str) -> Vec<ServiceInfoSnapshot> {
        let owned: Vec<Uuid> = self
            .services
            .iter()
            .filter(|s| s.node_unique_id() == node_unique_id)
            .map(|s| *s.key())
            .collect();

        owned
            .into_iter()
            .filter_map(|id| self.unregister(id))
            .collect()
    }

    pub fn service(&self, unique_id: Uuid) -> Option<ServiceInfoSnapshot> {
        self.services.get(&unique_id).map(|s| s.value().clone())
    }

    /// Look up by display name, e.g. `Lobby-1` (case-insensitive)
    pub fn service_by_name(&self, name: &str) -> Option<ServiceInfoSnapshot> {
        self.services
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
            .map(|s| s.value().clone())
    }

    pub fn services(&self) -> Vec<ServiceInfoSnapshot> {
        let mut services: Vec<_> = self.services.iter().map(|s| s.value().clone()).collect();
        services.sort_by(|a, b| {
            a.task_name()
                .cmp(b.task_name())
                .then(a.service_id.task_service_id.cmp(&b.service_id.task_service_id))
        });
        services
    }

    fn filtered(&self, filter: impl Fn(&ServiceInfoSnapshot) -> bool) -> Vec<ServiceInfoSnapshot> {
        self.services().into_iter().filter(|s| filter(s)).collect()
    }

    pub fn services_by_task(&self, task: &str) -> Vec<ServiceInfoSnapshot> {
        self.filtered(|s| s.task_name().eq_ignore_ascii_case(task))
    }

    pub fn services_by_group(&self, group: &str) -> Vec<ServiceInfoSnapshot> {
        self.filtered(|s| s.is_in_group(group))
    }

    pub fn services_by_node(&self, node_unique_id: &str) -> Vec<ServiceInfoSnapshot> {
        self.filtered(|s| s.node_unique_id() == node_unique_id)
    }

    pub fn services_by_environment(
        &self,
        environment: ServiceEnvironmentType,
    ) -> Vec<ServiceInfoSnapshot> {
        self.filtered(|s| s.service_id.environment == environment)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn service_count_by_task(&self, task: &str) -> usize {
        self.services_by_task(task).len()
    }

    pub fn service_count_by_group(&self, group: &str) -> usize {
        self.services_by_group(group).len()
    }

    pub fn service_count_by_node(&self, node_unique_id: &str) -> usize {
        self.services
            .iter()
            .filter(|s| s.node_unique_id() == node_unique_id)
            .count()
    }

    /// Number of services per task name
    pub fn service_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for service in self.services.iter() {
            *counts.entry(service.task_name().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Smallest task service id (from 1) no service of the task uses
    pub fn next_task_service_id(&self, task: &str) -> u32 {
        let taken: BTreeSet<u32> = self
            .services
            .iter()
            .filter(|s| s.task_name().eq_ignore_ascii_case(task))
            .map(|s| s.service_id.task_service_id)
            .collect();

        (1..).find(|id| !taken.contains(id)).unwrap_or(1)
    }
}

impl Default for GeneralCloudServiceProvider {
    fn default() -> Self {
        Self::new()
    }
}
