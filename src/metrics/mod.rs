//! System and process metrics
//!
//! Feeds the node liveness snapshot (system CPU, memory) and the process
//! figures of each service snapshot using the `sysinfo` crate.

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::service::ProcessSnapshot;

const MIB: u64 = 1024 * 1024;

/// System-wide figures
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SystemMetrics {
    /// Global CPU usage (0.0 - 100.0)
    pub cpu_usage_percent: f64,
    pub total_memory_mib: u64,
    pub used_memory_mib: u64,
}

pub struct MetricsCollector {
    system: System,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Refresh CPU and memory and return the system figures
    pub fn collect(&mut self) -> SystemMetrics {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        SystemMetrics {
            cpu_usage_percent: self.system.global_cpu_usage() as f64,
            total_memory_mib: self.system.total_memory() / MIB,
            used_memory_mib: self.system.used_memory() / MIB,
        }
    }

    /// Sample one process; an exited process yields an empty snapshot
    pub fn sample_process(&mut self, pid: u32, max_heap_mib: u64) -> ProcessSnapshot {
        let pid = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        match self.system.process(pid) {
            Some(process) => ProcessSnapshot {
                pid: Some(pid.as_u32()),
                heap_usage_memory: process.memory(),
                max_heap_memory: max_heap_mib * MIB,
                cpu_usage: process.cpu_usage() as f64,
                thread_count: process.tasks().map(|t| t.len() as u32).unwrap_or(1),
            },
            None => ProcessSnapshot::empty(),
        }
    }

    /// Sample the node process itself
    pub fn sample_self(&mut self) -> ProcessSnapshot {
        match sysinfo::get_current_pid() {
            Ok(pid) => self.sample_process(pid.as_u32(), 0),
            Err(_) => ProcessSnapshot::empty(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics collector for use across tasks
pub type SharedMetricsCollector = Arc<Mutex<MetricsCollector>>;

pub fn new_shared_collector() -> SharedMetricsCollector {
    Arc::new(Mutex::new(MetricsCollector::new()))
}
