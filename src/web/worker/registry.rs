//! In-memory table of launched workers, with a persisted snapshot so the
//! master can pick managed workers back up after a restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Child;

use serde::{Deserialize, Serialize};

use super::supervisor;
use crate::web::models::WorkerConfig;

/// How we can reach the underlying OS process.
///
/// `Spawned` carries the child handle from our own launch; `Restored` entries
/// came back from a snapshot, so only the PID is known and every stop must go
/// through the process-tree kill rather than a handle wait.
pub enum ProcessHandle {
    Spawned(Child),
    Restored,
}

/// Runtime record for one launched worker.
pub struct ManagedProcess {
    pub worker_id: String,
    pub pid: u32,
    /// Unix seconds.
    pub started_at: f64,
    pub config: WorkerConfig,
    pub log_file: PathBuf,
    /// True from launch until the worker confirms readiness.
    pub launching: bool,
    /// Whether a watchdog wrapper ties this worker's life to the master's.
    pub monitored: bool,
    pub handle: ProcessHandle,
}

impl ManagedProcess {
    /// Liveness check. Spawned entries ask the handle first (which also
    /// reaps an exited child); restored entries only have the PID.
    pub fn is_running(&mut self) -> bool {
        match &mut self.handle {
            ProcessHandle::Spawned(child) => match child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(_) => supervisor::is_alive(self.pid),
            },
            ProcessHandle::Restored => supervisor::is_alive(self.pid),
        }
    }
}

/// Snapshot record persisted to the config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedProcess {
    pub pid: u32,
    pub started_at: f64,
    pub config: WorkerConfig,
    pub log_file: PathBuf,
    #[serde(default)]
    pub launching: bool,
}

/// Table of worker-id → ManagedProcess. Locking is the manager's job; one
/// registry lives behind one Mutex there.
#[derive(Default)]
pub struct WorkerRegistry {
    processes: HashMap<String, ManagedProcess>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, process: ManagedProcess) {
        self.processes.insert(process.worker_id.clone(), process);
    }

    pub fn remove(&mut self, worker_id: &str) -> Option<ManagedProcess> {
        self.processes.remove(worker_id)
    }

    pub fn get_mut(&mut self, worker_id: &str) -> Option<&mut ManagedProcess> {
        self.processes.get_mut(worker_id)
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.processes.contains_key(worker_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.processes.keys().cloned().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ManagedProcess)> {
        self.processes.iter_mut()
    }

    pub fn clear(&mut self) {
        self.processes.clear();
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Rebuild the table from a persisted snapshot, keeping only entries
    /// whose PID is still alive. Dead entries are dropped silently; there is
    /// no handle to restore, so survivors come back as `Restored`.
    pub fn load(&mut self, snapshot: HashMap<String, PersistedProcess>) {
        for (worker_id, persisted) in snapshot {
            if supervisor::is_alive(persisted.pid) {
                crate::log_info!(
                    "Restored worker {} (PID: {})",
                    worker_id,
                    persisted.pid
                );
                self.processes.insert(
                    worker_id.clone(),
                    ManagedProcess {
                        worker_id,
                        pid: persisted.pid,
                        started_at: persisted.started_at,
                        config: persisted.config,
                        log_file: persisted.log_file,
                        launching: persisted.launching,
                        monitored: false,
                        handle: ProcessHandle::Restored,
                    },
                );
            } else {
                crate::log_info!(
                    "Worker {} (PID: {}) is no longer running",
                    worker_id,
                    persisted.pid
                );
            }
        }
    }

    /// Serialize entries that are alive right now.
    pub fn snapshot(&mut self) -> HashMap<String, PersistedProcess> {
        let mut out = HashMap::new();
        for (worker_id, process) in self.processes.iter_mut() {
            if process.is_running() {
                out.insert(
                    worker_id.clone(),
                    PersistedProcess {
                        pid: process.pid,
                        started_at: process.started_at,
                        config: process.config.clone(),
                        log_file: process.log_file.clone(),
                        launching: process.launching,
                    },
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(id: &str) -> WorkerConfig {
        WorkerConfig {
            id: id.to_string(),
            name: format!("Worker {id}"),
            host: String::new(),
            port: 8288,
            device: None,
            enabled: true,
            extra_args: String::new(),
        }
    }

    fn persisted(id: &str, pid: u32) -> PersistedProcess {
        PersistedProcess {
            pid,
            started_at: 1_700_000_000.0,
            config: test_config(id),
            log_file: PathBuf::from("logs/workers/test.log"),
            launching: false,
        }
    }

    #[test]
    fn test_load_keeps_only_live_pids() {
        let mut snapshot = HashMap::new();
        // Our own PID is certainly alive; the huge one certainly is not.
        snapshot.insert("0".to_string(), persisted("0", std::process::id()));
        snapshot.insert("1".to_string(), persisted("1", 0x3FFF_FFFF));

        let mut registry = WorkerRegistry::new();
        registry.load(snapshot);

        assert!(registry.contains("0"));
        assert!(!registry.contains("1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_restored_entries_have_no_handle() {
        let mut snapshot = HashMap::new();
        snapshot.insert("0".to_string(), persisted("0", std::process::id()));

        let mut registry = WorkerRegistry::new();
        registry.load(snapshot);

        let entry = registry.get_mut("0").unwrap();
        assert!(matches!(entry.handle, ProcessHandle::Restored));
        assert!(entry.is_running());
    }

    #[test]
    fn test_snapshot_skips_dead_entries() {
        let mut registry = WorkerRegistry::new();
        registry.put(ManagedProcess {
            worker_id: "0".to_string(),
            pid: std::process::id(),
            started_at: 1_700_000_000.0,
            config: test_config("0"),
            log_file: PathBuf::from("logs/workers/a.log"),
            launching: true,
            monitored: false,
            handle: ProcessHandle::Restored,
        });
        registry.put(ManagedProcess {
            worker_id: "1".to_string(),
            pid: 0x3FFF_FFFF,
            started_at: 1_700_000_000.0,
            config: test_config("1"),
            log_file: PathBuf::from("logs/workers/b.log"),
            launching: false,
            monitored: false,
            handle: ProcessHandle::Restored,
        });

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("0"));
        assert!(snapshot["0"].launching);
    }

    #[test]
    fn test_remove_returns_entry() {
        let mut registry = WorkerRegistry::new();
        registry.put(ManagedProcess {
            worker_id: "0".to_string(),
            pid: 1234,
            started_at: 0.0,
            config: test_config("0"),
            log_file: PathBuf::from("x.log"),
            launching: false,
            monitored: false,
            handle: ProcessHandle::Restored,
        });

        assert!(registry.remove("0").is_some());
        assert!(registry.remove("0").is_none());
        assert!(registry.is_empty());
    }
}
