//! Worker process lifecycle orchestration.
//!
//! One manager instance is created at startup and shared with every request
//! handler. Its methods block (process spawn, tree-kill grace waits), so
//! async handlers call them through `tokio::task::spawn_blocking`. The
//! registry lock is never held across a blocking portion.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use super::registry::{ManagedProcess, ProcessHandle, WorkerRegistry};
use super::supervisor::{self, LaunchError, LaunchSpec};
use crate::web::config::ConfigStore;
use crate::web::constants::PROCESS_TERMINATION_TIMEOUT;
use crate::web::models::{ManagedWorkerInfo, WorkerConfig};

/// Environment variable carrying the master's PID into workers. Its presence
/// also marks a process as running under a master, which gates auto-launch.
pub const MASTER_PID_ENV: &str = "SHARDPOOL_MASTER_PID";

/// Environment variable carrying the worker's accelerator selector.
pub const DEVICE_ENV: &str = "SHARDPOOL_DEVICE";

pub type SharedWorkerManager = Arc<WorkerProcessManager>;

/// Result of a launch request that did not error.
#[derive(Debug)]
pub enum LaunchOutcome {
    Launched { pid: u32, log_file: PathBuf },
    /// Not an error: the worker is already up, here is where to find it.
    AlreadyRunning { pid: u32, log_file: PathBuf },
}

/// Result of a stop request.
#[derive(Debug, PartialEq)]
pub enum StopOutcome {
    Stopped,
    /// No record of this worker id.
    NotManaged,
    /// The tracked process had already exited; the entry was evicted.
    AlreadyStopped,
    /// Tree kill and fallback both failed. The entry is evicted anyway; a
    /// process we can no longer influence should not remain managed.
    Failed(String),
}

pub struct WorkerProcessManager {
    registry: Mutex<WorkerRegistry>,
    store: Arc<ConfigStore>,
    log_dir: PathBuf,
    cleanup_started: AtomicBool,
}

impl WorkerProcessManager {
    pub fn new(store: Arc<ConfigStore>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry: Mutex::new(WorkerRegistry::new()),
            store,
            log_dir: log_dir.into(),
            cleanup_started: AtomicBool::new(false),
        }
    }

    fn registry(&self) -> MutexGuard<'_, WorkerRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload the persisted snapshot, keeping only entries whose PID is
    /// still alive. Called once at startup.
    pub fn restore(&self) {
        let snapshot = self.store.load().managed_processes;
        if !snapshot.is_empty() {
            self.registry().load(snapshot);
        }
    }

    /// Launch a worker process.
    ///
    /// Refuses with `AlreadyRunning` while an entry for the id is alive;
    /// stale (dead) entries are evicted and replaced.
    pub fn launch(&self, config: &WorkerConfig) -> Result<LaunchOutcome, LaunchError> {
        {
            let mut registry = self.registry();
            if let Some(existing) = registry.get_mut(&config.id) {
                if existing.is_running() {
                    return Ok(LaunchOutcome::AlreadyRunning {
                        pid: existing.pid,
                        log_file: existing.log_file.clone(),
                    });
                }
                registry.remove(&config.id);
            }
        }

        let settings = self.store.load().settings;
        let (program, args) = build_launch_command(settings.worker_entrypoint.as_deref(), config)?;
        let cwd = program.parent().map(Path::to_path_buf);

        let mut env = vec![(MASTER_PID_ENV.to_string(), std::process::id().to_string())];
        if let Some(device) = &config.device {
            env.push((DEVICE_ENV.to_string(), device.clone()));
        }

        // Tie the worker's lifetime to ours when the policy asks for it.
        let watchdog = if settings.stop_workers_on_master_exit {
            match watchdog_path() {
                Some(path) if path.exists() => Some(path),
                _ => {
                    crate::log_warn!(
                        "Watchdog binary not found, launching worker {} unwrapped",
                        config.name
                    );
                    None
                }
            }
        } else {
            None
        };
        let monitored = watchdog.is_some();

        let (program, args) = match watchdog {
            Some(watchdog) => {
                let mut wrapped = vec![
                    "--master-pid".to_string(),
                    std::process::id().to_string(),
                    "--".to_string(),
                    program.to_string_lossy().into_owned(),
                ];
                wrapped.extend(args);
                (watchdog, wrapped)
            }
            None => (program, args),
        };

        let log_file = self.log_dir.join(daily_log_name(&config.name));
        let log_sink = open_log_with_banner(&log_file, config, &program, &args, monitored)
            .map_err(|source| LaunchError::LogFile {
                path: log_file.clone(),
                source,
            })?;

        let child = supervisor::start(LaunchSpec {
            program,
            args,
            env,
            cwd,
            log_sink,
        })?;
        let pid = child.id();

        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        self.registry().put(ManagedProcess {
            worker_id: config.id.clone(),
            pid,
            started_at,
            config: config.clone(),
            log_file: log_file.clone(),
            launching: true,
            monitored,
            handle: ProcessHandle::Spawned(child),
        });
        self.save_registry();

        if monitored {
            crate::log_info!(
                "Launched worker {} via watchdog (PID: {})",
                config.name,
                pid
            );
        } else {
            crate::log_info!("Launched worker {} directly (PID: {})", config.name, pid);
        }
        crate::log_debug!("Log file: {}", log_file.display());

        Ok(LaunchOutcome::Launched { pid, log_file })
    }

    /// Stop a managed worker, taking its whole process tree down.
    pub fn stop(&self, worker_id: &str) -> StopOutcome {
        let mut process = match self.registry().remove(worker_id) {
            Some(process) => process,
            None => return StopOutcome::NotManaged,
        };

        if !process.is_running() {
            crate::log_info!("Worker {} already stopped", worker_id);
            self.save_registry();
            return StopOutcome::AlreadyStopped;
        }

        let pid = process.pid;
        crate::log_debug!("Stopping worker {} (PID: {})", worker_id, pid);

        // The entry is already out of the registry, so the grace waits below
        // never run under the lock.
        if supervisor::kill_tree(pid) {
            if let ProcessHandle::Spawned(mut child) = process.handle {
                let _ = child.wait(); // Reap
            }
            self.save_registry();
            crate::log_info!("Stopped worker {} and all child processes", worker_id);
            return StopOutcome::Stopped;
        }

        // Tree kill failed; one fallback with the owned handle if we have it.
        crate::log_warn!(
            "Process tree kill failed for worker {}, trying direct termination",
            worker_id
        );
        let outcome = match process.handle {
            ProcessHandle::Spawned(mut child) => {
                if supervisor::terminate_with_timeout(&mut child, PROCESS_TERMINATION_TIMEOUT) {
                    StopOutcome::Stopped
                } else {
                    StopOutcome::Failed(format!("could not terminate worker process {pid}"))
                }
            }
            ProcessHandle::Restored => {
                StopOutcome::Failed(format!("could not kill process tree for PID {pid}"))
            }
        };
        if let StopOutcome::Failed(msg) = &outcome {
            crate::log_error!("Failed to stop worker {}: {}", worker_id, msg);
        }
        self.save_registry();
        outcome
    }

    /// Readiness callback: the worker confirmed it is serving. Idempotent.
    pub fn clear_launching(&self, worker_id: &str) {
        let cleared = {
            let mut registry = self.registry();
            match registry.get_mut(worker_id) {
                Some(process) if process.launching => {
                    process.launching = false;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            crate::log_debug!("Cleared launching state for worker {}", worker_id);
            self.save_registry();
        }
    }

    /// Current managed workers, lazily evicting entries whose process died.
    pub fn list_managed(&self) -> HashMap<String, ManagedWorkerInfo> {
        let mut managed = HashMap::new();
        let mut dead = Vec::new();
        {
            let mut registry = self.registry();
            for (worker_id, process) in registry.iter_mut() {
                if process.is_running() {
                    managed.insert(
                        worker_id.clone(),
                        ManagedWorkerInfo {
                            pid: process.pid,
                            started_at: process.started_at,
                            log_file: process.log_file.clone(),
                            launching: process.launching,
                        },
                    );
                } else {
                    dead.push(worker_id.clone());
                }
            }
            for worker_id in &dead {
                registry.remove(worker_id);
            }
        }
        if !dead.is_empty() {
            self.save_registry();
        }
        managed
    }

    /// Log-file path for a managed worker, if we track it.
    pub fn log_file(&self, worker_id: &str) -> Option<PathBuf> {
        self.registry()
            .get_mut(worker_id)
            .map(|p| p.log_file.clone())
    }

    /// Launch every enabled local worker that is not already alive. Runs
    /// once, shortly after startup, and never when this process is itself a
    /// worker (detected by the watchdog's master-PID marker).
    pub fn auto_launch(&self) {
        if std::env::var_os(MASTER_PID_ENV).is_some() {
            crate::log_debug!("Running as worker, skipping auto-launch");
            return;
        }

        let config = self.store.load();
        if !config.settings.auto_launch_workers {
            crate::log_debug!("Auto-launch workers is disabled");
            return;
        }
        crate::log_info!("Auto-launch workers is enabled, checking for workers to start...");

        // A snapshot left by a master that was killed without cleanup is
        // stale by definition here.
        if !config.managed_processes.is_empty() {
            crate::log_info!("Clearing old managed process snapshot before auto-launch...");
            if let Err(e) = self.store.update(|c| c.managed_processes.clear()) {
                crate::log_warn!("Failed to clear process snapshot: {}", e);
            }
        }

        let mut launched = 0;
        for worker in config.workers.iter().filter(|w| w.enabled) {
            if !worker.is_local() {
                crate::log_debug!(
                    "Skipping remote worker {} (host: {})",
                    worker.name,
                    worker.host
                );
                continue;
            }
            match self.launch(worker) {
                Ok(LaunchOutcome::Launched { pid, .. }) => {
                    crate::log_info!("Auto-launched worker {} (PID: {})", worker.name, pid);
                    launched += 1;
                }
                Ok(LaunchOutcome::AlreadyRunning { .. }) => {
                    crate::log_debug!("Worker {} already running, skipping", worker.name);
                }
                Err(e) => {
                    crate::log_error!("Failed to auto-launch worker {}: {}", worker.name, e);
                }
            }
        }

        if launched > 0 {
            crate::log_info!("Auto-launched {} worker(s)", launched);
        } else {
            crate::log_debug!("No workers to auto-launch");
        }
    }

    /// Stop every managed worker. Used on master shutdown; guarded so
    /// multiple signal paths cannot run it twice, and a failure on one
    /// worker never blocks the rest.
    pub fn cleanup_all(&self) {
        if self.cleanup_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let ids = self.registry().ids();
        for worker_id in ids {
            match self.stop(&worker_id) {
                StopOutcome::Failed(msg) => {
                    crate::log_error!("Error stopping worker {}: {}", worker_id, msg);
                }
                outcome => {
                    crate::log_debug!("Cleanup stop for {}: {:?}", worker_id, outcome);
                }
            }
        }

        if let Err(e) = self.store.update(|c| c.managed_processes.clear()) {
            crate::log_warn!("Failed to clear process snapshot on cleanup: {}", e);
        }
    }

    /// Persist the snapshot of currently-alive workers. Advisory state;
    /// failures are logged, not surfaced.
    pub fn save_registry(&self) {
        let snapshot = self.registry().snapshot();
        if let Err(e) = self.store.update(|c| c.managed_processes = snapshot) {
            crate::log_warn!("Failed to persist process snapshot: {}", e);
        }
    }
}

/// Command line for one worker, before any watchdog wrapping.
pub fn build_launch_command(
    entrypoint: Option<&Path>,
    config: &WorkerConfig,
) -> Result<(PathBuf, Vec<String>), LaunchError> {
    let program = entrypoint.ok_or(LaunchError::EntrypointNotConfigured)?;
    if !program.exists() {
        return Err(LaunchError::MissingEntrypoint(program.to_path_buf()));
    }

    let mut args = vec!["--port".to_string(), config.port.to_string()];
    args.extend(config.extra_args.split_whitespace().map(str::to_string));
    Ok((program.to_path_buf(), args))
}

/// Daily log file name: one file per worker per calendar day, shared by
/// every launch that day.
pub fn daily_log_name(worker_name: &str) -> String {
    let date_stamp = chrono::Local::now().format("%Y%m%d");
    format!("{}_{}.log", sanitize_worker_name(worker_name), date_stamp)
}

pub fn sanitize_worker_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The watchdog binary is expected next to the master executable.
fn watchdog_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    Some(dir.join(format!("worker_watchdog{}", std::env::consts::EXE_SUFFIX)))
}

/// Open the daily log in append mode and write the session banner that
/// separates launches sharing one file.
fn open_log_with_banner(
    log_file: &Path,
    config: &WorkerConfig,
    program: &Path,
    args: &[String],
    monitored: bool,
) -> std::io::Result<std::fs::File> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(log_file)?;

    writeln!(file, "\n\n{}", "=".repeat(50))?;
    writeln!(file, "=== Worker Session Started ===")?;
    writeln!(file, "Worker: {}", config.name)?;
    writeln!(file, "Port: {}", config.port)?;
    if let Some(device) = &config.device {
        writeln!(file, "Device: {device}")?;
    }
    writeln!(
        file,
        "Started: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    writeln!(file, "Command: {} {}", program.display(), args.join(" "))?;
    if monitored {
        writeln!(file, "Note: Worker will stop when master shuts down")?;
    } else {
        writeln!(file, "Note: Worker will continue running after master shuts down")?;
    }
    writeln!(file, "{}\n", "=".repeat(30))?;
    file.flush()?;
    Ok(file)
}
