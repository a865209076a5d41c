// JSON config store: worker list, settings, and the persisted process
// snapshot, all in one document on disk.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::models::WorkerConfig;
use super::worker::registry::PersistedProcess;

pub const CONFIG_FILE: &str = "assets/shardpool.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub settings: Settings,
    /// Advisory recovery state; liveness is always re-verified against the
    /// OS on load.
    #[serde(default)]
    pub managed_processes: HashMap<String, PersistedProcess>,
}

impl Config {
    pub fn worker(&self, worker_id: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.id == worker_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_true")]
    pub stop_workers_on_master_exit: bool,
    #[serde(default)]
    pub auto_launch_workers: bool,
    /// Program launched for each local worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_entrypoint: Option<PathBuf>,
    #[serde(default)]
    pub debug: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stop_workers_on_master_exit: true,
            auto_launch_workers: false,
            worker_entrypoint: None,
            debug: false,
        }
    }
}

/// Shared handle to the config document. All writes funnel through one lock
/// so concurrent read-modify-write cycles cannot interleave.
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the config, falling back to defaults if the file is missing or
    /// unparsable.
    pub fn load(&self) -> Config {
        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    crate::log_warn!("Failed to parse config file: {}, using defaults", e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    /// Write the full config document. Goes through a temp file plus rename
    /// so a partial write never corrupts the document.
    pub fn save(&self, config: &Config) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.save_locked(config)
    }

    /// Locked read-modify-write cycle.
    pub fn update(&self, mutate: impl FnOnce(&mut Config)) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut config = self.load_unlocked();
        mutate(&mut config);
        self.save_locked(&config)
    }

    fn load_unlocked(&self) -> Config {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    fn save_locked(&self, config: &Config) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> ConfigStore {
        let path = std::env::temp_dir().join(format!("shardpool_config_{}_{}.json", name, std::process::id()));
        let _ = fs::remove_file(&path);
        ConfigStore::new(path)
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let store = temp_store("missing");
        let config = store.load();
        assert!(config.workers.is_empty());
        assert!(config.settings.stop_workers_on_master_exit);
        assert!(!config.settings.auto_launch_workers);
        assert!(config.managed_processes.is_empty());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let store = temp_store("roundtrip");
        let mut config = Config::default();
        config.workers.push(WorkerConfig {
            id: "0".to_string(),
            name: "Worker 0".to_string(),
            host: String::new(),
            port: 8288,
            device: Some("1".to_string()),
            enabled: true,
            extra_args: "--lowmem".to_string(),
        });
        config.settings.auto_launch_workers = true;
        store.save(&config).unwrap();

        let reloaded = store.load();
        assert_eq!(reloaded.workers, config.workers);
        assert!(reloaded.settings.auto_launch_workers);
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let store = temp_store("corrupt");
        fs::write(store.path(), "{not json").unwrap();
        let config = store.load();
        assert!(config.workers.is_empty());
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn test_update_is_read_modify_write() {
        let store = temp_store("update");
        store
            .update(|c| c.settings.auto_launch_workers = true)
            .unwrap();
        store.update(|c| c.settings.debug = true).unwrap();

        let config = store.load();
        assert!(config.settings.auto_launch_workers);
        assert!(config.settings.debug);
        let _ = fs::remove_file(store.path());
    }
}
