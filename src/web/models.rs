// Shared data types for the master: worker configuration and API bodies.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identity and launch parameters for one worker.
///
/// Created and edited through the config endpoints; the process manager
/// treats it as read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub id: String,
    pub name: String,
    /// Empty, "localhost" or "127.0.0.1" means locally launchable.
    /// Anything else is a remote worker this master never launches.
    #[serde(default)]
    pub host: String,
    pub port: u16,
    /// Accelerator selector exported to the worker as SHARDPOOL_DEVICE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    /// Free-form tokens appended to the launch command (whitespace-split).
    #[serde(default)]
    pub extra_args: String,
}

impl WorkerConfig {
    /// Whether this worker runs on the master's host.
    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "" | "localhost" | "127.0.0.1")
    }
}

/// One entry of the managed-workers listing.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedWorkerInfo {
    pub pid: u32,
    pub started_at: f64,
    pub log_file: PathBuf,
    pub launching: bool,
}

// --- Request bodies ---

#[derive(Debug, Deserialize)]
pub struct WorkerIdRequest {
    pub worker_id: String,
}

/// Field-wise update for a worker config entry. Missing fields keep their
/// current value; a worker is created when the id is unknown and name+port
/// are present.
#[derive(Debug, Deserialize)]
pub struct UpdateWorkerRequest {
    pub worker_id: String,
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub device: Option<String>,
    pub enabled: Option<bool>,
    pub extra_args: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingRequest {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct PrepareJobRequest {
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitFragmentRequest {
    pub job_id: String,
    pub worker_id: String,
    pub sequence_index: usize,
    /// Base64-encoded payload bytes.
    pub payload: String,
    #[serde(default)]
    pub is_last: bool,
}

#[derive(Debug, Deserialize)]
pub struct CollectJobRequest {
    pub job_id: String,
    pub expected_worker_ids: Vec<String>,
    /// Per-fragment wait in seconds; defaults to WORKER_JOB_TIMEOUT.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Base64-encoded payloads the caller already holds locally; these lead
    /// the reassembled output in their given order.
    #[serde(default)]
    pub local_payloads: Vec<String>,
}

// --- Response bodies ---

#[derive(Debug, Serialize)]
pub struct ManagedWorkersResponse {
    pub status: &'static str,
    pub managed_workers: HashMap<String, ManagedWorkerInfo>,
}

#[derive(Debug, Serialize)]
pub struct LaunchWorkerResponse {
    pub status: &'static str,
    pub message: String,
    pub pid: u32,
    pub log_file: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct CollectJobResponse {
    pub status: &'static str,
    /// Base64-encoded payloads in reassembly order.
    pub payloads: Vec<String>,
    pub collected: usize,
    pub expected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_local_hosts() {
        let mut config = WorkerConfig {
            id: "0".to_string(),
            name: "Worker 0".to_string(),
            host: String::new(),
            port: 8288,
            device: None,
            enabled: true,
            extra_args: String::new(),
        };
        assert!(config.is_local());

        config.host = "localhost".to_string();
        assert!(config.is_local());

        config.host = "127.0.0.1".to_string();
        assert!(config.is_local());

        config.host = "10.0.0.12".to_string();
        assert!(!config.is_local());
    }

    #[test]
    fn test_worker_config_defaults_on_deserialize() {
        let config: WorkerConfig =
            serde_json::from_str(r#"{"id":"1","name":"W1","port":8288}"#).unwrap();
        assert_eq!(config.host, "");
        assert!(config.is_local());
        assert!(!config.enabled);
        assert!(config.device.is_none());
        assert_eq!(config.extra_args, "");
    }
}
