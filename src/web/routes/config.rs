// Configuration endpoints: worker entries and settings.

use std::convert::Infallible;
use std::path::PathBuf;

use hyper::{Body, Request, Response};

use super::parse_json_body;
use crate::web::logger::LOGGER;
use crate::web::models::{UpdateSettingRequest, UpdateWorkerRequest, WorkerConfig};
use crate::web::response::{bad_request, internal_error, json_ok, not_found};
use crate::web::SharedAppState;

pub fn handle_get_config(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let config = state.store.load();
    match serde_json::to_string(&config) {
        Ok(json) => Ok(json_ok(json)),
        Err(e) => Ok(internal_error(&format!("Failed to serialize config: {e}"))),
    }
}

/// Update a worker entry field-wise, creating it when the id is unknown and
/// the required fields are present.
pub async fn handle_update_worker(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let update: UpdateWorkerRequest = match parse_json_body(req).await {
        Ok(update) => update,
        Err(response) => return Ok(response),
    };

    enum Outcome {
        Applied,
        MissingFields,
    }
    let mut outcome = Outcome::Applied;

    let result = state.store.update(|config| {
        if let Some(worker) = config.workers.iter_mut().find(|w| w.id == update.worker_id) {
            if let Some(name) = update.name {
                worker.name = name;
            }
            if let Some(host) = update.host {
                worker.host = host;
            }
            if let Some(port) = update.port {
                worker.port = port;
            }
            if let Some(device) = update.device {
                worker.device = if device.is_empty() { None } else { Some(device) };
            }
            if let Some(enabled) = update.enabled {
                worker.enabled = enabled;
            }
            if let Some(extra_args) = update.extra_args {
                worker.extra_args = extra_args;
            }
        } else if let (Some(name), Some(port)) = (update.name, update.port) {
            config.workers.push(WorkerConfig {
                id: update.worker_id,
                name,
                host: update.host.unwrap_or_default(),
                port,
                device: update.device.filter(|d| !d.is_empty()),
                enabled: update.enabled.unwrap_or(false),
                extra_args: update.extra_args.unwrap_or_default(),
            });
        } else {
            outcome = Outcome::MissingFields;
        }
    });

    if let Err(e) = result {
        return Ok(internal_error(&format!("Failed to save config: {e}")));
    }
    match outcome {
        Outcome::Applied => Ok(json_ok(r#"{"status":"success"}"#)),
        Outcome::MissingFields => Ok(not_found(
            "Worker not found and missing required fields for creation",
        )),
    }
}

pub async fn handle_delete_worker(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: crate::web::models::WorkerIdRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let mut removed: Option<String> = None;
    let result = state.store.update(|config| {
        if let Some(index) = config.workers.iter().position(|w| w.id == body.worker_id) {
            removed = Some(config.workers.remove(index).name);
        }
    });

    if let Err(e) = result {
        return Ok(internal_error(&format!("Failed to save config: {e}")));
    }
    match removed {
        Some(name) => Ok(json_ok(
            serde_json::json!({"status": "success", "message": format!("Worker {name} deleted")})
                .to_string(),
        )),
        None => Ok(not_found(&format!("Worker {} not found", body.worker_id))),
    }
}

/// Set one settings key. Keys are typed; unknown keys are rejected.
pub async fn handle_update_setting(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: UpdateSettingRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let mut applied = true;
    let result = state.store.update(|config| {
        let settings = &mut config.settings;
        match (body.key.as_str(), &body.value) {
            ("stop_workers_on_master_exit", v) if v.is_boolean() => {
                settings.stop_workers_on_master_exit = v.as_bool().unwrap_or(true);
            }
            ("auto_launch_workers", v) if v.is_boolean() => {
                settings.auto_launch_workers = v.as_bool().unwrap_or(false);
            }
            ("debug", v) if v.is_boolean() => {
                settings.debug = v.as_bool().unwrap_or(false);
                LOGGER.set_debug(settings.debug);
            }
            ("worker_entrypoint", v) if v.is_string() => {
                settings.worker_entrypoint = v.as_str().map(PathBuf::from);
            }
            _ => applied = false,
        }
    });

    if let Err(e) = result {
        return Ok(internal_error(&format!("Failed to save config: {e}")));
    }
    if applied {
        Ok(json_ok(
            serde_json::json!({
                "status": "success",
                "message": format!("Setting '{}' updated.", body.key)
            })
            .to_string(),
        ))
    } else {
        Ok(bad_request(&format!(
            "Unknown setting or wrong value type: {}",
            body.key
        )))
    }
}
