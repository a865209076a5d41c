// Worker lifecycle endpoints: launch, stop, listing, readiness, and logs.
//
// Manager calls block on process operations, so every one of them goes
// through spawn_blocking rather than stalling the request runtime.

use std::convert::Infallible;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use hyper::{Body, Request, Response};

use super::parse_json_body;
use crate::web::constants::{LOG_CHUNK_SIZE, LOG_TAIL_THRESHOLD};
use crate::web::models::{
    LaunchWorkerResponse, ManagedWorkersResponse, WorkerIdRequest,
};
use crate::web::response::{conflict, internal_error, json_ok, not_found};
use crate::web::worker::manager::{LaunchOutcome, StopOutcome};
use crate::web::SharedAppState;

pub async fn handle_get_managed(state: SharedAppState) -> Result<Response<Body>, Infallible> {
    let manager = state.manager.clone();
    let managed = match tokio::task::spawn_blocking(move || manager.list_managed()).await {
        Ok(managed) => managed,
        Err(e) => return Ok(internal_error(&format!("Listing task failed: {e}"))),
    };
    let response = ManagedWorkersResponse {
        status: "success",
        managed_workers: managed,
    };
    Ok(json_ok(serde_json::to_string(&response).unwrap_or_default()))
}

pub async fn handle_launch(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: WorkerIdRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let worker = match state.store.load().worker(&body.worker_id).cloned() {
        Some(worker) => worker,
        None => return Ok(not_found(&format!("Worker {} not found", body.worker_id))),
    };

    let manager = state.manager.clone();
    let outcome = match tokio::task::spawn_blocking(move || manager.launch(&worker)).await {
        Ok(outcome) => outcome,
        Err(e) => return Ok(internal_error(&format!("Launch task failed: {e}"))),
    };

    match outcome {
        Ok(LaunchOutcome::Launched { pid, log_file }) => {
            let response = LaunchWorkerResponse {
                status: "success",
                message: format!("Worker {} launched", body.worker_id),
                pid,
                log_file,
            };
            Ok(json_ok(serde_json::to_string(&response).unwrap_or_default()))
        }
        Ok(LaunchOutcome::AlreadyRunning { pid, log_file }) => Ok(conflict(
            serde_json::json!({
                "status": "error",
                "message": "Worker already running",
                "pid": pid,
                "log_file": log_file,
            })
            .to_string(),
        )),
        Err(e) => Ok(internal_error(&format!("Failed to launch worker: {e}"))),
    }
}

pub async fn handle_stop(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: WorkerIdRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let manager = state.manager.clone();
    let worker_id = body.worker_id.clone();
    let outcome = match tokio::task::spawn_blocking(move || manager.stop(&worker_id)).await {
        Ok(outcome) => outcome,
        Err(e) => return Ok(internal_error(&format!("Stop task failed: {e}"))),
    };

    match outcome {
        StopOutcome::Stopped => Ok(json_ok(
            serde_json::json!({"status": "success", "message": "Worker stopped"}).to_string(),
        )),
        StopOutcome::NotManaged => Ok(not_found("Worker not managed by this master")),
        StopOutcome::AlreadyStopped => Ok(conflict(
            serde_json::json!({"status": "error", "message": "Worker already stopped"}).to_string(),
        )),
        StopOutcome::Failed(message) => Ok(internal_error(&message)),
    }
}

pub async fn handle_clear_launching(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: WorkerIdRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let manager = state.manager.clone();
    let worker_id = body.worker_id;
    if let Err(e) = tokio::task::spawn_blocking(move || manager.clear_launching(&worker_id)).await {
        return Ok(internal_error(&format!("Clear task failed: {e}")));
    }
    Ok(json_ok(r#"{"status":"success"}"#))
}

/// Tail of a managed worker's log file.
pub async fn handle_worker_log(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let worker_id = req
        .uri()
        .path()
        .trim_start_matches("/api/workers/log/")
        .to_string();

    let lines: usize = req
        .uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("lines="))
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(1000);

    let log_file = match state.manager.log_file(&worker_id) {
        Some(path) => path,
        None => {
            return Ok(not_found(&format!(
                "Worker {worker_id} not managed by this master"
            )))
        }
    };

    let read = tokio::task::spawn_blocking(move || read_log_tail(&log_file, lines)).await;
    match read {
        Ok(Ok((content, file_size, truncated))) => Ok(json_ok(
            serde_json::json!({
                "status": "success",
                "content": content,
                "file_size": file_size,
                "truncated": truncated,
            })
            .to_string(),
        )),
        Ok(Err(e)) => Ok(not_found(&format!("Error reading log file: {e}"))),
        Err(e) => Ok(internal_error(&format!("Log read task failed: {e}"))),
    }
}

/// Read the last `max_lines` lines of a log, scanning backwards in chunks so
/// large files are never loaded whole.
fn read_log_tail(path: &Path, max_lines: usize) -> std::io::Result<(String, u64, bool)> {
    let mut file = std::fs::File::open(path)?;
    let file_size = file.metadata()?.len();

    if max_lines == 0 || file_size <= LOG_TAIL_THRESHOLD {
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        return Ok((content, file_size, false));
    }

    let mut lines: Vec<String> = Vec::new();
    let mut pos = file_size;
    let mut carry = Vec::new();

    while pos > 0 && lines.len() <= max_lines {
        let chunk_size = (LOG_CHUNK_SIZE as u64).min(pos);
        pos -= chunk_size;
        file.seek(SeekFrom::Start(pos))?;

        let mut chunk = vec![0u8; chunk_size as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&carry);

        let mut parts: Vec<&[u8]> = chunk.split(|&b| b == b'\n').collect();
        // The first part may be a partial line continued in the previous chunk.
        carry = parts.remove(0).to_vec();
        let mut chunk_lines: Vec<String> = parts
            .into_iter()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .collect();
        chunk_lines.extend(lines);
        lines = chunk_lines;
    }
    if pos == 0 && !carry.is_empty() {
        lines.insert(0, String::from_utf8_lossy(&carry).into_owned());
    }
    // A trailing newline leaves one empty split at the end; drop it.
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    let truncated = lines.len() > max_lines;
    let start = lines.len().saturating_sub(max_lines);
    Ok((lines[start..].join("\n"), file_size, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_log(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "shardpool_log_tail_{}_{}.log",
            name,
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_small_file_read_whole() {
        let path = temp_log("small", "line1\nline2\nline3\n");
        let (content, size, truncated) = read_log_tail(&path, 2).unwrap();
        assert_eq!(content, "line1\nline2\nline3\n");
        assert_eq!(size, 18);
        assert!(!truncated);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_large_file_tails_last_lines() {
        // Push the file over the tail threshold so the backward scan runs.
        let mut content = String::new();
        for i in 0..40_000 {
            content.push_str(&format!("log line number {i:06}\n"));
        }
        let path = temp_log("large", &content);

        let (tail, _, truncated) = read_log_tail(&path, 3).unwrap();
        assert!(truncated);
        let tail_lines: Vec<&str> = tail.lines().collect();
        assert_eq!(
            tail_lines,
            vec![
                "log line number 039997",
                "log line number 039998",
                "log line number 039999",
            ]
        );
        let _ = std::fs::remove_file(&path);
    }
}
