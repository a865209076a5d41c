// Job collection endpoints: prepare, submit, status, collect.

use std::convert::Infallible;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use hyper::{Body, Request, Response};

use super::parse_json_body;
use crate::web::collector::{ResultFragment, SubmitError};
use crate::web::constants::WORKER_JOB_TIMEOUT;
use crate::web::models::{CollectJobRequest, CollectJobResponse, PrepareJobRequest, SubmitFragmentRequest};
use crate::web::response::{bad_request, json_ok, not_found};
use crate::web::SharedAppState;

pub async fn handle_prepare(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: PrepareJobRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };
    if body.job_id.is_empty() {
        return Ok(bad_request("Missing job_id"));
    }
    state.collector.prepare(&body.job_id).await;
    Ok(json_ok(r#"{"status":"success"}"#))
}

pub async fn handle_submit(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: SubmitFragmentRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let payload = match general_purpose::STANDARD.decode(&body.payload) {
        Ok(payload) => payload,
        Err(e) => return Ok(bad_request(&format!("Invalid payload encoding: {e}"))),
    };

    let fragment = ResultFragment {
        worker_id: body.worker_id,
        sequence_index: body.sequence_index,
        payload,
        is_last: body.is_last,
    };
    match state.collector.submit(&body.job_id, fragment).await {
        Ok(()) => Ok(json_ok(r#"{"status":"success"}"#)),
        Err(SubmitError::UnknownJob(job_id)) => {
            crate::log_warn!("Fragment for unknown job {}", job_id);
            Ok(not_found("Job not found or already complete"))
        }
    }
}

pub async fn handle_queue_status(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let job_id = req
        .uri()
        .path()
        .trim_start_matches("/api/jobs/status/")
        .to_string();
    let exists = state.collector.exists(&job_id).await;
    Ok(json_ok(
        serde_json::json!({"exists": exists, "job_id": job_id}).to_string(),
    ))
}

pub async fn handle_collect(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    let body: CollectJobRequest = match parse_json_body(req).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let mut local_payloads = Vec::with_capacity(body.local_payloads.len());
    for encoded in &body.local_payloads {
        match general_purpose::STANDARD.decode(encoded) {
            Ok(payload) => local_payloads.push(payload),
            Err(e) => return Ok(bad_request(&format!("Invalid local payload encoding: {e}"))),
        }
    }
    let local_count = local_payloads.len();

    let timeout = body
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(WORKER_JOB_TIMEOUT);

    let payloads = state
        .collector
        .collect(&body.job_id, local_payloads, &body.expected_worker_ids, timeout)
        .await;

    let response = CollectJobResponse {
        status: "success",
        collected: payloads.len() - local_count,
        expected: body.expected_worker_ids.len(),
        payloads: payloads
            .iter()
            .map(|p| general_purpose::STANDARD.encode(p))
            .collect(),
    };
    Ok(json_ok(serde_json::to_string(&response).unwrap_or_default()))
}
