// Route handler modules

pub mod config;
pub mod health;
pub mod jobs;
pub mod workers;

use std::convert::Infallible;

use hyper::{Body, Method, Request, Response};
use serde::de::DeserializeOwned;

use crate::web::response::{bad_request, cors_preflight, not_found};
use crate::web::SharedAppState;

/// Top-level dispatch over (method, path).
pub async fn handle_request(
    req: Request<Body>,
    state: SharedAppState,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => health::handle_health(),

        (&Method::GET, "/api/config") => config::handle_get_config(state),
        (&Method::POST, "/api/config/worker") => config::handle_update_worker(req, state).await,
        (&Method::POST, "/api/config/worker/delete") => {
            config::handle_delete_worker(req, state).await
        }
        (&Method::POST, "/api/config/setting") => config::handle_update_setting(req, state).await,

        (&Method::GET, "/api/workers/managed") => workers::handle_get_managed(state).await,
        (&Method::POST, "/api/workers/launch") => workers::handle_launch(req, state).await,
        (&Method::POST, "/api/workers/stop") => workers::handle_stop(req, state).await,
        (&Method::POST, "/api/workers/clear_launching") => {
            workers::handle_clear_launching(req, state).await
        }
        (&Method::GET, path) if path.starts_with("/api/workers/log/") => {
            workers::handle_worker_log(req, state).await
        }

        (&Method::POST, "/api/jobs/prepare") => jobs::handle_prepare(req, state).await,
        (&Method::POST, "/api/jobs/submit") => jobs::handle_submit(req, state).await,
        (&Method::GET, path) if path.starts_with("/api/jobs/status/") => {
            jobs::handle_queue_status(req, state).await
        }
        (&Method::POST, "/api/jobs/collect") => jobs::handle_collect(req, state).await,

        (&Method::OPTIONS, _) => Ok(cors_preflight()),

        _ => Ok(not_found("Not Found")),
    }
}

/// Read and parse a JSON request body, or produce the 400 response to send
/// back instead.
pub(crate) async fn parse_json_body<T: DeserializeOwned>(
    req: Request<Body>,
) -> Result<T, Response<Body>> {
    let body_bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|_| bad_request("Failed to read request body"))?;
    serde_json::from_slice(&body_bytes).map_err(|e| bad_request(&format!("Invalid JSON: {e}")))
}
