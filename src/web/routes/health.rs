use std::convert::Infallible;

use hyper::{Body, Response};

use crate::web::response::json_ok;

pub fn handle_health() -> Result<Response<Body>, Infallible> {
    Ok(json_ok(r#"{"status":"ok","service":"shardpool-master"}"#))
}
