// Master server modules

pub mod collector;
pub mod config;
pub mod constants;
pub mod logger;
pub mod models;
pub mod response;
pub mod routes;
pub mod worker;

use std::sync::Arc;

use collector::SharedJobCollector;
use config::ConfigStore;
use worker::manager::SharedWorkerManager;

/// Process-wide services, constructed once at startup and handed to every
/// request handler.
pub struct AppState {
    pub manager: SharedWorkerManager,
    pub collector: SharedJobCollector,
    pub store: Arc<ConfigStore>,
}

pub type SharedAppState = Arc<AppState>;
