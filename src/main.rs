// Shardpool master server: worker pool management + job collection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::Server;

use shardpool::web::collector::JobCollector;
use shardpool::web::config::{ConfigStore, CONFIG_FILE};
use shardpool::web::constants::WORKER_STARTUP_DELAY;
use shardpool::web::logger::LOGGER;
use shardpool::web::routes::handle_request;
use shardpool::web::worker::manager::{SharedWorkerManager, WorkerProcessManager};
use shardpool::web::AppState;
use shardpool::{log_info, log_warn};

const LISTEN_PORT: u16 = 8188;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = Arc::new(ConfigStore::new(CONFIG_FILE));
    let settings = store.load().settings;
    LOGGER.set_debug(settings.debug);

    let manager: SharedWorkerManager =
        Arc::new(WorkerProcessManager::new(store.clone(), "logs/workers"));
    // Pick up workers a previous master left running.
    manager.restore();

    let collector = Arc::new(JobCollector::new());
    let state = Arc::new(AppState {
        manager: manager.clone(),
        collector: collector.clone(),
        store: store.clone(),
    });

    // Delayed so the HTTP surface is up before freshly launched workers
    // start calling back in.
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(WORKER_STARTUP_DELAY).await;
            if let Err(e) = tokio::task::spawn_blocking(move || manager.auto_launch()).await {
                log_warn!("Auto-launch task failed: {}", e);
            }
        });
    }

    let make_svc = make_service_fn({
        let state = state.clone();
        move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone())))
            }
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], LISTEN_PORT));
    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown_signal());

    println!("Shardpool master starting on http://{addr}");
    println!("Available endpoints:");
    println!("  GET  /health                      - Health check");
    println!("  GET  /api/config                  - Get configuration");
    println!("  POST /api/config/worker           - Update or create a worker entry");
    println!("  POST /api/config/worker/delete    - Delete a worker entry");
    println!("  POST /api/config/setting          - Update one setting");
    println!("  GET  /api/workers/managed         - List managed workers");
    println!("  POST /api/workers/launch          - Launch a worker");
    println!("  POST /api/workers/stop            - Stop a worker");
    println!("  POST /api/workers/clear_launching - Worker readiness callback");
    println!("  GET  /api/workers/log/:id         - Tail a worker log");
    println!("  POST /api/jobs/prepare            - Prepare a job queue");
    println!("  POST /api/jobs/submit             - Submit a result fragment");
    println!("  GET  /api/jobs/status/:id         - Check a job queue");
    println!("  POST /api/jobs/collect            - Collect job results");
    log_info!("Master listening on {}", addr);

    server.await?;

    // Shutdown: the graceful-shutdown future already fired, so this runs
    // exactly once per process; cleanup_all is additionally guarded inside.
    let settings = store.load().settings;
    if settings.stop_workers_on_master_exit {
        println!("[Master] Shutting down, stopping all managed workers...");
        let manager = manager.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || manager.cleanup_all()).await {
            log_warn!("Cleanup task failed: {}", e);
        }
    } else {
        println!("[Master] Shutting down, workers will continue running");
        let manager = manager.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || manager.save_registry()).await {
            log_warn!("Registry save task failed: {}", e);
        }
    }
    collector.shutdown().await;
    log_info!("Master shut down");
    Ok(())
}

/// Resolves when the process is asked to exit: ctrl-c everywhere, plus
/// SIGTERM and SIGHUP (terminal closed) on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    }
    log_info!("Shutdown signal received");
}
