//! forgecache server binary
//!
//! Wires the object-store adapter, cache service, pruning controller,
//! and RPC surface together, serves health and metrics, and handles
//! signal-driven graceful shutdown.

use forgecache_cache::CacheService;
use forgecache_core::{Config, MetricsCollector};
use forgecache_pruner::{Pruner, PrunerConfig};
use forgecache_server::handler::{auth_interceptor, BuildCacheHandler};
use forgecache_server::proto::build_cache_server::BuildCacheServer;
use forgecache_server::{metrics_http, proto, shutdown, telemetry};
use forgecache_storage::{GcsStore, ObjectStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;
use tracing::{error, info, warn};

/// In-flight RPCs get this long to drain after a shutdown signal
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    if let Err(err) = telemetry::init_tracing(telemetry::LogFormat::from_env()) {
        eprintln!("failed to initialize logging: {err}");
        return 1;
    }

    match serve().await {
        Ok(()) => {
            info!("Server stopped");
            0
        }
        Err(err) => {
            error!(error = %err, "Fatal error");
            1
        }
    }
}

async fn serve() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(Config::from_env()?);
    info!(
        bucket = %config.bucket,
        server_port = config.server_port,
        metrics_port = config.metrics_port,
        "Loaded configuration"
    );

    let metrics = MetricsCollector::new();
    let store: Arc<dyn ObjectStore> = Arc::new(GcsStore::new(&config.bucket));
    let service = Arc::new(CacheService::new(store.clone(), metrics.clone()));

    let shutdown = shutdown::install_signal_handlers();

    // Pruning controller: first cycle immediately, then on interval
    let pruner = Pruner::new(
        store.clone(),
        metrics.clone(),
        PrunerConfig::from_config(&config),
    );
    tokio::spawn(pruner.run(shutdown.subscribe()));

    // Metrics endpoint on its own listener
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    {
        let metrics = metrics.clone();
        let drain = shutdown.clone();
        tokio::spawn(async move {
            let wait = async move { drain.wait().await };
            if let Err(err) = metrics_http::serve(metrics_addr, metrics, wait).await {
                error!(error = %err, "Metrics server failed");
            }
        });
    }

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();

    let handler = BuildCacheHandler::new(service, config.clone(), metrics.clone());
    let cache_service =
        BuildCacheServer::with_interceptor(handler, auth_interceptor(config.require_auth));

    let router = Server::builder()
        .add_service(health_service)
        .add_service(cache_service);
    let router = if config.enable_reflection {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
            .build_v1()?;
        router.add_service(reflection)
    } else {
        router
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!(port = config.server_port, "Starting gRPC server");

    let drain = shutdown.clone();
    let mut server_task = tokio::spawn(
        router.serve_with_shutdown(addr, async move { drain.wait().await }),
    );

    health_reporter
        .set_serving::<BuildCacheServer<BuildCacheHandler>>()
        .await;

    tokio::select! {
        result = &mut server_task => {
            // The server only returns before a signal on a startup or
            // transport failure
            result??;
            return Err("gRPC server exited unexpectedly".into());
        }
        _ = shutdown.wait() => {}
    }

    info!("Shutting down gracefully");
    health_reporter
        .set_not_serving::<BuildCacheServer<BuildCacheHandler>>()
        .await;

    match tokio::time::timeout(DRAIN_DEADLINE, &mut server_task).await {
        Ok(result) => {
            result??;
            info!("Server stopped gracefully");
        }
        Err(_) => {
            warn!("Drain deadline exceeded, forcing server shutdown");
            server_task.abort();
        }
    }

    Ok(())
}
