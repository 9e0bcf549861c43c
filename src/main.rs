//! sensorfleet - fleet manager for network-attached sensing devices
//!
//! Discovers devices on a subnet, tracks their lifecycle and polls frames
//! from every device that is recording.

mod config;
mod db;
mod devices;
mod discovery;
mod events;
mod locks;
mod probe;
mod scheduler;
mod web;

#[cfg(test)]
mod testing;

use config::ServerConfig;
use db::{DeviceRegistry, Store};
use devices::DeviceService;
use discovery::Discovery;
use events::{EventBus, EventKind};
use probe::{ClientFactory, HttpClientFactory};
use scheduler::{JobOrchestrator, Scheduler};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sensorfleet=info".parse()?),
        )
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting sensorfleet on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    let registry: Arc<dyn DeviceRegistry> = store;
    tracing::info!("Database initialized successfully");

    let clients: Arc<dyn ClientFactory> = Arc::new(HttpClientFactory::new(
        cfg.request_timeout,
        cfg.probe_timeout,
        cfg.device_port,
    )?);
    let bus = Arc::new(EventBus::new());
    let service = Arc::new(DeviceService::new(
        registry,
        bus.clone(),
        clients.clone(),
    ));

    // Wire lifecycle events to the poll jobs
    let scheduler = Arc::new(Scheduler::new(cfg.max_jobs));
    let orchestrator = Arc::new(JobOrchestrator::new(
        scheduler.clone(),
        service.clone(),
        clients.clone(),
    ));
    bus.subscribe(EventKind::StatusChanged, orchestrator.clone())
        .await;
    bus.subscribe(EventKind::FrequencyChanged, orchestrator.clone())
        .await;
    service.supervise(orchestrator.clone()).await;
    orchestrator.restore().await?;

    let discovery = Arc::new(
        Discovery::new(service.clone(), clients, cfg.probe_concurrency)
            .with_max_hosts(cfg.max_scan_hosts),
    );
    if let Some((address, mask)) = cfg.startup_scan {
        tracing::info!("Scheduling startup scan of {}/{}", address, mask);
        discovery.schedule(&scheduler, address, mask).await?;
    }

    // Start web server
    let server = Server::new(cfg, service, scheduler.clone(), discovery);
    server.start(shutdown_signal()).await?;

    tracing::info!("Shutting down");
    bus.shutdown();
    scheduler.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
