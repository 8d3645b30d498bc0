//! Vantage - distributed uptime monitoring hub
//!
//! Websites are checked by a pool of remote validators that sign their
//! reports; the hub schedules checks, correlates replies and aggregates
//! the results.

mod aggregate;
mod config;
mod db;
mod hub;
mod location;
mod protocol;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use hub::Hub;
use location::{Geolocate, IpInfoLocator, NoLocation};
use scheduler::{run_tick_writer, Scheduler, SchedulerSettings, SweepManager};
use web::Server;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("vantage=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Vantage on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Validated ticks flow to the batch writer
    let (tick_tx, tick_rx) = mpsc::channel(1000);
    tokio::spawn(run_tick_writer(tick_rx, store.clone()));

    let locator: Arc<dyn Geolocate> = if cfg.location_lookup {
        Arc::new(IpInfoLocator::new())
    } else {
        tracing::info!("Validator location lookup disabled");
        Arc::new(NoLocation)
    };

    let hub = Arc::new(Hub::new(store.clone(), locator, tick_tx));

    // Start background tasks
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        hub.clone(),
        SchedulerSettings::from(&cfg),
    ));
    scheduler.start();

    let sweeper = SweepManager::new(hub.clone(), cfg.sweep_interval);
    sweeper.start();

    // Start web server
    let server = Server::new(cfg, store, hub, scheduler.clone());
    server.start().await?;

    sweeper.stop().await;
    scheduler.stop().await;
    Ok(())
}
