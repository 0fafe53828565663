mod classifier;
mod commands;
mod config;
mod dedup;
mod discovery;
mod models;
mod notifier;
mod pipeline;
mod pool;
mod reconciler;
mod rest_server;
mod rest_store;
mod service_utils;

use crate::config::Config;
use crate::pipeline::FleetContext;
use crate::rest_server::run_rest_server;
use crate::service_utils::{
    handle_shutdown, periodic_status_update, start_connections, start_dedup_eviction, start_ingest,
};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };
    info!("Using fleet store at {}.", config.rest_base_url);

    let (ctx, inbound) = FleetContext::new(config);

    let eviction_task = start_dedup_eviction(&ctx);
    let ingest_task = start_ingest(&ctx, inbound);
    start_connections(ctx.clone());
    periodic_status_update(ctx.clone());

    // Start the status API
    let rest_ctx = ctx.clone();
    let rest_api_task = tokio::spawn(async move {
        run_rest_server(rest_ctx).await;
    });

    handle_shutdown(ctx.clone()).await;

    // Wait for tasks to complete
    let _ = tokio::join!(eviction_task, ingest_task, rest_api_task);
    info!("All services shut down successfully.");
}
