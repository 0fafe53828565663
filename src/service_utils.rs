use crate::pipeline::FleetContext;
use crate::pool::InboundMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEDUP_EVICTION_PERIOD: Duration = Duration::from_secs(1);
const STATUS_LOG_PERIOD: Duration = Duration::from_secs(30);

/// Discover the fleet and open every broker connection in the background.
pub fn start_connections(ctx: Arc<FleetContext>) {
    tokio::spawn(async move {
        match ctx.discover_and_connect().await {
            Ok(count) => info!("Opened {} broker connection(s).", count),
            Err(e) => error!("Initial fleet discovery failed: {}", e),
        }
    });
}

/// Start draining inbound broker messages through the pipeline.
pub fn start_ingest(ctx: &Arc<FleetContext>, inbound: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
    ctx.spawn_ingest(inbound)
}

pub fn start_dedup_eviction(ctx: &Arc<FleetContext>) -> JoinHandle<()> {
    ctx.dedup.clone().spawn_eviction(DEDUP_EVICTION_PERIOD, ctx.shutdown_token())
}

/// Periodically log how many connections are up.
pub fn periodic_status_update(ctx: Arc<FleetContext>) {
    let shutdown = ctx.shutdown_token();
    tokio::spawn(async move {
        loop {
            let statuses = ctx.pool.statuses().await;
            let connected = statuses.iter().filter(|s| s.connected).count();
            if connected < statuses.len() {
                warn!("{}/{} broker connections up.", connected, statuses.len());
            } else {
                info!("{}/{} broker connections up.", connected, statuses.len());
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(STATUS_LOG_PERIOD) => {}
            }
        }
    });
}

/// Wait for ctrl-c, then stop the workers and close every broker client.
pub async fn handle_shutdown(ctx: Arc<FleetContext>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }
    info!("fleetlink is shutting down...");
    ctx.shutdown().await;
}
