use crate::models::Device;
use crate::pool::{ConnectionDescriptor, ConnectionKey};
use crate::rest_store::{RestStore, StoreError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{info, warn};
use uuid::Uuid;

/// Client ids carry the wall clock plus a random suffix so a reconnect never
/// reuses the id of a session the broker may still hold.
pub fn client_id(device_id: &str, section: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("fleetlink_{}_{}_{}_{}", device_id, section, millis, &suffix[..8])
}

/// One descriptor per section that carries a broker URL, username and password.
pub fn discover_connections(devices: &[Device]) -> Vec<ConnectionDescriptor> {
    devices
        .iter()
        .flat_map(|device| {
            device
                .sections
                .iter()
                .filter(|(_, section)| section.has_credentials())
                .map(move |(name, section)| ConnectionDescriptor {
                    key: ConnectionKey::new(&device.id, name),
                    device_name: device.display_name().to_string(),
                    broker_url: section.mqtt_url().trim().to_string(),
                    username: section.mqtt_username().trim().to_string(),
                    password: section.mqtt_password().to_string(),
                    publish_topic: section.topic_main().trim().to_string(),
                    subscribe_topic: section.topic_subscribe().trim().to_string(),
                    client_id: client_id(&device.id, name),
                })
        })
        .collect()
}

/// Fetches the fleet, retrying with backoff while the backend comes up.
pub async fn fetch_fleet(store: &RestStore, retries: usize) -> Result<Vec<Device>, StoreError> {
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(retries);

    let devices = Retry::start(strategy, || async {
        store.fetch_devices().await.map_err(|e| {
            warn!("Fleet fetch failed: {}", e);
            e
        })
    })
    .await?;

    info!("Fetched {} devices from the fleet store.", devices.len());
    Ok(devices)
}
