use crate::models::{Device, Direction, NotificationRecord, NotificationType};
use crate::pool::{ConnectionKey, ConnectionPool};
use crate::rest_store::RestStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Maps a pressed value onto the button name configured for the section that
/// owns `topic`. Unknown values are published as given.
pub fn resolve_button_name(device: &Device, topic: &str, value: &str) -> String {
    let topic = topic.trim();
    device
        .sections
        .values()
        .filter(|section| section.topic_main().trim() == topic || section.topic_subscribe().trim() == topic)
        .flat_map(|section| section.buttons().iter())
        .find(|button| button.matches(value))
        .map(|button| button.name.clone())
        .unwrap_or_else(|| value.to_string())
}

pub struct CommandPublisher {
    pool: Arc<ConnectionPool>,
    store: Arc<RestStore>,
}

impl CommandPublisher {
    pub fn new(pool: Arc<ConnectionPool>, store: Arc<RestStore>) -> Self {
        Self { pool, store }
    }

    /// Publishes a button press on the section's connection and records it in
    /// the logs collection. Returns false when nothing was sent.
    pub async fn publish_button_message(
        &self,
        device: Option<&Device>,
        key: &ConnectionKey,
        topic: &str,
        button: &str,
    ) -> bool {
        let name = match device {
            Some(device) => resolve_button_name(device, topic, button),
            None => button.to_string(),
        };

        if !self.pool.publish(key, topic, &name).await {
            return false;
        }

        let device_name = device.map(|d| d.display_name().to_string()).unwrap_or_else(|| key.device_id.clone());
        let record = NotificationRecord::new(topic, &format!("Button pressed: {}", name), NotificationType::Info)
            .for_section(&key.device_id, &device_name, &key.section_name)
            .with_direction(Direction::Outgoing);

        let store = self.store.clone();
        tokio::spawn(async move {
            match store.post_log(&record).await {
                Ok(()) => info!("Logged '{}' for {}.", record.message, device_name),
                Err(e) => warn!("Failed to log button press '{}': {}", record.message, e),
            }
        });

        true
    }
}
