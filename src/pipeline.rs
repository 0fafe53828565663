use crate::classifier::{classify, is_danger, normalize_payload, Classified, FreeTextEvent};
use crate::commands::CommandPublisher;
use crate::config::Config;
use crate::dedup::{danger_key, message_key, DedupWindows, Deduplicator};
use crate::discovery::{discover_connections, fetch_fleet};
use crate::models::{Device, Direction, NotificationRecord};
use crate::notifier::Notifier;
use crate::pool::{ConnectionKey, ConnectionPool, InboundMessage, PoolSettings};
use crate::reconciler::{ReconcileTarget, ReconcilerSettings, TelemetryReconciler};
use crate::rest_store::{RestStore, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INBOUND_BUFFER: usize = 256;

/// Everything the ingestion pipeline shares: one per process, handed around
/// as `Arc<FleetContext>`.
pub struct FleetContext {
    pub config: Arc<Config>,
    pub store: Arc<RestStore>,
    pub pool: Arc<ConnectionPool>,
    pub dedup: Arc<Deduplicator>,
    pub notifier: Arc<Notifier>,
    pub reconciler: TelemetryReconciler,
    pub commands: CommandPublisher,
    fleet: RwLock<Vec<Device>>,
    reconnect_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl FleetContext {
    pub fn new(config: Config) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let config = Arc::new(config);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        let store = Arc::new(RestStore::new(&config.rest_base_url));
        let pool = ConnectionPool::new(PoolSettings::from_config(&config), inbound_tx);
        let dedup = Arc::new(Deduplicator::new(DedupWindows::default()));
        let notifier = Arc::new(Notifier::new(
            store.clone(),
            dedup.clone(),
            config.notification_cap,
            config.log_to_collection,
        ));
        let reconciler = TelemetryReconciler::new(
            store.clone(),
            notifier.clone(),
            dedup.clone(),
            ReconcilerSettings {
                low_voltage_threshold: config.low_voltage_threshold,
                ..ReconcilerSettings::default()
            },
        );
        let commands = CommandPublisher::new(pool.clone(), store.clone());

        let context = Arc::new(Self {
            config,
            store,
            pool,
            dedup,
            notifier,
            reconciler,
            commands,
            fleet: RwLock::new(Vec::new()),
            reconnect_generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        (context, inbound_rx)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn refresh_fleet(&self) -> Result<Vec<Device>, StoreError> {
        let devices = fetch_fleet(&self.store, self.config.fleet_fetch_retries).await?;
        *self.fleet.write().await = devices.clone();
        Ok(devices)
    }

    async fn cached_device(&self, device_id: &str) -> Option<Device> {
        self.fleet.read().await.iter().find(|d| d.id == device_id).cloned()
    }

    /// Fetches the fleet and opens a client per credentialed section. With
    /// `only` set, just that section is (re)connected.
    async fn connect_discovered(&self, only: Option<&ConnectionKey>) -> Result<usize, StoreError> {
        let devices = self.refresh_fleet().await?;
        let mut descriptors = discover_connections(&devices);
        if let Some(key) = only {
            descriptors.retain(|d| &d.key == key);
        }
        if descriptors.is_empty() {
            info!("No connectable sections found.");
            return Ok(0);
        }
        let connected = descriptors.len();
        self.pool.connect_all(&descriptors).await;
        Ok(connected)
    }

    pub async fn discover_and_connect(&self) -> Result<usize, StoreError> {
        self.connect_discovered(None).await
    }

    pub async fn reconnect_one(&self, key: &ConnectionKey) -> Result<usize, StoreError> {
        if !self.pool.end_one(key).await {
            debug!("No client held for {}; connecting fresh.", key);
        }
        sleep(self.config.reconnect_one_delay()).await;
        self.connect_discovered(Some(key)).await
    }

    /// Tears every client down and rediscovers after the debounce delay.
    /// Returns `None` when a newer reconnect-all superseded this one.
    pub async fn reconnect_all(&self) -> Result<Option<usize>, StoreError> {
        let generation = self.reconnect_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.pool.end_all().await;
        self.dedup.reset().await;

        sleep(self.config.reconnect_all_delay()).await;
        if self.reconnect_generation.load(Ordering::SeqCst) != generation {
            debug!("Reconnect-all {} superseded.", generation);
            return Ok(None);
        }
        self.discover_and_connect().await.map(Some)
    }

    pub async fn handle_inbound(&self, message: InboundMessage) {
        let key = message_key(
            &message.key.device_id,
            &message.key.section_name,
            &message.topic,
            &normalize_payload(&message.payload),
        );
        if !self.dedup.admit_message(&key).await {
            debug!("Duplicate message on {} dropped.", message.key);
            return;
        }

        let target = ReconcileTarget {
            device_id: message.key.device_id.clone(),
            section_name: message.key.section_name.clone(),
            device_name: message.device_name.clone(),
            topic: message.topic.clone(),
        };

        match classify(&message.payload) {
            Classified::HalfCycle => {
                self.reconciler.apply_half_cycle(&target).await;
            }
            Classified::Telemetry(update) => {
                self.reconciler.apply_telemetry(&target, update).await;
            }
            Classified::FreeText(event) => self.handle_free_text(&target, event).await,
        }
    }

    async fn handle_free_text(&self, target: &ReconcileTarget, event: FreeTextEvent) {
        let mut record = NotificationRecord::new(&target.topic, &event.message, event.kind)
            .for_section(&target.device_id, &target.device_name, &target.section_name)
            .with_direction(Direction::Incoming)
            .with_timestamp(event.date, event.time);

        if is_danger(&event.message) {
            let key = danger_key(&target.device_id, &target.section_name, &event.message);
            if !self.dedup.admit_danger(&key).await {
                debug!("Danger message for {}/{} suppressed.", target.device_id, target.section_name);
                return;
            }
            record = record.as_danger();
        }

        self.notifier.notify(record).await;
    }

    /// Drains the pool's inbound channel in arrival order until shutdown.
    pub fn spawn_ingest(self: &Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        let context = self.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = context.shutdown.cancelled() => break,
                    message = inbound.recv() => message,
                };
                match message {
                    Some(message) => context.handle_inbound(message).await,
                    None => {
                        warn!("Inbound channel closed.");
                        break;
                    }
                }
            }
            info!("Ingest task stopped.");
        })
    }

    pub async fn publish_button_message(&self, key: &ConnectionKey, topic: &str, button: &str) -> bool {
        let mut device = self.cached_device(&key.device_id).await;
        if device.is_none() {
            match self.refresh_fleet().await {
                Ok(_) => device = self.cached_device(&key.device_id).await,
                Err(e) => warn!("Fleet refresh for button lookup failed: {}", e),
            }
        }
        self.commands
            .publish_button_message(device.as_ref(), key, topic, button)
            .await
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.end_all().await;
        info!("Fleet context shut down.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn config(server: &MockServer) -> Config {
        let mut config = Config::with_base_url(&server.uri());
        config.mqtt_ws_port = 1;
        config.mqtt_ws_secure = false;
        config.mqtt_reconnect_period_ms = 100;
        config.mqtt_connect_timeout_secs = 1;
        config.reconnect_one_delay_ms = 20;
        config.reconnect_all_delay_ms = 50;
        config.fleet_fetch_retries = 1;
        config
    }

    async fn accept_posts(server: &MockServer) {
        for route in ["/notifications", "/logs"] {
            Mock::given(method("POST"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
                .mount(server)
                .await;
        }
    }

    fn inbound(device_id: &str, section: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            key: ConnectionKey::new(device_id, section),
            device_name: format!("Robot-{}", device_id),
            topic: format!("r{}/events", device_id),
            payload: payload.to_string(),
        }
    }

    fn count(requests: &[Request], verb: &str, route: &str) -> usize {
        requests
            .iter()
            .filter(|r| r.method.as_str() == verb && r.url.path() == route)
            .count()
    }

    #[tokio::test]
    async fn duplicate_within_window_has_one_side_effect() {
        let server = MockServer::start().await;
        accept_posts(&server).await;
        let (context, _rx) = FleetContext::new(config(&server));

        context.handle_inbound(inbound("5", "main", "Robot started")).await;
        context.handle_inbound(inbound("5", "main", " Robot started ")).await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(count(&requests, "POST", "/notifications"), 1);
        assert_eq!(count(&requests, "POST", "/logs"), 1);
        assert_eq!(context.notifier.recent(None).await.len(), 1);
    }

    #[tokio::test]
    async fn danger_text_is_suppressed_for_the_danger_window() {
        let server = MockServer::start().await;
        accept_posts(&server).await;
        let (context, _rx) = FleetContext::new(config(&server));

        context
            .handle_inbound(inbound("5", "main", r#"{"message":"Danger: motor failure","time":"10:00:00"}"#))
            .await;
        context
            .handle_inbound(inbound("5", "main", r#"{"message":"Danger: motor failure","time":"10:00:05"}"#))
            .await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(count(&requests, "POST", "/notifications"), 1);
        assert_eq!(count(&requests, "POST", "/logs"), 0);

        let body: Value = serde_json::from_slice(
            &requests
                .iter()
                .find(|r| r.url.path() == "/notifications")
                .unwrap()
                .body,
        )
        .unwrap();
        assert_eq!(body["type"], json!("alert"));
        assert_eq!(body["deviceId"], json!("5"));
        assert_eq!(body["direction"], json!("incoming"));
    }

    #[tokio::test]
    async fn voltage_message_updates_device_and_raises_alert() {
        let server = MockServer::start().await;
        accept_posts(&server).await;
        Mock::given(method("GET"))
            .and(path("/robots/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 5,
                "RobotName": "Solar-5",
                "Sections": { "main": { "Voltage": 24, "Status": "Running" } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/robots/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        let (context, _rx) = FleetContext::new(config(&server));

        context.handle_inbound(inbound("5", "main", "voltage: 12")).await;

        let requests = server.received_requests().await.unwrap();
        let put = requests
            .iter()
            .find(|r| r.method.as_str() == "PUT")
            .expect("device written");
        let body: Value = serde_json::from_slice(&put.body).unwrap();
        assert_eq!(body["Sections"]["main"]["Voltage"], json!(12.0));
        assert_eq!(body["Sections"]["main"]["Status"], json!("Running"));

        let recent = context.notifier.recent(None).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "⚠️ Danger: Robot \"Solar-5\" voltage is critically low (12V)!");
    }

    #[tokio::test]
    async fn reconnect_all_rebuilds_pool_from_fresh_fleet() {
        let server = MockServer::start().await;
        let section = |topic: &str| {
            json!({
                "mqttUrl": "127.0.0.1",
                "mqttUsername": "u",
                "mqttPassword": "p",
                "Topic_main": format!("{}/cmd", topic),
                "Topic_subscribe": format!("{}/events", topic)
            })
        };
        Mock::given(method("GET"))
            .and(path("/robots"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "7", "RobotName": "Roof-7", "Sections": { "main": section("r7"), "car": section("r7/car") } }
            ])))
            .mount(&server)
            .await;
        let (context, _rx) = FleetContext::new(config(&server));

        assert_eq!(context.discover_and_connect().await.unwrap(), 2);
        let before: Vec<String> = context.pool.statuses().await.into_iter().map(|s| s.client_id).collect();
        context.dedup.admit_message("stale").await;

        assert_eq!(context.reconnect_all().await.unwrap(), Some(2));
        // Only the rediscovery's own entries remain; the stale stamp is gone.
        assert_eq!(context.dedup.len().await, 0);

        sleep(Duration::from_millis(150)).await;
        let statuses = context.pool.statuses().await;
        let keys: Vec<String> = statuses
            .iter()
            .map(|s| format!("{}/{}", s.device_id, s.section_name))
            .collect();
        assert_eq!(keys, vec!["7/car", "7/main"]);
        assert!(statuses.iter().all(|s| !s.connected));
        // Both clients are new objects, not the ones held before the reconnect.
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| !before.contains(&s.client_id)));

        context.shutdown().await;
        assert!(context.pool.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn overlapping_reconnect_all_runs_discovery_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        let (context, _rx) = FleetContext::new(config(&server));

        let (first, second) = tokio::join!(context.reconnect_all(), async {
            sleep(Duration::from_millis(10)).await;
            context.reconnect_all().await
        });
        assert_eq!(first.unwrap(), None);
        assert_eq!(second.unwrap(), Some(0));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(count(&requests, "GET", "/robots"), 1);
    }

    #[tokio::test]
    async fn button_publish_refreshes_fleet_on_cache_miss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "5", "RobotName": "Solar-5", "Sections": { "main": { "Topic_main": "r5/cmd", "ActiveBtns": ["Forward"] } } }
            ])))
            .mount(&server)
            .await;
        let (context, _rx) = FleetContext::new(config(&server));

        let sent = context
            .publish_button_message(&ConnectionKey::new("5", "main"), "r5/cmd", "forward")
            .await;
        assert!(!sent);
        assert!(context.cached_device("5").await.is_some());
    }
}
