use crate::config::Config;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Outgoing, Packet, QoS, Transport};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Time a connected client gets to flush its DISCONNECT before its event loop is cancelled.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// A connection is identified by the device and the section it serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionKey {
    pub device_id: String,
    pub section_name: String,
}

impl ConnectionKey {
    pub fn new(device_id: &str, section_name: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            section_name: section_name.to_string(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.section_name)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub key: ConnectionKey,
    pub device_name: String,
    pub broker_url: String,
    pub username: String,
    pub password: String,
    pub publish_topic: String,
    pub subscribe_topic: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub device_id: String,
    pub section_name: String,
    pub device_name: String,
    pub client_id: String,
    pub connected: bool,
    pub error: Option<String>,
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub key: ConnectionKey,
    pub device_name: String,
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no connected client for {0}")]
    NotConnected(String),
    #[error("no topic configured for {0}")]
    MissingTopic(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub ws_port: u16,
    pub ws_path: String,
    pub secure: bool,
    pub keep_alive: Duration,
    pub reconnect_period: Duration,
    pub connect_timeout_secs: u64,
    pub publish_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ws_port: config.mqtt_ws_port,
            ws_path: config.mqtt_ws_path.clone(),
            secure: config.mqtt_ws_secure,
            keep_alive: Duration::from_secs(10),
            reconnect_period: config.mqtt_reconnect_period(),
            connect_timeout_secs: config.mqtt_connect_timeout_secs,
            publish_timeout: config.mqtt_publish_timeout(),
        }
    }
}

/// Builds `wss://<host>:<port><path>` from whatever the section stored as its
/// broker URL (bare host, host:port, or a full URL).
pub fn broker_address(raw: &str, port: u16, path: &str, secure: bool) -> String {
    let without_scheme = raw.trim().rsplit("://").next().unwrap_or(raw);
    let host = without_scheme.split(['/', ':']).next().unwrap_or(without_scheme);
    let scheme = if secure { "wss" } else { "ws" };
    format!("{}://{}:{}{}", scheme, host, port, path)
}

fn now_rfc3339() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

struct PooledClient {
    client: AsyncClient,
    status: Arc<RwLock<ConnectionStatus>>,
    shutdown: CancellationToken,
}

impl PooledClient {
    async fn end(self) {
        let connected = self.status.read().await.connected;
        if connected {
            if let Err(e) = self.client.try_disconnect() {
                debug!("Disconnect request for {} failed: {}", self.status.read().await.client_id, e);
            }
            let shutdown = self.shutdown;
            tokio::spawn(async move {
                sleep(DISCONNECT_GRACE).await;
                shutdown.cancel();
            });
        } else {
            self.shutdown.cancel();
        }
    }
}

struct EventLoopContext {
    key: ConnectionKey,
    device_name: String,
    subscribe_topic: String,
    client: AsyncClient,
    status: Arc<RwLock<ConnectionStatus>>,
    inbound: mpsc::Sender<InboundMessage>,
    reconnect_period: Duration,
    shutdown: CancellationToken,
}

impl EventLoopContext {
    async fn mark_connected(&self) {
        let mut status = self.status.write().await;
        status.connected = true;
        status.error = None;
        status.last_seen = now_rfc3339();
    }

    async fn mark_disconnected(&self, reason: Option<String>) {
        let mut status = self.status.write().await;
        status.connected = false;
        if reason.is_some() {
            status.error = reason;
        }
    }

    async fn touch(&self) {
        self.status.write().await.last_seen = now_rfc3339();
    }

    fn subscribe(&self) {
        if self.subscribe_topic.is_empty() {
            warn!("No subscribe topic configured for {}; listening to nothing.", self.key);
            return;
        }
        // Only device-originated events; the publish topic carries our own commands.
        match self.client.try_subscribe(self.subscribe_topic.clone(), QoS::AtMostOnce) {
            Ok(_) => info!("Subscribed {} to '{}'.", self.key, self.subscribe_topic),
            Err(e) => error!("Failed to subscribe {} to '{}': {}", self.key, self.subscribe_topic, e),
        }
    }
}

async fn run_event_loop(mut eventloop: EventLoop, ctx: EventLoopContext) {
    debug!("Event loop for {} started.", ctx.key);

    loop {
        let polled = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("{} connected to broker.", ctx.key);
                ctx.mark_connected().await;
                ctx.subscribe();
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                ctx.touch().await;
                let message = InboundMessage {
                    key: ctx.key.clone(),
                    device_name: ctx.device_name.clone(),
                    topic: publish.topic.clone(),
                    payload: String::from_utf8_lossy(&publish.payload).to_string(),
                };
                if ctx.inbound.send(message).await.is_err() {
                    warn!("Inbound channel closed; stopping event loop for {}.", ctx.key);
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the session for {}.", ctx.key);
                ctx.mark_disconnected(Some("closed by broker".to_string())).await;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("{} sent DISCONNECT.", ctx.key);
                break;
            }
            Ok(event) => {
                debug!("Unhandled event for {}: {:?}", ctx.key, event);
            }
            Err(e) => {
                // The client is kept; polling again after the period reconnects it.
                warn!("Connection error for {}: {}. Retrying in {:?}...", ctx.key, e, ctx.reconnect_period);
                ctx.mark_disconnected(Some(e.to_string())).await;
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = sleep(ctx.reconnect_period) => {}
                }
            }
        }
    }

    ctx.mark_disconnected(None).await;
    debug!("Event loop for {} stopped.", ctx.key);
}

/// Owns one broker client per `(deviceId, sectionName)`.
pub struct ConnectionPool {
    settings: PoolSettings,
    clients: Mutex<HashMap<ConnectionKey, PooledClient>>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, inbound: mpsc::Sender<InboundMessage>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            clients: Mutex::new(HashMap::new()),
            inbound,
        })
    }

    fn open(&self, descriptor: &ConnectionDescriptor) -> PooledClient {
        let address = broker_address(
            &descriptor.broker_url,
            self.settings.ws_port,
            &self.settings.ws_path,
            self.settings.secure,
        );
        debug!("Configuring client {} for {} at {}...", descriptor.client_id, descriptor.key, address);

        let mut mqtt_options = MqttOptions::new(&descriptor.client_id, address, self.settings.ws_port);
        mqtt_options.set_keep_alive(self.settings.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_credentials(&descriptor.username, &descriptor.password);
        if self.settings.secure {
            mqtt_options.set_transport(Transport::wss_with_default_config());
        } else {
            mqtt_options.set_transport(Transport::Ws);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(self.settings.connect_timeout_secs);
        eventloop.set_network_options(network_options);

        let status = Arc::new(RwLock::new(ConnectionStatus {
            device_id: descriptor.key.device_id.clone(),
            section_name: descriptor.key.section_name.clone(),
            device_name: descriptor.device_name.clone(),
            client_id: descriptor.client_id.clone(),
            connected: false,
            error: None,
            last_seen: None,
        }));
        let shutdown = CancellationToken::new();

        let ctx = EventLoopContext {
            key: descriptor.key.clone(),
            device_name: descriptor.device_name.clone(),
            subscribe_topic: descriptor.subscribe_topic.clone(),
            client: client.clone(),
            status: status.clone(),
            inbound: self.inbound.clone(),
            reconnect_period: self.settings.reconnect_period,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(run_event_loop(eventloop, ctx));

        PooledClient {
            client,
            status,
            shutdown,
        }
    }

    /// Opens a client per descriptor, replacing any client already held for
    /// the same key.
    pub async fn connect_all(&self, descriptors: &[ConnectionDescriptor]) -> usize {
        let mut clients = self.clients.lock().await;
        for descriptor in descriptors {
            if let Some(previous) = clients.remove(&descriptor.key) {
                warn!("Replacing existing client for {}.", descriptor.key);
                previous.end().await;
            }
            let pooled = self.open(descriptor);
            clients.insert(descriptor.key.clone(), pooled);
        }
        info!("Connection pool holds {} clients.", clients.len());
        clients.len()
    }

    pub async fn end_one(&self, key: &ConnectionKey) -> bool {
        let removed = self.clients.lock().await.remove(key);
        match removed {
            Some(pooled) => {
                info!("Ending client for {}.", key);
                pooled.end().await;
                true
            }
            None => false,
        }
    }

    pub async fn end_all(&self) {
        let drained: Vec<PooledClient> = self.clients.lock().await.drain().map(|(_, c)| c).collect();
        let count = drained.len();
        futures::future::join_all(drained.into_iter().map(PooledClient::end)).await;
        info!("Ended {} clients.", count);
    }

    pub async fn statuses(&self) -> Vec<ConnectionStatus> {
        let handles: Vec<Arc<RwLock<ConnectionStatus>>> =
            self.clients.lock().await.values().map(|c| c.status.clone()).collect();
        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            statuses.push(handle.read().await.clone());
        }
        statuses.sort_by(|a, b| (&a.device_id, &a.section_name).cmp(&(&b.device_id, &b.section_name)));
        statuses
    }

    pub async fn try_publish(&self, key: &ConnectionKey, topic: &str, message: &str) -> Result<(), PoolError> {
        if topic.trim().is_empty() {
            return Err(PoolError::MissingTopic(key.to_string()));
        }

        let client = {
            let clients = self.clients.lock().await;
            let pooled = clients
                .get(key)
                .ok_or_else(|| PoolError::NotConnected(key.to_string()))?;
            if !pooled.status.read().await.connected {
                return Err(PoolError::NotConnected(key.to_string()));
            }
            pooled.client.clone()
        };

        timeout(
            self.settings.publish_timeout,
            client.publish(topic, QoS::AtMostOnce, false, message.as_bytes().to_vec()),
        )
        .await
        .map_err(|_| PoolError::Timeout(self.settings.publish_timeout))??;

        Ok(())
    }

    /// Returns false when there is no connected client for `key` or the
    /// publish itself failed.
    pub async fn publish(&self, key: &ConnectionKey, topic: &str, message: &str) -> bool {
        match self.try_publish(key, topic, message).await {
            Ok(()) => {
                info!("Message published to '{}' via {}: {}", topic, key, message);
                true
            }
            Err(e) => {
                warn!("Not publishing to '{}' via {}: {}", topic, key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PoolSettings {
        PoolSettings {
            ws_port: 1,
            ws_path: "/mqtt".to_string(),
            secure: false,
            keep_alive: Duration::from_secs(10),
            reconnect_period: Duration::from_millis(50),
            connect_timeout_secs: 1,
            publish_timeout: Duration::from_secs(1),
        }
    }

    fn descriptor(device_id: &str, section: &str, client_id: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            key: ConnectionKey::new(device_id, section),
            device_name: format!("Robot {}", device_id),
            broker_url: "127.0.0.1".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
            publish_topic: format!("{}/{}/cmd", device_id, section),
            subscribe_topic: format!("{}/{}/events", device_id, section),
            client_id: client_id.to_string(),
        }
    }

    #[test]
    fn broker_address_normalizes_stored_urls() {
        assert_eq!(broker_address("abc.hivemq.cloud", 8884, "/mqtt", true), "wss://abc.hivemq.cloud:8884/mqtt");
        assert_eq!(
            broker_address("wss://abc.hivemq.cloud:8884/mqtt", 8884, "/mqtt", true),
            "wss://abc.hivemq.cloud:8884/mqtt"
        );
        assert_eq!(broker_address(" mqtt://host:1883 ", 8884, "/mqtt", true), "wss://host:8884/mqtt");
        assert_eq!(broker_address("host", 9001, "/ws", false), "ws://host:9001/ws");
    }

    #[tokio::test]
    async fn publish_without_client_returns_false() {
        let (tx, _rx) = mpsc::channel(8);
        let pool = ConnectionPool::new(settings(), tx);
        let key = ConnectionKey::new("5", "main");

        assert!(!pool.publish(&key, "5/main/cmd", "Forward").await);
        assert!(matches!(
            pool.try_publish(&key, "5/main/cmd", "Forward").await,
            Err(PoolError::NotConnected(_))
        ));
        assert!(matches!(
            pool.try_publish(&key, " ", "Forward").await,
            Err(PoolError::MissingTopic(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_leaves_connections_down_but_pooled() {
        let (tx, _rx) = mpsc::channel(8);
        let pool = ConnectionPool::new(settings(), tx);

        let count = pool
            .connect_all(&[descriptor("7", "main", "a-1"), descriptor("7", "car", "a-2")])
            .await;
        assert_eq!(count, 2);

        sleep(Duration::from_millis(200)).await;
        let statuses = pool.statuses().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| !s.connected));
        assert!(!pool.publish(&ConnectionKey::new("7", "main"), "7/main/cmd", "x").await);
    }

    #[tokio::test]
    async fn connecting_the_same_key_replaces_the_client() {
        let (tx, _rx) = mpsc::channel(8);
        let pool = ConnectionPool::new(settings(), tx);

        pool.connect_all(&[descriptor("7", "main", "first")]).await;
        let count = pool.connect_all(&[descriptor("7", "main", "second")]).await;
        assert_eq!(count, 1);

        let statuses = pool.statuses().await;
        assert_eq!(statuses[0].client_id, "second");

        assert!(pool.end_one(&ConnectionKey::new("7", "main")).await);
        assert!(!pool.end_one(&ConnectionKey::new("7", "main")).await);
        assert!(pool.statuses().await.is_empty());
    }
}
