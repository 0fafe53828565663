use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct DedupWindows {
    /// Identical messages inside this window are dropped.
    pub message_window: Duration,
    /// How long a message stamp is kept before eviction.
    pub message_ttl: Duration,
    pub danger_window: Duration,
    pub half_cycle_window: Duration,
}

impl Default for DedupWindows {
    fn default() -> Self {
        Self {
            message_window: Duration::from_millis(3000),
            message_ttl: Duration::from_secs(10),
            danger_window: Duration::from_secs(30),
            half_cycle_window: Duration::from_secs(5),
        }
    }
}

/// Key -> time of last acceptance.
#[derive(Debug)]
struct WindowTable {
    window: Duration,
    ttl: Duration,
    entries: HashMap<String, Instant>,
}

impl WindowTable {
    fn new(window: Duration, ttl: Duration) -> Self {
        Self {
            window,
            ttl: ttl.max(window),
            entries: HashMap::new(),
        }
    }

    /// Returns true and stamps the key when it was not seen inside the window.
    fn admit(&mut self, key: &str, now: Instant) -> bool {
        if let Some(stamped) = self.entries.get(key) {
            if now.duration_since(*stamped) < self.window {
                return false;
            }
        }
        self.entries.insert(key.to_string(), now);
        true
    }

    fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, stamped| now.duration_since(*stamped) < ttl);
        before - self.entries.len()
    }
}

pub fn message_key(device_id: &str, section: &str, topic: &str, message: &str) -> String {
    let encoded = BASE64_STANDARD.encode(format!("{}:{}", topic, message));
    format!("{}:{}:{}", device_id, section, encoded)
}

pub fn danger_key(device_id: &str, section: &str, discriminator: &str) -> String {
    format!("danger-{}-{}-{}", device_id, section, discriminator)
}

pub fn half_cycle_key(device_id: &str, section: &str) -> String {
    format!("halfcycle-{}-{}", device_id, section)
}

/// In-memory suppression tables for repeated messages, danger alerts and
/// half-cycle bursts. Process lifetime only.
#[derive(Debug)]
pub struct Deduplicator {
    messages: Mutex<WindowTable>,
    danger: Mutex<WindowTable>,
    half_cycle: Mutex<WindowTable>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupWindows::default())
    }
}

impl Deduplicator {
    pub fn new(windows: DedupWindows) -> Self {
        Self {
            messages: Mutex::new(WindowTable::new(windows.message_window, windows.message_ttl)),
            danger: Mutex::new(WindowTable::new(windows.danger_window, windows.danger_window)),
            half_cycle: Mutex::new(WindowTable::new(windows.half_cycle_window, windows.half_cycle_window)),
        }
    }

    pub async fn admit_message(&self, key: &str) -> bool {
        self.messages.lock().await.admit(key, Instant::now())
    }

    pub async fn admit_danger(&self, key: &str) -> bool {
        self.danger.lock().await.admit(key, Instant::now())
    }

    pub async fn admit_half_cycle(&self, key: &str) -> bool {
        self.half_cycle.lock().await.admit(key, Instant::now())
    }

    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = self.messages.lock().await.evict_expired(now);
        evicted += self.danger.lock().await.evict_expired(now);
        evicted += self.half_cycle.lock().await.evict_expired(now);
        evicted
    }

    pub async fn reset(&self) {
        self.messages.lock().await.entries.clear();
        self.danger.lock().await.entries.clear();
        self.half_cycle.lock().await.entries.clear();
        debug!("Dedup tables cleared.");
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.entries.len()
            + self.danger.lock().await.entries.len()
            + self.half_cycle.lock().await.entries.len()
    }

    /// Periodically drops expired stamps until `shutdown` fires.
    pub fn spawn_eviction(self: Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.evict_expired().await;
                        if evicted > 0 {
                            debug!("Evicted {} expired dedup entries.", evicted);
                        }
                    }
                }
            }
            debug!("Dedup eviction worker stopped.");
        })
    }
}
