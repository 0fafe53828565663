use crate::dedup::{danger_key, message_key, Deduplicator};
use crate::models::{Direction, EmailRequest, NotificationRecord, NotificationType, User};
use crate::rest_store::RestStore;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

const INFO_TOAST_CHARS: usize = 80;
const ALERT_TOAST_CHARS: usize = 100;
const INFO_TOAST_MS: u64 = 3_000;
const ALERT_TOAST_MS: u64 = 6_000;
const DANGER_TOAST_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
    pub duration_ms: u64,
}

impl Toast {
    pub fn for_record(record: &NotificationRecord) -> Self {
        match record.kind {
            NotificationType::Alert => Toast {
                level: ToastLevel::Error,
                message: truncate(&record.message, ALERT_TOAST_CHARS),
                duration_ms: ALERT_TOAST_MS,
            },
            NotificationType::Info => Toast {
                level: ToastLevel::Info,
                message: truncate(&record.message, INFO_TOAST_CHARS),
                duration_ms: INFO_TOAST_MS,
            },
        }
    }

    pub fn danger(message: &str) -> Self {
        Toast {
            level: ToastLevel::Error,
            message: truncate(message, ALERT_TOAST_CHARS),
            duration_ms: DANGER_TOAST_MS,
        }
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

/// Dedup key for a record: the same `(topic, message, date, time)` tuple from
/// the same section is delivered once.
pub fn record_key(record: &NotificationRecord) -> String {
    message_key(
        record.device_id.as_deref().unwrap_or("-"),
        record.section_name.as_deref().unwrap_or("-"),
        &record.topic,
        &format!("{}:{}:{}", record.message, record.date, record.time),
    )
}

pub fn low_voltage_message(device_name: &str, voltage: f64) -> String {
    format!("⚠️ Danger: Robot \"{}\" voltage is critically low ({}V)!", device_name, voltage)
}

fn record_timestamp(record: &NotificationRecord) -> Option<OffsetDateTime> {
    let date = Date::parse(&record.date, format_description!("[year]-[month]-[day]")).ok()?;
    let time = Time::parse(&record.time, format_description!("[hour]:[minute]:[second]")).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

/// Parses the "last opened" marker. Never opened means everything is unread.
pub fn unread_cutoff(since: Option<&str>) -> Result<OffsetDateTime, time::error::Parse> {
    match since.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339),
        None => Ok(OffsetDateTime::UNIX_EPOCH),
    }
}

/// Everything the low-voltage path needs about the device, captured before
/// the telemetry write.
#[derive(Debug, Clone)]
pub struct LowVoltageAlert {
    pub device_id: String,
    pub device_name: String,
    pub section_name: String,
    pub project_id: Option<String>,
    pub voltage: f64,
    pub topic: String,
}

pub struct Notifier {
    store: Arc<RestStore>,
    dedup: Arc<Deduplicator>,
    recent: RwLock<VecDeque<NotificationRecord>>,
    cap: usize,
    log_to_collection: bool,
    toasts: broadcast::Sender<Toast>,
}

impl Notifier {
    pub fn new(store: Arc<RestStore>, dedup: Arc<Deduplicator>, cap: usize, log_to_collection: bool) -> Self {
        let (toasts, _) = broadcast::channel(64);
        Self {
            store,
            dedup,
            recent: RwLock::new(VecDeque::with_capacity(cap.min(1024))),
            cap,
            log_to_collection,
            toasts,
        }
    }

    pub fn subscribe_toasts(&self) -> broadcast::Receiver<Toast> {
        self.toasts.subscribe()
    }

    /// Persists, mirrors and toasts a record. Returns whether the store
    /// accepted it; duplicates return false without side effects.
    pub async fn notify(&self, record: NotificationRecord) -> bool {
        let toast = Toast::for_record(&record);
        self.deliver(record, toast).await
    }

    async fn deliver(&self, mut record: NotificationRecord, toast: Toast) -> bool {
        record.dedup_key = record_key(&record);
        if !self.dedup.admit_message(&record.dedup_key).await {
            debug!("Duplicate notification dropped: {}", record);
            return false;
        }

        let persisted = match self.store.post_notification(&record).await {
            Ok(()) => {
                if self.log_to_collection && !record.danger {
                    if let Err(e) = self.store.post_log(&record).await {
                        warn!("Failed to write log entry for '{}': {}", record.message, e);
                    }
                }
                true
            }
            Err(e) => {
                error!("Failed to persist notification '{}': {}", record.message, e);
                false
            }
        };

        self.mirror(record).await;
        self.toast(toast);
        persisted
    }

    async fn mirror(&self, record: NotificationRecord) {
        let mut recent = self.recent.write().await;
        recent.push_front(record);
        recent.truncate(self.cap);
    }

    fn toast(&self, toast: Toast) {
        match toast.level {
            ToastLevel::Error => warn!("[toast] {}", toast.message),
            ToastLevel::Info => info!("[toast] {}", toast.message),
        }
        // Nobody listening is fine.
        let _ = self.toasts.send(toast);
    }

    /// Newest first.
    pub async fn recent(&self, limit: Option<usize>) -> Vec<NotificationRecord> {
        let recent = self.recent.read().await;
        recent.iter().take(limit.unwrap_or(self.cap)).cloned().collect()
    }

    /// Count of mirrored notifications stamped after `since`.
    pub async fn unread_since(&self, since: OffsetDateTime) -> usize {
        self.recent
            .read()
            .await
            .iter()
            .filter(|record| record_timestamp(record).is_some_and(|at| at > since))
            .count()
    }

    pub async fn send_low_voltage_alert(&self, alert: &LowVoltageAlert) {
        let key = danger_key(&alert.device_id, &alert.section_name, &alert.voltage.to_string());
        if !self.dedup.admit_danger(&key).await {
            debug!("Low-voltage alert for {} suppressed ({}).", alert.device_name, key);
            return;
        }

        let message = low_voltage_message(&alert.device_name, alert.voltage);
        let record = NotificationRecord::new(&alert.topic, &message, NotificationType::Alert)
            .for_section(&alert.device_id, &alert.device_name, &alert.section_name)
            .with_direction(Direction::Incoming)
            .as_danger();
        self.deliver(record, Toast::danger(&message)).await;

        self.email_stakeholders(alert, &message).await;
    }

    async fn email_stakeholders(&self, alert: &LowVoltageAlert, message: &str) {
        let Some(project_id) = alert.project_id.as_deref() else {
            info!("{} has no project; no stakeholders to email.", alert.device_name);
            return;
        };

        let project = match self.store.fetch_project(project_id).await {
            Ok(project) => project,
            Err(e) => {
                warn!("Could not load project {} for low-voltage email: {}", project_id, e);
                return;
            }
        };
        let project_name = project.project_name.trim();
        if project_name.is_empty() {
            return;
        }

        let users = match self.store.fetch_users().await {
            Ok(users) => users,
            Err(e) => {
                warn!("Could not load users for low-voltage email: {}", e);
                return;
            }
        };

        let recipients: Vec<&User> = users
            .iter()
            .filter(|user| user.project_name.as_deref().map(str::trim) == Some(project_name))
            .filter(|user| user.email.as_deref().is_some_and(|email| !email.trim().is_empty()))
            .collect();

        for user in recipients {
            let email = EmailRequest {
                to: user.email.clone().unwrap_or_default(),
                subject: format!("Low voltage alert: {}", alert.device_name),
                message: message.to_string(),
            };
            match self.store.send_email(&email).await {
                Ok(()) => info!("Low-voltage email sent to {}.", email.to),
                Err(e) => warn!("Low-voltage email to {} failed: {}", email.to, e),
            }
        }
    }
}
