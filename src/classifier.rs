//! Turns raw device payloads into one of three shapes the pipeline acts on.
//!
//! Devices publish loosely formatted text: sometimes bare `key:value` tokens,
//! sometimes a `message_status: { ... }` block, sometimes a JSON object with a
//! `message` field, and sometimes plain prose. Classification is pure so the
//! ingest path can match on the result exhaustively.

use crate::models::{utc_date_time_now, NotificationType};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

const ALERT_KEYWORDS: &[&str] = &[
    "error",
    "alert",
    "warning",
    "critical",
    "fail",
    "failed",
    "stopped",
    "emergency",
    "fault",
    "danger",
    "issue",
    "problem",
    "shutdown",
    "offline",
    "alarm",
    "malfunction",
    "broken",
];

const INFO_KEYWORDS: &[&str] = &[
    "info",
    "started",
    "running",
    "online",
    "completed",
    "success",
    "ready",
    "normal",
    "ok",
    "initialized",
    "connected",
    "active",
    "operational",
];

static HALF_CYCLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)half[\s-]?cycle\s*finished").expect("valid half-cycle pattern"));

static STATUS_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)["']?message_status["']?\s*:\s*\{([^}]*)\}"#).expect("valid status-block pattern"));

static VOLTAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["']?\bvoltage["']?\s*:\s*["']?(-?\d+(?:\.\d+)?)"#).expect("valid voltage pattern")
});

static MODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)["']?\bmode["']?\s*:\s*["']?([A-Za-z_][\w-]*)"#).expect("valid mode pattern"));

static CYCLES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["']?\bcycles["']?\s*:\s*["']?(\d+(?:\.\d+)?)"#).expect("valid cycles pattern")
});

/// Fields extracted from a telemetry payload. Absent fields must be left
/// untouched downstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryUpdate {
    pub voltage: Option<f64>,
    pub mode: Option<String>,
    pub cycles: Option<f64>,
}

impl TelemetryUpdate {
    pub fn is_empty(&self) -> bool {
        self.voltage.is_none() && self.mode.is_none() && self.cycles.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FreeTextEvent {
    pub message: String,
    pub kind: NotificationType,
    pub date: String,
    pub time: String,
    pub is_alert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    HalfCycle,
    Telemetry(TelemetryUpdate),
    FreeText(FreeTextEvent),
}

/// Trims the payload and removes one layer of accidental JSON string quoting.
pub fn normalize_payload(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        if let Ok(inner) = serde_json::from_str::<String>(trimmed) {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

pub fn is_half_cycle(text: &str) -> bool {
    HALF_CYCLE.is_match(text)
}

fn extract_fields(text: &str) -> TelemetryUpdate {
    let capture = |re: &Regex| re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().to_string());
    TelemetryUpdate {
        voltage: capture(&VOLTAGE).and_then(|v| v.parse::<f64>().ok()),
        mode: capture(&MODE),
        cycles: capture(&CYCLES).and_then(|v| v.parse::<f64>().ok()),
    }
}

/// Pulls voltage/mode/cycles out of the text. Values inside a
/// `message_status: { ... }` block take precedence over bare tokens.
pub fn extract_telemetry(text: &str) -> Option<TelemetryUpdate> {
    let bare = extract_fields(text);
    let update = match STATUS_BLOCK.captures(text).and_then(|c| c.get(1)) {
        Some(block) => {
            let nested = extract_fields(block.as_str());
            TelemetryUpdate {
                voltage: nested.voltage.or(bare.voltage),
                mode: nested.mode.or(bare.mode),
                cycles: nested.cycles.or(bare.cycles),
            }
        }
        None => bare,
    };

    if update.is_empty() {
        None
    } else {
        Some(update)
    }
}

/// Alert iff at least one alert keyword appears and no info keyword does.
pub fn is_alert(text: &str) -> bool {
    let lowered = text.to_lowercase();
    let has_alert = ALERT_KEYWORDS.iter().any(|k| lowered.contains(k));
    let has_info = INFO_KEYWORDS.iter().any(|k| lowered.contains(k));
    has_alert && !has_info
}

/// Danger events are alerts that explicitly say so; they get their own
/// longer dedup window and are kept out of the logs collection.
pub fn is_danger(text: &str) -> bool {
    is_alert(text) && text.to_lowercase().contains("danger")
}

fn string_field(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn free_text(text: &str) -> FreeTextEvent {
    let (now_date, now_time) = utc_date_time_now();

    let parsed = if text.starts_with('{') && text.ends_with('}') {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(object)) => Some(object),
            _ => None,
        }
    } else {
        None
    };

    let (message, declared_kind, date, time) = match parsed {
        Some(object) => {
            let message = match object.get("message") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => text.to_string(),
                Some(other) => other.to_string(),
            };
            let declared = string_field(&object, "type").and_then(|t| NotificationType::parse(&t));
            (
                message,
                declared,
                string_field(&object, "date").unwrap_or(now_date),
                string_field(&object, "time").unwrap_or(now_time),
            )
        }
        None => (text.to_string(), None, now_date, now_time),
    };

    let alert = is_alert(&message);
    let kind = if alert {
        NotificationType::Alert
    } else {
        declared_kind.unwrap_or(NotificationType::Info)
    };

    FreeTextEvent {
        message,
        kind,
        date,
        time,
        is_alert: alert,
    }
}

pub fn classify(raw: &str) -> Classified {
    let text = normalize_payload(raw);

    if is_half_cycle(&text) {
        return Classified::HalfCycle;
    }

    if let Some(update) = extract_telemetry(&text) {
        return Classified::Telemetry(update);
    }

    Classified::FreeText(free_text(&text))
}
