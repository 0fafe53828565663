use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use time::macros::format_description;
use time::OffsetDateTime;
use uuid::Uuid;

/// Record ids come back from the store as either strings or numbers.
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("unsupported id value: {}", other))),
    }
}

fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Ok(None),
    }
}

/// Voltage and cycle fields are sometimes stored as numeric strings.
fn de_opt_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => Ok(s.trim().parse::<f64>().ok()),
        _ => Ok(None),
    }
}

/// Absent and null stay absent so a write-back does not invent the field.
fn de_opt_lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Ok(Some(other.to_string())),
    }
}

fn de_lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SectionStatus {
    Running,
    Stopped,
    Idle,
    /// Any other mode a device reports.
    Other(String),
}

impl From<String> for SectionStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => SectionStatus::Running,
            "stopped" => SectionStatus::Stopped,
            "idle" => SectionStatus::Idle,
            _ => SectionStatus::Other(value.trim().to_string()),
        }
    }
}

impl From<SectionStatus> for String {
    fn from(value: SectionStatus) -> Self {
        match value {
            SectionStatus::Running => "Running".to_string(),
            SectionStatus::Stopped => "Stopped".to_string(),
            SectionStatus::Idle => "Idle".to_string(),
            SectionStatus::Other(mode) => mode,
        }
    }
}

/// A control button configured on a section, normalised from whatever shape
/// the store returned (bare string or object with `Name`/`name`/`Command`).
/// The stored value is kept and written back verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveButton {
    pub name: String,
    pub command: Option<String>,
    pub id: String,
    pub section: String,
    raw: Value,
}

#[derive(Deserialize)]
struct RawButtonObject {
    #[serde(rename = "Name", alias = "name", default)]
    name: Option<String>,
    #[serde(rename = "Command", alias = "command", default)]
    command: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    id: Option<String>,
    #[serde(default)]
    section: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawButton {
    Label(String),
    Object(RawButtonObject),
}

impl<'de> Deserialize<'de> for ActiveButton {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let parsed: RawButton = serde_json::from_value(raw.clone()).map_err(de::Error::custom)?;
        let button = match parsed {
            RawButton::Label(name) => ActiveButton {
                name,
                command: None,
                id: Uuid::new_v4().to_string(),
                section: String::new(),
                raw,
            },
            RawButton::Object(object) => {
                let command = object.command.filter(|c| !c.trim().is_empty());
                let name = object
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .or_else(|| command.clone())
                    .unwrap_or_default();
                ActiveButton {
                    name,
                    command,
                    // Local only; a generated id is never written back.
                    id: object.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    section: object.section.unwrap_or_default(),
                    raw,
                }
            }
        };
        Ok(button)
    }
}

impl Serialize for ActiveButton {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl ActiveButton {
    /// Case-insensitive match against the button's name or its command.
    pub fn matches(&self, value: &str) -> bool {
        let value = value.trim();
        self.name.trim().eq_ignore_ascii_case(value)
            || self
                .command
                .as_deref()
                .is_some_and(|command| command.trim().eq_ignore_ascii_case(value))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(
        rename = "mqttUrl",
        default,
        deserialize_with = "de_opt_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub mqtt_url: Option<String>,
    #[serde(
        rename = "mqttUsername",
        default,
        deserialize_with = "de_opt_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub mqtt_username: Option<String>,
    #[serde(
        rename = "mqttPassword",
        default,
        deserialize_with = "de_opt_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub mqtt_password: Option<String>,
    #[serde(
        rename = "Topic_main",
        default,
        deserialize_with = "de_opt_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub topic_main: Option<String>,
    #[serde(
        rename = "Topic_subscribe",
        default,
        deserialize_with = "de_opt_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub topic_subscribe: Option<String>,
    #[serde(
        rename = "Voltage",
        default,
        deserialize_with = "de_opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub voltage: Option<f64>,
    #[serde(
        rename = "Cycles",
        default,
        deserialize_with = "de_opt_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub cycles: Option<f64>,
    #[serde(rename = "Status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SectionStatus>,
    #[serde(rename = "ActiveBtns", default, skip_serializing_if = "Option::is_none")]
    pub active_buttons: Option<Vec<ActiveButton>>,
    /// Fields this service does not interpret; written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Section {
    pub fn has_credentials(&self) -> bool {
        !self.mqtt_url().trim().is_empty()
            && !self.mqtt_username().trim().is_empty()
            && !self.mqtt_password().trim().is_empty()
    }

    pub fn buttons(&self) -> &[ActiveButton] {
        self.active_buttons.as_deref().unwrap_or_default()
    }

    pub fn mqtt_url(&self) -> &str {
        self.mqtt_url.as_deref().unwrap_or_default()
    }

    pub fn mqtt_username(&self) -> &str {
        self.mqtt_username.as_deref().unwrap_or_default()
    }

    pub fn mqtt_password(&self) -> &str {
        self.mqtt_password.as_deref().unwrap_or_default()
    }

    /// Topic commands are published on.
    pub fn topic_main(&self) -> &str {
        self.topic_main.as_deref().unwrap_or_default()
    }

    /// Topic the device reports on.
    pub fn topic_subscribe(&self) -> &str {
        self.topic_subscribe.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(rename = "RobotName", alias = "name", default, deserialize_with = "de_lenient_string")]
    pub name: String,
    #[serde(
        rename = "projectId",
        default,
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_id: Option<String>,
    #[serde(rename = "Sections", default)]
    pub sections: BTreeMap<String, Section>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Device {
    /// Stamps every button with its owning section name. Called once on fetch.
    pub fn normalized(mut self) -> Self {
        for (section_name, section) in self.sections.iter_mut() {
            for button in section.active_buttons.iter_mut().flatten() {
                if button.section.is_empty() {
                    button.section = section_name.clone();
                }
            }
        }
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(rename = "projectName", alias = "name", default, deserialize_with = "de_lenient_string")]
    pub project_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(alias = "username", default, deserialize_with = "de_lenient_string")]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "projectName", default)]
    pub project_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Info,
    Alert,
}

impl NotificationType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" => Some(NotificationType::Info),
            "alert" => Some(NotificationType::Alert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A notification (and optionally log) entry as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub topic: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub date: String,
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub dedup_key: String,
    /// Danger alerts go to notifications only, never to the logs collection.
    #[serde(skip)]
    pub danger: bool,
}

impl NotificationRecord {
    pub fn new(topic: &str, message: &str, kind: NotificationType) -> Self {
        let (date, time) = utc_date_time_now();
        Self {
            topic: topic.to_string(),
            message: message.to_string(),
            kind,
            date,
            time,
            device_id: None,
            device_name: None,
            section_name: None,
            direction: None,
            dedup_key: String::new(),
            danger: false,
        }
    }

    pub fn for_section(mut self, device_id: &str, device_name: &str, section_name: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self.device_name = Some(device_name.to_string());
        self.section_name = Some(section_name.to_string());
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_timestamp(mut self, date: String, time: String) -> Self {
        self.date = date;
        self.time = time;
        self
    }

    pub fn as_danger(mut self) -> Self {
        self.danger = true;
        self
    }
}

impl fmt::Display for NotificationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{:?}] {}: {}", self.date, self.time, self.kind, self.topic, self.message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailRequest {
    pub to: String,
    pub subject: String,
    pub message: String,
}

/// Current UTC date (`YYYY-MM-DD`) and time (`HH:MM:SS`).
pub fn utc_date_time_now() -> (String, String) {
    let now = OffsetDateTime::now_utc();
    let date = now
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_default();
    let time = now
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default();
    (date, time)
}
