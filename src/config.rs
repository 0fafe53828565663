use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub rest_base_url: String,

    pub mqtt_ws_port: u16,
    pub mqtt_ws_path: String,
    pub mqtt_ws_secure: bool,
    pub mqtt_reconnect_period_ms: u64,
    pub mqtt_connect_timeout_secs: u64,
    pub mqtt_publish_timeout_secs: u64,

    pub reconnect_one_delay_ms: u64,
    pub reconnect_all_delay_ms: u64,
    pub fleet_fetch_retries: usize,

    pub low_voltage_threshold: f64,
    pub notification_cap: usize,
    pub log_to_collection: bool,

    pub status_port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

/// Reads `name` from the environment, falling back to `default` when unset.
fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Defaults for every knob; only the REST base URL has no sensible default.
    pub fn with_base_url(rest_base_url: &str) -> Self {
        Self {
            rest_base_url: rest_base_url.trim_end_matches('/').to_string(),
            mqtt_ws_port: 8884,
            mqtt_ws_path: "/mqtt".to_string(),
            mqtt_ws_secure: true,
            mqtt_reconnect_period_ms: 5000,
            mqtt_connect_timeout_secs: 10,
            mqtt_publish_timeout_secs: 10,
            reconnect_one_delay_ms: 1000,
            reconnect_all_delay_ms: 3000,
            fleet_fetch_retries: 3,
            low_voltage_threshold: 15.0,
            notification_cap: 1000,
            log_to_collection: true,
            status_port: 8000,
        }
    }

    /// Validate timeout values and other critical configurations.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_reconnect_period_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RECONNECT_PERIOD_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if self.mqtt_connect_timeout_secs == 0 || self.mqtt_publish_timeout_secs == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT connect and publish timeouts must be at least one second".to_string(),
            ));
        }
        if self.notification_cap == 0 {
            return Err(ConfigError::ParsingError("NOTIFICATION_CAP must be positive".to_string()));
        }
        if !self.mqtt_ws_path.starts_with('/') {
            return Err(ConfigError::ParsingError("MQTT_WS_PATH must start with '/'".to_string()));
        }

        Ok(())
    }

    pub fn mqtt_reconnect_period(&self) -> Duration {
        Duration::from_millis(self.mqtt_reconnect_period_ms)
    }

    pub fn mqtt_publish_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt_publish_timeout_secs)
    }

    pub fn reconnect_one_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_one_delay_ms)
    }

    pub fn reconnect_all_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_all_delay_ms)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let rest_base_url = env::var("REST_BASE_URL")
            .map_err(|_| ConfigError::MissingOrInvalid("REST_BASE_URL".to_string()))?;
        if rest_base_url.trim().is_empty() {
            return Err(ConfigError::MissingOrInvalid("REST_BASE_URL".to_string()));
        }

        let defaults = Self::with_base_url(rest_base_url.trim());
        let config = Self {
            mqtt_ws_port: env_or("MQTT_WS_PORT", defaults.mqtt_ws_port)?,
            mqtt_ws_path: env_or("MQTT_WS_PATH", defaults.mqtt_ws_path.clone())?,
            mqtt_ws_secure: env_or("MQTT_WS_SECURE", defaults.mqtt_ws_secure)?,
            mqtt_reconnect_period_ms: env_or("MQTT_RECONNECT_PERIOD_MS", defaults.mqtt_reconnect_period_ms)?,
            mqtt_connect_timeout_secs: env_or("MQTT_CONNECT_TIMEOUT_SECS", defaults.mqtt_connect_timeout_secs)?,
            mqtt_publish_timeout_secs: env_or("MQTT_PUBLISH_TIMEOUT_SECS", defaults.mqtt_publish_timeout_secs)?,
            reconnect_one_delay_ms: env_or("RECONNECT_ONE_DELAY_MS", defaults.reconnect_one_delay_ms)?,
            reconnect_all_delay_ms: env_or("RECONNECT_ALL_DELAY_MS", defaults.reconnect_all_delay_ms)?,
            fleet_fetch_retries: env_or("FLEET_FETCH_RETRIES", defaults.fleet_fetch_retries)?,
            low_voltage_threshold: env_or("LOW_VOLTAGE_THRESHOLD", defaults.low_voltage_threshold)?,
            notification_cap: env_or("NOTIFICATION_CAP", defaults.notification_cap)?,
            log_to_collection: env_or("LOG_TO_COLLECTION", defaults.log_to_collection)?,
            status_port: env_or("STATUS_PORT", defaults.status_port)?,
            rest_base_url: defaults.rest_base_url,
        };

        config.validate()?;

        Ok(config)
    }
}
