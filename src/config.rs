use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_ssl_enabled: bool,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,

    pub topics: TopicConfig,

    pub history_db_path: String,
    pub history_max_records: usize,
    pub record_interval_secs: u64,

    pub rest_address: String,
    pub rest_port: u16,
}

/// Every topic the hub talks to, already prefixed with the root topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub tank_1: String,
    pub tank_2: String,
    pub flow_1: String,
    pub flow_2: String,
    pub sensor: String,
    pub thresholds_1: String,
    pub thresholds_2: String,
    pub alerts: String,
    pub status: String,
}

impl TopicConfig {
    pub fn with_root(root: &str) -> Self {
        // Helper to prepend root topic if available
        let prepend_root_topic = |topic: &str| {
            if !root.is_empty() {
                format!("{}/{}", root.trim_end_matches('/'), topic.trim_start_matches('/'))
            } else {
                topic.to_string()
            }
        };

        Self {
            tank_1: prepend_root_topic("/tanque/1"),
            tank_2: prepend_root_topic("/tanque/2"),
            flow_1: prepend_root_topic("/caudal/1"),
            flow_2: prepend_root_topic("/caudal/2"),
            sensor: prepend_root_topic("/sensor"),
            thresholds_1: prepend_root_topic("/umbrales/1"),
            thresholds_2: prepend_root_topic("/umbrales/2"),
            alerts: prepend_root_topic("/alertas"),
            status: prepend_root_topic("/hub/status"),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self::with_root("fluir")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        // Reconnect delays never exceed one minute.
        const MAX_TIMEOUT: u64 = 60_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if !(5..=u16::MAX as u64).contains(&self.mqtt_keep_alive_secs) {
            return Err(ConfigError::ParsingError(
                "MQTT_KEEP_ALIVE_SECS must be between 5 and 65535".to_string(),
            ));
        }

        if self.mqtt_max_retries < -1 {
            return Err(ConfigError::ParsingError(
                "MQTT_MAX_RETRIES must be -1 (unlimited), 0 (disabled) or positive".to_string(),
            ));
        }

        if self.record_interval_secs == 0 {
            return Err(ConfigError::ParsingError(
                "RECORD_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        if self.history_max_records == 0 {
            return Err(ConfigError::ParsingError(
                "HISTORY_MAX_RECORDS must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, so tests don't touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mqtt_root_topic = lookup("MQTT_ROOT_TOPIC").unwrap_or_else(|| "fluir".to_string());

        let config = Self {
            // MQTT Configuration
            mqtt_host: lookup("MQTT_HOST")
                .filter(|host| !host.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingOrInvalid("MQTT_HOST".to_string()))?,
            mqtt_port: parse_var(&lookup, "MQTT_PORT", 8883)?,
            mqtt_username: lookup("MQTT_USERNAME").unwrap_or_default(), // Default to empty
            mqtt_password: lookup("MQTT_PASSWORD").unwrap_or_default(), // Default to empty
            mqtt_ssl_enabled: parse_flag(&lookup, "MQTT_SSL_ENABLED", true)?,
            mqtt_keep_alive_secs: parse_var(&lookup, "MQTT_KEEP_ALIVE_SECS", 30)?,
            mqtt_max_retries: parse_var(&lookup, "MQTT_MAX_RETRIES", 5)?,
            mqtt_retry_interval_ms: parse_var(&lookup, "MQTT_RETRY_INTERVAL_MS", 5000)?,

            // MQTT Topics
            topics: TopicConfig::with_root(&mqtt_root_topic),

            // Level history
            history_db_path: lookup("HISTORY_DB_PATH")
                .unwrap_or_else(|| "fluir_history.db".to_string()),
            history_max_records: parse_var(&lookup, "HISTORY_MAX_RECORDS", 10_000)?,
            record_interval_secs: parse_var(&lookup, "RECORD_INTERVAL_SECS", 60)?,

            // REST API
            rest_address: lookup("REST_ADDRESS").unwrap_or_else(|| "127.0.0.1".to_string()),
            rest_port: parse_var(&lookup, "REST_PORT", 8000)?,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", key))),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("FALSE") | Some("no") => Ok(false),
        Some(_) => Err(ConfigError::ParsingError(format!("{} must be true or false", key))),
    }
}
