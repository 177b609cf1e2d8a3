//! Server configuration module.
//!
//! Parses configuration from environment variables for the Livewire server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `JWT_SECRET` | Yes | - | HMAC secret shared with the credential service |
//! | `MQTT_BROKER` | Yes | - | MQTT broker host |
//! | `MQTT_PORT` | No | 1883 | MQTT broker port |
//! | `MQTT_USERNAME` | No | - | MQTT username (used only with `MQTT_PASSWORD`) |
//! | `MQTT_PASSWORD` | No | - | MQTT password |
//! | `MQTT_TOPIC_SENSORS_DATA` | No | "" | Topic prefix, subscribed as `<prefix>#` |
//! | `MQTT_CLIENT_ID` | No | `livewire-<uuid>` | MQTT client identifier |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `HUB_SEND_TIMEOUT_SECS` | No | 10 | Per-subscriber write timeout |

use std::env;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::ingest::IngestConfig;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default MQTT broker port.
const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default per-subscriber write timeout in seconds.
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 10;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number for {var}: {message}")]
    InvalidPort { var: String, message: String },
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Shared secret used to verify subscriber tokens.
    pub jwt_secret: String,

    /// HTTP server port.
    pub port: u16,

    /// Bound on a single subscriber write during dispatch.
    pub send_timeout: Duration,

    /// MQTT ingestion settings.
    pub ingest: IngestConfig,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `JWT_SECRET` or `MQTT_BROKER` is missing or empty
    /// - A port is not a valid u16
    /// - `HUB_SEND_TIMEOUT_SECS` is not a positive integer
    ///
    /// # Example
    ///
    /// ```no_run
    /// use livewire_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = raw_env("JWT_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("JWT_SECRET".to_string()))?;
        let port = parse_port("PORT", DEFAULT_PORT)?;
        let send_timeout = parse_send_timeout()?;

        let host = required_env("MQTT_BROKER")?;
        let mqtt_port = parse_port("MQTT_PORT", DEFAULT_MQTT_PORT)?;
        let credentials = match (optional_env("MQTT_USERNAME"), raw_env("MQTT_PASSWORD")) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        };
        let topic_prefix = env::var("MQTT_TOPIC_SENSORS_DATA").unwrap_or_default();
        let client_id = optional_env("MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("livewire-{}", Uuid::new_v4().simple()));

        Ok(Self {
            jwt_secret,
            port,
            send_timeout,
            ingest: IngestConfig {
                host,
                port: mqtt_port,
                credentials,
                topic_prefix,
                client_id,
            },
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"<redacted>")
            .field("port", &self.port)
            .field("send_timeout", &self.send_timeout)
            .field("ingest", &self.ingest)
            .finish()
    }
}

/// Read a variable that must be present and non-empty.
fn required_env(name: &str) -> Result<String, ConfigError> {
    optional_env(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

/// Read a variable, treating empty and whitespace-only values as unset.
fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a credential verbatim; only an empty value counts as unset.
///
/// Secrets are compared byte-for-byte by their peers, so surrounding
/// whitespace is significant.
fn raw_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse a port variable.
///
/// Returns `default` if not set.
fn parse_port(name: &str, default: u16) -> Result<u16, ConfigError> {
    match env::var(name) {
        Ok(port_str) => port_str
            .trim()
            .parse()
            .map_err(|err: std::num::ParseIntError| ConfigError::InvalidPort {
                var: name.to_string(),
                message: err.to_string(),
            }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse the HUB_SEND_TIMEOUT_SECS environment variable.
fn parse_send_timeout() -> Result<Duration, ConfigError> {
    let Some(value) = optional_env("HUB_SEND_TIMEOUT_SECS") else {
        return Ok(Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS));
    };

    match value.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidFormat {
            var: "HUB_SEND_TIMEOUT_SECS".to_string(),
            message: format!("expected a positive number of seconds, got '{value}'"),
        }),
    }
}
