//! Gateway configuration.
//!
//! Env-driven with production defaults; every knob has an `MPGATE_*`
//! override. The MP endpoint settings feed straight into the session
//! clients; the rest wires the dispatcher and logging.
//!
//! # Environment Variables
//!
//! - `MPGATE_ENDPOINT` - MP WebSocket endpoint URL
//! - `MPGATE_ORIGIN` - Origin header for the MP handshake
//! - `MPGATE_GLOBAL_WEBHOOK` - optional global webhook fanout URL
//! - `MPGATE_SKIP_MEDIA` - disable the media side-channel entirely
//! - `MPGATE_LOG_FORMAT` - `json` or `plain` (default plain)

use std::env;

use crate::client::SessionConfig;
use crate::logging::LogFormat;
use crate::protocol::{DEFAULT_ENDPOINT, DEFAULT_ORIGIN, PROTOCOL_VERSION};

/// Process-wide gateway settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub origin: String,
    pub protocol_version: i32,
    /// Empty disables global webhook fanout.
    pub global_webhook: String,
    pub skip_media: bool,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            protocol_version: PROTOCOL_VERSION,
            global_webhook: String::new(),
            skip_media: false,
            log_format: LogFormat::Plaintext,
        }
    }
}

impl Config {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoint) = env::var("MPGATE_ENDPOINT") {
            if !endpoint.is_empty() {
                config.endpoint = endpoint;
            }
        }
        if let Ok(origin) = env::var("MPGATE_ORIGIN") {
            if !origin.is_empty() {
                config.origin = origin;
            }
        }
        if let Ok(url) = env::var("MPGATE_GLOBAL_WEBHOOK") {
            config.global_webhook = url;
        }
        if let Ok(skip) = env::var("MPGATE_SKIP_MEDIA") {
            config.skip_media = matches!(skip.as_str(), "1" | "true" | "yes");
        }
        if let Ok(format) = env::var("MPGATE_LOG_FORMAT") {
            if format.eq_ignore_ascii_case("json") {
                config.log_format = LogFormat::Json;
            }
        }

        config
    }

    /// Connection settings handed to each session client.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            origin: self.origin.clone(),
            protocol_version: self.protocol_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert!(config.global_webhook.is_empty());
        assert!(!config.skip_media);
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("MPGATE_ENDPOINT", "ws://127.0.0.1:9999/ws");
        env::set_var("MPGATE_SKIP_MEDIA", "true");
        env::set_var("MPGATE_LOG_FORMAT", "json");

        let config = Config::from_env();
        assert_eq!(config.endpoint, "ws://127.0.0.1:9999/ws");
        assert!(config.skip_media);
        assert_eq!(config.log_format, LogFormat::Json);

        env::remove_var("MPGATE_ENDPOINT");
        env::remove_var("MPGATE_SKIP_MEDIA");
        env::remove_var("MPGATE_LOG_FORMAT");
    }

    #[test]
    fn test_session_config_projection() {
        let mut config = Config::default();
        config.endpoint = "ws://example".to_string();
        let session = config.session_config();
        assert_eq!(session.endpoint, "ws://example");
        assert_eq!(session.origin, config.origin);
    }
}
