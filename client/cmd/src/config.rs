//! Configuration handling for the bayeux binary.
//!
//! Settings are read from an optional YAML file and may be overridden by
//! environment variables; command-line flags take precedence over both.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bayeux server URL.
    pub url: String,
    /// Pause added to the retry pause after each failed attempt (ms).
    pub backoff_increment_ms: u64,
    /// Upper bound for the retry pause (ms).
    pub max_backoff_ms: u64,
    /// Transport preference order.
    pub transports: Vec<String>,
    /// Channels to subscribe to at startup.
    pub channels: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/cometd".to_string(),
            backoff_increment_ms: 1000,
            max_backoff_ms: 30_000,
            transports: vec!["long-polling".to_string()],
            channels: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a file, falling back to defaults, then apply
    /// environment overrides.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<ClientConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("loaded configuration from {:?}", config_path.as_ref());
                }
                Err(error) => {
                    warn!(
                        "failed to parse config file {:?} ({error}), using defaults",
                        config_path.as_ref()
                    );
                }
            }
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `BAYEUX_*` environment variable overrides.
    fn apply_environment_overrides(&mut self) {
        if let Ok(url) = std::env::var("BAYEUX_URL") {
            info!("server url overridden by environment: {url}");
            self.url = url;
        }
        if let Ok(value) = std::env::var("BAYEUX_BACKOFF_INCREMENT_MS") {
            if let Ok(ms) = value.parse::<u64>() {
                self.backoff_increment_ms = ms;
            }
        }
        if let Ok(value) = std::env::var("BAYEUX_MAX_BACKOFF_MS") {
            if let Ok(ms) = value.parse::<u64>() {
                self.max_backoff_ms = ms;
            }
        }
        if let Ok(value) = std::env::var("BAYEUX_TRANSPORTS") {
            self.transports = value
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "http://localhost:8080/cometd");
        assert_eq!(config.backoff_increment_ms, 1000);
        assert_eq!(config.max_backoff_ms, 30_000);
        assert_eq!(config.transports, vec!["long-polling"]);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
url: "https://example.com/cometd"
backoff_increment_ms: 500
transports:
  - websocket
  - long-polling
channels:
  - /chat
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.url, "https://example.com/cometd");
        assert_eq!(config.backoff_increment_ms, 500);
        // Unset fields keep their defaults.
        assert_eq!(config.max_backoff_ms, 30_000);
        assert_eq!(config.transports, vec!["websocket", "long-polling"]);
        assert_eq!(config.channels, vec!["/chat"]);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ClientConfig::load_from_file("/nonexistent/config.yaml").unwrap();
        assert_eq!(config.url, ClientConfig::default().url);
    }
}
