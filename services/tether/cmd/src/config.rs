//! Configuration handling for the tether client.
//!
//! Settings come from a YAML file, then `TETHER_*` environment variables,
//! then command line flags, each layer overriding the previous one.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tether_session::SocketConfig;
use tracing::{info, warn};

/// Tether client configuration
#[derive(Clone)]
pub struct TetherConfig {
    /// WebSocket endpoint
    pub url: String,
    /// Shared secret the channel key is derived from
    pub secret: Option<String>,
    /// Time allowed for connecting and the nonce exchange
    pub dial_timeout: Duration,
    /// Interval between echo probes
    pub echo_interval: Duration,
    /// Initial sender flush delay
    pub send_delay: Duration,
    /// Pending sends that force a flush
    pub burst_limit: usize,
    /// Largest plaintext per envelope
    pub max_segment_size: usize,
}

impl std::fmt::Debug for TetherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherConfig")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("dial_timeout", &self.dial_timeout)
            .field("echo_interval", &self.echo_interval)
            .field("send_delay", &self.send_delay)
            .field("burst_limit", &self.burst_limit)
            .field("max_segment_size", &self.max_segment_size)
            .finish()
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        let socket = SocketConfig::default();
        Self {
            url: String::new(),
            secret: None,
            dial_timeout: socket.dial_timeout,
            echo_interval: socket.echo_interval,
            send_delay: socket.send_delay,
            burst_limit: socket.burst_limit,
            max_segment_size: socket.max_segment_size,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    tether: Option<FileConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    url: Option<String>,
    secret: Option<String>,
    dial_timeout: Option<String>,
    echo_interval: Option<String>,
    send_delay: Option<String>,
    burst_limit: Option<usize>,
    max_segment_size: Option<usize>,
}

impl TetherConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(file) = root.tether {
                        config.apply_file_config(file);
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => info!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Tether configuration: url={}, dial_timeout={:?}, echo_interval={:?}",
            config.url, config.dial_timeout, config.echo_interval
        );

        Ok(config)
    }

    /// Settings for the socket facade
    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            url: self.url.clone(),
            dial_timeout: self.dial_timeout,
            echo_interval: self.echo_interval,
            max_segment_size: self.max_segment_size,
            send_delay: self.send_delay,
            burst_limit: self.burst_limit,
        }
    }

    fn apply_file_config(&mut self, file: FileConfig) {
        if let Some(url) = file.url {
            self.url = url;
        }
        if let Some(secret) = file.secret {
            self.secret = Some(secret);
        }
        if let Some(value) = file.dial_timeout {
            set_duration(&mut self.dial_timeout, "dial_timeout", &value);
        }
        if let Some(value) = file.echo_interval {
            set_duration(&mut self.echo_interval, "echo_interval", &value);
        }
        if let Some(value) = file.send_delay {
            set_duration(&mut self.send_delay, "send_delay", &value);
        }
        if let Some(limit) = file.burst_limit {
            self.burst_limit = limit;
        }
        if let Some(size) = file.max_segment_size {
            self.max_segment_size = size;
        }
    }

    /// Apply `TETHER_*` overrides looked up through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TETHER_URL") {
            info!("URL overridden by environment: {}", url);
            self.url = url;
        }

        if let Some(secret) = lookup("TETHER_SECRET") {
            self.secret = Some(secret);
        }

        if let Some(value) = lookup("TETHER_DIAL_TIMEOUT") {
            set_duration(&mut self.dial_timeout, "TETHER_DIAL_TIMEOUT", &value);
        }

        if let Some(value) = lookup("TETHER_ECHO_INTERVAL") {
            set_duration(&mut self.echo_interval, "TETHER_ECHO_INTERVAL", &value);
        }

        if let Some(value) = lookup("TETHER_SEND_DELAY") {
            set_duration(&mut self.send_delay, "TETHER_SEND_DELAY", &value);
        }

        if let Some(value) = lookup("TETHER_BURST_LIMIT") {
            match value.parse::<usize>() {
                Ok(limit) => self.burst_limit = limit,
                Err(_) => warn!("Ignoring invalid TETHER_BURST_LIMIT: {}", value),
            }
        }

        if let Some(value) = lookup("TETHER_MAX_SEGMENT_SIZE") {
            match value.parse::<usize>() {
                Ok(size) => self.max_segment_size = size,
                Err(_) => warn!("Ignoring invalid TETHER_MAX_SEGMENT_SIZE: {}", value),
            }
        }
    }
}

fn set_duration(target: &mut Duration, name: &str, value: &str) {
    match humantime::parse_duration(value) {
        Ok(duration) => *target = duration,
        Err(e) => warn!("Ignoring invalid {} {:?}: {}", name, value, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = TetherConfig::default();
        assert!(config.url.is_empty());
        assert!(config.secret.is_none());
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.echo_interval, Duration::from_secs(10));
        assert_eq!(config.send_delay, Duration::from_millis(30));
        assert_eq!(config.burst_limit, 10);
        assert_eq!(config.max_segment_size, 4032);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
tether:
  url: ws://127.0.0.1:8182/sshwifty/socket
  secret: from-file
  dial_timeout: 3s
  echo_interval: 1m
  send_delay: not-a-duration
  burst_limit: 4
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut config = TetherConfig::default();
        let root: RootConfig =
            serde_yaml::from_str(&std::fs::read_to_string(temp_file.path()).unwrap()).unwrap();
        config.apply_file_config(root.tether.unwrap());

        assert_eq!(config.url, "ws://127.0.0.1:8182/sshwifty/socket");
        assert_eq!(config.secret.as_deref(), Some("from-file"));
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.echo_interval, Duration::from_secs(60));
        assert_eq!(config.send_delay, Duration::from_millis(30));
        assert_eq!(config.burst_limit, 4);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = TetherConfig::load_from_file("/nonexistent/tether.yaml").unwrap();
        assert_eq!(config.burst_limit, TetherConfig::default().burst_limit);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TETHER_URL", "ws://example.test/socket"),
            ("TETHER_SECRET", "from-env"),
            ("TETHER_SEND_DELAY", "50ms"),
            ("TETHER_BURST_LIMIT", "many"),
        ]
        .into_iter()
        .collect();

        let mut config = TetherConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.url, "ws://example.test/socket");
        assert_eq!(config.secret.as_deref(), Some("from-env"));
        assert_eq!(config.send_delay, Duration::from_millis(50));
        assert_eq!(config.burst_limit, 10);

        let socket = config.socket_config();
        assert_eq!(socket.url, config.url);
        assert_eq!(socket.send_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_oversized_segment_fails_validation() {
        let env: HashMap<&str, &str> = [("TETHER_MAX_SEGMENT_SIZE", "70000")].into_iter().collect();

        let mut config = TetherConfig::default();
        assert!(config.socket_config().validate().is_ok());

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.max_segment_size, 70000);
        assert!(config.socket_config().validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = TetherConfig {
            secret: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
