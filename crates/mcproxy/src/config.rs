use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use message_sanitizer::SanitizationConfig;
use rate_guard::RateLimitConfig;
use secret_vault::{DetectorConfig, VaultConfig};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub sanitization: SanitizationConfig,
    #[serde(default)]
    pub api_key_protection: ApiKeyProtection,
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_upstream")]
    pub mcp_server_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_initial_delay_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_max_attempts: u32,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mcp_server_url: default_upstream(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            max_queue_size: default_max_queue_size(),
            connection_timeout_secs: default_connection_timeout(),
            auto_reconnect: default_true(),
            reconnect_initial_delay_secs: default_reconnect_delay(),
            reconnect_max_attempts: default_reconnect_attempts(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyProtection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub detection: DetectorConfig,
    #[serde(default)]
    pub storage: VaultConfig,
}

impl Default for ApiKeyProtection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            detection: DetectorConfig::default(),
            storage: VaultConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_event_log_path")]
    pub event_log_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            event_log_path: default_event_log_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_upstream() -> String {
    "ws://127.0.0.1:3000".to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_max_queue_size() -> usize {
    100
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    1
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_log_path() -> PathBuf {
    PathBuf::from("events.jsonl")
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted, so the proxy can start with sensible defaults before
/// any config has been written.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}

impl Config {
    /// The listen address assembled from `proxy.host` and `proxy.port`.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.proxy.host, self.proxy.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid proxy.host/proxy.port: {e}"))
    }

    /// The coordinator settings derived from this configuration.
    pub fn proxy_config(&self) -> anyhow::Result<ws_proxy::ProxyConfig> {
        Ok(ws_proxy::ProxyConfig {
            listen_addr: self.listen_addr()?,
            mcp_server_url: self.proxy.mcp_server_url.clone(),
            max_connections: self.proxy.max_connections,
            max_message_size: self.proxy.max_message_size,
            max_queue_size: self.proxy.max_queue_size,
            connection_timeout: Duration::from_secs(self.proxy.connection_timeout_secs),
            auto_reconnect: self.proxy.auto_reconnect,
            reconnect_initial_delay: Duration::from_secs(self.proxy.reconnect_initial_delay_secs),
            reconnect_max_attempts: self.proxy.reconnect_max_attempts,
            secret_protection: self.api_key_protection.enabled,
            strict_mode: self.sanitization.strict_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config: Config = serde_yml::from_str("{}").unwrap();
        assert_eq!(config.proxy.port, 8765);
        assert_eq!(config.proxy.max_connections, 100);
        assert_eq!(config.proxy.max_queue_size, 100);
        assert!(config.proxy.auto_reconnect);
        assert!(!config.sanitization.strict_mode);
        assert!(config.api_key_protection.enabled);
        assert_eq!(config.api_key_protection.storage.max_keys_per_connection, 100);
        assert!(config.rate_limiting.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn full_yaml_round_trips() {
        let yaml = r#"
proxy:
  host: "0.0.0.0"
  port: 9100
  mcp_server_url: "ws://10.0.0.5:4000"
  max_connections: 8
  max_queue_size: 16
  connection_timeout_secs: 3
  auto_reconnect: false
sanitization:
  strict_mode: true
  ansi_escapes:
    enabled: true
    action: encode
  character_whitelist:
    enabled: true
    allowed_ranges: [[9, 9], [32, 126]]
    blacklist: [27, 127]
  patterns:
    enabled: true
    rules:
      - name: block_everything_fishy
        pattern: "fishy"
        action: reject
        severity: high
api_key_protection:
  enabled: true
  detection:
    minimum_key_length: 24
  storage:
    encryption: true
    ttl: 600
    max_keys_per_connection: 10
rate_limiting:
  enabled: true
  global:
    requests_per_minute: 100
    requests_per_hour: 2000
  per_client:
    requests_per_minute: 10
    requests_per_hour: 200
  per_method:
    tools/call:
      requests_per_minute: 5
      requests_per_hour: 50
logging:
  level: debug
  event_log_path: /tmp/mcproxy-events.jsonl
"#;
        let config: Config = serde_yml::from_str(yaml).unwrap();

        assert_eq!(config.proxy.port, 9100);
        assert_eq!(config.proxy.mcp_server_url, "ws://10.0.0.5:4000");
        assert!(!config.proxy.auto_reconnect);
        assert!(config.sanitization.strict_mode);
        assert_eq!(config.sanitization.patterns.rules.len(), 1);
        assert_eq!(
            config.sanitization.character_whitelist.allowed_ranges,
            vec![(9, 9), (32, 126)]
        );
        assert_eq!(config.api_key_protection.detection.minimum_key_length, 24);
        assert_eq!(config.api_key_protection.storage.ttl_secs, 600);
        assert_eq!(config.api_key_protection.storage.max_keys_per_connection, 10);
        assert_eq!(config.rate_limiting.per_client.requests_per_minute, 10);
        assert!(config.rate_limiting.per_method.contains_key("tools/call"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn listen_addr_is_assembled_from_host_and_port() {
        let config = Config::default();
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:8765");
    }

    #[test]
    fn proxy_config_carries_strict_and_secret_flags() {
        let yaml = r#"
sanitization:
  strict_mode: true
api_key_protection:
  enabled: false
"#;
        let config: Config = serde_yml::from_str(yaml).unwrap();
        let proxy = config.proxy_config().unwrap();
        assert!(proxy.strict_mode);
        assert!(!proxy.secret_protection);
        assert_eq!(proxy.connection_timeout, Duration::from_secs(10));
    }
}
