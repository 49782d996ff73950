//! Configuration management

use crate::{Error, DEFAULT_BROKER_PORT, DEFAULT_MAX_BODY_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker configuration
    pub broker: Option<BrokerConfig>,
    /// Client agent configuration
    pub client: Option<ClientConfig>,
    /// Upstream agent configuration
    pub upstream: Option<UpstreamConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker identity
    pub id: String,
    /// Listen address for agent connections
    pub listen: String,
    /// Relayed request TTL in milliseconds
    pub request_ttl_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            id: "broker".to_string(),
            listen: format!("0.0.0.0:{}", DEFAULT_BROKER_PORT),
            request_ttl_ms: 10_000,
        }
    }
}

impl BrokerConfig {
    pub fn request_ttl(&self) -> Duration {
        Duration::from_millis(self.request_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        require("broker", "id", &self.id)?;
        require("broker", "listen", &self.listen)?;
        require_ttl("broker", self.request_ttl_ms)
    }
}

/// Client agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Registration id
    pub id: String,
    /// HTTP listen address
    pub listen: String,
    /// Broker address
    pub broker: String,
    /// Upstream agent every request is routed to
    pub upstream_target: String,
    /// Pending request TTL in milliseconds
    pub request_ttl_ms: u64,
    /// Listen address for tunneled stream connections (disabled when unset)
    pub stream_listen: Option<String>,
    /// Largest request body relayed, in bytes
    pub max_body_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            listen: "127.0.0.1:8080".to_string(),
            broker: format!("127.0.0.1:{}", DEFAULT_BROKER_PORT),
            upstream_target: String::new(),
            request_ttl_ms: 10_000,
            stream_listen: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn request_ttl(&self) -> Duration {
        Duration::from_millis(self.request_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        require("client", "id", &self.id)?;
        require("client", "listen", &self.listen)?;
        require("client", "broker", &self.broker)?;
        require("client", "upstream_target", &self.upstream_target)?;
        require_ttl("client", self.request_ttl_ms)
    }
}

/// Upstream agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Registration id, the name clients target
    pub id: String,
    /// Broker address
    pub broker: String,
    /// Base URL of the private server
    pub target_address: String,
    /// In-flight call TTL in milliseconds
    pub request_ttl_ms: u64,
    /// Address tunneled stream connections are opened to (disabled when unset)
    pub stream_peer: Option<String>,
    /// Largest response body relayed, in bytes
    pub max_body_size: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            broker: format!("127.0.0.1:{}", DEFAULT_BROKER_PORT),
            target_address: String::new(),
            request_ttl_ms: 30_000,
            stream_peer: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl UpstreamConfig {
    pub fn request_ttl(&self) -> Duration {
        Duration::from_millis(self.request_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        require("upstream", "id", &self.id)?;
        require("upstream", "broker", &self.broker)?;
        require("upstream", "target_address", &self.target_address)?;
        require_ttl("upstream", self.request_ttl_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn require(section: &str, field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("[{}] {} is required", section, field)));
    }
    Ok(())
}

fn require_ttl(section: &str, ttl_ms: u64) -> Result<(), Error> {
    if ttl_ms == 0 {
        return Err(Error::Config(format!("[{}] request_ttl_ms must be positive", section)));
    }
    Ok(())
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        broker: Some(BrokerConfig::default()),
        client: Some(ClientConfig {
            id: "client123".to_string(),
            upstream_target: "upstream123".to_string(),
            ..ClientConfig::default()
        }),
        upstream: Some(UpstreamConfig {
            id: "upstream123".to_string(),
            target_address: "http://127.0.0.1:3000".to_string(),
            ..UpstreamConfig::default()
        }),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_are_optional() {
        let config = Config::parse(
            r#"
            [client]
            id = "client123"
            upstream_target = "upstream123"
            "#,
        )
        .unwrap();

        assert!(config.broker.is_none());
        assert!(config.upstream.is_none());
        let client = config.client.unwrap();
        assert_eq!(client.request_ttl(), Duration::from_secs(10));
        assert_eq!(client.max_body_size, DEFAULT_MAX_BODY_SIZE);
        assert!(client.stream_listen.is_none());
        client.validate().unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_upstream_defaults_to_longer_ttl() {
        let config = Config::parse(
            r#"
            [upstream]
            id = "upstream123"
            target_address = "http://localhost:3000"
            stream_peer = "127.0.0.1:4000"
            "#,
        )
        .unwrap();
        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.request_ttl(), Duration::from_secs(30));
        assert_eq!(upstream.stream_peer.as_deref(), Some("127.0.0.1:4000"));
        upstream.validate().unwrap();
    }

    #[test]
    fn test_missing_required_values_are_rejected() {
        let client = ClientConfig {
            id: "client123".to_string(),
            ..ClientConfig::default()
        };
        let err = client.validate().unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("upstream_target")));

        let upstream = UpstreamConfig {
            id: "upstream123".to_string(),
            ..UpstreamConfig::default()
        };
        assert!(upstream.validate().is_err());

        let broker = BrokerConfig {
            request_ttl_ms: 0,
            ..BrokerConfig::default()
        };
        assert!(broker.validate().is_err());
    }

    #[test]
    fn test_example_config_survives_save_and_load() {
        let path = std::env::temp_dir().join(format!("tunnel-broker-{}.toml", std::process::id()));
        let example = generate_example_config();
        example.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.client.unwrap().upstream_target, "upstream123");
        assert_eq!(loaded.upstream.unwrap().target_address, "http://127.0.0.1:3000");
        assert_eq!(loaded.broker.unwrap().request_ttl_ms, 10_000);
    }

    #[test]
    fn test_unparseable_config() {
        assert!(matches!(Config::parse("[client"), Err(Error::Config(_))));
    }
}
