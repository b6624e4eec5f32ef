/// Configuration management for alacena
use crate::core::ServerSpec;
use crate::health::RetryPolicy;
use crate::protocol::ProtocolKind;
use crate::ClientConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client behaviour
    pub client: ClientSection,
    /// Cache servers
    pub servers: Vec<ServerSpec>,
    /// Reconnect backoff
    pub retry: RetryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Client behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Wire protocol (text, binary)
    pub protocol: ProtocolKind,
    /// Prefix prepended to every key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Connect timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    /// Reply timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout_ms: Option<u64>,
    /// TCP keepalive idle time in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_sec: Option<u64>,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay after the first failed connect, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for the delay, in milliseconds
    pub max_delay_ms: u64,
    /// Randomize delays
    #[serde(default)]
    pub jitter: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientSection {
                protocol: ProtocolKind::Text,
                namespace: None,
                connect_timeout_ms: Some(1000),
                operation_timeout_ms: Some(1000),
                keepalive_sec: Some(60),
            },
            servers: vec![ServerSpec::new("127.0.0.1", crate::core::DEFAULT_PORT)],
            retry: RetryConfig {
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                jitter: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Servers and client settings share the programmatic rules
        self.to_client_config().validate()?;

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry max_delay_ms must not be less than base_delay_ms".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Convert into the client's runtime configuration
    pub fn into_client_config(self) -> Result<ClientConfig, ConfigError> {
        self.validate()?;
        Ok(self.to_client_config())
    }

    fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            servers: self.servers.clone(),
            protocol: self.client.protocol,
            namespace: self.client.namespace.clone(),
            connect_timeout: self.client.connect_timeout_ms.map(Duration::from_millis),
            operation_timeout: self.client.operation_timeout_ms.map(Duration::from_millis),
            keepalive: self.client.keepalive_sec.map(Duration::from_secs),
            retry: RetryPolicy::new(
                Duration::from_millis(self.retry.base_delay_ms),
                Duration::from_millis(self.retry.max_delay_ms),
            )
            .with_jitter(self.retry.jitter),
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, protocol: &str) -> Result<(), ConfigError> {
        let protocol = protocol
            .parse::<ProtocolKind>()
            .map_err(|_| ConfigError::ValidationError("Protocol must be 'text' or 'binary'".to_string()))?;

        let config = Config {
            client: ClientSection {
                protocol,
                namespace: Some("app.".to_string()),
                ..Config::default().client
            },
            servers: vec![
                ServerSpec::new("10.0.1.10", 11211),
                ServerSpec::new("10.0.1.11", 11211),
                ServerSpec::new("10.0.1.12", 11211).with_weight(2),
            ],
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
