/// Alacena - asynchronous memcached client
///
/// One `CacheClient` talks to a fixed set of memcached servers over either the text or
/// the binary protocol:
/// 1. Keyed commands (get/set/delete/counters) are namespaced, routed to one server and
///    pipelined on that server's single connection
/// 2. Administrative commands (stats/version/flush_all) fan out to every server and
///    return one result per server, so an unreachable server never fails the call
///
/// Each server connection is driven by its own task; callers only ever hold
/// completion handles.
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod protocol;
pub mod routing;
pub mod utils;

use std::time::Duration;

pub use client::{Aggregate, CacheClient, StatsAggregate};
pub use config::ConfigError;
pub use core::{ConnectionState, ServerSpec};
pub use error::{AlacenaError, AlacenaResult};
pub use health::{ConnectionEvent, RetryPolicy};
pub use protocol::{Item, ProtocolKind, StoreMode};
pub use routing::{KeyRouter, WeightedHashRouter};

/// Client configuration, fixed once the client is built
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub servers: Vec<ServerSpec>,
    pub protocol: ProtocolKind,
    /// Prepended to every key before routing
    pub namespace: Option<String>,
    pub connect_timeout: Option<Duration>,
    /// Bound on waiting for each reply
    pub operation_timeout: Option<Duration>,
    pub keepalive: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    /// Create a new client configuration with validation
    pub fn new(servers: Vec<ServerSpec>, protocol: ProtocolKind) -> Result<Self, ConfigError> {
        let config = Self {
            servers,
            protocol,
            namespace: None,
            connect_timeout: None,
            operation_timeout: None,
            keepalive: None,
            retry: RetryPolicy::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_keepalive(mut self, idle: Duration) -> Self {
        self.keepalive = Some(idle);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(invalid("At least one server is required"));
        }

        for server in &self.servers {
            if server.host.trim().is_empty() {
                return Err(invalid("Server host cannot be empty"));
            }
            if server.port == 0 {
                return Err(invalid(format!("Server {} has port 0", server)));
            }
            if server.weight == Some(0) {
                return Err(invalid(format!("Server {} must have weight >= 1", server)));
            }
        }

        if let Some(namespace) = &self.namespace {
            if namespace.bytes().any(|b| b <= b' ' || b == 0x7f) {
                return Err(invalid("Namespace cannot contain whitespace or control characters"));
            }
            if namespace.len() >= protocol::MAX_KEY_LENGTH {
                return Err(invalid("Namespace leaves no room for keys"));
            }
        }

        for (name, timeout) in [
            ("connect_timeout", self.connect_timeout),
            ("operation_timeout", self.operation_timeout),
            ("keepalive", self.keepalive),
        ] {
            if timeout == Some(Duration::ZERO) {
                return Err(invalid(format!("{} must be greater than 0", name)));
            }
        }

        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid("Retry max delay must not be less than base delay"));
        }

        Ok(())
    }

    /// Check if the configuration is valid
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

fn invalid<S: Into<String>>(message: S) -> ConfigError {
    ConfigError::ValidationError(message.into())
}
