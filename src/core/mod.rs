/// Core abstractions shared by the connection layer and the dispatcher
pub mod completion;
pub mod connection;
pub mod pool;

use crate::error::AlacenaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::SystemTime;

/// Default memcached port
pub const DEFAULT_PORT: u16 = 11211;

/// Identifies one cache server.
///
/// Equality and hashing only consider `host:port`; the weight is a routing hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl ServerSpec {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Routing weight, defaulting to 1
    pub fn weight(&self) -> u32 {
        self.weight.unwrap_or(1).max(1)
    }

    /// `host:port` form suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl PartialEq for ServerSpec {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for ServerSpec {}

impl Hash for ServerSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerSpec {
    type Err = AlacenaError;

    /// Parses `host`, `host:port` or `[v6addr]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AlacenaError::UnknownServer {
                server: s.to_string(),
            });
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                let port = port.parse::<u16>().map_err(|_| AlacenaError::UnknownServer {
                    server: s.to_string(),
                })?;
                (host.trim_start_matches('[').trim_end_matches(']'), port)
            }
            _ => (s, DEFAULT_PORT),
        };

        if host.is_empty() || port == 0 {
            return Err(AlacenaError::UnknownServer {
                server: s.to_string(),
            });
        }
        Ok(ServerSpec::new(host, port))
    }
}

/// Lifecycle of a single server connection
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Ready,
    /// Sticky until the pool starts a fresh attempt
    Failed {
        error: AlacenaError,
        at: SystemTime,
    },
}

impl ConnectionState {
    pub fn failed(error: AlacenaError) -> Self {
        ConnectionState::Failed {
            error,
            at: SystemTime::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unconnected => write!(f, "Unconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Ready => write!(f, "Ready"),
            ConnectionState::Failed { error, .. } => write!(f, "Failed: {}", error),
        }
    }
}
