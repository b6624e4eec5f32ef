/// Unified error handling for the alacena client
///
/// Every asynchronous operation resolves to an `AlacenaResult`. Connection-scoped
/// failures (connect, I/O, timeout, protocol) carry the server they belong to so a
/// fan-out caller can attribute them; capability and key errors are raised before any
/// network I/O happens.

use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for alacena operations
#[derive(Debug, Clone, Error)]
pub enum AlacenaError {
    /// Socket, DNS or refused connection while establishing a connection
    #[error("failed to connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    /// Read or write failure on an established connection
    #[error("I/O error on {server}: {reason}")]
    Io { server: String, reason: String },

    /// Malformed or unexpected response bytes; the connection is torn down
    #[error("protocol error on {server}: {message}")]
    Protocol { server: String, message: String },

    /// Connect attempt or pending command exceeded its deadline
    #[error("{operation} timed out on {server}")]
    Timeout { server: String, operation: String },

    /// The active wire protocol cannot express this operation
    #[error("{operation} is not supported by the {protocol} protocol")]
    Unsupported { operation: String, protocol: String },

    /// The server answered with ERROR, CLIENT_ERROR or SERVER_ERROR
    #[error("server error: {message}")]
    Server { message: String },

    /// Key rejected before it reached the wire
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    /// No servers are configured
    #[error("no servers configured")]
    NoServers,

    /// Server is not part of the configured server list
    #[error("unknown server: {server}")]
    UnknownServer { server: String },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Completion was dropped without being resolved (connection task gone)
    #[error("connection closed before the operation completed")]
    Closed,
}

/// Result type alias for alacena operations
pub type AlacenaResult<T> = Result<T, AlacenaError>;

impl AlacenaError {
    /// Create a connect error
    pub fn connect<S: fmt::Display, R: fmt::Display>(server: S, reason: R) -> Self {
        AlacenaError::Connect {
            server: server.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create an I/O error
    pub fn io<S: fmt::Display>(server: S, err: &io::Error) -> Self {
        AlacenaError::Io {
            server: server.to_string(),
            reason: err.to_string(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: fmt::Display, M: Into<String>>(server: S, message: M) -> Self {
        AlacenaError::Protocol {
            server: server.to_string(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: fmt::Display, O: Into<String>>(server: S, operation: O) -> Self {
        AlacenaError::Timeout {
            server: server.to_string(),
            operation: operation.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported<O: Into<String>, P: fmt::Display>(operation: O, protocol: P) -> Self {
        AlacenaError::Unsupported {
            operation: operation.into(),
            protocol: protocol.to_string(),
        }
    }

    /// Create a server-reported error
    pub fn server<S: Into<String>>(message: S) -> Self {
        AlacenaError::Server {
            message: message.into(),
        }
    }

    /// Create an invalid key error
    pub fn invalid_key<S: Into<String>>(reason: S) -> Self {
        AlacenaError::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Check if this error is scoped to a single server's connection
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            AlacenaError::Connect { .. }
                | AlacenaError::Io { .. }
                | AlacenaError::Protocol { .. }
                | AlacenaError::Timeout { .. }
                | AlacenaError::Closed
        )
    }

    /// Check if this error is recoverable (a later attempt may succeed)
    pub fn is_recoverable(&self) -> bool {
        match self {
            AlacenaError::Connect { .. } => true,
            AlacenaError::Io { .. } => true,
            AlacenaError::Protocol { .. } => true,
            AlacenaError::Timeout { .. } => true,
            AlacenaError::Closed => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AlacenaError::Config(_) => ErrorSeverity::Critical,
            AlacenaError::NoServers => ErrorSeverity::Critical,
            AlacenaError::Connect { .. } => ErrorSeverity::Warning,
            AlacenaError::Io { .. } => ErrorSeverity::Warning,
            AlacenaError::Timeout { .. } => ErrorSeverity::Warning,
            AlacenaError::Closed => ErrorSeverity::Warning,
            AlacenaError::InvalidKey { .. } => ErrorSeverity::Info,
            AlacenaError::Unsupported { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = AlacenaError::connect("10.0.0.1:11211", "Connection refused");
        assert!(matches!(error, AlacenaError::Connect { .. }));
        assert_eq!(
            error.to_string(),
            "failed to connect to 10.0.0.1:11211: Connection refused"
        );
    }

    #[test]
    fn test_unsupported_message() {
        let error = AlacenaError::unsupported("stats", "binary");
        assert_eq!(
            error.to_string(),
            "stats is not supported by the binary protocol"
        );
        assert!(!error.is_connection_failure());
    }

    #[test]
    fn test_error_severity() {
        let config_error = AlacenaError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let io_error = AlacenaError::io(
            "127.0.0.1:11211",
            &io::Error::new(io::ErrorKind::BrokenPipe, "test"),
        );
        assert_eq!(io_error.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_error_recoverability() {
        let timeout = AlacenaError::timeout("127.0.0.1:11211", "get");
        assert!(timeout.is_recoverable());
        assert!(timeout.is_connection_failure());

        let key_error = AlacenaError::invalid_key("contains whitespace");
        assert!(!key_error.is_recoverable());
    }
}
