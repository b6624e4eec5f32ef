/// Server health: reconnect backoff and connection diagnostics
///
/// A server whose connection fails is not removed from the pool. It stays listed as
/// `Failed` and the `RetryPolicy` decides when the next connection attempt may start.
/// Every lifecycle transition worth reporting is published as a `ConnectionEvent`,
/// both to `tracing` and to any subscribers of the client's event channel.
use crate::core::ServerSpec;
use rand::Rng;
use std::fmt;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;

/// Capacity of the diagnostic event channel; slow subscribers lose the oldest events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bounded exponential backoff between connection attempts to one server
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Ceiling for the doubled delay
    pub max_delay: Duration,
    /// Randomize each delay within [delay/2, delay]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before the next attempt after `consecutive_failures` failed attempts.
    ///
    /// Zero failures (a connection that was up and then dropped) means no wait.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let low = delay / 2;
            let spread = (delay - low).as_millis() as u64;
            low + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
        } else {
            delay
        }
    }

    /// Whether a server that failed at `failed_at` may be retried now
    pub fn is_due(&self, failed_at: SystemTime, delay: Duration, now: SystemTime) -> bool {
        match now.duration_since(failed_at) {
            Ok(elapsed) => elapsed >= delay,
            // clock went backwards; do not lock the server out
            Err(_) => true,
        }
    }
}

/// Diagnostic side channel for connection lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected { server: ServerSpec },
    /// One per failed connection attempt, regardless of how many commands waited on it
    ConnectFailed { server: ServerSpec, reason: String },
    /// An established connection broke (I/O, protocol violation or timeout)
    ConnectionLost { server: ServerSpec, reason: String },
}

impl ConnectionEvent {
    pub fn server(&self) -> &ServerSpec {
        match self {
            ConnectionEvent::Connected { server }
            | ConnectionEvent::ConnectFailed { server, .. }
            | ConnectionEvent::ConnectionLost { server, .. } => server,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, ConnectionEvent::Connected { .. })
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected { server } => write!(f, "connected to {}", server),
            ConnectionEvent::ConnectFailed { server, reason } => {
                write!(f, "failed to connect to {}: {}", server, reason)
            }
            ConnectionEvent::ConnectionLost { server, reason } => {
                write!(f, "lost connection to {}: {}", server, reason)
            }
        }
    }
}

/// Fan-out of connection events to tracing and to subscribers
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Connected { server } => {
                tracing::debug!(server = %server, "connection established");
            }
            ConnectionEvent::ConnectFailed { server, reason } => {
                tracing::warn!(server = %server, reason = %reason, "failed to connect to {}", server);
            }
            ConnectionEvent::ConnectionLost { server, reason } => {
                tracing::warn!(server = %server, reason = %reason, "connection to {} lost", server);
            }
        }
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
