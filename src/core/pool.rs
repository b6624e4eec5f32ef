/// Connection pool: at most one live connection per configured server
use crate::core::connection::{ConnectionSettings, ServerConnection};
use crate::core::{ConnectionState, ServerSpec};
use crate::error::{AlacenaError, AlacenaResult};
use crate::health::{EventSink, RetryPolicy};
use crate::protocol::Codec;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::debug;

/// A server's current connection plus the backoff computed for it once it failed
struct Slot {
    connection: ServerConnection,
    retry_delay: Option<Duration>,
}

impl Slot {
    fn new(connection: ServerConnection) -> Self {
        Self {
            connection,
            retry_delay: None,
        }
    }

    /// Consecutive failed attempts, counting this connection if it never came up
    fn failures(&self) -> u32 {
        if self.connection.reached_ready() {
            0
        } else {
            self.connection.prior_failures().saturating_add(1)
        }
    }

    /// Backoff for this failed connection, fixed at first observation so jitter is stable
    fn retry_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let failures = self.failures();
        *self
            .retry_delay
            .get_or_insert_with(|| policy.delay_for(failures))
    }
}

/// Lazily creates and caches one `ServerConnection` per server
pub struct ConnectionPool {
    servers: Vec<ServerSpec>,
    codec: Codec,
    settings: ConnectionSettings,
    retry: RetryPolicy,
    events: EventSink,
    slots: Mutex<HashMap<ServerSpec, Slot>>,
}

impl ConnectionPool {
    pub fn new(
        servers: Vec<ServerSpec>,
        codec: Codec,
        settings: ConnectionSettings,
        retry: RetryPolicy,
        events: EventSink,
    ) -> Self {
        Self {
            servers,
            codec,
            settings,
            retry,
            events,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Configured servers, in configuration order
    pub fn servers(&self) -> &[ServerSpec] {
        &self.servers
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Connection for `server`, starting one if none exists.
    ///
    /// Ready and Connecting connections are returned as-is. A failed connection is
    /// replaced by a fresh attempt once its backoff has elapsed; until then it is
    /// returned unchanged and rejects submissions with its stored error.
    pub async fn get_or_connect(&self, server: &ServerSpec) -> AlacenaResult<ServerConnection> {
        if !self.servers.contains(server) {
            return Err(AlacenaError::UnknownServer {
                server: server.to_string(),
            });
        }

        let mut slots = self.slots.lock().await;
        let replace_with = match slots.get_mut(server) {
            None => Some(0),
            Some(slot) => match slot.connection.state() {
                ConnectionState::Failed { at, .. } => {
                    let delay = slot.retry_delay(&self.retry);
                    if self.retry.is_due(at, delay, SystemTime::now()) {
                        Some(slot.failures())
                    } else {
                        None
                    }
                }
                // closed explicitly; start over
                ConnectionState::Unconnected => Some(0),
                ConnectionState::Connecting | ConnectionState::Ready => None,
            },
        };

        if let Some(prior_failures) = replace_with {
            debug!(server = %server, prior_failures, "opening connection");
            let connection = ServerConnection::connect(
                server.clone(),
                self.codec,
                self.settings.clone(),
                self.events.clone(),
                prior_failures,
            );
            slots.insert(server.clone(), Slot::new(connection));
        }

        slots
            .get(server)
            .map(|slot| slot.connection.clone())
            .ok_or(AlacenaError::Closed)
    }

    /// Servers eligible for key routing: everything not inside a backoff window.
    ///
    /// Falls back to the full list when every server is backing off.
    pub async fn routable_servers(&self) -> Vec<ServerSpec> {
        let mut slots = self.slots.lock().await;
        let now = SystemTime::now();
        let available: Vec<ServerSpec> = self
            .servers
            .iter()
            .filter(|server| match slots.get_mut(*server) {
                Some(slot) => match slot.connection.state() {
                    ConnectionState::Failed { at, .. } => {
                        let delay = slot.retry_delay(&self.retry);
                        self.retry.is_due(at, delay, now)
                    }
                    _ => true,
                },
                None => true,
            })
            .cloned()
            .collect();

        if available.is_empty() {
            self.servers.clone()
        } else {
            available
        }
    }

    /// Snapshot of every configured server's connection state
    pub async fn server_states(&self) -> Vec<(ServerSpec, ConnectionState)> {
        let slots = self.slots.lock().await;
        self.servers
            .iter()
            .map(|server| {
                let state = slots
                    .get(server)
                    .map(|slot| slot.connection.state())
                    .unwrap_or(ConnectionState::Unconnected);
                (server.clone(), state)
            })
            .collect()
    }

    /// Close every connection; later requests reconnect lazily
    pub async fn close_all(&self) {
        let mut slots = self.slots.lock().await;
        for (_, slot) in slots.drain() {
            slot.connection.close();
        }
    }
}
