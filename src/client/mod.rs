/// Command dispatcher: the public operation surface of the cache client
///
/// Every keyed operation goes through the same steps: prefix the key with the
/// namespace, validate it, route it among the servers that are not backing off,
/// check that the active protocol can express the command, then submit it to that
/// server's connection. Nothing touches the network until all of that succeeded.
pub mod fanout;

use crate::core::connection::{ConnectionSettings, ServerConnection};
use crate::core::pool::ConnectionPool;
use crate::core::{ConnectionState, ServerSpec};
use crate::error::{AlacenaError, AlacenaResult};
use crate::health::{ConnectionEvent, EventSink};
use crate::protocol::{Codec, Command, CommandKind, CounterOp, Item, ProtocolKind, Reply, StoreMode};
use crate::routing::{KeyRouter, WeightedHashRouter};
use crate::utils::{validate_key, Namespace};
use crate::ClientConfig;
use bytes::Bytes;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub use fanout::{Aggregate, BatchState, StatsAggregate};

/// Memcached treats expirations beyond 30 days as absolute unix time
const MAX_RELATIVE_TTL: u64 = 60 * 60 * 24 * 30;

struct Inner {
    pool: ConnectionPool,
    router: Box<dyn KeyRouter>,
    namespace: Namespace,
}

/// Asynchronous memcached client.
///
/// Cloning is cheap; clones share connections.
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("servers", &self.inner.pool.servers())
            .field("protocol", &self.protocol())
            .field("namespace", &self.inner.namespace)
            .finish()
    }
}

impl CacheClient {
    /// Build a client using weighted hash routing
    pub fn new(config: ClientConfig) -> AlacenaResult<Self> {
        Self::with_router(config, WeightedHashRouter)
    }

    /// Build a client with a custom key router
    pub fn with_router<R>(config: ClientConfig, router: R) -> AlacenaResult<Self>
    where
        R: KeyRouter + 'static,
    {
        config.validate()?;
        if config.servers.is_empty() {
            return Err(AlacenaError::NoServers);
        }

        let settings = ConnectionSettings {
            connect_timeout: config.connect_timeout,
            operation_timeout: config.operation_timeout,
            keepalive: config.keepalive,
        };
        let pool = ConnectionPool::new(
            config.servers,
            Codec::new(config.protocol),
            settings,
            config.retry,
            EventSink::new(),
        );
        let namespace = config.namespace.map(Namespace::new).unwrap_or_default();

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                router: Box::new(router),
                namespace,
            }),
        })
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.inner.pool.codec().kind()
    }

    pub fn servers(&self) -> &[ServerSpec] {
        self.inner.pool.servers()
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.pool.events().subscribe()
    }

    /// Current connection state of every configured server
    pub async fn server_states(&self) -> Vec<(ServerSpec, ConnectionState)> {
        self.inner.pool.server_states().await
    }

    /// Value stored under `key`, `None` on a miss
    pub async fn get<K: AsRef<[u8]>>(&self, key: K) -> AlacenaResult<Option<Bytes>> {
        Ok(self.get_item(key).await?.map(|item| item.value))
    }

    /// Value together with its flags and CAS unique
    pub async fn get_item<K: AsRef<[u8]>>(&self, key: K) -> AlacenaResult<Option<Item>> {
        let key = self.wire_key(key.as_ref())?;
        match self.execute(Command::Get { key }).await? {
            Reply::Item(item) => Ok(item),
            other => Err(unexpected(CommandKind::Get, &other)),
        }
    }

    /// Store unconditionally
    pub async fn set<K, V>(&self, key: K, value: V, ttl: Option<Duration>) -> AlacenaResult<bool>
    where
        K: AsRef<[u8]>,
        V: Into<Bytes>,
    {
        self.store(StoreMode::Set, key, value, 0, ttl).await
    }

    /// Store only if the key is absent
    pub async fn add<K, V>(&self, key: K, value: V, ttl: Option<Duration>) -> AlacenaResult<bool>
    where
        K: AsRef<[u8]>,
        V: Into<Bytes>,
    {
        self.store(StoreMode::Add, key, value, 0, ttl).await
    }

    /// Store only if the key is present
    pub async fn replace<K, V>(&self, key: K, value: V, ttl: Option<Duration>) -> AlacenaResult<bool>
    where
        K: AsRef<[u8]>,
        V: Into<Bytes>,
    {
        self.store(StoreMode::Replace, key, value, 0, ttl).await
    }

    pub async fn append<K, V>(&self, key: K, value: V) -> AlacenaResult<bool>
    where
        K: AsRef<[u8]>,
        V: Into<Bytes>,
    {
        self.store(StoreMode::Append, key, value, 0, None).await
    }

    pub async fn prepend<K, V>(&self, key: K, value: V) -> AlacenaResult<bool>
    where
        K: AsRef<[u8]>,
        V: Into<Bytes>,
    {
        self.store(StoreMode::Prepend, key, value, 0, None).await
    }

    /// Any storage command with explicit flags.
    ///
    /// Resolves `false` when the server declined to store (add on an existing key,
    /// replace or append on a missing one).
    pub async fn store<K, V>(
        &self,
        mode: StoreMode,
        key: K,
        value: V,
        flags: u32,
        ttl: Option<Duration>,
    ) -> AlacenaResult<bool>
    where
        K: AsRef<[u8]>,
        V: Into<Bytes>,
    {
        let key = self.wire_key(key.as_ref())?;
        let command = Command::Store {
            mode,
            key,
            value: value.into(),
            flags,
            ttl: ttl_to_wire(ttl, SystemTime::now()),
        };
        match self.execute(command).await? {
            Reply::Stored(stored) => Ok(stored),
            other => Err(unexpected(CommandKind::Store, &other)),
        }
    }

    /// Remove `key`; `false` when it was not there
    pub async fn delete<K: AsRef<[u8]>>(&self, key: K) -> AlacenaResult<bool> {
        let key = self.wire_key(key.as_ref())?;
        match self.execute(Command::Delete { key }).await? {
            Reply::Deleted(deleted) => Ok(deleted),
            other => Err(unexpected(CommandKind::Delete, &other)),
        }
    }

    /// Increment a counter; `None` when the key is absent
    pub async fn incr<K: AsRef<[u8]>>(&self, key: K, delta: u64) -> AlacenaResult<Option<u64>> {
        self.counter(CounterOp::Incr, key.as_ref(), delta).await
    }

    /// Decrement a counter, saturating at zero on the server
    pub async fn decr<K: AsRef<[u8]>>(&self, key: K, delta: u64) -> AlacenaResult<Option<u64>> {
        self.counter(CounterOp::Decr, key.as_ref(), delta).await
    }

    async fn counter(&self, op: CounterOp, key: &[u8], delta: u64) -> AlacenaResult<Option<u64>> {
        let key = self.wire_key(key)?;
        match self.execute(Command::Counter { op, key, delta }).await? {
            Reply::Counter(value) => Ok(value),
            other => Err(unexpected(CommandKind::Counter, &other)),
        }
    }

    /// Fetch several keys at once.
    ///
    /// Keys are grouped by server and each group is pipelined on its connection.
    /// Misses are absent from the result; so are keys whose server failed, which is
    /// logged rather than failing the whole call.
    pub async fn get_multi<I, K>(&self, keys: I) -> AlacenaResult<HashMap<Bytes, Item>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let wire_keys = keys
            .into_iter()
            .map(|key| self.wire_key(key.as_ref()))
            .collect::<AlacenaResult<Vec<Bytes>>>()?;
        if wire_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let candidates = self.inner.pool.routable_servers().await;
        let mut groups: HashMap<ServerSpec, Vec<Bytes>> = HashMap::new();
        for key in wire_keys {
            let server = self
                .inner
                .router
                .route(&key, &candidates)
                .ok_or(AlacenaError::NoServers)?;
            groups.entry(server.clone()).or_default().push(key);
        }

        let lookups = groups.into_iter().map(|(server, keys)| async move {
            let connection = match self.inner.pool.get_or_connect(&server).await {
                Ok(connection) => connection,
                Err(e) => {
                    let failed = keys.into_iter().map(|k| (k, Err(e.clone()))).collect::<Vec<_>>();
                    return (server, failed);
                }
            };
            let handles: Vec<_> = keys
                .iter()
                .map(|key| connection.submit(&Command::Get { key: key.clone() }))
                .collect();
            let replies = join_all(handles).await;
            let outcomes: Vec<(Bytes, AlacenaResult<Reply>)> = keys.into_iter().zip(replies).collect();
            (server, outcomes)
        });

        let mut found = HashMap::new();
        for (server, outcomes) in join_all(lookups).await {
            for (wire_key, outcome) in outcomes {
                match outcome {
                    Ok(Reply::Item(Some(item))) => {
                        let key = Bytes::copy_from_slice(self.inner.namespace.strip(&wire_key));
                        found.insert(key, item);
                    }
                    Ok(Reply::Item(None)) => {}
                    Ok(other) => warn!(server = %server, "unexpected reply to get: {:?}", other),
                    Err(e) => warn!(server = %server, key = ?wire_key, "get failed: {}", e),
                }
            }
        }
        Ok(found)
    }

    /// Statistics from every server.
    ///
    /// Unreachable servers get an error entry; the call itself only fails when the
    /// protocol has no stats command.
    pub async fn stats(&self) -> AlacenaResult<StatsAggregate> {
        self.stats_group(None).await
    }

    /// Statistics of one group (`slabs`, `items`, ...) from every server
    pub async fn stats_group(&self, group: Option<&str>) -> AlacenaResult<StatsAggregate> {
        self.check_capability(CommandKind::Stats)?;
        let command = Command::Stats {
            group: group.map(str::to_string),
        };
        fanout::fan_out(&self.inner.pool, command, |reply| match reply {
            Reply::Stats(stats) => Ok(stats),
            other => Err(unexpected(CommandKind::Stats, &other)),
        })
        .await
    }

    /// Version string of every server
    pub async fn version(&self) -> AlacenaResult<Aggregate<String>> {
        self.check_capability(CommandKind::Version)?;
        fanout::fan_out(&self.inner.pool, Command::Version, |reply| match reply {
            Reply::Version(version) => Ok(version),
            other => Err(unexpected(CommandKind::Version, &other)),
        })
        .await
    }

    /// Invalidate every item on every server
    pub async fn flush_all(&self) -> AlacenaResult<Aggregate<bool>> {
        self.check_capability(CommandKind::FlushAll)?;
        fanout::fan_out(&self.inner.pool, Command::FlushAll, |reply| match reply {
            Reply::Ok => Ok(true),
            other => Err(unexpected(CommandKind::FlushAll, &other)),
        })
        .await
    }

    /// Close every connection; the client reconnects lazily on the next request
    pub async fn close(&self) {
        self.inner.pool.close_all().await;
    }

    /// Namespaced and validated key
    fn wire_key(&self, key: &[u8]) -> AlacenaResult<Bytes> {
        let key = self.inner.namespace.apply(key);
        validate_key(&key)?;
        Ok(key)
    }

    fn check_capability(&self, kind: CommandKind) -> AlacenaResult<()> {
        let codec = self.inner.pool.codec();
        if codec.supports(kind) {
            Ok(())
        } else {
            Err(AlacenaError::unsupported(kind.to_string(), codec.kind()))
        }
    }

    /// Route a keyed command to its server and wait for the reply
    async fn execute(&self, command: Command) -> AlacenaResult<Reply> {
        self.check_capability(command.kind())?;
        let connection = self.connection_for(&command).await?;
        debug!(server = %connection.server(), command = %command.kind(), "dispatching");
        connection.submit(&command).await
    }

    async fn connection_for(&self, command: &Command) -> AlacenaResult<ServerConnection> {
        let key = command
            .key()
            .ok_or_else(|| AlacenaError::invalid_key("command carries no key"))?;
        let candidates = self.inner.pool.routable_servers().await;
        let server = self
            .inner
            .router
            .route(key, &candidates)
            .ok_or(AlacenaError::NoServers)?;
        self.inner.pool.get_or_connect(server).await
    }
}

fn unexpected(kind: CommandKind, reply: &Reply) -> AlacenaError {
    AlacenaError::protocol("client", format!("unexpected reply to {}: {:?}", kind, reply))
}

/// Wire expiration for an optional TTL.
///
/// Sub-second TTLs round up to one second so they never mean "no expiry".
fn ttl_to_wire(ttl: Option<Duration>, now: SystemTime) -> u32 {
    let Some(ttl) = ttl else {
        return 0;
    };
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    if secs <= MAX_RELATIVE_TTL {
        return secs as u32;
    }
    let epoch = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u32::try_from(epoch.saturating_add(secs)).unwrap_or(u32::MAX)
}
