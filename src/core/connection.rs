/// Per-server connection engine
///
/// A `ServerConnection` is a cheap, cloneable handle to a task that owns one socket to
/// one memcached server. Commands are encoded by the submitter, handed to the task over
/// a channel and parked in the task's pending queue until the matching reply arrives.
/// The task is the only writer of that queue.
///
/// Failure handling:
/// - connect failure: one `ConnectFailed` event, every queued command fails
/// - I/O error, EOF or protocol violation: one `ConnectionLost` event, every in-flight
///   and queued command fails, the state becomes `Failed`
/// - reply timeout: the text protocol cannot resynchronize, so the connection is torn
///   down; the binary protocol drops only the expired request
use crate::core::completion::{completion, Completer, CompletionHandle};
use crate::core::{ConnectionState, ServerSpec};
use crate::error::{AlacenaError, AlacenaResult};
use crate::health::{ConnectionEvent, EventSink};
use crate::protocol::{Codec, Command, CommandKind, Discipline, Frame, ProtocolError, Reply};
use bytes::{Bytes, BytesMut};
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Late binary replies remembered after their request timed out
const MAX_EXPIRED_TOKENS: usize = 4096;

/// Socket and deadline settings shared by every connection of a client
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSettings {
    /// Bound on establishing the TCP connection
    pub connect_timeout: Option<Duration>,
    /// Bound on waiting for a reply, measured from submission
    pub operation_timeout: Option<Duration>,
    /// TCP keepalive idle time
    pub keepalive: Option<Duration>,
}

/// A command waiting for its reply
#[derive(Debug)]
pub(crate) struct PendingCommand {
    payload: Bytes,
    kind: CommandKind,
    opaque: u32,
    completer: Completer<Reply>,
    enqueued_at: Instant,
}

#[derive(Debug)]
enum Message {
    Submit(PendingCommand),
    Close,
}

/// State observed by handles and written by the task
#[derive(Debug)]
struct Status {
    state: Mutex<ConnectionState>,
    reached_ready: AtomicBool,
    next_opaque: AtomicU32,
}

impl Status {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Unconnected),
            reached_ready: AtomicBool::new(false),
            next_opaque: AtomicU32::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        // the state is a plain value; a panicked writer cannot leave it half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to one server's connection task
#[derive(Debug, Clone)]
pub struct ServerConnection {
    server: ServerSpec,
    codec: Codec,
    tx: mpsc::UnboundedSender<Message>,
    status: Arc<Status>,
    prior_failures: u32,
}

impl ServerConnection {
    /// Start a connection attempt in the background and return its handle immediately.
    ///
    /// `prior_failures` is the number of consecutive failed attempts before this one;
    /// the pool uses it to compute the next backoff.
    pub fn connect(
        server: ServerSpec,
        codec: Codec,
        settings: ConnectionSettings,
        events: EventSink,
        prior_failures: u32,
    ) -> Self {
        let (handle, task) = Self::new_pair(server, codec, settings, events, prior_failures);
        tokio::spawn(task.run());
        handle
    }

    /// Run the connection engine over an already established stream
    pub fn from_stream<S>(
        server: ServerSpec,
        codec: Codec,
        settings: ConnectionSettings,
        events: EventSink,
        stream: S,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (handle, task) = Self::new_pair(server, codec, settings, events, 0);
        tokio::spawn(task.serve(stream));
        handle
    }

    fn new_pair(
        server: ServerSpec,
        codec: Codec,
        settings: ConnectionSettings,
        events: EventSink,
        prior_failures: u32,
    ) -> (Self, ConnectionTask) {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(Status::new());
        *status.lock() = ConnectionState::Connecting;

        let handle = ServerConnection {
            server: server.clone(),
            codec,
            tx,
            status: Arc::clone(&status),
            prior_failures,
        };
        let task = ConnectionTask {
            server,
            codec,
            settings,
            events,
            status,
            rx,
        };
        (handle, task)
    }

    pub fn server(&self) -> &ServerSpec {
        &self.server
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().clone()
    }

    /// Whether this connection was ever established
    pub fn reached_ready(&self) -> bool {
        self.status.reached_ready.load(Ordering::Acquire)
    }

    pub fn prior_failures(&self) -> u32 {
        self.prior_failures
    }

    /// Encode `command` and queue it on this connection.
    ///
    /// Never blocks. Failures known up front (unsupported command, connection already
    /// failed) come back as an already-resolved handle.
    pub fn submit(&self, command: &Command) -> CompletionHandle<Reply> {
        let kind = command.kind();
        if !self.codec.supports(kind) {
            return CompletionHandle::ready(Err(AlacenaError::unsupported(
                kind.to_string(),
                self.codec.kind(),
            )));
        }
        if let ConnectionState::Failed { error, .. } = &*self.status.lock() {
            return CompletionHandle::ready(Err(error.clone()));
        }

        let opaque = self.status.next_opaque.fetch_add(1, Ordering::Relaxed);
        let mut payload = BytesMut::new();
        if let Err(e) = self.codec.encode(command, opaque, &mut payload) {
            return CompletionHandle::ready(Err(AlacenaError::protocol(&self.server, e.to_string())));
        }

        let (completer, handle) = completion();
        let pending = PendingCommand {
            payload: payload.freeze(),
            kind,
            opaque,
            completer,
            enqueued_at: Instant::now(),
        };
        if let Err(mpsc::error::SendError(Message::Submit(pending))) =
            self.tx.send(Message::Submit(pending))
        {
            // the task finished between the state check and the send
            pending.completer.fail(self.closed_error());
        }
        handle
    }

    /// Ask the task to shut the socket down; outstanding commands resolve `Closed`
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close);
    }

    fn closed_error(&self) -> AlacenaError {
        match &*self.status.lock() {
            ConnectionState::Failed { error, .. } => error.clone(),
            _ => AlacenaError::Closed,
        }
    }
}

/// The task side: owns the socket, the receiver and the pending queue
struct ConnectionTask {
    server: ServerSpec,
    codec: Codec,
    settings: ConnectionSettings,
    events: EventSink,
    status: Arc<Status>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl ConnectionTask {
    async fn run(mut self) {
        debug!(server = %self.server, "connecting");
        match connect_stream(&self.server, &self.settings).await {
            Ok(stream) => self.serve(stream).await,
            Err(error) => {
                self.set_state(ConnectionState::failed(error.clone()));
                self.events.emit(ConnectionEvent::ConnectFailed {
                    server: self.server.clone(),
                    reason: error.to_string(),
                });
                self.reject_queued(&error).await;
            }
        }
    }

    async fn serve<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite,
    {
        self.status.reached_ready.store(true, Ordering::Release);
        self.set_state(ConnectionState::Ready);
        self.events.emit(ConnectionEvent::Connected {
            server: self.server.clone(),
        });

        let mut pending = PendingQueue::new(self.codec.discipline());
        match self.drive(stream, &mut pending).await {
            Ok(()) => {
                debug!(server = %self.server, "connection closed");
                self.set_state(ConnectionState::Unconnected);
                pending.fail_all(&AlacenaError::Closed);
                self.reject_queued(&AlacenaError::Closed).await;
            }
            Err(error) => {
                self.set_state(ConnectionState::failed(error.clone()));
                self.events.emit(ConnectionEvent::ConnectionLost {
                    server: self.server.clone(),
                    reason: error.to_string(),
                });
                pending.fail_all(&error);
                self.reject_queued(&error).await;
            }
        }
    }

    /// Pump commands out and replies in until the owner closes or the stream breaks.
    ///
    /// Writes proceed one `write_buf` call at a time alongside reads and the deadline,
    /// so a server that stalls reading until its replies are drained cannot wedge the
    /// connection.
    async fn drive<S>(&mut self, stream: S, pending: &mut PendingQueue) -> AlacenaResult<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut write_buf = BytesMut::new();

        loop {
            let deadline = self
                .settings
                .operation_timeout
                .and_then(|limit| pending.oldest().map(|at| at + limit));

            tokio::select! {
                message = self.rx.recv() => {
                    let mut closing = match message {
                        Some(Message::Submit(command)) => {
                            pending.push(command, &mut write_buf);
                            false
                        }
                        Some(Message::Close) | None => true,
                    };
                    // coalesce everything already queued into the outgoing buffer
                    while !closing {
                        match self.rx.try_recv() {
                            Ok(Message::Submit(command)) => pending.push(command, &mut write_buf),
                            Ok(Message::Close) => closing = true,
                            Err(_) => break,
                        }
                    }
                    if closing {
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                }
                written = writer.write_buf(&mut write_buf), if !write_buf.is_empty() => {
                    let n = written.map_err(|e| AlacenaError::io(&self.server, &e))?;
                    if n == 0 {
                        let zero = io::Error::new(io::ErrorKind::WriteZero, "connection refused further writes");
                        return Err(AlacenaError::io(&self.server, &zero));
                    }
                    trace!(server = %self.server, bytes = n, remaining = write_buf.len(), "wrote");
                    if write_buf.is_empty() {
                        writer
                            .flush()
                            .await
                            .map_err(|e| AlacenaError::io(&self.server, &e))?;
                    }
                }
                read = reader.read_buf(&mut read_buf) => {
                    let n = read.map_err(|e| AlacenaError::io(&self.server, &e))?;
                    if n == 0 {
                        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server");
                        return Err(AlacenaError::io(&self.server, &eof));
                    }
                    trace!(server = %self.server, bytes = n, "read");
                    self.dispatch(&mut read_buf, pending)?;
                }
                _ = expiry(deadline) => {
                    if let Some(limit) = self.settings.operation_timeout {
                        pending.expire(Instant::now(), limit, &self.server)?;
                    }
                }
            }
        }
    }

    /// Decode every complete frame in `buf` and resolve its command
    fn dispatch(&self, buf: &mut BytesMut, pending: &mut PendingQueue) -> AlacenaResult<()> {
        loop {
            let frame = match self.codec.decode(pending.expected_kind(), buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => return Err(AlacenaError::protocol(&self.server, e.to_string())),
            };
            pending.complete(frame, &self.server)?;
        }
    }

    /// Refuse new submissions and fail whatever is still in the channel
    async fn reject_queued(&mut self, error: &AlacenaError) {
        self.rx.close();
        while let Some(message) = self.rx.recv().await {
            if let Message::Submit(command) = message {
                command.completer.fail(error.clone());
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.status.lock() = state;
    }
}

/// Commands written to the socket and not yet answered
#[derive(Debug)]
enum PendingQueue {
    Ordered(VecDeque<PendingCommand>),
    Correlated {
        by_opaque: FnvHashMap<u32, PendingCommand>,
        /// submission order, may contain tokens already completed
        order: VecDeque<u32>,
        expired: FnvHashSet<u32>,
    },
}

impl PendingQueue {
    fn new(discipline: Discipline) -> Self {
        match discipline {
            Discipline::Ordered => PendingQueue::Ordered(VecDeque::new()),
            Discipline::Correlated => PendingQueue::Correlated {
                by_opaque: FnvHashMap::default(),
                order: VecDeque::new(),
                expired: FnvHashSet::default(),
            },
        }
    }

    fn push(&mut self, command: PendingCommand, write_buf: &mut BytesMut) {
        write_buf.extend_from_slice(&command.payload);
        match self {
            PendingQueue::Ordered(queue) => queue.push_back(command),
            PendingQueue::Correlated {
                by_opaque, order, ..
            } => {
                order.push_back(command.opaque);
                by_opaque.insert(command.opaque, command);
            }
        }
    }

    /// Kind of the reply the ordered protocol expects next
    fn expected_kind(&self) -> Option<CommandKind> {
        match self {
            PendingQueue::Ordered(queue) => queue.front().map(|c| c.kind),
            PendingQueue::Correlated { .. } => None,
        }
    }

    /// Submission time of the oldest unanswered command
    fn oldest(&mut self) -> Option<Instant> {
        match self {
            PendingQueue::Ordered(queue) => queue.front().map(|c| c.enqueued_at),
            PendingQueue::Correlated {
                by_opaque, order, ..
            } => {
                while let Some(opaque) = order.front() {
                    match by_opaque.get(opaque) {
                        Some(command) => return Some(command.enqueued_at),
                        None => {
                            order.pop_front();
                        }
                    }
                }
                None
            }
        }
    }

    /// Resolve the command `frame` answers
    fn complete(&mut self, frame: Frame, server: &ServerSpec) -> AlacenaResult<()> {
        let violation = |e: ProtocolError| AlacenaError::protocol(server, e.to_string());
        let command = match self {
            PendingQueue::Ordered(queue) => queue
                .pop_front()
                .ok_or_else(|| violation(ProtocolError::Unsolicited))?,
            PendingQueue::Correlated {
                by_opaque, expired, ..
            } => {
                let opaque = frame.opaque.ok_or_else(|| {
                    violation(ProtocolError::InvalidFormat(
                        "reply without correlation token".to_string(),
                    ))
                })?;
                match by_opaque.remove(&opaque) {
                    Some(command) => command,
                    None if expired.remove(&opaque) => {
                        trace!(opaque, "discarding reply to an expired request");
                        return Ok(());
                    }
                    None => return Err(violation(ProtocolError::Unsolicited)),
                }
            }
        };

        if command.kind != frame.kind {
            let error = violation(ProtocolError::Unexpected {
                expected: command.kind,
                got: format!("{} reply", frame.kind),
            });
            command.completer.fail(error.clone());
            return Err(error);
        }
        match frame.outcome {
            Ok(reply) => command.completer.succeed(reply),
            Err(message) => command.completer.fail(AlacenaError::server(message)),
        };
        Ok(())
    }

    /// Resolve commands older than `limit` with a timeout
    fn expire(&mut self, now: Instant, limit: Duration, server: &ServerSpec) -> AlacenaResult<()> {
        match self {
            PendingQueue::Ordered(queue) => {
                if let Some(front) = queue.front() {
                    if front.enqueued_at + limit <= now {
                        let error = AlacenaError::timeout(server, format!("{} reply", front.kind));
                        if let Some(command) = queue.pop_front() {
                            command.completer.fail(error.clone());
                        }
                        // replies after the expired one would be misattributed
                        return Err(error);
                    }
                }
                Ok(())
            }
            PendingQueue::Correlated {
                by_opaque,
                order,
                expired,
            } => {
                while let Some(&opaque) = order.front() {
                    let Some(command) = by_opaque.get(&opaque) else {
                        order.pop_front();
                        continue;
                    };
                    if command.enqueued_at + limit > now {
                        break;
                    }
                    order.pop_front();
                    if let Some(command) = by_opaque.remove(&opaque) {
                        warn!(server = %server, opaque, "request timed out");
                        let error = AlacenaError::timeout(server, format!("{} reply", command.kind));
                        command.completer.fail(error);
                    }
                    if expired.len() >= MAX_EXPIRED_TOKENS {
                        expired.clear();
                    }
                    expired.insert(opaque);
                }
                Ok(())
            }
        }
    }

    fn fail_all(&mut self, error: &AlacenaError) {
        match self {
            PendingQueue::Ordered(queue) => {
                for command in queue.drain(..) {
                    command.completer.fail(error.clone());
                }
            }
            PendingQueue::Correlated {
                by_opaque, order, ..
            } => {
                order.clear();
                for (_, command) in by_opaque.drain() {
                    command.completer.fail(error.clone());
                }
            }
        }
    }
}

/// Open a TCP connection to `server`, bounded by the connect timeout
/// Resolves at the deadline of the oldest outstanding command, never when nothing waits
async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn connect_stream(
    server: &ServerSpec,
    settings: &ConnectionSettings,
) -> AlacenaResult<TcpStream> {
    let attempt = TcpStream::connect(server.address());
    let result = match settings.connect_timeout {
        Some(limit) => match timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => return Err(AlacenaError::timeout(server, "connect")),
        },
        None => attempt.await,
    };
    let stream = result.map_err(|e| AlacenaError::connect(server, e))?;

    if let Err(e) = configure_stream(&stream, settings) {
        warn!(server = %server, "failed to configure socket: {}", e);
    }
    Ok(stream)
}

fn configure_stream(stream: &TcpStream, settings: &ConnectionSettings) -> io::Result<()> {
    // requests are small; don't let Nagle hold them back
    stream.set_nodelay(true)?;
    if let Some(idle) = settings.keepalive {
        let keepalive = socket2::TcpKeepalive::new().with_time(idle);
        socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}
