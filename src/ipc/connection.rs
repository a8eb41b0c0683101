//! Connection manager for the editor command channel.
//!
//! `ConnectionManager` owns one socket to the Unity editor and multiplexes
//! any number of concurrent `invoke` calls over it. Each connection epoch
//! runs a reader task (frames in, correlation, expiry sweep) and a writer
//! task fed by an unbounded queue, so frames hit the wire in invocation
//! order and callers only ever wait on their own reply.
//!
//! # Example
//!
//! ```ignore
//! use unity_bridge::config::BridgeConfig;
//! use unity_bridge::ipc::ConnectionManager;
//! use serde_json::json;
//!
//! let channel = ConnectionManager::from_config(&BridgeConfig::load()?);
//! let state = channel.invoke("get_editor_state", json!({})).await?;
//! channel.disconnect();
//! ```

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, VersionPolicy};
use crate::ipc::error::{describe_connect_error, ChannelError};
use crate::ipc::framing::{read_frame, write_frame};
use crate::ipc::pending::{deadline_after, CorrelationTable, Routing};
use crate::ipc::stats::{CommandStats, StatsSnapshot};
use crate::protocol::{CommandRequest, Outcome, Reply, RequestId};

/// Version of this bridge, compared against the editor package version.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the reader task rejects pending entries past their deadline.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Opens the byte stream the channel runs over.
///
/// Production code uses [`TcpConnector`]; tests plug in in-memory streams.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Human-readable address used in logs and errors.
    fn endpoint(&self) -> String;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Connects to the editor's TCP listener.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Lifecycle state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Snapshot returned by [`ConnectionManager::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub endpoint: String,
    pub connected_since: Option<DateTime<Utc>>,
    /// Requests still waiting for a reply.
    pub pending: usize,
    pub commands: StatsSnapshot,
    pub editor_version: Option<String>,
}

/// What the retry policy and other callers need from a channel.
pub trait CommandChannel: Send + Sync {
    /// Send one command and wait for its reply.
    fn invoke(
        &self,
        command: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, ChannelError>> + Send;

    /// Make sure a connection is up. No-op when already connected.
    fn connect(&self) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn is_connected(&self) -> bool;
}

/// The live half of a connection epoch.
struct Link {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct VersionGate {
    checked: bool,
    editor: Option<String>,
    mismatch: Option<ChannelError>,
}

struct Shared<C: Connector> {
    connector: C,
    config: BridgeConfig,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    /// Serializes connect attempts so concurrent callers share one socket.
    connect_lock: tokio::sync::Mutex<()>,
    pending: CorrelationTable,
    next_id: AtomicU64,
    epoch: AtomicU64,
    stats: CommandStats,
    version: Mutex<VersionGate>,
    /// Set by `disconnect()`; stops background reconnection.
    closing: AtomicBool,
    reconnecting: AtomicBool,
}

/// Cloneable handle to one editor connection.
///
/// All clones share the same socket, correlation table and counters.
/// Call [`disconnect`](Self::disconnect) to release the connection; the
/// background tasks hold the shared state until then.
pub struct ConnectionManager<C: Connector = TcpConnector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl ConnectionManager<TcpConnector> {
    /// Build a TCP channel from configuration. Does not connect yet.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            TcpConnector::new(config.host.clone(), config.port),
            config.clone(),
        )
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, config: BridgeConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                state,
                link: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                pending: CorrelationTable::new(),
                next_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                stats: CommandStats::new(),
                version: Mutex::new(VersionGate::default()),
                closing: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    /// Connect if not already connected.
    ///
    /// Concurrent callers wait for the same attempt and never open a second
    /// socket.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Connect` when the editor is unreachable or the
    /// connect timeout elapses.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.establish().await
    }

    /// Send a command using the configured command timeout.
    pub async fn invoke(&self, command: &str, params: Value) -> Result<Value, ChannelError> {
        let after = self.shared.config.command_timeout();
        self.invoke_with_timeout(command, params, after).await
    }

    /// Send a command and wait at most `after` for its reply.
    ///
    /// Connects first when needed (one attempt). `Null` params are sent as
    /// `{}`. Never retries.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Timeout` when no reply arrives in time
    /// - `ChannelError::Command` when the editor reports a failure
    /// - `ChannelError::ConnectionLost` when the socket drops mid-call
    /// - `ChannelError::VersionMismatch` under the `error` version policy
    pub async fn invoke_with_timeout(
        &self,
        command: &str,
        params: Value,
        after: Duration,
    ) -> Result<Value, ChannelError> {
        let shared = &self.shared;
        shared.check_version()?;

        if !shared.is_connected() {
            shared.closing.store(false, Ordering::SeqCst);
            shared.establish().await?;
        }

        let id = RequestId::new(shared.next_id.fetch_add(1, Ordering::Relaxed));
        let params = if params.is_null() { json!({}) } else { params };
        let body = CommandRequest::new(id, command, params)
            .to_bytes()
            .map_err(|e| ChannelError::Protocol(format!("Failed to encode {}: {}", command, e)))?;

        let deadline = deadline_after(Instant::now(), after);
        let mut rx = shared.pending.register(id, command, deadline);
        if !shared.send(body) {
            shared.pending.take(id);
            return Err(ChannelError::NotConnected);
        }
        debug!("Sent {} (id {})", command, id);

        let received = match timeout_at(deadline, &mut rx).await {
            Ok(received) => received,
            Err(_) if shared.pending.take(id) => {
                return Err(ChannelError::Timeout {
                    command: command.to_string(),
                    after_ms: after.as_millis() as u64,
                });
            }
            // Settled concurrently with the deadline; take what was sent.
            Err(_) => rx.await,
        };

        let value = received.map_err(|_| ChannelError::ConnectionClosed)??;
        shared.stats.record_success(command);
        Ok(value)
    }

    /// Close the connection, reject everything pending with
    /// `ConnectionClosed` and stop background reconnection.
    pub fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if self.shared.teardown(None, ChannelError::ConnectionClosed) {
            info!("Disconnected from {}", self.shared.connector.endpoint());
        }
    }

    pub fn status(&self) -> ChannelStatus {
        let connected_since = self.shared.lock_link().as_ref().map(|l| l.connected_at);
        ChannelStatus {
            state: self.state(),
            endpoint: self.shared.connector.endpoint(),
            connected_since,
            pending: self.shared.pending.len(),
            commands: self.shared.stats.snapshot(),
            editor_version: self.shared.lock_version().editor.clone(),
        }
    }
}

impl<C: Connector> CommandChannel for ConnectionManager<C> {
    async fn invoke(&self, command: &str, params: Value) -> Result<Value, ChannelError> {
        ConnectionManager::invoke(self, command, params).await
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        ConnectionManager::connect(self).await
    }

    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }
}

impl<C: Connector> Shared<C> {
    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_version(&self) -> MutexGuard<'_, VersionGate> {
        self.version.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        self.lock_link().is_some()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Channel state {} -> {}", previous, state);
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let endpoint = self.connector.endpoint();
        self.set_state(ConnectionState::Connecting);
        debug!("Connecting to editor at {}", endpoint);

        let connect_timeout = self.config.connect_timeout();
        let stream = match timeout(connect_timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                let reason = describe_connect_error(&e);
                error!("Failed to connect to {}: {}", endpoint, reason);
                return Err(ChannelError::Connect { endpoint, reason });
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                let reason = format!("timed out after {}ms", connect_timeout.as_millis());
                error!("Failed to connect to {}: {}", endpoint, reason);
                return Err(ChannelError::Connect { endpoint, reason });
            }
        };

        if self.closing.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
            return Err(ChannelError::ConnectionClosed);
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();

        *self.lock_version() = VersionGate::default();

        let mut link = self.lock_link();
        let tasks = vec![
            tokio::spawn(Arc::clone(self).read_loop(epoch, BufReader::new(read_half))),
            tokio::spawn(Arc::clone(self).write_loop(epoch, write_half, queue)),
        ];
        *link = Some(Link {
            epoch,
            outbound,
            tasks,
            connected_at: Utc::now(),
        });
        self.set_state(ConnectionState::Connected);
        drop(link);

        info!("Connected to editor at {} (epoch {})", endpoint, epoch);
        Ok(())
    }

    /// Queue a frame body for the writer. Returns `false` without a link.
    fn send(&self, body: Vec<u8>) -> bool {
        match self.lock_link().as_ref() {
            Some(link) => link.outbound.send(body).is_ok(),
            None => false,
        }
    }

    /// Drop the current link and reject everything pending with `error`.
    ///
    /// With `Some(epoch)`, only tears down if that epoch is still current,
    /// so a late failure from an old connection cannot kill a new one.
    fn teardown(&self, epoch: Option<u64>, error: ChannelError) -> bool {
        let mut guard = self.lock_link();
        let link = match (guard.as_ref(), epoch) {
            (None, _) => None,
            (Some(current), Some(epoch)) if current.epoch != epoch => None,
            _ => guard.take(),
        };
        let Some(link) = link else {
            return false;
        };

        // Reject before releasing the link so a request queued on the next
        // connection cannot be swept up with this one's.
        let rejected = self.pending.reject_all(&error);
        self.set_state(ConnectionState::Disconnected);
        drop(guard);

        if rejected > 0 {
            warn!("Rejected {} pending command(s): {}", rejected, error);
        }
        for task in link.tasks {
            task.abort();
        }
        true
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.config.auto_reconnect || self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let delay = shared.config.reconnect_backoff(attempt);
                debug!("Reconnect attempt {} in {:?}", attempt + 1, delay);
                sleep(delay).await;

                if shared.closing.load(Ordering::SeqCst) || shared.is_connected() {
                    break;
                }
                match shared.establish().await {
                    Ok(()) => {
                        info!("Reconnected after {} attempt(s)", attempt + 1);
                        break;
                    }
                    Err(e) => debug!("Reconnect attempt {} failed: {}", attempt + 1, e),
                }
                attempt = attempt.saturating_add(1);
            }
            shared.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn read_loop(self: Arc<Self>, epoch: u64, mut reader: BufReader<ReadHalf<C::Stream>>) {
        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The read future survives sweep ticks; dropping it mid-frame
            // would lose bytes.
            let frame = {
                let read = read_frame(&mut reader);
                tokio::pin!(read);
                loop {
                    tokio::select! {
                        frame = &mut read => break frame,
                        _ = sweep.tick() => {
                            let expired = self.pending.sweep_expired(Instant::now());
                            if expired > 0 {
                                debug!("Swept {} expired command(s)", expired);
                            }
                        }
                    }
                }
            };

            match frame {
                Ok(body) => self.dispatch(&body),
                Err(e) => {
                    let reason = format!("{:#}", e);
                    if self.teardown(Some(epoch), ChannelError::ConnectionLost(reason.clone())) {
                        warn!("Connection to editor lost: {}", reason);
                        self.schedule_reconnect();
                    }
                    return;
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        epoch: u64,
        mut writer: WriteHalf<C::Stream>,
        mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(body) = queue.recv().await {
            if let Err(e) = write_frame(&mut writer, &body).await {
                let reason = format!("{:#}", e);
                if self.teardown(Some(epoch), ChannelError::ConnectionLost(reason.clone())) {
                    warn!("Failed to write to editor: {}", reason);
                    self.schedule_reconnect();
                }
                return;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Decode one inbound frame and hand it to whoever is waiting.
    fn dispatch(&self, body: &[u8]) {
        debug!("Received {}-byte frame", body.len());
        let reply = match Reply::from_slice(body) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Dropping unreadable frame: {}", e);
                self.stats.record_dropped();
                return;
            }
        };

        let settlement = match self.observe_version(reply.version.as_deref()) {
            Err(mismatch) => Err(mismatch),
            Ok(()) => match reply.outcome {
                Outcome::Success(payload) => Ok(payload),
                Outcome::Failure { message, code } => Err(ChannelError::Command { message, code }),
            },
        };

        match self.pending.resolve(reply.id.as_deref(), settlement) {
            Routing::Matched(_) | Routing::Oldest(_) => {}
            Routing::Unmatched => {
                warn!(
                    "Dropping reply for unknown request {}",
                    reply.id.as_deref().unwrap_or("<none>")
                );
                self.stats.record_dropped();
            }
            Routing::Empty => {
                warn!("Dropping reply with nothing pending");
                self.stats.record_dropped();
            }
        }
    }

    /// Compare the first advertised editor version with ours.
    fn observe_version(&self, editor: Option<&str>) -> Result<(), ChannelError> {
        let policy = self.config.version_mismatch;
        let Some(editor) = editor.map(str::trim) else {
            return Ok(());
        };
        // Placeholder versions say nothing; wait for a real one.
        if editor.is_empty() || editor.eq_ignore_ascii_case("unknown") {
            debug!("Ignoring placeholder editor version {:?}", editor);
            return Ok(());
        }
        if policy == VersionPolicy::Off {
            return Ok(());
        }

        let mut gate = self.lock_version();
        if gate.checked {
            return Ok(());
        }
        gate.checked = true;
        gate.editor = Some(editor.to_string());

        if editor == BRIDGE_VERSION {
            debug!("Editor package version {} matches", editor);
            return Ok(());
        }

        let mismatch = ChannelError::VersionMismatch {
            bridge: BRIDGE_VERSION.to_string(),
            editor: editor.to_string(),
        };
        match policy {
            VersionPolicy::Error => {
                error!("{}", mismatch);
                gate.mismatch = Some(mismatch.clone());
                Err(mismatch)
            }
            _ => {
                warn!("{}; update the Unity package or this bridge", mismatch);
                Ok(())
            }
        }
    }

    fn check_version(&self) -> Result<(), ChannelError> {
        match &self.lock_version().mismatch {
            Some(mismatch) => Err(mismatch.clone()),
            None => Ok(()),
        }
    }
}
