//! One TCP session with a Q-SYS Core.
//!
//! # Tasks (for beginners)
//!
//! After [`Connection::connect`] succeeds, three background tasks run until
//! the session ends:
//!
//! ```text
//!             ┌──────────── receive loop ────────────┐
//!  socket ──► │ FrameDecoder → decode_message        │──► Correlator (responses)
//!             │                                      │──► NotificationRouter
//!             └──────────────────────────────────────┘──► ConnectionEvent channel
//!
//!             ┌──────────── write task ──────────────┐
//!  callers ──►│ one encoded frame at a time          │──► socket
//!             └──────────────────────────────────────┘
//!
//!             ┌──────────── keep-alive ──────────────┐
//!  interval ─►│ idle ≥ threshold?  send NoOp         │──► write task
//!             └──────────────────────────────────────┘
//! ```
//!
//! Callers never touch the socket.  They queue an encoded frame for the write
//! task, which owns the write half, and wait for it to report the outcome.
//! A caller that gives up while waiting leaves the frame with the task, so
//! the Core never sees half a request.
//!
//! # Shutdown
//!
//! The session state lives in a `watch` channel.  Every task `select!`s on
//! it, so moving the state away from `Connected` (intentional disconnect or a
//! transport failure) stops them promptly, even mid-write against a Core
//! that stopped reading.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use qrc_core::protocol::{methods, RequestIdCounter, DEFAULT_PORT};
use qrc_core::{
    decode_message, encode_frame, FrameDecoder, FrameError, InboundMessage, Notification,
    QrcError, Request, RequestId, Response,
};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, TcpStream},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

use super::correlator::{Correlator, CorrelatorError, PendingResponse};
use super::keepalive::{ActivityClock, KeepAlive};
use super::router::NotificationRouter;
use crate::application::client::RpcChannel;

/// Attempts to find a free request id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

/// Queue depth of the [`ConnectionEvent`] channel.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Frames that may wait for the write task.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Configuration of one Core session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Bound on TCP connection establishment.
    pub connect_timeout: Duration,
    /// Default deadline for [`Connection::call`] and for `NoOp` replies.
    pub request_timeout: Duration,
    pub keepalive: KeepAlive,
    /// Size of the socket read buffer.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            keepalive: KeepAlive::default(),
            read_buffer_size: 4096,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Lifecycle of a [`Connection`].
///
/// ```text
/// Disconnected ──connect──► Connecting ──► Connected ──disconnect──► Disconnecting ──► Disconnected
///      ▲                        │              │
///      └──── connect failed ────┘              └── I/O failure ──► Failed ──connect──► Connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// Events emitted by the connection to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A notification no subscriber claimed.
    Notification(Notification),
    /// The active session failed; carries the reason.
    Failed(String),
}

/// An encoded request waiting for the write task.
struct Outbound {
    id: RequestId,
    frame: Vec<u8>,
    written: oneshot::Sender<std::io::Result<()>>,
}

/// State shared between the public handle and the background tasks.
struct Shared {
    config: ConnectionConfig,
    /// Queue into the write task; `None` while no session is active.
    outbound: StdMutex<Option<mpsc::Sender<Outbound>>>,
    correlator: Correlator,
    router: NotificationRouter,
    request_ids: RequestIdCounter,
    activity: ActivityClock,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<ConnectionEvent>,
}

/// A client session with one Core.
pub struct Connection {
    shared: Arc<Shared>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Creates a disconnected connection and the receiver for its events.
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            config,
            outbound: StdMutex::new(None),
            correlator: Correlator::new(),
            router: NotificationRouter::new(),
            request_ids: RequestIdCounter::new(),
            activity: ActivityClock::new(),
            state,
            events,
        });
        (
            Self {
                shared,
                tasks: StdMutex::new(Vec::new()),
            },
            rx,
        )
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Returns a receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Opens the TCP session and starts the receive and keep-alive tasks.
    ///
    /// # Errors
    ///
    /// - [`QrcError::ConnectFailed`] when the socket cannot be opened within
    ///   `connect_timeout`; the state returns to `Disconnected`.
    /// - [`QrcError::Protocol`] when the connection is already active.
    pub async fn connect(&self) -> Result<(), QrcError> {
        let shared = &self.shared;
        if shared
            .transition(
                |s| matches!(s, ConnectionState::Disconnected | ConnectionState::Failed),
                ConnectionState::Connecting,
            )
            .is_none()
        {
            return Err(QrcError::Protocol(format!(
                "cannot connect while {:?}",
                self.state()
            )));
        }
        self.join_tasks().await;

        let addr = shared.config.addr();
        info!(%addr, "connecting to Core");
        let stream = match time::timeout(shared.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                shared.transition(|s| s == ConnectionState::Connecting, ConnectionState::Disconnected);
                return Err(QrcError::ConnectFailed { addr, source });
            }
            Err(_elapsed) => {
                shared.transition(|s| s == ConnectionState::Connecting, ConnectionState::Disconnected);
                return Err(QrcError::ConnectFailed {
                    addr,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        *shared.outbound_slot() = Some(outbound);
        shared.activity.touch();

        if shared
            .transition(|s| s == ConnectionState::Connecting, ConnectionState::Connected)
            .is_none()
        {
            // disconnect() ran while the socket was being opened.
            shared.outbound_slot().take();
            return Err(QrcError::ConnectionLost(
                "disconnected while connecting".to_string(),
            ));
        }

        let receive = tokio::spawn(receive_loop(
            Arc::clone(shared),
            read_half,
            shared.state.subscribe(),
        ));
        let write = tokio::spawn(write_loop(
            Arc::clone(shared),
            write_half,
            outbound_rx,
            shared.state.subscribe(),
        ));
        let keepalive = tokio::spawn(keepalive_loop(Arc::clone(shared), shared.state.subscribe()));
        self.lock_tasks().extend([receive, write, keepalive]);

        info!(%addr, "connected to Core");
        Ok(())
    }

    /// Closes the session.  Safe to call in any state and more than once.
    ///
    /// Outstanding requests fail with [`QrcError::ConnectionLost`] and every
    /// notification subscription ends.  A write stuck on a Core that stopped
    /// reading is abandoned, so this never waits on the socket.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let previous = shared.transition(
            |s| matches!(s, ConnectionState::Connected | ConnectionState::Connecting),
            ConnectionState::Disconnecting,
        );
        if previous.is_none() {
            shared.transition(|s| s == ConnectionState::Failed, ConnectionState::Disconnected);
            self.join_tasks().await;
            debug!("disconnect on an inactive connection; nothing to do");
            return;
        }

        // The write task sees the state change and shuts its half down.
        shared.outbound_slot().take();
        let cancelled = shared.correlator.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding requests");
        }
        shared.router.clear();
        shared.transition(|s| s == ConnectionState::Disconnecting, ConnectionState::Disconnected);
        self.join_tasks().await;
        info!("disconnected from Core");
    }

    /// Sends a request without waiting for its response.
    ///
    /// The reply, if any, is treated as unknown and logged.
    ///
    /// # Errors
    ///
    /// [`QrcError::NotConnected`] when the session is not active and
    /// [`QrcError::Protocol`] when encoding or the write fails.
    pub async fn send(&self, method: &str, params: Value) -> Result<RequestId, QrcError> {
        self.shared.send_without_reply(method, params).await
    }

    /// Sends a request and waits up to `timeout` for its response.
    ///
    /// # Errors
    ///
    /// - [`QrcError::Timeout`] when no response arrives in time.
    /// - [`QrcError::ConnectionLost`] when the session ends first.
    /// - Any error from [`Connection::send`].
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Response, QrcError> {
        let pending = self.shared.send_with_reply(method, params).await?;
        let id = pending.id();
        match pending.wait(timeout).await {
            Ok(response) => Ok(response),
            Err(CorrelatorError::TimedOut { .. }) => {
                warn!(method, id, ?timeout, "request timed out");
                Err(QrcError::Timeout {
                    method: method.to_string(),
                    id,
                    timeout,
                })
            }
            Err(CorrelatorError::Cancelled(_)) => Err(QrcError::ConnectionLost(format!(
                "connection closed before {method} (id {id}) was answered"
            ))),
            Err(e) => Err(QrcError::Protocol(e.to_string())),
        }
    }

    /// Subscribes to notifications with the given method name.
    pub fn subscribe(&self, method: &str) -> mpsc::Receiver<Notification> {
        self.shared.router.subscribe_method(method)
    }

    /// Subscribes to change-group notifications for `group_id`.
    pub fn subscribe_change_group(&self, group_id: &str) -> mpsc::Receiver<Notification> {
        self.shared.router.subscribe_change_group(group_id)
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.shared.correlator.is_pending(id)
    }

    /// Time since the last frame was sent or received.
    pub fn idle_for(&self) -> Duration {
        self.shared.activity.idle_for()
    }

    async fn join_tasks(&self) {
        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "connection task panicked");
                }
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl RpcChannel for Connection {
    async fn connect(&self) -> Result<(), QrcError> {
        Connection::connect(self).await
    }

    async fn disconnect(&self) {
        Connection::disconnect(self).await
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Response, QrcError> {
        Connection::call(self, method, params, timeout).await
    }

    fn subscribe(&self, method: &str) -> mpsc::Receiver<Notification> {
        Connection::subscribe(self, method)
    }

    fn subscribe_change_group(&self, group_id: &str) -> mpsc::Receiver<Notification> {
        Connection::subscribe_change_group(self, group_id)
    }
}

// ── Shared internals ──────────────────────────────────────────────────────────

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves to `to` if the current state satisfies `allowed`.
    ///
    /// Returns the previous state when the transition happened.
    fn transition(
        &self,
        allowed: impl Fn(ConnectionState) -> bool,
        to: ConnectionState,
    ) -> Option<ConnectionState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state != to && allowed(*state) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        if let Some(from) = previous {
            debug!(?from, ?to, "connection state changed");
            self.emit(ConnectionEvent::StateChanged(to));
        }
        previous
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events.try_send(event) {
            trace!(error = %e, "connection event not delivered");
        }
    }

    async fn send_with_reply(&self, method: &str, params: Value) -> Result<PendingResponse, QrcError> {
        self.ensure_connected()?;
        let pending = self.register_next_id()?;
        self.write_request(pending.id(), method, params).await?;
        Ok(pending)
    }

    async fn send_without_reply(&self, method: &str, params: Value) -> Result<RequestId, QrcError> {
        self.ensure_connected()?;
        let id = self.next_free_id()?;
        self.write_request(id, method, params).await?;
        Ok(id)
    }

    fn ensure_connected(&self) -> Result<(), QrcError> {
        if self.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(QrcError::NotConnected)
        }
    }

    /// Next id with no pending slot, for requests whose reply is ignored.
    fn next_free_id(&self) -> Result<RequestId, QrcError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.request_ids.next();
            if !self.correlator.is_pending(id) {
                return Ok(id);
            }
            warn!(id, "request id still pending; skipping");
        }
        Err(QrcError::Protocol("no free request id".to_string()))
    }

    /// Registers a slot under the next free id, skipping ids still pending
    /// after the counter wrapped.
    fn register_next_id(&self) -> Result<PendingResponse, QrcError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.request_ids.next();
            match self.correlator.register(id) {
                Ok(pending) => return Ok(pending),
                Err(CorrelatorError::DuplicateId(_)) => {
                    warn!(id, "request id still pending; skipping");
                }
                Err(e) => return Err(QrcError::Protocol(e.to_string())),
            }
        }
        Err(QrcError::Protocol("no free request id".to_string()))
    }

    async fn write_request(&self, id: RequestId, method: &str, params: Value) -> Result<(), QrcError> {
        let request = Request::new(method, params, id);
        let frame = encode_frame(&request)?;

        let outbound = self.outbound_slot().clone().ok_or(QrcError::NotConnected)?;
        let (written, outcome) = oneshot::channel();
        outbound
            .send(Outbound { id, frame, written })
            .await
            .map_err(|_| QrcError::NotConnected)?;

        match outcome.await {
            Ok(Ok(())) => {
                debug!(id, method, "request sent");
                Ok(())
            }
            Ok(Err(e)) => Err(QrcError::Protocol(format!("failed to send {method}: {e}"))),
            Err(_) => Err(QrcError::ConnectionLost(format!(
                "connection closed before {method} (id {id}) was written"
            ))),
        }
    }

    fn outbound_slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Outbound>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tears the session down after a transport failure.
    ///
    /// Does nothing unless the session is `Connected`, so a failure observed
    /// during an intentional disconnect stays silent.
    fn fail(&self, reason: &str) {
        if self
            .transition(|s| s == ConnectionState::Connected, ConnectionState::Failed)
            .is_none()
        {
            return;
        }
        error!(reason, "connection to Core failed");
        self.outbound_slot().take();
        let cancelled = self.correlator.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding requests");
        }
        self.router.clear();
        self.emit(ConnectionEvent::Failed(reason.to_string()));
    }

    fn dispatch_frame(&self, frame: Result<String, FrameError>) {
        let text = match frame {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "dropping unreadable frame");
                return;
            }
        };
        trace!(frame = %text, "frame received");

        match decode_message(&text) {
            Ok(InboundMessage::Response(response)) => {
                self.correlator.resolve(response);
            }
            Ok(InboundMessage::Notification(notification)) => {
                debug!(method = %notification.method, "notification received");
                if self.router.route(&notification) == 0 {
                    self.emit(ConnectionEvent::Notification(notification));
                }
            }
            Err(e) => warn!(error = %e, "dropping malformed message from Core"),
        }
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    mut state: watch::Receiver<ConnectionState>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; shared.config.read_buffer_size];

    loop {
        if *state.borrow_and_update() != ConnectionState::Connected {
            break;
        }
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        match read {
            Ok(0) => {
                shared.fail("connection closed by Core");
                break;
            }
            Ok(n) => {
                shared.activity.touch();
                for frame in decoder.feed(&buf[..n]) {
                    shared.dispatch_frame(frame);
                }
            }
            Err(e) => {
                shared.fail(&format!("read failed: {e}"));
                break;
            }
        }
    }
    debug!("receive loop stopped");
}

/// Writes queued frames one at a time until the session ends.
///
/// The task owns each frame, so a caller that stops waiting never cuts a
/// write short.  Only the session ending interrupts one, and the half is shut
/// down right after.
async fn write_loop<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    mut state: watch::Receiver<ConnectionState>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        if *state.borrow_and_update() != ConnectionState::Connected {
            break;
        }
        let next = tokio::select! {
            next = outbound.recv() => next,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        let Some(Outbound { id, frame, written }) = next else {
            break;
        };

        let result = tokio::select! {
            result = writer.write_all(&frame) => result,
            () = session_ended(&mut state) => {
                debug!(id, "session closing; abandoning write");
                break;
            }
        };
        match result {
            Ok(()) => {
                shared.activity.touch();
                let _ = written.send(Ok(()));
            }
            Err(e) => {
                shared.fail(&format!("write failed: {e}"));
                let _ = written.send(Err(e));
                debug!("write task stopped");
                return;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "socket shutdown failed");
    }
    debug!("write task stopped");
}

/// Resolves once the state leaves `Connected` or the sender is gone.
async fn session_ended(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state
        .wait_for(|s| *s != ConnectionState::Connected)
        .await;
}

async fn keepalive_loop(shared: Arc<Shared>, mut state: watch::Receiver<ConnectionState>) {
    let policy = shared.config.keepalive;
    let mut ticker = time::interval(policy.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        if *state.borrow_and_update() != ConnectionState::Connected {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        if !policy.is_due(shared.activity.idle_for()) {
            continue;
        }
        debug!("connection idle; sending NoOp");
        match shared.send_with_reply(methods::NO_OP, json!({})).await {
            Ok(pending) => {
                // Await the ack elsewhere so the next check is never delayed.
                let timeout = shared.config.request_timeout;
                tokio::spawn(async move {
                    let id = pending.id();
                    if let Err(e) = pending.wait(timeout).await {
                        warn!(id, error = %e, "NoOp not acknowledged");
                    }
                });
            }
            Err(e) => warn!(error = %e, "failed to send NoOp"),
        }
    }
    debug!("keep-alive task stopped");
}
