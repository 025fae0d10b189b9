//! Websocket transport for the channel client.
//!
//! A single background worker owns the socket. It reads outbound frames from
//! an in-memory queue, routes inbound frames to the channel registry, sends
//! heartbeats, and reconnects on its own schedule after unexpected loss.
//! Channels do not survive a lost connection: they are closed when the
//! socket drops and must be subscribed again once it is back.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::retry::{with_timeout, ReconnectSchedule};
use crate::socket::callbacks::ChannelCallbacks;
use crate::socket::channel::Channel;
use crate::socket::lock;
use crate::socket::proto::{
    Frame, RefCounter, EVENT_GET_STATUS, EVENT_PING, PHOENIX_TOPIC, PROTOCOL_VSN,
};
use crate::socket::registry::ChannelRegistry;

/// Payload sent with [`SocketClient::ping`].
pub const PING_MESSAGE: &str = "Hello from client";

const CONNECT_ABORTED: &str = "connect aborted by disconnect";

/// Default values used by [`SocketOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SocketDefaults;

impl SocketDefaults {
    /// Socket mount point; `/websocket` is appended when connecting.
    pub const ENDPOINT: &'static str = "ws://localhost:4000/socket";
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long `disconnect` waits for the worker to close the socket.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
}

/// Connection settings for [`SocketClient`].
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// Socket mount point, e.g. `wss://docs.example.com/socket`.
    pub endpoint: String,
    /// Extra query parameters sent with the upgrade request.
    pub params: BTreeMap<String, String>,
    /// Sent as the `token` query parameter when set.
    pub auth_token: Option<SecretString>,
    /// Delays between reconnect attempts.
    pub reconnect: ReconnectSchedule,
    /// Heartbeat period; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Upper bound on waiting for a push reply; `None` waits indefinitely.
    pub push_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            endpoint: SocketDefaults::ENDPOINT.to_string(),
            params: BTreeMap::new(),
            auth_token: None,
            reconnect: ReconnectSchedule::default(),
            heartbeat_interval: Some(SocketDefaults::HEARTBEAT_INTERVAL),
            connect_timeout: SocketDefaults::CONNECT_TIMEOUT,
            push_timeout: None,
        }
    }
}

impl SocketOptions {
    /// Sets the socket mount point. Trailing whitespace is ignored.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    /// Adds a query parameter to the upgrade request.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn with_reconnect_schedule(mut self, schedule: ReconnectSchedule) -> Self {
        self.reconnect = schedule;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_push_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.push_timeout = timeout;
        self
    }

    /// Builds the websocket URL: `<endpoint>/websocket?<params>&vsn=2.0.0`.
    ///
    /// `http`/`https` endpoints are mapped to `ws`/`wss`.
    pub fn websocket_url(&self) -> Result<Url, SocketError> {
        let base = self.endpoint.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/websocket"))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(SocketError::UnsupportedScheme(other.to_string())),
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(SocketError::UnsupportedScheme(url.scheme().to_string()));
        }

        {
            let mut query = url.query_pairs_mut();
            for (key, value) in &self.params {
                query.append_pair(key, value);
            }
            if let Some(token) = &self.auth_token {
                query.append_pair("token", token.expose_secret());
            }
            query.append_pair("vsn", PROTOCOL_VSN);
        }
        Ok(url)
    }
}

/// Connection lifecycle state of the shared socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Errors produced by the transport, subscriptions, and pushes.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    /// Operation requires an established connection.
    #[error("socket is not connected")]
    NotConnected,

    /// No channel is subscribed for the topic.
    #[error("not subscribed to topic: {0}")]
    NotSubscribed(String),

    /// Server declined the channel join.
    #[error("join rejected: {0}")]
    JoinRejected(Value),

    /// Server replied `error` to a push.
    #[error("request rejected: {0}")]
    RequestRejected(Value),

    /// Channel closed before the push was answered.
    #[error("channel closed before a reply arrived")]
    ChannelClosed,

    /// No reply arrived within the configured push timeout.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Socket-level failure while connecting.
    #[error("transport error: {0}")]
    Transport(String),

    /// Endpoint could not be parsed as a URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// Endpoint scheme is not a websocket or http scheme.
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    /// Outbound queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,
}

/// Work items consumed by the connection worker.
#[derive(Debug)]
pub(crate) enum Command {
    Push(Frame),
    Connect(oneshot::Sender<Result<(), SocketError>>),
    Shutdown,
}

/// Cloneable handle for queueing outbound frames.
#[derive(Clone, Debug)]
pub(crate) struct FrameSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<(), SocketError> {
        self.tx
            .send(Command::Push(frame))
            .map_err(|_| SocketError::SendQueueClosed)
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    registry: ChannelRegistry,
    refs: RefCounter,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(event = "connection_state_changed", from = ?previous, to = ?state);
        }
    }
}

struct WorkerHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Owner of the shared socket and its channel registry.
///
/// Construct one per process and share it (for example behind an `Arc`);
/// every subscription multiplexes over the same connection.
pub struct SocketClient {
    options: SocketOptions,
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
    connect_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("endpoint", &self.options.endpoint)
            .field("state", &self.state())
            .field("channels", &self.shared.registry.len())
            .finish()
    }
}

impl SocketClient {
    pub fn new(options: SocketOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            options,
            shared: Arc::new(Shared {
                state,
                registry: ChannelRegistry::new(),
                refs: RefCounter::default(),
            }),
            worker: Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns a receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Live channels keyed by topic.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.shared.registry
    }

    /// Opens the socket, or returns immediately when already connected.
    ///
    /// Concurrent calls are serialized; at most one connect attempt is in
    /// flight. If a reconnect wait is in progress, the existing worker is
    /// asked to try now instead of opening a second socket. A failed attempt
    /// rejects with [`SocketError::Transport`]; the worker keeps retrying on
    /// its schedule in the background until [`SocketClient::disconnect`].
    pub async fn connect(&self) -> Result<(), SocketError> {
        let _gate = self.connect_gate.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        self.request_connect(ready_tx)?;
        ready_rx
            .await
            .unwrap_or_else(|_| Err(SocketError::Transport(CONNECT_ABORTED.to_string())))
    }

    fn request_connect(
        &self,
        ready_tx: oneshot::Sender<Result<(), SocketError>>,
    ) -> Result<(), SocketError> {
        let mut worker = lock(&self.worker);

        if let Some(handle) = worker.as_ref() {
            if !handle.commands.is_closed() {
                debug!(event = "socket_connect_requested", worker = "existing");
                return handle
                    .commands
                    .send(Command::Connect(ready_tx))
                    .map_err(|_| SocketError::SendQueueClosed);
            }
        }

        let url = self.options.websocket_url()?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        debug!(event = "socket_connect_requested", worker = "new", endpoint = %self.options.endpoint);
        let task = tokio::spawn(connection_worker(
            url,
            self.options.clone(),
            Arc::clone(&self.shared),
            commands_rx,
            ready_tx,
        ));
        *worker = Some(WorkerHandle { commands, task });
        Ok(())
    }

    /// Closes the socket and retires every channel.
    ///
    /// Each channel transitions to `Closed`, fires `on_close`, and rejects its
    /// pending pushes with [`SocketError::ChannelClosed`]. Safe to call
    /// repeatedly.
    pub async fn disconnect(&self) {
        let handle = lock(&self.worker).take();
        if let Some(WorkerHandle { commands, mut task }) = handle {
            let _ = commands.send(Command::Shutdown);
            drop(commands);
            if with_timeout(SocketDefaults::SHUTDOWN_GRACE, &mut task)
                .await
                .is_err()
            {
                warn!(event = "socket_shutdown_forced");
                task.abort();
            }
            info!(event = "socket_disconnected", endpoint = %self.options.endpoint);
        }

        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.registry.close_all(None);
    }

    /// Subscribes to `topic`, returning the existing channel when there is one.
    ///
    /// Fails with [`SocketError::NotConnected`] and no side effects unless the
    /// socket is connected. For an existing channel the new `callbacks` are
    /// ignored and no second join is sent. The join outcome is reported
    /// through `on_join` / `on_error`.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        callbacks: ChannelCallbacks,
    ) -> Result<Channel, SocketError> {
        let topic = topic.into();
        self.shared.registry.subscribe_with(
            &topic,
            json!({}),
            || {
                if self.is_connected() {
                    Ok(())
                } else {
                    warn!(event = "channel_subscribe_rejected", topic = %topic, reason = "not_connected");
                    Err(SocketError::NotConnected)
                }
            },
            || {
                let outbound = self.frame_sender().ok_or(SocketError::NotConnected)?;
                Ok(Channel::new(
                    topic.clone(),
                    callbacks,
                    outbound,
                    self.shared.refs.clone(),
                    self.options.push_timeout,
                ))
            },
        )
    }

    /// Leaves and forgets the channel for `topic`. Unknown topics are ignored.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.shared.registry.unsubscribe(topic)
    }

    /// Returns the live channel for `topic`.
    pub fn channel(&self, topic: &str) -> Option<Channel> {
        self.shared.registry.get(topic)
    }

    /// Pushes `event` on the channel for `topic` and waits for its reply.
    ///
    /// Fails immediately with [`SocketError::NotSubscribed`] when no channel
    /// exists for the topic.
    pub async fn send_message(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<Value, SocketError> {
        let Some(channel) = self.shared.registry.get(topic) else {
            return Err(SocketError::NotSubscribed(topic.to_string()));
        };
        channel.push(event, payload).await
    }

    /// Asks the channel for the current processing status.
    pub async fn get_document_status(&self, topic: &str) -> Result<Value, SocketError> {
        self.send_message(topic, EVENT_GET_STATUS, json!({})).await
    }

    /// Round-trips a ping through the channel.
    pub async fn ping(&self, topic: &str) -> Result<Value, SocketError> {
        self.send_message(topic, EVENT_PING, json!({ "message": PING_MESSAGE }))
            .await
    }

    fn frame_sender(&self) -> Option<FrameSender> {
        lock(&self.worker)
            .as_ref()
            .map(|handle| FrameSender::new(handle.commands.clone()))
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.worker).take() {
            let _ = handle.commands.send(Command::Shutdown);
        }
    }
}

enum SessionOutcome {
    Shutdown,
    Reconnect(String),
}

enum RetryWait {
    Elapsed,
    ConnectNow,
    Shutdown,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connection_worker(
    url: Url,
    options: SocketOptions,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready_tx: oneshot::Sender<Result<(), SocketError>>,
) {
    let mut waiters = vec![ready_tx];
    let mut attempt = 0usize;

    loop {
        shared.set_state(ConnectionState::Connecting);
        match open_socket(&url, options.connect_timeout).await {
            Ok(socket) => {
                attempt = 0;
                shared.set_state(ConnectionState::Connected);
                info!(event = "socket_connected", endpoint = %options.endpoint);
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }

                let outcome = run_session(socket, &options, &shared, &mut commands).await;
                shared.set_state(ConnectionState::Disconnected);
                match outcome {
                    SessionOutcome::Shutdown => {
                        shared.registry.close_all(None);
                        break;
                    }
                    SessionOutcome::Reconnect(reason) => {
                        warn!(event = "socket_connection_lost", reason = %reason);
                        shared.registry.close_all(Some(&reason));
                    }
                }
            }
            Err(err) => {
                shared.set_state(ConnectionState::Disconnected);
                warn!(event = "socket_connect_failed", attempt = attempt + 1, error = %err);
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }

        attempt += 1;
        let delay = options.reconnect.delay_for_attempt(attempt);
        match wait_for_retry(delay, &mut commands, &mut waiters).await {
            RetryWait::Elapsed | RetryWait::ConnectNow => {}
            RetryWait::Shutdown => break,
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    for waiter in waiters {
        let _ = waiter.send(Err(SocketError::Transport(CONNECT_ABORTED.to_string())));
    }
}

async fn open_socket(url: &Url, connect_timeout: Duration) -> Result<Socket, SocketError> {
    match with_timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(WsError::Http(response))) => Err(SocketError::Transport(format!(
            "handshake rejected with http {}",
            response.status()
        ))),
        Ok(Err(err)) => Err(SocketError::Transport(err.to_string())),
        Err(_) => Err(SocketError::Transport(format!(
            "connect timed out after {connect_timeout:?}"
        ))),
    }
}

async fn run_session(
    mut socket: Socket,
    options: &SocketOptions,
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionOutcome {
    let mut heartbeat = options
        .heartbeat_interval
        .filter(|period| !period.is_zero())
        .map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
    let mut pending_heartbeat: Option<String> = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Push(frame)) => {
                        if let Err(err) = send_frame(&mut socket, &frame).await {
                            return SessionOutcome::Reconnect(format!("send failed: {err}"));
                        }
                    }
                    Some(Command::Connect(waiter)) => {
                        let _ = waiter.send(Ok(()));
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = socket.close(None).await;
                        return SessionOutcome::Shutdown;
                    }
                }
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match Frame::from_text(&text) {
                        Ok(frame) if frame.topic == PHOENIX_TOPIC => {
                            if frame.msg_ref.is_some() && frame.msg_ref == pending_heartbeat {
                                pending_heartbeat = None;
                            }
                        }
                        Ok(frame) => shared.registry.route(frame),
                        Err(err) => warn!(event = "frame_decode_failed", error = %err),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return SessionOutcome::Reconnect("pong failed".to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        return SessionOutcome::Reconnect("socket closed by server".to_string());
                    }
                    Some(Ok(_)) => debug!(event = "frame_ignored", reason = "non_text"),
                    Some(Err(err)) => return SessionOutcome::Reconnect(err.to_string()),
                    None => return SessionOutcome::Reconnect("socket ended".to_string()),
                }
            }
            _ = next_heartbeat(&mut heartbeat) => {
                if pending_heartbeat.is_some() {
                    return SessionOutcome::Reconnect("heartbeat timeout".to_string());
                }
                let msg_ref = shared.refs.next();
                if send_frame(&mut socket, &Frame::heartbeat(msg_ref.clone())).await.is_err() {
                    return SessionOutcome::Reconnect("heartbeat send failed".to_string());
                }
                pending_heartbeat = Some(msg_ref);
            }
        }
    }
}

async fn next_heartbeat(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn send_frame<S>(socket: &mut WebSocketStream<S>, frame: &Frame) -> Result<(), WsError>
where
    WebSocketStream<S>: futures_util::Sink<Message, Error = WsError>
        + Stream<Item = Result<Message, WsError>>
        + Unpin,
{
    let text = frame
        .to_text()
        .map_err(|err| WsError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;
    trace!(event = "frame_sent", topic = %frame.topic, name = %frame.event);
    socket.send(Message::Text(text)).await
}

async fn wait_for_retry(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    waiters: &mut Vec<oneshot::Sender<Result<(), SocketError>>>,
) -> RetryWait {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return RetryWait::Elapsed,
            command = commands.recv() => {
                match command {
                    Some(Command::Push(frame)) => {
                        debug!(
                            event = "frame_dropped_while_disconnected",
                            topic = %frame.topic,
                            name = %frame.event
                        );
                    }
                    Some(Command::Connect(waiter)) => {
                        waiters.push(waiter);
                        return RetryWait::ConnectNow;
                    }
                    Some(Command::Shutdown) | None => return RetryWait::Shutdown,
                }
            }
        }
    }
}
