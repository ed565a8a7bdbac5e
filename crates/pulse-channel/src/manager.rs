//! Connection manager: a cloneable handle plus the background driver task.
//!
//! The handle applies transitions to the shared [`Lifecycle`] synchronously
//! and forwards the resulting IO to the driver over an unbounded channel.
//! The driver owns the socket and both timers, multiplexed in one
//! `select!` loop, and feeds socket activity back into the lifecycle.

use std::{
    collections::VecDeque,
    future::pending,
    pin::Pin,
    sync::{Arc, Weak},
    time::Duration,
};

use futures_util::{FutureExt, StreamExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep, timeout},
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ChannelConfig,
    dispatcher::{EventDispatcher, EventStream, HandlerId, Subscription},
    error::{ChannelError, ChannelResult},
    event::{Event, EventName},
    lifecycle::{Action, ConnectionEpoch, ConnectionState, Lifecycle},
    message::Message,
    transport::{Connector, Frame, FrameSink, FrameStream, Socket, TungsteniteConnector},
};

/// Time allowed for the close handshake before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

enum Command {
    /// Execute actions produced by a handle-side transition.
    Run {
        epoch: ConnectionEpoch,
        actions: Vec<Action>,
    },
    /// Write a serialized message on the socket of `epoch`.
    Send { epoch: ConnectionEpoch, text: String },
}

struct Inner {
    config: Arc<ChannelConfig>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    dispatcher: Arc<EventDispatcher>,
    commands: mpsc::UnboundedSender<Command>,
}

/// Handle to one managed connection.
///
/// Cloning is cheap; all clones drive the same socket. The driver task
/// stops, closing the socket, once the last clone is dropped.
///
/// Handlers are owned by the connection, so a handler that captures a
/// clone keeps the connection alive forever. Capture a
/// [`WeakConnectionManager`] from [`downgrade`](Self::downgrade) instead.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager using the tokio-tungstenite transport.
    ///
    /// Must be called within a tokio runtime. The connection starts
    /// `Disconnected`; call [`connect`](Self::connect) to open it.
    pub fn new(config: ChannelConfig) -> ChannelResult<Self> {
        Self::with_connector(config, Arc::new(TungsteniteConnector::new()))
    }

    /// Create a manager over a custom transport.
    pub fn with_connector(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
    ) -> ChannelResult<Self> {
        config.validate().map_err(ChannelError::config)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ChannelError::runtime(e.to_string()))?;

        let config = Arc::new(config);
        let lifecycle = Arc::new(Mutex::new(Lifecycle::new(&config)));
        let dispatcher = Arc::new(EventDispatcher::new());
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            config: Arc::clone(&config),
            connector,
            lifecycle: Arc::clone(&lifecycle),
            dispatcher: Arc::clone(&dispatcher),
            commands: command_rx,
            socket: None,
            connecting: None,
            reconnect: None,
            heartbeat: None,
        };
        runtime.spawn(driver.run());
        debug!(url = %config.url, "Connection manager created");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                lifecycle,
                dispatcher,
                commands,
            }),
        })
    }

    /// Open the socket. No-op while connected or connecting.
    pub fn connect(&self) {
        let (epoch, actions) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let actions = lifecycle.connect();
            (lifecycle.epoch(), actions)
        };
        self.execute(epoch, actions);
    }

    /// Close the socket and stop automatic reconnection.
    ///
    /// Once this returns no reconnect is scheduled, and every `connected`,
    /// `message` or typed handler for the closed socket that has not yet
    /// started is skipped: liveness is checked right before each handler.
    /// On a multi-thread runtime, a handler whose check ran concurrently
    /// with this call may still start once.
    pub fn disconnect(&self) {
        let (epoch, actions) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let actions = lifecycle.disconnect();
            (lifecycle.epoch(), actions)
        };
        if !actions.is_empty() {
            info!(url = %self.inner.config.url, "Disconnecting");
        }
        self.execute(epoch, actions);
    }

    /// Serialize `message` and write it on the socket.
    ///
    /// Returns false, after logging a warning, when not connected or when
    /// the message cannot be serialized. Nothing is buffered.
    pub fn send(&self, message: &Message) -> bool {
        let epoch = {
            let lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.state().is_connected() {
                warn!(
                    url = %self.inner.config.url,
                    state = ?lifecycle.state(),
                    "{}, dropping message",
                    ChannelError::SendWhileDisconnected
                );
                return false;
            }
            lifecycle.epoch()
        };

        let text = match message.to_wire() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound message");
                return false;
            }
        };
        self.inner.commands.send(Command::Send { epoch, text }).is_ok()
    }

    /// Register a handler for a lifecycle name or message tag.
    pub fn on<F>(&self, name: impl Into<EventName>, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(name, handler)
    }

    /// Remove one handler registration.
    pub fn off(&self, name: impl Into<EventName>, id: HandlerId) -> bool {
        self.inner.dispatcher.off(&name.into(), id)
    }

    /// Register a handler that is removed when the guard drops.
    pub fn subscribe<F>(&self, name: impl Into<EventName>, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(name, handler)
    }

    /// Receive events under `names` as an async stream.
    pub fn listen<I, N>(&self, names: I) -> EventStream
    where
        I: IntoIterator<Item = N>,
        N: Into<EventName>,
    {
        self.inner.dispatcher.listen(names)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Automatic reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lifecycle.lock().attempts()
    }

    /// Whether the owning registry tore this channel down.
    pub fn is_retired(&self) -> bool {
        self.inner.lifecycle.lock().is_retired()
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Whether both handles drive the same connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A handle that does not keep the connection alive, for use inside
    /// handlers.
    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Disconnect for good and release every handler. Later `connect`
    /// calls on any clone are ignored.
    pub(crate) fn teardown(&self) {
        let (epoch, actions) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let actions = lifecycle.retire();
            (lifecycle.epoch(), actions)
        };
        info!(url = %self.inner.config.url, "Tearing down channel");
        self.execute(epoch, actions);
        self.inner.dispatcher.clear();
    }

    fn execute(&self, epoch: ConnectionEpoch, actions: Vec<Action>) {
        let mut io = Vec::with_capacity(actions.len());
        let mut events = Vec::new();
        for action in actions {
            match action {
                Action::Emit(event) => events.push(event),
                other => io.push(other),
            }
        }

        if !io.is_empty() && self.inner.commands.send(Command::Run { epoch, actions: io }).is_err()
        {
            debug!("Connection driver gone, dropping actions");
        }

        let lifecycle = &self.inner.lifecycle;
        for event in events {
            if event.name().is_inbound() {
                self.inner
                    .dispatcher
                    .emit_while(&event, || lifecycle.lock().is_current(epoch));
            } else {
                self.inner.dispatcher.emit(&event);
            }
        }
    }
}

/// Non-owning handle from [`ConnectionManager::downgrade`].
#[derive(Clone, Debug)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    /// The connection, unless every strong handle is gone.
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

struct LiveSocket {
    epoch: ConnectionEpoch,
    writer: Box<dyn FrameSink>,
    reader: FrameStream,
    last_inbound: Instant,
}

struct Connecting {
    epoch: ConnectionEpoch,
    future: BoxFuture<'static, ChannelResult<Socket>>,
}

enum Wake {
    Command(Option<Command>),
    Opened(ConnectionEpoch, ChannelResult<Socket>),
    Frame(ConnectionEpoch, Option<ChannelResult<Frame>>),
    ReconnectDue,
    HeartbeatDue,
}

struct Driver {
    config: Arc<ChannelConfig>,
    connector: Arc<dyn Connector>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    dispatcher: Arc<EventDispatcher>,
    commands: mpsc::UnboundedReceiver<Command>,
    socket: Option<LiveSocket>,
    connecting: Option<Connecting>,
    reconnect: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                biased;
                cmd = self.commands.recv() => Wake::Command(cmd),
                () = next_reconnect(&mut self.reconnect) => Wake::ReconnectDue,
                (epoch, result) = next_open(&mut self.connecting) => Wake::Opened(epoch, result),
                (epoch, frame) = next_frame(&mut self.socket) => Wake::Frame(epoch, frame),
                () = next_heartbeat(&mut self.heartbeat) => Wake::HeartbeatDue,
            };

            match wake {
                Wake::Command(Some(Command::Run { epoch, actions })) => {
                    self.run_actions(epoch, actions).await;
                }
                Wake::Command(Some(Command::Send { epoch, text })) => {
                    self.send(epoch, text).await;
                }
                Wake::Command(None) => break,
                Wake::Opened(epoch, result) => self.on_opened(epoch, result).await,
                Wake::Frame(epoch, frame) => self.on_frame(epoch, frame).await,
                Wake::ReconnectDue => {
                    self.reconnect = None;
                    let (epoch, actions) = self.transition(|lc| lc.reconnect_timer_fired());
                    self.run_actions(epoch, actions).await;
                }
                Wake::HeartbeatDue => self.on_heartbeat().await,
            }
        }

        self.connecting = None;
        self.reconnect = None;
        self.heartbeat = None;
        self.close_socket().await;
        debug!(url = %self.config.url, "All handles dropped; connection driver stopped");
    }

    fn transition(
        &self,
        f: impl FnOnce(&mut Lifecycle) -> Vec<Action>,
    ) -> (ConnectionEpoch, Vec<Action>) {
        let mut lifecycle = self.lifecycle.lock();
        let actions = f(&mut lifecycle);
        (lifecycle.epoch(), actions)
    }

    fn is_current(&self, epoch: ConnectionEpoch) -> bool {
        self.lifecycle.lock().is_current(epoch)
    }

    async fn on_opened(&mut self, epoch: ConnectionEpoch, result: ChannelResult<Socket>) {
        self.connecting = None;

        match result {
            Ok(socket) => {
                let actions = {
                    let mut lifecycle = self.lifecycle.lock();
                    lifecycle
                        .is_current(epoch)
                        .then(|| lifecycle.opened(epoch))
                };
                let Some(actions) = actions else {
                    debug!(epoch = epoch.0, "Discarding socket opened for a stale epoch");
                    let mut writer = socket.writer;
                    let _ = timeout(CLOSE_TIMEOUT, writer.close()).await;
                    return;
                };

                info!(url = %self.config.url, epoch = epoch.0, "WebSocket connected");
                self.socket = Some(LiveSocket {
                    epoch,
                    writer: socket.writer,
                    reader: socket.reader,
                    last_inbound: Instant::now(),
                });
                self.run_actions(epoch, actions).await;
            }
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "Connection failed");
                let (current, actions) = self.transition(|lc| lc.failed(epoch, e));
                self.run_actions(current, actions).await;
            }
        }
    }

    async fn on_frame(&mut self, epoch: ConnectionEpoch, frame: Option<ChannelResult<Frame>>) {
        let (current, actions) = match frame {
            Some(Ok(Frame::Close(reason))) => {
                debug!(reason = ?reason, "Peer closed the connection");
                self.socket = None;
                self.transition(|lc| lc.closed(epoch, reason))
            }
            Some(Ok(frame)) => {
                if let Some(socket) = self.socket.as_mut() {
                    socket.last_inbound = Instant::now();
                }
                self.on_data(epoch, frame);
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read error");
                self.socket = None;
                self.transition(|lc| lc.failed(epoch, e))
            }
            None => {
                debug!("WebSocket stream ended");
                self.socket = None;
                self.transition(|lc| lc.closed(epoch, None))
            }
        };
        self.run_actions(current, actions).await;
    }

    fn on_data(&self, epoch: ConnectionEpoch, frame: Frame) {
        let max = self.config.max_message_size;
        if max > 0 && frame.len() > max {
            warn!(
                size = frame.len(),
                max, "Dropping oversized WebSocket message"
            );
            return;
        }

        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Dropping binary frame that is not UTF-8");
                    return;
                }
            },
            Frame::Close(_) => return,
        };

        let message = match Message::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                return;
            }
        };

        trace!(kind = %message.kind(), "Dispatching message");
        let lifecycle = &self.lifecycle;
        self.dispatcher
            .dispatch_message_while(message, || lifecycle.lock().is_current(epoch));
    }

    async fn on_heartbeat(&mut self) {
        if let (Some(limit), Some(socket)) = (self.config.liveness_timeout, self.socket.as_ref())
            && socket.last_inbound.elapsed() > limit
        {
            let epoch = socket.epoch;
            warn!(timeout = ?limit, "No inbound traffic within liveness timeout");
            self.close_socket().await;
            let (current, actions) =
                self.transition(|lc| lc.failed(epoch, ChannelError::timeout(limit)));
            self.run_actions(current, actions).await;
            return;
        }

        let (epoch, actions) = self.transition(Lifecycle::heartbeat_tick);
        self.run_actions(epoch, actions).await;
    }

    async fn send(&mut self, epoch: ConnectionEpoch, text: String) {
        let Some(socket) = self.socket.as_mut().filter(|s| s.epoch == epoch) else {
            warn!("{}, dropping message", ChannelError::SendWhileDisconnected);
            return;
        };
        if let Err(e) = socket.writer.send_text(text).await {
            warn!(error = %e, "Failed to send message");
            self.socket = None;
            let (current, actions) = self.transition(|lc| lc.failed(epoch, e));
            self.run_actions(current, actions).await;
        }
    }

    async fn run_actions(&mut self, epoch: ConnectionEpoch, actions: Vec<Action>) {
        let mut queue: VecDeque<(ConnectionEpoch, Action)> =
            actions.into_iter().map(|action| (epoch, action)).collect();

        while let Some((epoch, action)) = queue.pop_front() {
            if action.is_forward() && !self.is_current(epoch) {
                trace!(?action, "Skipping action for a stale epoch");
                continue;
            }

            match action {
                Action::Open { epoch } => {
                    self.close_socket().await;
                    debug!(url = %self.config.url, epoch = epoch.0, "Connecting to WebSocket");
                    self.connecting = Some(Connecting {
                        epoch,
                        future: self.open_future(),
                    });
                }
                Action::Close => {
                    self.connecting = None;
                    self.close_socket().await;
                }
                Action::ScheduleReconnect { delay, attempt } => {
                    info!(attempt, delay = ?delay, "Reconnecting");
                    self.reconnect = Some(Box::pin(sleep(delay)));
                }
                Action::CancelReconnect => self.reconnect = None,
                Action::StartHeartbeat => {
                    let period = self.config.heartbeat_interval;
                    let mut heartbeat = interval_at(Instant::now() + period, period);
                    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(heartbeat);
                }
                Action::StopHeartbeat => self.heartbeat = None,
                Action::SendPing => {
                    let Some(socket) = self.socket.as_mut() else {
                        continue;
                    };
                    let ping = match Message::ping().to_wire() {
                        Ok(ping) => ping,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode heartbeat");
                            continue;
                        }
                    };
                    trace!("Sending heartbeat");
                    if let Err(e) = socket.writer.send_text(ping).await {
                        warn!(error = %e, "Failed to send ping");
                        let socket_epoch = socket.epoch;
                        self.socket = None;
                        let (current, more) = self.transition(|lc| lc.failed(socket_epoch, e));
                        queue.extend(more.into_iter().map(|action| (current, action)));
                    }
                }
                Action::Emit(event) => {
                    if event.name().is_inbound() {
                        let lifecycle = &self.lifecycle;
                        self.dispatcher
                            .emit_while(&event, || lifecycle.lock().is_current(epoch));
                    } else {
                        self.dispatcher.emit(&event);
                    }
                }
            }
        }
    }

    fn open_future(&self) -> BoxFuture<'static, ChannelResult<Socket>> {
        let connector = Arc::clone(&self.connector);
        let url = self.config.url.clone();
        let limit = self.config.connect_timeout;
        async move {
            match timeout(limit, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::timeout(limit)),
            }
        }
        .boxed()
    }

    async fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            self.heartbeat = None;
            match timeout(CLOSE_TIMEOUT, socket.writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Error closing WebSocket"),
                Err(_) => debug!("Timed out closing WebSocket"),
            }
        }
    }
}

async fn next_reconnect(reconnect: &mut Option<Pin<Box<Sleep>>>) {
    match reconnect {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn next_open(connecting: &mut Option<Connecting>) -> (ConnectionEpoch, ChannelResult<Socket>) {
    match connecting {
        Some(connecting) => {
            let epoch = connecting.epoch;
            (epoch, (&mut connecting.future).await)
        }
        None => pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<LiveSocket>,
) -> (ConnectionEpoch, Option<ChannelResult<Frame>>) {
    match socket {
        Some(socket) => {
            let epoch = socket.epoch;
            (epoch, socket.reader.next().await)
        }
        None => pending().await,
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending().await,
    }
}
