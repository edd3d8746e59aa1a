#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff as _;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;
use uuid::Uuid;

use super::config::Config;
use super::error::WsError;
use crate::Result;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::events::{Connected, Disconnected, EventBus, TransportError};
use crate::host::{Dispatcher, Notifier, ReadySignal};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const CONNECTED_NOTICE: &str = "You are now connected to the global relay.";
const ERROR_NOTICE: &str = "The global relay client has encountered an error.";

const SHUTDOWN_REASON: &str = "client shutdown";
const CLOSED_REASON: &str = "connection closed";
const HEARTBEAT_REASON: &str = "heartbeat timeout";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected. Initial state, and final once reconnect attempts are exhausted
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting to retry after a close or a failed attempt
    Reconnecting {
        /// Consecutive failed attempts so far
        attempt: u32,
    },
    /// Shut down by the client; no further attempts are made
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check if the connection task has stopped for good.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// The connection state machine.
///
/// Each method is one input (socket opened, closed, errored, ...). The new state is
/// published right away; listener emissions and user notices are enqueued on the host
/// [`Dispatcher`] in the order the inputs arrive.
pub struct Lifecycle {
    state_tx: watch::Sender<ConnectionState>,
    events: Arc<EventBus>,
    dispatcher: Arc<dyn Dispatcher>,
    notifier: Arc<dyn Notifier>,
    log_path: Option<PathBuf>,
}

impl Lifecycle {
    #[must_use]
    pub fn new(
        events: Arc<EventBus>,
        dispatcher: Arc<dyn Dispatcher>,
        notifier: Arc<dyn Notifier>,
        log_path: Option<PathBuf>,
    ) -> Self {
        Self {
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
            events,
            dispatcher,
            notifier,
            log_path,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(?state, "Relay connection state changed");

        self.state_tx.send_replace(state);
    }

    /// The first connection attempt is about to be made.
    pub fn start(&self) {
        self.set_state(ConnectionState::Connecting);
    }

    /// The socket opened.
    pub fn opened(&self) {
        let event = Connected {
            since: Instant::now(),
        };
        self.set_state(ConnectionState::Connected { since: event.since });

        let events = Arc::clone(&self.events);
        self.dispatch("connect", move || {
            events.emit_connect(&event);
        });
        self.notify(CONNECTED_NOTICE.to_owned());
    }

    /// A connected socket went away; the next attempt follows after `delay`.
    pub fn closed(&self, info: Disconnected, delay: Duration) {
        #[cfg(feature = "tracing")]
        tracing::info!(reason = %info, "Relay connection closed");

        self.set_state(ConnectionState::Reconnecting { attempt: 0 });

        let reason = info.reason.clone();
        let events = Arc::clone(&self.events);
        self.dispatch("disconnect", move || {
            events.emit_disconnect(&info);
        });
        self.notify(format!("Relay disconnect: {reason}"));
        self.notify(reconnect_notice(delay));
    }

    /// Connection attempt number `attempt` failed; the next follows after `delay`.
    pub fn retrying(&self, attempt: u32, delay: Duration) {
        self.set_state(ConnectionState::Reconnecting { attempt });
        self.notify(reconnect_notice(delay));
    }

    /// A transport error. The state is left as it is.
    pub fn errored(&self, error: Error) {
        #[cfg(feature = "tracing")]
        tracing::error!(error = %error, "Relay transport error");

        let event = TransportError::from(error);
        let events = Arc::clone(&self.events);
        self.dispatch("error", move || {
            events.emit_error(&event);
        });

        let notice = match &self.log_path {
            Some(path) => format!(
                "{ERROR_NOTICE} You can find your logs in: {}",
                path.display()
            ),
            None => ERROR_NOTICE.to_owned(),
        };
        self.notify(notice);
    }

    /// An inbound envelope was decoded.
    pub fn message(&self, envelope: Envelope) {
        let events = Arc::clone(&self.events);
        self.dispatch("payload", move || {
            events.emit_payload(&envelope);
        });
    }

    /// The reconnect policy gave up after `attempts` consecutive failures.
    pub fn exhausted(&self, attempts: u32) {
        self.errored(WsError::RetriesExhausted { attempts }.into());
        self.set_state(ConnectionState::Disconnected);
    }

    /// The client shut the session down. A live connection is reported as a disconnect.
    pub fn shutdown(&self) {
        let was_connected = self.state().is_connected();
        self.set_state(ConnectionState::Closed);

        if was_connected {
            let events = Arc::clone(&self.events);
            let info = Disconnected::new(Some(CloseCode::Normal.into()), SHUTDOWN_REASON);
            self.dispatch("disconnect", move || {
                events.emit_disconnect(&info);
            });
        }
    }

    fn notify(&self, message: String) {
        let notifier = Arc::clone(&self.notifier);
        self.dispatch("notice", move || notifier.show_message(&message));
    }

    fn dispatch<F>(&self, kind: &str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher
            .enqueue(Box::new(task), format!("global_relay:{kind}:{}", Uuid::new_v4()));
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .field("events", &self.events)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

fn reconnect_notice(delay: Duration) -> String {
    if delay.subsec_millis() == 0 {
        format!("Reconnecting in {} seconds...", delay.as_secs())
    } else {
        format!("Reconnecting in {:.1} seconds...", delay.as_secs_f64())
    }
}

/// How a single connection ended.
enum Ended {
    Shutdown,
    Closed(Disconnected),
}

/// Owns the relay socket: connects, reconnects, keeps the connection alive and feeds
/// every socket event into a [`Lifecycle`].
///
/// Cheap to clone; all clones talk to the same background task. The task stops once the
/// last clone is dropped, as if [`shutdown`](Self::shutdown) had been called.
#[derive(Clone)]
pub struct ConnectionManager {
    /// Watch channel receiver for state changes
    state_rx: watch::Receiver<ConnectionState>,
    /// Sender channel for outgoing frames
    sender_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Stops the background task
    cancel: CancellationToken,
    /// Cancels `cancel` when the last clone goes away
    _drop_guard: Arc<DropGuard>,
}

impl ConnectionManager {
    /// Start the connection task. It waits for `ready` before the first attempt.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(url: Url, config: Config, lifecycle: Lifecycle, ready: ReadySignal) -> Self {
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let state_rx = lifecycle.state_receiver();
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            Self::connection_loop(url, config, sender_rx, lifecycle, ready, task_cancel).await;
        });

        Self {
            state_rx,
            sender_tx,
            _drop_guard: Arc::new(cancel.clone().drop_guard()),
            cancel,
        }
    }

    /// Main connection loop with automatic reconnection.
    async fn connection_loop(
        url: Url,
        config: Config,
        mut sender_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        lifecycle: Lifecycle,
        ready: ReadySignal,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            () = cancel.cancelled() => {
                lifecycle.shutdown();
                return;
            }
            () = ready.wait() => {}
        }

        #[cfg(feature = "tracing")]
        let endpoint = super::endpoint::redact_endpoint(&url);

        let mut attempt = 0_u32;
        let mut delays = config.reconnect.policy.delays();
        lifecycle.start();

        loop {
            #[cfg(feature = "tracing")]
            tracing::debug!(%endpoint, attempt, "Connecting to relay");

            let connected = tokio::select! {
                () = cancel.cancelled() => {
                    lifecycle.shutdown();
                    return;
                }
                result = connect_async(url.as_str()) => result,
            };

            let delay = match connected {
                Ok((ws_stream, _)) => {
                    attempt = 0;
                    delays.reset();

                    // Frames queued for the previous connection are not replayed
                    while sender_rx.try_recv().is_ok() {}
                    lifecycle.opened();

                    let ended = Self::handle_connection(
                        ws_stream,
                        &mut sender_rx,
                        &lifecycle,
                        &config,
                        &cancel,
                    )
                    .await;

                    match ended {
                        Ended::Shutdown => {
                            lifecycle.shutdown();
                            return;
                        }
                        Ended::Closed(info) => {
                            let delay = delays.next_backoff().unwrap_or_default();
                            lifecycle.closed(info, delay);
                            delay
                        }
                    }
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);

                    #[cfg(feature = "tracing")]
                    tracing::warn!(%endpoint, attempt, error = %e, "Unable to connect to relay");

                    lifecycle.errored(e.into());

                    if let Some(max) = config.reconnect.max_attempts
                        && attempt >= max
                    {
                        lifecycle.exhausted(attempt);
                        break;
                    }

                    let delay = delays.next_backoff().unwrap_or_default();
                    lifecycle.retrying(attempt, delay);
                    delay
                }
            };

            tokio::select! {
                () = cancel.cancelled() => {
                    lifecycle.shutdown();
                    return;
                }
                () = sleep(delay) => {}
            }
        }
    }

    /// Handle an active WebSocket connection until it closes or the client shuts down.
    async fn handle_connection(
        ws_stream: WsStream,
        sender_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        lifecycle: &Lifecycle,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Ended {
        let (mut write, mut read) = ws_stream.split();

        // Channel to notify heartbeat loop when PONG is received
        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();

        let heartbeat_config = config.clone();
        let mut heartbeat = tokio::spawn(async move {
            Self::heartbeat_loop(ping_tx, &heartbeat_config, pong_rx).await;
        });

        let ended = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: SHUTDOWN_REASON.into(),
                    };
                    _ = write.send(Message::Close(Some(frame))).await;
                    break Ended::Shutdown;
                }

                // Handle incoming messages
                msg = read.next() => match msg {
                    Some(Ok(Message::Binary(data))) => Self::deliver(&data, lifecycle),
                    Some(Ok(Message::Text(text))) => Self::deliver(text.as_bytes(), lifecycle),
                    Some(Ok(Message::Pong(_))) => {
                        _ = pong_tx.send(Instant::now());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let info = match frame {
                            Some(frame) => Disconnected::new(
                                Some(frame.code.into()),
                                frame.reason.to_string(),
                            ),
                            None => Disconnected::new(None, CLOSED_REASON),
                        };
                        break Ended::Closed(info);
                    }
                    Some(Ok(_)) => {
                        // Pings are answered by tungstenite itself.
                    }
                    Some(Err(e)) => break Self::failed(e, lifecycle),
                    None => break Ended::Closed(Disconnected::new(None, CLOSED_REASON)),
                },

                // Handle outgoing envelopes from the session
                Some(bytes) = sender_rx.recv() => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(len = bytes.len(), "Sending relay frame");

                    if let Err(e) = write.send(Message::Binary(bytes.into())).await {
                        break Self::failed(e, lifecycle);
                    }
                }

                // Handle PING requests from heartbeat loop
                Some(()) = ping_rx.recv() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        break Self::failed(e, lifecycle);
                    }
                }

                // The heartbeat loop only finishes when a PONG is overdue
                _ = &mut heartbeat => {
                    break Ended::Closed(Disconnected::new(None, HEARTBEAT_REASON));
                }
            }
        };

        // Cleanup
        heartbeat.abort();

        ended
    }

    fn deliver(bytes: &[u8], lifecycle: &Lifecycle) {
        match Envelope::deserialize(bytes) {
            Ok(envelope) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(
                    module = %envelope.module,
                    event = %envelope.event,
                    packet_type = %envelope.packet_type,
                    "Received relay envelope"
                );
                lifecycle.message(envelope);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(len = bytes.len(), error = %e, "Dropping undecodable relay message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn failed(e: tokio_tungstenite::tungstenite::Error, lifecycle: &Lifecycle) -> Ended {
        let info = Disconnected::new(None, e.to_string());
        lifecycle.errored(e.into());
        Ended::Closed(info)
    }

    /// Heartbeat loop that sends PING frames and monitors PONG responses.
    async fn heartbeat_loop(
        ping_tx: mpsc::UnboundedSender<()>,
        config: &Config,
        mut pong_rx: watch::Receiver<Instant>,
    ) {
        let mut ping_interval = interval(config.heartbeat_interval);

        loop {
            ping_interval.tick().await;

            // Mark current PONG state as seen before sending PING
            // This prevents changed() from returning immediately due to a stale PONG
            drop(pong_rx.borrow_and_update());

            let ping_sent = Instant::now();
            if ping_tx.send(()).is_err() {
                // Message loop has terminated
                break;
            }

            match timeout(config.heartbeat_timeout, pong_rx.changed()).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(rtt = ?ping_sent.elapsed(), "Relay heartbeat");
                    #[cfg(not(feature = "tracing"))]
                    let _ = ping_sent;
                }
                Ok(Err(_)) => {
                    // Channel closed, connection is terminating
                    break;
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Heartbeat timeout: no PONG received within {:?}",
                        config.heartbeat_timeout
                    );
                    break;
                }
            }
        }
    }

    /// Queue an encoded envelope for the writer.
    ///
    /// Frames queued while no connection is open are discarded when the next one opens.
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.sender_tx
            .send(bytes)
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the connection task, closing a live socket with a normal close frame.
    ///
    /// The state becomes [`ConnectionState::Closed`] once the task has stopped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("shutdown", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
