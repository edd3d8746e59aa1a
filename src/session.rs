//! The host-facing pub/sub session.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use global_relay_client::identity::FileTokenStore;
//! use global_relay_client::session::Session;
//! use global_relay_client::ws::{Credentials, Endpoint};
//!
//! # async fn run() -> global_relay_client::Result<()> {
//! let session = Session::builder()
//!     .credentials(Credentials::new("player-uid", "session-key".to_owned()))
//!     .token_store(Arc::new(FileTokenStore::in_dir("ModData/GlobalRelay")))
//!     .endpoint(Endpoint::Local)
//!     .start()?;
//!
//! let chat = session.clone();
//! session.events().on_connect(move |_| {
//!     // Subscriptions are not remembered across reconnects.
//!     _ = chat.subscribe("chat");
//! });
//! session.events().on_payload(|envelope| {
//!     if let Ok(Some(line)) = envelope.deserialize_packet::<String>() {
//!         println!("{}: {line}", envelope.module);
//!     }
//! });
//!
//! session.broadcast(&"hello".to_owned(), "chat")?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bon::bon;
use tokio::sync::watch;
use uuid::Uuid;

use crate::Result;
use crate::envelope::{CORE_MODULE, Envelope, Packet};
use crate::events::EventBus;
use crate::host::{Dispatcher, Notifier, QueueDispatcher, ReadySignal, TracingNotifier};
use crate::identity::TokenStore;
use crate::ws::endpoint::{self, Credentials, Endpoint};
use crate::ws::{Config, ConnectionManager, ConnectionState, Lifecycle};

/// One relay connection plus the Event Bus its events are published on.
///
/// Cheap to clone; clones share the connection and the bus. Dropping the last clone shuts
/// the connection down.
#[derive(Clone)]
pub struct Session {
    events: Arc<EventBus>,
    connection: ConnectionManager,
    token: Uuid,
}

#[bon]
impl Session {
    /// Resolve the identity token and start connecting in the background.
    ///
    /// Must be called from within a Tokio runtime. Fails without retrying when the token
    /// store cannot produce a token or the connection string is invalid.
    #[builder(finish_fn = start)]
    pub fn new(
        credentials: Credentials,
        token_store: Arc<dyn TokenStore>,
        #[builder(default)] endpoint: Endpoint,
        /// Module the connection itself is registered under
        #[builder(into, default = CORE_MODULE.to_owned())]
        module: String,
        #[builder(default)] config: Config,
        /// Bus to publish on; a fresh one when omitted
        events: Option<Arc<EventBus>>,
        /// Where listener calls and notices run; a [`QueueDispatcher`] when omitted
        dispatcher: Option<Arc<dyn Dispatcher>>,
        /// Where user notices go; a [`TracingNotifier`] when omitted
        notifier: Option<Arc<dyn Notifier>>,
        /// Gate for the first connection attempt
        #[builder(default = ReadySignal::ready())]
        ready: ReadySignal,
        /// Shown to the user when the client hits an error
        #[builder(into)]
        log_path: Option<PathBuf>,
    ) -> Result<Self> {
        let token = token_store.get_or_create_token().inspect_err(|e| {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "Unable to resolve relay identity token");
            #[cfg(not(feature = "tracing"))]
            let _ = e;
        })?;

        let url = endpoint::connection_url(&endpoint, &credentials, token, &module)?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            endpoint = %endpoint::redact_endpoint(&url),
            %module,
            "Starting relay session"
        );

        let events = events.unwrap_or_default();
        let dispatcher = dispatcher.unwrap_or_else(|| Arc::new(QueueDispatcher::spawn()));
        let notifier = notifier.unwrap_or_else(|| Arc::new(TracingNotifier));

        let lifecycle = Lifecycle::new(Arc::clone(&events), dispatcher, notifier, log_path);
        let connection = ConnectionManager::spawn(url, config, lifecycle, ready);

        Ok(Self {
            events,
            connection,
            token,
        })
    }

    /// The bus this session publishes connection events and inbound envelopes on.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Identity token presented to the relay.
    #[must_use]
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Send `packet` to every subscriber of `module`.
    ///
    /// Does nothing unless connected; nothing is queued for later. Encoding errors are
    /// returned to the caller.
    pub fn broadcast<P: Packet>(&self, packet: &P, module: &str) -> Result<()> {
        if !self.connection.state().is_connected() {
            #[cfg(feature = "tracing")]
            tracing::debug!(module, "Not connected, dropping broadcast");
            return Ok(());
        }

        let bytes = Envelope::broadcast(module).serialize_with(packet)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(module, packet_type = P::PACKET_TYPE, "Broadcasting");

        self.connection.send(bytes)
    }

    /// Ask the relay to deliver `module`'s broadcasts to this connection.
    ///
    /// Same policy as [`broadcast`](Self::broadcast). The relay forgets subscriptions when
    /// the connection drops, so re-subscribe from an `on_connect` listener.
    pub fn subscribe(&self, module: &str) -> Result<()> {
        if !self.connection.state().is_connected() {
            #[cfg(feature = "tracing")]
            tracing::debug!(module, "Not connected, dropping subscribe");
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(module, "Subscribing");

        self.connection.send(Envelope::subscribe(module).serialize())
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_receiver()
    }

    /// Close the connection and stop reconnecting. Affects every clone.
    pub fn shutdown(&self) {
        self.connection.shutdown();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("connection", &self.connection)
            .field("events", &self.events)
            .finish()
    }
}
