//! Multicast notifications for connection lifecycle and inbound payloads.
//!
//! An [`EventBus`] has four independent channels. Listeners on a channel run
//! synchronously, in registration order, on whichever context emits; for a running
//! [`Session`](crate::session::Session) that is the host dispatcher.
//!
//! ```
//! use global_relay_client::events::EventBus;
//!
//! let bus = EventBus::new();
//! let id = bus.on_payload(|envelope| {
//!     if envelope.module == "chat" {
//!         // decode and handle
//!     }
//! });
//!
//! assert!(bus.remove(id));
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use crate::envelope::Envelope;
use crate::error::Error;

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Emitted when the socket reaches the connected state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Connected {
    /// When the connection was established
    pub since: Instant,
}

/// Emitted when a connected socket goes away.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    /// Close code sent by the peer, if any
    pub code: Option<u16>,
    /// Human-readable close reason
    pub reason: String,
}

impl Disconnected {
    #[must_use]
    pub fn new<S: Into<String>>(code: Option<u16>, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Disconnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code})", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

/// Emitted for transport failures. A disconnect may or may not follow.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct TransportError {
    /// Rendered error message
    pub message: String,
    /// The underlying error
    pub error: Arc<Error>,
}

impl From<Error> for TransportError {
    fn from(error: Error) -> Self {
        Self {
            message: error.to_string(),
            error: Arc::new(error),
        }
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of listeners for one event type.
pub struct Listeners<T: ?Sized> {
    entries: RwLock<Vec<(ListenerId, Listener<T>)>>,
}

impl<T: ?Sized> Listeners<T> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn push(&self, id: ListenerId, listener: Listener<T>) {
        // A panic while holding this lock cannot leave the Vec half-updated.
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener with `event`, returning how many ran to completion.
    ///
    /// The list is copied first so listeners may register, remove, or publish without
    /// deadlocking. A panicking listener is logged and skipped.
    fn emit(&self, channel: &'static str, event: &T) -> usize {
        let snapshot: Vec<(ListenerId, Listener<T>)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut completed = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        channel,
                        listener = ?id,
                        panic = panic_message(&*panic),
                        "Event listener panicked"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = (channel, id, panic_message(&*panic));
                }
            }
        }

        completed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Process-scoped hub for the four session event channels.
///
/// Construct one per session (or share one across sessions via `Arc`); separate buses
/// never see each other's listeners.
pub struct EventBus {
    next_id: AtomicU64,
    connect: Listeners<Connected>,
    disconnect: Listeners<Disconnected>,
    error: Listeners<TransportError>,
    payload: Listeners<Envelope>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connect: Listeners::new(),
            disconnect: Listeners::new(),
            error: Listeners::new(),
            payload: Listeners::new(),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Called every time the session (re)connects; the place to re-issue subscriptions.
    pub fn on_connect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Connected) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.connect.push(id, Arc::new(listener));
        id
    }

    /// Called when a connected socket closes, unexpectedly or through shutdown.
    pub fn on_disconnect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Disconnected) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.disconnect.push(id, Arc::new(listener));
        id
    }

    /// Called for every transport error.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.error.push(id, Arc::new(listener));
        id
    }

    /// Called for every inbound envelope, whatever its module.
    pub fn on_payload<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.payload.push(id, Arc::new(listener));
        id
    }

    /// Remove a listener from whichever channel it was registered on.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.connect.remove(id)
            || self.disconnect.remove(id)
            || self.error.remove(id)
            || self.payload.remove(id)
    }

    pub fn emit_connect(&self, event: &Connected) -> usize {
        self.connect.emit("connect", event)
    }

    pub fn emit_disconnect(&self, event: &Disconnected) -> usize {
        self.disconnect.emit("disconnect", event)
    }

    pub fn emit_error(&self, event: &TransportError) -> usize {
        self.error.emit("error", event)
    }

    pub fn emit_payload(&self, envelope: &Envelope) -> usize {
        self.payload.emit("payload", envelope)
    }

    #[must_use]
    pub fn connect_listeners(&self) -> &Listeners<Connected> {
        &self.connect
    }

    #[must_use]
    pub fn disconnect_listeners(&self) -> &Listeners<Disconnected> {
        &self.disconnect
    }

    #[must_use]
    pub fn error_listeners(&self) -> &Listeners<TransportError> {
        &self.error
    }

    #[must_use]
    pub fn payload_listeners(&self) -> &Listeners<Envelope> {
        &self.payload
    }

    /// Total listeners across all channels.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.connect.len() + self.disconnect.len() + self.error.len() + self.payload.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("connect", &self.connect.len())
            .field("disconnect", &self.disconnect.len())
            .field("error", &self.error.len())
            .field("payload", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        (calls, move |name| sink.lock().unwrap().push(name))
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let (calls, record) = recorder();

        for name in ["l1", "l2", "l3"] {
            let record = record.clone();
            bus.on_disconnect(move |_| record(name));
        }

        let invoked = bus.emit_disconnect(&Disconnected::new(None, "test"));

        assert_eq!(invoked, 3);
        assert_eq!(*calls.lock().unwrap(), vec!["l1", "l2", "l3"]);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let bus = EventBus::new();
        let (calls, record) = recorder();

        let first = record.clone();
        bus.on_connect(move |_| first("l1"));
        bus.on_connect(|_| panic!("listener failure"));
        let third = record.clone();
        bus.on_connect(move |_| third("l3"));

        let completed = bus.emit_connect(&Connected {
            since: Instant::now(),
        });

        assert_eq!(completed, 2);
        assert_eq!(*calls.lock().unwrap(), vec!["l1", "l3"]);
    }

    #[test]
    fn channels_are_independent() {
        let bus = EventBus::new();
        let (calls, record) = recorder();

        bus.on_connect(move |_| record("connect"));

        let invoked = bus.emit_payload(&Envelope::broadcast("chat"));

        assert_eq!(invoked, 0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn removed_listener_is_not_invoked() {
        let bus = EventBus::new();
        let (calls, record) = recorder();

        let keep = record.clone();
        bus.on_payload(move |_| keep("kept"));
        let id = bus.on_payload(move |_| record("removed"));

        assert!(bus.remove(id));
        assert!(!bus.remove(id), "second removal finds nothing");

        bus.emit_payload(&Envelope::broadcast("chat"));

        assert_eq!(*calls.lock().unwrap(), vec!["kept"]);
        assert_eq!(bus.payload_listeners().len(), 1);
    }

    #[test]
    fn listener_may_register_while_emitting() {
        let bus = Arc::new(EventBus::new());
        let (calls, record) = recorder();

        let inner_bus = Arc::clone(&bus);
        bus.on_error(move |_| {
            let record = record.clone();
            inner_bus.on_error(move |_| record("late"));
        });

        let event = TransportError::from(Error::validation("boom"));
        assert_eq!(bus.emit_error(&event), 1);
        assert!(calls.lock().unwrap().is_empty(), "late listener joins next emit");

        bus.emit_error(&event);
        assert_eq!(*calls.lock().unwrap(), vec!["late"]);
        assert_eq!(bus.error_listeners().len(), 3);
    }

    #[test]
    fn separate_buses_do_not_share_listeners() {
        let first = EventBus::new();
        let second = EventBus::new();

        first.on_connect(|_| {});

        assert_eq!(first.listener_count(), 1);
        assert_eq!(second.listener_count(), 0);
        assert!(second.connect_listeners().is_empty());
    }

    #[test]
    fn disconnected_display_includes_code() {
        assert_eq!(
            Disconnected::new(Some(1001), "going away").to_string(),
            "going away (1001)"
        );
        assert_eq!(Disconnected::new(None, "reset").to_string(), "reset");
    }
}
