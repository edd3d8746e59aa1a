//! Seams to the application hosting the session.
//!
//! The transport runs on its own task, but everything a host can observe (event
//! listeners, user-facing messages) is handed to a [`Dispatcher`] so the host decides
//! where it runs. [`QueueDispatcher`] runs work serially on one Tokio task;
//! [`InlineDispatcher`] runs it immediately on the transport task.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

/// Unit of work scheduled onto the host context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Schedules work on the host's designated execution context.
///
/// Implementations must run tasks in the order they were enqueued and never two at once.
pub trait Dispatcher: Send + Sync + 'static {
    /// Run `task` later on the host context. `label` identifies the task in logs.
    fn enqueue(&self, task: Task, label: String);
}

/// Runs each task synchronously on the enqueuing thread.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn enqueue(&self, task: Task, label: String) {
        run(task, &label);
    }
}

/// FIFO queue drained by a single Tokio task.
///
/// Cheap to clone; all clones feed the same queue. The draining task stops once every
/// clone has been dropped.
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: mpsc::UnboundedSender<(String, Task)>,
}

impl QueueDispatcher {
    /// Start the draining task. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Task)>();

        tokio::spawn(async move {
            while let Some((label, task)) = rx.recv().await {
                run(task, &label);
            }
        });

        Self { tx }
    }
}

impl Dispatcher for QueueDispatcher {
    fn enqueue(&self, task: Task, label: String) {
        if let Err(rejected) = self.tx.send((label, task)) {
            #[cfg(feature = "tracing")]
            tracing::warn!(label = %rejected.0.0, "Dispatch queue closed, dropping task");
            #[cfg(not(feature = "tracing"))]
            drop(rejected);
        }
    }
}

impl fmt::Debug for QueueDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

fn run(task: Task, label: &str) {
    #[cfg(feature = "tracing")]
    tracing::trace!(label, "Running dispatched task");

    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        #[cfg(feature = "tracing")]
        tracing::error!(label, "Dispatched task panicked");
        #[cfg(not(feature = "tracing"))]
        let _ = label;
    }
}

/// Surfaces short status lines to the user (chat line, toast, status bar).
pub trait Notifier: Send + Sync + 'static {
    fn show_message(&self, message: &str);
}

impl<F> Notifier for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn show_message(&self, message: &str) {
        self(message);
    }
}

/// Writes user-facing messages to the log at `info`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show_message(&self, message: &str) {
        #[cfg(feature = "tracing")]
        tracing::info!(target: "global_relay_client::notice", "{message}");
        #[cfg(not(feature = "tracing"))]
        let _ = message;
    }
}

/// One-shot "host is ready" notification.
///
/// The session does not open its socket until [`ReadySignal::notify_ready`] has been
/// called on any clone of the signal it was built with.
#[derive(Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadySignal {
    /// A signal that has not fired yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(false)),
        }
    }

    /// A signal that has already fired.
    #[must_use]
    pub fn ready() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(true)),
        }
    }

    /// Mark the host ready. Calling this more than once has no further effect.
    pub fn notify_ready(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once ready.
        _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReadySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadySignal")
            .field("ready", &self.is_ready())
            .finish()
    }
}
