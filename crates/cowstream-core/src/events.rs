//! Job event records and their delivery to subscribers
//!
//! Every subscriber gets its own unbounded queue, so a slow consumer never
//! loses an event and never slows down the job that emits it.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::mpsc;

/// Kind of block job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Copy-down of a backing chain into its top layer
    Stream,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Stream => write!(f, "stream"),
        }
    }
}

/// How a job terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Whole image processed
    Completed,
    /// Stopped on operator request
    Cancelled,
    /// Stopped by a storage failure
    Error,
}

/// Immutable record of a job reaching a terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// What happened
    pub kind: EventKind,

    /// Device the job ran on
    pub device: String,

    /// Job type tag
    pub job_type: JobType,

    /// Progress cursor when the event fired
    pub offset: u64,

    /// Total logical length of the image
    pub len: u64,

    /// Configured speed limit in bytes per second
    pub speed: u64,

    /// Failure detail for [`EventKind::Error`]
    pub error: Option<String>,

    /// When the event was recorded
    pub timestamp: SystemTime,
}

/// Fan-out of events to any number of subscribers
#[derive(Debug, Default)]
pub struct EventNotifier {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl EventNotifier {
    /// Create a notifier without subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber; it receives every event emitted from now on
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        EventStream { rx }
    }

    /// Deliver `event` to every live subscriber.
    ///
    /// Never blocks; subscribers that went away are dropped.
    pub fn emit(&self, event: Event) {
        tracing::debug!(
            device = %event.device,
            kind = ?event.kind,
            "Emitting block job event"
        );
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Wait for the next event; `None` once the notifier is gone
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
