//! Operational event streams.
//!
//! Components emit structured events on channels instead of presenting
//! them: consumers (logging, UI, metrics) decide how to surface them.
//! Event channels are unbounded and never closed while the emitting
//! component is alive; the receiving half of each channel is handed out
//! exactly once through `events()`.

use std::sync::Mutex;
use tokio::sync::mpsc;

/// Severity of an operational event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal lifecycle information.
    Info,
    /// Recoverable anomalies (dropped frames, rejected receipts).
    Warn,
    /// Failures that degrade the component.
    Error,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A structured operational event from the bridge or an attached driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    level: EventLevel,
    origin: &'static str,
    payload: String,
}

impl Event {
    /// Creates an event.
    pub fn new(level: EventLevel, origin: &'static str, payload: impl Into<String>) -> Self {
        Self {
            level,
            origin,
            payload: payload.into(),
        }
    }

    /// The severity.
    pub fn level(&self) -> EventLevel {
        self.level
    }

    /// The emitting component, e.g. `"bridge.local"` or `"broker.memory"`.
    pub fn origin(&self) -> &'static str {
        self.origin
    }

    /// The human-readable event description.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.origin, self.payload)
    }
}

/// One component's event channel: emit on the sending half, hand the
/// receiving half out once.
pub(crate) struct EventChannel {
    origin: &'static str,
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl EventChannel {
    pub(crate) fn new(origin: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            origin,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Emits an event; silently dropped if the receiver was discarded.
    pub(crate) fn emit(&self, level: EventLevel, payload: impl Into<String>) {
        let _ = self.tx.send(Event::new(level, self.origin, payload));
    }

    /// Takes the receiving half. Returns `None` after the first call.
    pub(crate) fn take(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.rx.lock().expect("event channel lock poisoned").take()
    }
}
