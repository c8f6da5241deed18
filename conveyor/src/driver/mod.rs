//! Consumed driver interfaces.
//!
//! Broker drivers transport task frames from producers to consumers;
//! backend drivers transport report frames from reporters to stores. The
//! runtime only ever sees these traits — concrete drivers (in-memory,
//! AMQP, Redis, …) live behind them. All frames are opaque bytes framed
//! by [`crate::frame`]; drivers that route by function name may
//! [`crate::frame::peek_header`] without decoding payloads.

pub mod memory;

use crate::events::Event;
use crate::report::Receipt;
use crate::task::Task;
use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryBackend, MemoryBroker};

/// Errors surfaced by driver implementations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver has been stopped or its transport is gone.
    #[error("driver closed")]
    Closed,

    /// A frame could not be handed to the transport.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A listener could not be set up.
    #[error("listener setup failed: {0}")]
    Listener(String),
}

/// Broker-side producer: ships encoded task frames out.
pub trait Producer: Send + Sync {
    /// Sends one task frame. Blocks on a full broker queue.
    fn send(&self, frame: Bytes) -> BoxFuture<'_, Result<(), DriverError>>;
}

/// Broker-side consumer: delivers task frames to a listener loop.
pub trait Consumer: Send + Sync {
    /// Subscribes a listener. The returned channel carries task frames;
    /// the passed channel carries receipts back to the broker and stays
    /// owned by the caller.
    fn add_listener(
        &self,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Bytes>, DriverError>;

    /// Halts all consumer loops and closes their frame channels.
    /// Receipt channels are left untouched.
    fn stop_all_listeners(&self) -> Result<(), DriverError>;

    /// Hands out the driver's event streams. May return an empty set, and
    /// returns an empty set on every call after the first.
    fn events(&self) -> Vec<mpsc::UnboundedReceiver<Event>> {
        Vec::new()
    }
}

/// Optional broker capability: per-name subscriptions.
pub trait NamedConsumer: Send + Sync {
    /// Subscribes a listener receiving only frames for `name`.
    fn add_named_listener(
        &self,
        name: &str,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Bytes>, DriverError>;
}

/// Backend-side reporter: ships encoded report frames out.
pub trait Reporter: Send + Sync {
    /// Attaches a stream of encoded report frames for transport. The
    /// driver consumes the channel until it closes.
    fn report(&self, frames: mpsc::Receiver<Bytes>) -> Result<(), DriverError>;
}

/// Backend-side store: delivers report frames for one task.
pub trait Store: Send + Sync {
    /// Subscribes to the report frames of the given task.
    fn poll(&self, task: &Task) -> BoxFuture<'_, Result<mpsc::Receiver<Bytes>, DriverError>>;

    /// Hands out the driver's event streams, as [`Consumer::events`].
    fn events(&self) -> Vec<mpsc::UnboundedReceiver<Event>> {
        Vec::new()
    }
}
