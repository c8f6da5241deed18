//! The bridge: one uniform interface over broker and backend access.
//!
//! Two flavors implement [`Bridge`]:
//!
//! - [`LocalBridge`] short-circuits producer, consumer, reporter and
//!   store through in-process channels — tasks and reports never touch
//!   bytes;
//! - [`DefaultBridge`] delegates to attached driver implementations,
//!   encoding tasks and reports through the marshaller registry on the
//!   way out and decoding them on the way in.
//!
//! A listener moves Idle → Active (`add_listener`) → Stopping
//! (`stop_all_listeners`) → Stopped (consumer loop exit). Receipt
//! channels passed into listeners stay owned by the caller and are never
//! closed by the bridge.

mod default;
mod local;

pub use default::DefaultBridge;
pub use local::LocalBridge;

use crate::driver::{Consumer, DriverError, NamedConsumer, Producer, Reporter, Store};
use crate::events::Event;
use crate::registry::RegistryError;
use crate::report::{Receipt, Report};
use crate::task::Task;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Bridge errors, returned synchronously at the call site.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The role already has a bound implementation.
    #[error("{0} already attached")]
    AlreadyAttached(&'static str),

    /// The role has no bound implementation yet.
    #[error("{0} not attached")]
    NotAttached(&'static str),

    /// The attached driver lacks the requested capability.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The report stream for this task was already handed out.
    #[error("report stream for task {0} already claimed")]
    StreamClaimed(String),

    /// The bridge has been closed.
    #[error("bridge closed")]
    Closed,

    /// Encode/decode failure in the marshaller registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Failure inside an attached driver.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Bit mask of the four driver roles a bridge can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roles(u8);

impl Roles {
    /// No roles.
    pub const NONE: Roles = Roles(0);
    /// The broker-side producer seat.
    pub const PRODUCER: Roles = Roles(1);
    /// The broker-side consumer seat.
    pub const CONSUMER: Roles = Roles(1 << 1);
    /// The backend-side reporter seat.
    pub const REPORTER: Roles = Roles(1 << 2);
    /// The backend-side store seat.
    pub const STORE: Roles = Roles(1 << 3);
    /// All four seats.
    pub const ALL: Roles = Roles(0b1111);

    /// True when every bit of `other` is present in `self`.
    pub fn contains(self, other: Roles) -> bool {
        self.0 & other.0 == other.0
    }

    /// Adds the given roles.
    pub fn insert(&mut self, other: Roles) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Roles {
    type Output = Roles;

    fn bitor(self, rhs: Roles) -> Roles {
        Roles(self.0 | rhs.0)
    }
}

/// Uniform facade over broker and backend access.
///
/// All methods take `&self`; implementations use interior mutability and
/// spawned loops. Entry points that may suspend return boxed futures so
/// the trait stays object-safe.
pub trait Bridge: Send + Sync {
    /// Ships a task toward the worker side. Blocks on transport
    /// back-pressure.
    fn send_task(&self, task: Task) -> BoxFuture<'_, Result<(), BridgeError>>;

    /// Subscribes a consumer loop emitting decoded tasks. The receipt
    /// channel flows back to the broker and stays owned by the caller.
    fn add_listener(
        &self,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Task>, BridgeError>;

    /// Name-routed variant of [`Bridge::add_listener`]. Fails with
    /// [`BridgeError::NotSupported`] when the attached consumer lacks the
    /// named-subscription capability.
    fn add_named_listener(
        &self,
        name: &str,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Task>, BridgeError>;

    /// Halts all consumer loops and closes their task channels.
    fn stop_all_listeners(&self) -> Result<(), BridgeError>;

    /// Attaches a stream of reports to ship toward callers. One stream
    /// per worker report channel.
    fn report(&self, reports: mpsc::Receiver<Report>) -> Result<(), BridgeError>;

    /// Returns the report stream for a task, creating it on first call.
    fn poll(&self, task: &Task) -> BoxFuture<'_, Result<mpsc::Receiver<Report>, BridgeError>>;

    /// Binds the producer seat. At most once.
    fn attach_producer(&self, producer: Arc<dyn Producer>) -> Result<(), BridgeError>;

    /// Binds the consumer seat. At most once.
    fn attach_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), BridgeError>;

    /// Binds the named-consumer capability. At most once.
    fn attach_named_consumer(&self, consumer: Arc<dyn NamedConsumer>) -> Result<(), BridgeError>;

    /// Binds the reporter seat. At most once.
    fn attach_reporter(&self, reporter: Arc<dyn Reporter>) -> Result<(), BridgeError>;

    /// Binds the store seat. At most once.
    fn attach_store(&self, store: Arc<dyn Store>) -> Result<(), BridgeError>;

    /// True when every role in the mask has a bound implementation.
    fn exists(&self, roles: Roles) -> bool;

    /// Hands out the bridge's event streams plus those of attached
    /// drivers. Streams are handed out once; later calls return an empty
    /// set.
    fn events(&self) -> Vec<mpsc::UnboundedReceiver<Event>>;

    /// Stops every internal loop and closes outstanding report streams.
    /// Idempotent.
    fn close(&self) -> BoxFuture<'_, Result<(), BridgeError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_contains() {
        let both = Roles::PRODUCER | Roles::CONSUMER;
        assert!(both.contains(Roles::PRODUCER));
        assert!(both.contains(Roles::CONSUMER));
        assert!(!both.contains(Roles::REPORTER));
        assert!(Roles::ALL.contains(both));
        assert!(both.contains(Roles::NONE));
    }

    #[test]
    fn test_roles_insert() {
        let mut roles = Roles::NONE;
        roles.insert(Roles::STORE);
        assert!(roles.contains(Roles::STORE));
        assert!(!roles.contains(Roles::PRODUCER));
    }
}
