//! In-memory broker and backend drivers.
//!
//! Both drivers speak the full wire contract over process-local channels:
//! frames are real [`crate::frame`] blobs, receipts are consumed, and
//! back-pressure comes from bounded channels. They exist so a
//! driver-backed bridge can run without external infrastructure — in
//! tests, and as the default transport for single-process deployments.

use super::{Consumer, DriverError, NamedConsumer, Producer, Reporter, Store};
use crate::events::{Event, EventChannel, EventLevel};
use crate::frame::peek_header;
use crate::report::Receipt;
use crate::task::Task;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An in-memory broker: one default queue plus per-name queues for named
/// subscriptions. Frames sent before a listener attaches are buffered up
/// to the queue capacity.
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    capacity: usize,
    default_tx: StdMutex<Option<mpsc::Sender<Bytes>>>,
    default_rx: StdMutex<Option<mpsc::Receiver<Bytes>>>,
    named: StdMutex<HashMap<String, mpsc::Sender<Bytes>>>,
    shutdown: CancellationToken,
    events: EventChannel,
}

impl MemoryBroker {
    /// Creates a broker whose queues buffer up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(BrokerInner {
                capacity,
                default_tx: StdMutex::new(Some(tx)),
                default_rx: StdMutex::new(Some(rx)),
                named: StdMutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                events: EventChannel::new("broker.memory"),
            }),
        }
    }

    fn spawn_receipt_drain(&self, mut receipts: mpsc::Receiver<Receipt>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let receipt = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    receipt = receipts.recv() => match receipt {
                        Some(receipt) => receipt,
                        None => break,
                    },
                };
                if !receipt.is_accepted() {
                    inner.events.emit(
                        EventLevel::Warn,
                        format!("task {} rejected by runtime", receipt.id()),
                    );
                }
            }
        });
    }
}

impl Clone for MemoryBroker {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Producer for MemoryBroker {
    fn send(&self, frame: Bytes) -> BoxFuture<'_, Result<(), DriverError>> {
        Box::pin(async move {
            let header =
                peek_header(&frame).map_err(|e| DriverError::SendFailed(e.to_string()))?;

            let named_tx = {
                let named = self.inner.named.lock().expect("broker named lock poisoned");
                named.get(header.name()).cloned()
            };
            if let Some(tx) = named_tx {
                return tx.send(frame).await.map_err(|_| DriverError::Closed);
            }

            let default_tx = {
                let guard = self
                    .inner
                    .default_tx
                    .lock()
                    .expect("broker default lock poisoned");
                guard.clone()
            };
            match default_tx {
                Some(tx) => tx.send(frame).await.map_err(|_| DriverError::Closed),
                None => Err(DriverError::Closed),
            }
        })
    }
}

impl Consumer for MemoryBroker {
    fn add_listener(
        &self,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Bytes>, DriverError> {
        let rx = self
            .inner
            .default_rx
            .lock()
            .expect("broker default lock poisoned")
            .take()
            .ok_or_else(|| DriverError::Listener("default listener already attached".into()))?;
        self.spawn_receipt_drain(receipts);
        debug!("memory broker listener attached");
        Ok(rx)
    }

    fn stop_all_listeners(&self) -> Result<(), DriverError> {
        self.inner.shutdown.cancel();
        // Dropping the senders ends the frame streams.
        self.inner
            .default_tx
            .lock()
            .expect("broker default lock poisoned")
            .take();
        self.inner
            .named
            .lock()
            .expect("broker named lock poisoned")
            .clear();
        Ok(())
    }

    fn events(&self) -> Vec<mpsc::UnboundedReceiver<Event>> {
        self.inner.events.take().into_iter().collect()
    }
}

impl NamedConsumer for MemoryBroker {
    fn add_named_listener(
        &self,
        name: &str,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Bytes>, DriverError> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        {
            let mut named = self.inner.named.lock().expect("broker named lock poisoned");
            if named.contains_key(name) {
                return Err(DriverError::Listener(format!(
                    "listener for {:?} already attached",
                    name
                )));
            }
            named.insert(name.to_string(), tx);
        }
        self.spawn_receipt_drain(receipts);
        debug!(name, "memory broker named listener attached");
        Ok(rx)
    }
}

/// An in-memory backend: per-task mailboxes keyed by task ID.
///
/// Report frames arriving before the caller polls are buffered in the
/// mailbox channel; the reporter loop back-pressures once a mailbox is
/// full. Mailboxes live until the backend is dropped — the backend cannot
/// see terminal statuses inside opaque frames.
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    capacity: usize,
    mailboxes: DashMap<String, Mailbox>,
    shutdown: CancellationToken,
    events: EventChannel,
}

struct Mailbox {
    tx: mpsc::Sender<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl MemoryBackend {
    /// Creates a backend whose mailboxes buffer up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                capacity,
                mailboxes: DashMap::new(),
                shutdown: CancellationToken::new(),
                events: EventChannel::new("backend.memory"),
            }),
        }
    }

    fn mailbox_sender(&self, id: &str) -> mpsc::Sender<Bytes> {
        let mut entry = self
            .inner
            .mailboxes
            .entry(id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.inner.capacity);
                Mailbox { tx, rx: Some(rx) }
            });
        entry.value_mut().tx.clone()
    }
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Reporter for MemoryBackend {
    fn report(&self, mut frames: mpsc::Receiver<Bytes>) -> Result<(), DriverError> {
        let backend = self.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = backend.inner.shutdown.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let id = match peek_header(&frame) {
                    Ok(header) => header.id().to_string(),
                    Err(e) => {
                        backend
                            .inner
                            .events
                            .emit(EventLevel::Warn, format!("dropping bad frame: {}", e));
                        continue;
                    }
                };
                let tx = backend.mailbox_sender(&id);
                if tx.send(frame).await.is_err() {
                    backend
                        .inner
                        .events
                        .emit(EventLevel::Warn, format!("mailbox for {} gone", id));
                }
            }
        });
        Ok(())
    }
}

impl Store for MemoryBackend {
    fn poll(&self, task: &Task) -> BoxFuture<'_, Result<mpsc::Receiver<Bytes>, DriverError>> {
        let id = task.id().to_string();
        Box::pin(async move {
            let mut entry = self.inner.mailboxes.entry(id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.inner.capacity);
                Mailbox { tx, rx: Some(rx) }
            });
            entry
                .value_mut()
                .rx
                .take()
                .ok_or_else(|| DriverError::Listener(format!("task {} already polled", id)))
        })
    }

    fn events(&self) -> Vec<mpsc::UnboundedReceiver<Event>> {
        self.inner.events.take().into_iter().collect()
    }
}
