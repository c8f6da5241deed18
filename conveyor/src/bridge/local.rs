//! The local bridge: broker and backend short-circuited in process.
//!
//! Tasks submitted with `send_task` land directly on a listener's task
//! channel; reports are forwarded to per-task streams through an ID-keyed
//! map — no byte round-trip anywhere. The same `Task` and `Report`
//! objects a remote deployment would reconstruct from frames traverse the
//! same channels here.

use super::{Bridge, BridgeError, Roles};
use crate::config::RuntimeConfig;
use crate::driver::{Consumer, NamedConsumer, Producer, Reporter, Store};
use crate::events::{Event, EventChannel, EventLevel};
use crate::report::{Receipt, Report};
use crate::task::Task;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct ListenerState {
    default_txs: Vec<mpsc::Sender<Task>>,
    named_txs: HashMap<String, mpsc::Sender<Task>>,
    next_default: usize,
    stopped: bool,
}

struct AttachState {
    roles: Roles,
    named: bool,
}

struct PollSlot {
    tx: mpsc::Sender<Report>,
    rx: Option<mpsc::Receiver<Report>>,
}

/// The in-process bridge flavor.
pub struct LocalBridge {
    listeners: StdMutex<ListenerState>,
    attached: StdMutex<AttachState>,
    polls: Arc<DashMap<String, PollSlot>>,
    loops: StdMutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    events: Arc<EventChannel>,
    driver_events: StdMutex<Vec<mpsc::UnboundedReceiver<Event>>>,
    task_capacity: usize,
    report_capacity: usize,
}

impl LocalBridge {
    /// Creates a local bridge sized by the runtime configuration.
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            listeners: StdMutex::new(ListenerState {
                default_txs: Vec::new(),
                named_txs: HashMap::new(),
                next_default: 0,
                stopped: false,
            }),
            attached: StdMutex::new(AttachState {
                roles: Roles::NONE,
                named: false,
            }),
            polls: Arc::new(DashMap::new()),
            loops: StdMutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            events: Arc::new(EventChannel::new("bridge.local")),
            driver_events: StdMutex::new(Vec::new()),
            task_capacity: config.task_channel_capacity,
            report_capacity: config.report_stream_capacity,
        }
    }

    fn attach_role(&self, role: Roles, what: &'static str) -> Result<(), BridgeError> {
        let mut attached = self.attached.lock().expect("bridge attach lock poisoned");
        if attached.roles.contains(role) {
            return Err(BridgeError::AlreadyAttached(what));
        }
        attached.roles.insert(role);
        Ok(())
    }

    fn spawn_receipt_drain(&self, mut receipts: mpsc::Receiver<Receipt>) {
        let events = Arc::clone(&self.events);
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                let receipt = tokio::select! {
                    _ = token.cancelled() => break,
                    receipt = receipts.recv() => match receipt {
                        Some(receipt) => receipt,
                        None => break,
                    },
                };
                if !receipt.is_accepted() {
                    events.emit(
                        EventLevel::Warn,
                        format!("task {} rejected by mapper", receipt.id()),
                    );
                }
            }
        });
        self.loops
            .lock()
            .expect("bridge loop lock poisoned")
            .push(handle);
    }

    fn poll_sender(polls: &DashMap<String, PollSlot>, id: &str, capacity: usize) -> mpsc::Sender<Report> {
        let mut slot = polls.entry(id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(capacity);
            PollSlot { tx, rx: Some(rx) }
        });
        slot.value_mut().tx.clone()
    }
}

impl Bridge for LocalBridge {
    fn send_task(&self, task: Task) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            let tx = {
                let mut listeners = self.listeners.lock().expect("bridge listener lock poisoned");
                if listeners.stopped {
                    return Err(BridgeError::Closed);
                }
                if let Some(tx) = listeners.named_txs.get(task.name()) {
                    tx.clone()
                } else if listeners.default_txs.is_empty() {
                    return Err(BridgeError::NotAttached("listener"));
                } else {
                    let index = listeners.next_default % listeners.default_txs.len();
                    listeners.next_default = listeners.next_default.wrapping_add(1);
                    listeners.default_txs[index].clone()
                }
            };
            tx.send(task).await.map_err(|_| BridgeError::Closed)
        })
    }

    fn add_listener(
        &self,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Task>, BridgeError> {
        let (tx, rx) = mpsc::channel(self.task_capacity);
        {
            let mut listeners = self.listeners.lock().expect("bridge listener lock poisoned");
            if listeners.stopped {
                return Err(BridgeError::Closed);
            }
            listeners.default_txs.push(tx);
        }
        self.spawn_receipt_drain(receipts);
        debug!("local bridge listener active");
        Ok(rx)
    }

    fn add_named_listener(
        &self,
        name: &str,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Task>, BridgeError> {
        let (tx, rx) = mpsc::channel(self.task_capacity);
        {
            let mut listeners = self.listeners.lock().expect("bridge listener lock poisoned");
            if listeners.stopped {
                return Err(BridgeError::Closed);
            }
            if listeners.named_txs.contains_key(name) {
                return Err(BridgeError::AlreadyAttached("named listener"));
            }
            listeners.named_txs.insert(name.to_string(), tx);
        }
        self.spawn_receipt_drain(receipts);
        debug!(name, "local bridge named listener active");
        Ok(rx)
    }

    fn stop_all_listeners(&self) -> Result<(), BridgeError> {
        let mut listeners = self.listeners.lock().expect("bridge listener lock poisoned");
        listeners.stopped = true;
        listeners.default_txs.clear();
        listeners.named_txs.clear();
        debug!("local bridge listeners stopped");
        Ok(())
    }

    fn report(&self, mut reports: mpsc::Receiver<Report>) -> Result<(), BridgeError> {
        let polls = Arc::clone(&self.polls);
        let token = self.shutdown.clone();
        let capacity = self.report_capacity;

        let handle = tokio::spawn(async move {
            loop {
                let report = tokio::select! {
                    _ = token.cancelled() => break,
                    report = reports.recv() => match report {
                        Some(report) => report,
                        None => break,
                    },
                };
                let id = report.id().to_string();
                let terminal = report.is_done();
                let tx = LocalBridge::poll_sender(&polls, &id, capacity);
                if tx.send(report).await.is_err() {
                    warn!(id = %id, "report stream dropped before terminal");
                }
                if terminal {
                    polls.remove(&id);
                }
            }

            // Teardown: forward whatever is already buffered, best effort.
            while let Ok(report) = reports.try_recv() {
                let id = report.id().to_string();
                let terminal = report.is_done();
                let tx = LocalBridge::poll_sender(&polls, &id, capacity);
                let _ = tx.try_send(report);
                if terminal {
                    polls.remove(&id);
                }
            }
        });

        self.loops
            .lock()
            .expect("bridge loop lock poisoned")
            .push(handle);
        Ok(())
    }

    fn poll(&self, task: &Task) -> BoxFuture<'_, Result<mpsc::Receiver<Report>, BridgeError>> {
        let id = task.id().to_string();
        Box::pin(async move {
            let mut slot = self.polls.entry(id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.report_capacity);
                PollSlot { tx, rx: Some(rx) }
            });
            slot.value_mut()
                .rx
                .take()
                .ok_or(BridgeError::StreamClaimed(id))
        })
    }

    fn attach_producer(&self, _producer: Arc<dyn Producer>) -> Result<(), BridgeError> {
        // The local transport never touches the driver; the seat is
        // tracked only for contract parity.
        self.attach_role(Roles::PRODUCER, "producer")
    }

    fn attach_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), BridgeError> {
        self.attach_role(Roles::CONSUMER, "consumer")?;
        self.driver_events
            .lock()
            .expect("bridge event lock poisoned")
            .extend(consumer.events());
        Ok(())
    }

    fn attach_named_consumer(&self, _consumer: Arc<dyn NamedConsumer>) -> Result<(), BridgeError> {
        let mut attached = self.attached.lock().expect("bridge attach lock poisoned");
        if attached.named {
            return Err(BridgeError::AlreadyAttached("named consumer"));
        }
        attached.named = true;
        Ok(())
    }

    fn attach_reporter(&self, _reporter: Arc<dyn Reporter>) -> Result<(), BridgeError> {
        self.attach_role(Roles::REPORTER, "reporter")
    }

    fn attach_store(&self, store: Arc<dyn Store>) -> Result<(), BridgeError> {
        self.attach_role(Roles::STORE, "store")?;
        self.driver_events
            .lock()
            .expect("bridge event lock poisoned")
            .extend(store.events());
        Ok(())
    }

    fn exists(&self, _roles: Roles) -> bool {
        // All four roles are intrinsic to the local transport.
        true
    }

    fn events(&self) -> Vec<mpsc::UnboundedReceiver<Event>> {
        let mut streams: Vec<_> = self.events.take().into_iter().collect();
        streams.extend(
            self.driver_events
                .lock()
                .expect("bridge event lock poisoned")
                .drain(..),
        );
        streams
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            self.shutdown.cancel();
            self.stop_all_listeners()?;

            let loops: Vec<_> = {
                let mut guard = self.loops.lock().expect("bridge loop lock poisoned");
                guard.drain(..).collect()
            };
            for handle in loops {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        std::panic::resume_unwind(e.into_panic());
                    }
                }
            }

            // Closing drops every remaining report sender, which unblocks
            // callers still waiting on their streams.
            self.polls.clear();
            Ok(())
        })
    }
}

impl std::fmt::Debug for LocalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBridge")
            .field("open_streams", &self.polls.len())
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
