//! The default bridge: driver-backed transport.
//!
//! Delegates to the attached broker and backend drivers, encoding tasks
//! and reports through the marshaller registry before they leave the
//! process and decoding frames on the way back in. One decode loop runs
//! per listener and per polled task; one encode loop per attached report
//! stream.

use super::{Bridge, BridgeError, Roles};
use crate::config::RuntimeConfig;
use crate::driver::{Consumer, NamedConsumer, Producer, Reporter, Store};
use crate::events::{Event, EventChannel, EventLevel};
use crate::registry::MarshallerRegistry;
use crate::report::{Receipt, Report};
use crate::task::Task;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct Seats {
    producer: Option<Arc<dyn Producer>>,
    consumer: Option<Arc<dyn Consumer>>,
    named: Option<Arc<dyn NamedConsumer>>,
    reporter: Option<Arc<dyn Reporter>>,
    store: Option<Arc<dyn Store>>,
}

/// The driver-backed bridge flavor.
pub struct DefaultBridge {
    registry: Arc<MarshallerRegistry>,
    seats: StdMutex<Seats>,
    loops: StdMutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    events: Arc<EventChannel>,
    driver_events: StdMutex<Vec<mpsc::UnboundedReceiver<Event>>>,
    task_capacity: usize,
    report_capacity: usize,
    byte_capacity: usize,
}

impl DefaultBridge {
    /// Creates a driver-backed bridge over the given registry.
    pub fn new(registry: Arc<MarshallerRegistry>, config: &RuntimeConfig) -> Self {
        Self {
            registry,
            seats: StdMutex::new(Seats::default()),
            loops: StdMutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            events: Arc::new(EventChannel::new("bridge.default")),
            driver_events: StdMutex::new(Vec::new()),
            task_capacity: config.task_channel_capacity,
            report_capacity: config.report_stream_capacity,
            byte_capacity: config.byte_channel_capacity,
        }
    }

    fn push_loop(&self, handle: JoinHandle<()>) {
        self.loops
            .lock()
            .expect("bridge loop lock poisoned")
            .push(handle);
    }

    /// Spawns the frame → task decode loop for one listener.
    fn spawn_task_decoder(&self, mut frames: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Task> {
        let (task_tx, task_rx) = mpsc::channel(self.task_capacity);
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        let token = self.shutdown.clone();

        self.push_loop(tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                match registry.decode_task(&frame) {
                    Ok(task) => {
                        if task_tx.send(task).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        events.emit(EventLevel::Warn, format!("dropping task frame: {}", e));
                    }
                }
            }
            debug!("listener decode loop stopped");
        }));

        task_rx
    }
}

impl Bridge for DefaultBridge {
    fn send_task(&self, task: Task) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            let producer = {
                let seats = self.seats.lock().expect("bridge seat lock poisoned");
                seats
                    .producer
                    .clone()
                    .ok_or(BridgeError::NotAttached("producer"))?
            };
            let frame = self.registry.encode_task(&task)?;
            producer.send(Bytes::from(frame)).await?;
            Ok(())
        })
    }

    fn add_listener(
        &self,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Task>, BridgeError> {
        let consumer = {
            let seats = self.seats.lock().expect("bridge seat lock poisoned");
            seats
                .consumer
                .clone()
                .ok_or(BridgeError::NotAttached("consumer"))?
        };
        let frames = consumer.add_listener(receipts)?;
        debug!("default bridge listener active");
        Ok(self.spawn_task_decoder(frames))
    }

    fn add_named_listener(
        &self,
        name: &str,
        receipts: mpsc::Receiver<Receipt>,
    ) -> Result<mpsc::Receiver<Task>, BridgeError> {
        let named = {
            let seats = self.seats.lock().expect("bridge seat lock poisoned");
            seats
                .named
                .clone()
                .ok_or(BridgeError::NotSupported("named consumer"))?
        };
        let frames = named.add_named_listener(name, receipts)?;
        debug!(name, "default bridge named listener active");
        Ok(self.spawn_task_decoder(frames))
    }

    fn stop_all_listeners(&self) -> Result<(), BridgeError> {
        let consumer = {
            let seats = self.seats.lock().expect("bridge seat lock poisoned");
            seats.consumer.clone()
        };
        if let Some(consumer) = consumer {
            consumer.stop_all_listeners()?;
        }
        debug!("default bridge listeners stopping");
        Ok(())
    }

    fn report(&self, mut reports: mpsc::Receiver<Report>) -> Result<(), BridgeError> {
        let reporter = {
            let seats = self.seats.lock().expect("bridge seat lock poisoned");
            seats
                .reporter
                .clone()
                .ok_or(BridgeError::NotAttached("reporter"))?
        };
        let (frame_tx, frame_rx) = mpsc::channel(self.byte_capacity);
        reporter.report(frame_rx)?;

        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        let token = self.shutdown.clone();

        self.push_loop(tokio::spawn(async move {
            loop {
                let report = tokio::select! {
                    _ = token.cancelled() => break,
                    report = reports.recv() => match report {
                        Some(report) => report,
                        None => break,
                    },
                };
                match registry.encode_report(&report) {
                    Ok(frame) => {
                        if frame_tx.send(Bytes::from(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        events.emit(EventLevel::Warn, format!("dropping report: {}", e));
                    }
                }
            }

            // Teardown: flush what is already buffered, best effort.
            while let Ok(report) = reports.try_recv() {
                if let Ok(frame) = registry.encode_report(&report) {
                    let _ = frame_tx.try_send(Bytes::from(frame));
                }
            }
        }));
        Ok(())
    }

    fn poll(&self, task: &Task) -> BoxFuture<'_, Result<mpsc::Receiver<Report>, BridgeError>> {
        let task = task.clone();
        Box::pin(async move {
            let store = {
                let seats = self.seats.lock().expect("bridge seat lock poisoned");
                seats.store.clone().ok_or(BridgeError::NotAttached("store"))?
            };
            let mut frames = store.poll(&task).await?;

            let (report_tx, report_rx) = mpsc::channel(self.report_capacity);
            let registry = Arc::clone(&self.registry);
            let events = Arc::clone(&self.events);
            let token = self.shutdown.clone();

            self.push_loop(tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = token.cancelled() => break,
                        frame = frames.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    match registry.decode_report(&frame) {
                        Ok(report) => {
                            let terminal = report.is_done();
                            if report_tx.send(report).await.is_err() {
                                break;
                            }
                            if terminal {
                                // The stream contract ends here.
                                break;
                            }
                        }
                        Err(e) => {
                            events.emit(EventLevel::Warn, format!("dropping report frame: {}", e));
                        }
                    }
                }
            }));

            Ok(report_rx)
        })
    }

    fn attach_producer(&self, producer: Arc<dyn Producer>) -> Result<(), BridgeError> {
        let mut seats = self.seats.lock().expect("bridge seat lock poisoned");
        if seats.producer.is_some() {
            return Err(BridgeError::AlreadyAttached("producer"));
        }
        seats.producer = Some(producer);
        Ok(())
    }

    fn attach_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), BridgeError> {
        let mut seats = self.seats.lock().expect("bridge seat lock poisoned");
        if seats.consumer.is_some() {
            return Err(BridgeError::AlreadyAttached("consumer"));
        }
        self.driver_events
            .lock()
            .expect("bridge event lock poisoned")
            .extend(consumer.events());
        seats.consumer = Some(consumer);
        Ok(())
    }

    fn attach_named_consumer(&self, consumer: Arc<dyn NamedConsumer>) -> Result<(), BridgeError> {
        let mut seats = self.seats.lock().expect("bridge seat lock poisoned");
        if seats.named.is_some() {
            return Err(BridgeError::AlreadyAttached("named consumer"));
        }
        seats.named = Some(consumer);
        Ok(())
    }

    fn attach_reporter(&self, reporter: Arc<dyn Reporter>) -> Result<(), BridgeError> {
        let mut seats = self.seats.lock().expect("bridge seat lock poisoned");
        if seats.reporter.is_some() {
            return Err(BridgeError::AlreadyAttached("reporter"));
        }
        seats.reporter = Some(reporter);
        Ok(())
    }

    fn attach_store(&self, store: Arc<dyn Store>) -> Result<(), BridgeError> {
        let mut seats = self.seats.lock().expect("bridge seat lock poisoned");
        if seats.store.is_some() {
            return Err(BridgeError::AlreadyAttached("store"));
        }
        self.driver_events
            .lock()
            .expect("bridge event lock poisoned")
            .extend(store.events());
        seats.store = Some(store);
        Ok(())
    }

    fn exists(&self, roles: Roles) -> bool {
        let seats = self.seats.lock().expect("bridge seat lock poisoned");
        let mut bound = Roles::NONE;
        if seats.producer.is_some() {
            bound.insert(Roles::PRODUCER);
        }
        if seats.consumer.is_some() {
            bound.insert(Roles::CONSUMER);
        }
        if seats.reporter.is_some() {
            bound.insert(Roles::REPORTER);
        }
        if seats.store.is_some() {
            bound.insert(Roles::STORE);
        }
        bound.contains(roles)
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
            Ok(())
        })
    }
}

impl std::fmt::Debug for DefaultBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultBridge")
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
