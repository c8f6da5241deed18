//! The runtime facade: registry, bridge, mapper pool and event pump
//! wired into one embeddable component.
//!
//! A runtime is created around a bridge flavor, functions are registered
//! with worker counts and marshaller bindings, and invocations go out
//! through [`Runtime::call`], which hands back the per-task report
//! stream. `close` tears everything down in order: listeners stop, the
//! mapper pool drains with `Shutdown` reports for queued tasks, then the
//! bridge closes its remaining streams.
//!
//! # Example
//!
//! ```ignore
//! use conveyor::runtime::{Runtime, RuntimeConfig};
//! use conveyor::task::TaskOptions;
//! use conveyor::registry::MARSHALLER_JSON;
//! use serde_json::json;
//!
//! let runtime = Runtime::local(RuntimeConfig::default());
//! runtime.register(
//!     "Add",
//!     |a: i64, b: i64| -> (i64,) { (a + b,) },
//!     2, 16, MARSHALLER_JSON, MARSHALLER_JSON,
//! )?;
//!
//! let mut reports = runtime
//!     .call("Add", TaskOptions::new(), vec![json!(1), json!(2)])
//!     .await?
//!     .expect("report stream");
//! while let Some(report) = reports.recv().await {
//!     if report.is_done() {
//!         println!("returns: {:?}", report.returns());
//!     }
//! }
//! ```

pub use crate::config::RuntimeConfig;

use crate::bridge::{Bridge, BridgeError, LocalBridge};
use crate::events::EventLevel;
use crate::invoker::{IntoTaskFn, TaskFn};
use crate::mapper::{share_tasks, MapperError, MapperPool, WorkerBinding};
use crate::mux::Mux;
use crate::registry::{Codec, MarshallerRegistry, RegistryError};
use crate::report::Report;
use crate::task::{TaskOptions, Value};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Errors surfaced by the runtime facade.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Registration or codec lookup failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Bridge failure.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Mapper pool failure.
    #[error(transparent)]
    Mapper(#[from] MapperError),

    /// The runtime has been closed.
    #[error("runtime closed")]
    Closed,
}

struct RuntimeState {
    ingress_wired: bool,
    closed: bool,
}

/// An embeddable task-queue runtime.
///
/// Must be created inside a tokio runtime; construction spawns the event
/// pump and later calls spawn mapper and worker routines.
pub struct Runtime {
    registry: Arc<MarshallerRegistry>,
    bridge: Arc<dyn Bridge>,
    pool: MapperPool,
    config: RuntimeConfig,
    event_mux: Mux<crate::events::Event>,
    state: StdMutex<RuntimeState>,
}

impl Runtime {
    /// Creates a runtime over an explicit registry and bridge.
    ///
    /// The bridge must have been built over the same registry when it
    /// encodes or decodes anything (the default bridge does).
    pub fn new(
        config: RuntimeConfig,
        registry: Arc<MarshallerRegistry>,
        bridge: Arc<dyn Bridge>,
    ) -> Self {
        let event_mux = Mux::new();
        event_mux.handle(|event: crate::events::Event, _| match event.level() {
            EventLevel::Debug => tracing::debug!(origin = event.origin(), "{}", event.payload()),
            EventLevel::Info => tracing::info!(origin = event.origin(), "{}", event.payload()),
            EventLevel::Warn => tracing::warn!(origin = event.origin(), "{}", event.payload()),
            EventLevel::Error => tracing::error!(origin = event.origin(), "{}", event.payload()),
        });
        for stream in bridge.events() {
            // Registration only fails once the mux is closed.
            let _ = event_mux.register(stream, 0);
        }
        event_mux.more(1);

        info!("runtime assembled");
        Self {
            registry,
            bridge,
            pool: MapperPool::new(),
            config,
            event_mux,
            state: StdMutex::new(RuntimeState {
                ingress_wired: false,
                closed: false,
            }),
        }
    }

    /// Creates a runtime whose bridge short-circuits everything in
    /// process.
    pub fn local(config: RuntimeConfig) -> Self {
        let registry = Arc::new(MarshallerRegistry::new());
        let bridge = Arc::new(LocalBridge::new(&config));
        Self::new(config, registry, bridge)
    }

    /// The shared registry, for building driver-backed bridges and
    /// composing tasks out of band.
    pub fn registry(&self) -> &Arc<MarshallerRegistry> {
        &self.registry
    }

    /// Binds a codec to a marshaller ID. IDs 0 and 1 are reserved for
    /// the built-ins.
    pub fn add_marshaller(&self, id: u16, codec: Codec) -> Result<(), RuntimeError> {
        self.ensure_open()?;
        self.registry.add_marshaller(id, codec)?;
        Ok(())
    }

    /// Registers a function under a name and allocates its workers.
    ///
    /// `workers` routines pull the function's dispatch channel, which
    /// buffers up to `queue_size` tasks. Tasks are framed with the
    /// `task_mid` marshaller and reports with `report_mid`. Returns the
    /// count of workers that could not be allocated (zero on success).
    pub fn register<F, Args, R>(
        &self,
        name: &str,
        f: F,
        workers: usize,
        queue_size: usize,
        task_mid: u16,
        report_mid: u16,
    ) -> Result<usize, RuntimeError>
    where
        F: IntoTaskFn<Args, R>,
    {
        self.ensure_open()?;
        let entry = self
            .registry
            .register(name, TaskFn::from_handler(f), task_mid, report_mid)?;
        self.ensure_ingress()?;

        let codec = self.registry.codec(task_mid)?;
        let binding = WorkerBinding {
            func: entry.func().clone(),
            invoker: Arc::clone(codec.invoker()),
            report_mid,
        };
        let (report_rxs, remain) = self.pool.allocate_workers(name, binding, workers, queue_size)?;
        for report_rx in report_rxs {
            self.bridge.report(report_rx)?;
        }
        debug!(name, workers, "function registered");
        Ok(remain)
    }

    /// Invokes a registered function.
    ///
    /// Returns the task's report stream, or `None` when the options
    /// ignore reporting — in that case no report is ever produced for
    /// the task.
    pub async fn call(
        &self,
        name: &str,
        options: TaskOptions,
        args: Vec<Value>,
    ) -> Result<Option<mpsc::Receiver<Report>>, RuntimeError> {
        self.ensure_open()?;
        let task = self.registry.compose_task(name, options, args)?;

        if options.ignore_report() {
            self.bridge.send_task(task).await?;
            return Ok(None);
        }

        let handle = task.clone();
        self.bridge.send_task(task).await?;
        let reports = self.bridge.poll(&handle).await?;
        Ok(Some(reports))
    }

    /// Tears the runtime down: stops listeners, drains the mapper pool
    /// (queued tasks get `Shutdown` reports), closes the bridge and the
    /// event pump. Safe to call more than once.
    pub async fn close(&self) -> Result<(), RuntimeError> {
        let wired = {
            let mut state = self.state.lock().expect("runtime state lock poisoned");
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.ingress_wired
        };
        info!("runtime closing");

        if wired {
            self.bridge.stop_all_listeners()?;
        }
        self.pool.close().await;
        self.bridge.close().await?;
        self.event_mux.close().await;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        let state = self.state.lock().expect("runtime state lock poisoned");
        if state.closed {
            return Err(RuntimeError::Closed);
        }
        Ok(())
    }

    /// Wires the ingress path on first registration: one listener on the
    /// bridge feeding the configured number of mapper routines, plus the
    /// pool's stray-report channel into the report path.
    fn ensure_ingress(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("runtime state lock poisoned");
        if state.ingress_wired {
            return Ok(());
        }

        let (receipt_tx, receipt_rx) = mpsc::channel(self.config.receipt_channel_capacity);
        let tasks_rx = self.bridge.add_listener(receipt_rx)?;
        let tasks = share_tasks(tasks_rx);
        for _ in 0..self.config.mapper_count.max(1) {
            self.pool.more(Arc::clone(&tasks), receipt_tx.clone());
        }

        if let Some(stray_rx) = self.pool.stray_reports() {
            self.bridge.report(stray_rx)?;
        }

        state.ingress_wired = true;
        debug!(
            mappers = self.config.mapper_count.max(1),
            "ingress path wired"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("runtime state lock poisoned");
        f.debug_struct("Runtime")
            .field("ingress_wired", &state.ingress_wired)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}
