//! Conveyor — an embeddable distributed task-queue runtime.
//!
//! Callers submit named function invocations as tasks, a broker carries
//! them to worker routines, and a result backend streams execution
//! reports back. This crate is the in-process dispatch and reporting
//! fabric between those parts: the marshalling and invocation layer, the
//! mapper pool, the bridge over broker/backend drivers, and the report
//! stream contract. Concrete transports live behind the [`driver`]
//! traits; [`driver::memory`] ships in-memory implementations.
//!
//! # Quick start
//!
//! ```ignore
//! use conveyor::runtime::{Runtime, RuntimeConfig};
//! use conveyor::registry::MARSHALLER_JSON;
//! use conveyor::task::TaskOptions;
//! use serde_json::json;
//!
//! let runtime = Runtime::local(RuntimeConfig::default());
//! runtime.register(
//!     "Greet",
//!     |n: i64, name: String| -> (String, i64) {
//!         (format!("{}_'s message", name), n + 1)
//!     },
//!     1, 16, MARSHALLER_JSON, MARSHALLER_JSON,
//! )?;
//!
//! let mut reports = runtime
//!     .call("Greet", TaskOptions::new(), vec![json!(12345), json!("mission")])
//!     .await?
//!     .expect("report stream");
//! while let Some(report) = reports.recv().await {
//!     if report.is_done() {
//!         assert!(report.is_ok());
//!     }
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod driver;
pub mod events;
pub mod frame;
pub mod invoker;
pub mod mapper;
pub mod marshaller;
pub mod mux;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod task;

pub use bridge::{Bridge, BridgeError, DefaultBridge, LocalBridge, Roles};
pub use config::RuntimeConfig;
pub use events::{Event, EventLevel};
pub use frame::{compose_bytes, decompose_bytes, peek_header, FrameError, Header};
pub use invoker::{DefaultInvoker, IntoTaskFn, InvokeError, Invoker, TaskFn};
pub use mapper::{MapperError, MapperPool, WorkerBinding};
pub use marshaller::{CustomMarshaller, JsonMarshaller, MarshalError, Marshaller, ValueMarshaller};
pub use mux::{Mux, MuxError, MuxSource};
pub use registry::{
    Codec, MarshallerRegistry, RegistryError, MARSHALLER_JSON, MARSHALLER_VALUE,
};
pub use report::{Disposition, Receipt, Report, Status, TaskError};
pub use runtime::{Runtime, RuntimeError};
pub use task::{Task, TaskOptions, Value};

/// Version of the conveyor library.
///
/// Injected from `Cargo.toml` at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
