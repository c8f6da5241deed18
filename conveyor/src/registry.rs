//! Marshaller and function registries.
//!
//! Two read-mostly maps guarded by reader-writer locks: marshaller ID →
//! [`Codec`] (a marshaller/invoker pair) and function name →
//! [`FunctionEntry`]. Writes happen only during registration, before task
//! flow starts; every encode/decode path takes the shared lock.
//!
//! IDs 0 and 1 are reserved for the built-in codecs and pre-registered at
//! construction.

use crate::frame::{decompose_bytes, Header};
use crate::invoker::{DefaultInvoker, Invoker, TaskFn};
use crate::marshaller::{JsonMarshaller, MarshalError, Marshaller, ValueMarshaller};
use crate::report::Report;
use crate::task::{Task, TaskOptions, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Marshaller ID of the built-in [`JsonMarshaller`].
pub const MARSHALLER_JSON: u16 = 0;

/// Marshaller ID of the built-in [`ValueMarshaller`].
pub const MARSHALLER_VALUE: u16 = 1;

/// Registry errors, returned synchronously at the registration or
/// compose/decode call site.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The marshaller ID is already bound.
    #[error("marshaller {0} already registered")]
    MarshallerAlreadyRegistered(u16),

    /// No codec is bound to the marshaller ID.
    #[error("unknown marshaller: {0}")]
    UnknownMarshaller(u16),

    /// The function name is already registered.
    #[error("function {0:?} already registered")]
    FunctionAlreadyRegistered(String),

    /// No function is registered under the name.
    #[error("unknown function: {0:?}")]
    UnknownFunction(String),

    /// Payload codec failure.
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// Explicit composition of the two codec capabilities: how payloads are
/// marshalled and how argument lists are adapted to function signatures.
#[derive(Clone)]
pub struct Codec {
    marshaller: Arc<dyn Marshaller>,
    invoker: Arc<dyn Invoker>,
}

impl Codec {
    /// Pairs a marshaller with an invoker.
    pub fn new(marshaller: Arc<dyn Marshaller>, invoker: Arc<dyn Invoker>) -> Self {
        Self {
            marshaller,
            invoker,
        }
    }

    /// The payload marshaller.
    pub fn marshaller(&self) -> &Arc<dyn Marshaller> {
        &self.marshaller
    }

    /// The invocation adapter.
    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

/// A registered function with its codec bindings.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    func: TaskFn,
    task_mid: u16,
    report_mid: u16,
}

impl FunctionEntry {
    /// The type-erased function.
    pub fn func(&self) -> &TaskFn {
        &self.func
    }

    /// Marshaller ID used for task frames of this function.
    pub fn task_mid(&self) -> u16 {
        self.task_mid
    }

    /// Marshaller ID used for report frames of this function.
    pub fn report_mid(&self) -> u16 {
        self.report_mid
    }
}

/// The shared registry: marshaller IDs and registered functions.
pub struct MarshallerRegistry {
    codecs: RwLock<HashMap<u16, Codec>>,
    functions: RwLock<HashMap<String, Arc<FunctionEntry>>>,
}

impl MarshallerRegistry {
    /// Creates a registry with the built-in codecs bound to IDs 0 and 1.
    pub fn new() -> Self {
        let invoker: Arc<dyn Invoker> = Arc::new(DefaultInvoker);
        let mut codecs = HashMap::new();
        codecs.insert(
            MARSHALLER_JSON,
            Codec::new(Arc::new(JsonMarshaller), Arc::clone(&invoker)),
        );
        codecs.insert(
            MARSHALLER_VALUE,
            Codec::new(Arc::new(ValueMarshaller), invoker),
        );
        Self {
            codecs: RwLock::new(codecs),
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Binds a codec to a marshaller ID.
    ///
    /// IDs 0 and 1 are taken by the built-ins, so registering them — or
    /// any other bound ID — fails with `MarshallerAlreadyRegistered`.
    pub fn add_marshaller(&self, id: u16, codec: Codec) -> Result<(), RegistryError> {
        let mut codecs = self.codecs.write().expect("codec registry lock poisoned");
        if codecs.contains_key(&id) {
            return Err(RegistryError::MarshallerAlreadyRegistered(id));
        }
        codecs.insert(id, codec);
        Ok(())
    }

    /// Looks up the codec bound to an ID.
    pub fn codec(&self, id: u16) -> Result<Codec, RegistryError> {
        self.codecs
            .read()
            .expect("codec registry lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownMarshaller(id))
    }

    /// Registers a function under a name with its marshaller bindings.
    ///
    /// Both marshallers get a `prepare` call so they can cache
    /// per-function metadata before any task flows.
    pub fn register(
        &self,
        name: &str,
        func: TaskFn,
        task_mid: u16,
        report_mid: u16,
    ) -> Result<Arc<FunctionEntry>, RegistryError> {
        let task_codec = self.codec(task_mid)?;
        task_codec.marshaller().prepare(name, &func)?;
        if report_mid != task_mid {
            self.codec(report_mid)?.marshaller().prepare(name, &func)?;
        }

        let mut functions = self
            .functions
            .write()
            .expect("function registry lock poisoned");
        if functions.contains_key(name) {
            return Err(RegistryError::FunctionAlreadyRegistered(name.to_string()));
        }
        let entry = Arc::new(FunctionEntry {
            func,
            task_mid,
            report_mid,
        });
        functions.insert(name.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Looks up a registered function by name.
    pub fn entry(&self, name: &str) -> Result<Arc<FunctionEntry>, RegistryError> {
        self.functions
            .read()
            .expect("function registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownFunction(name.to_string()))
    }

    /// Composes a new task for a registered function.
    ///
    /// Assigns a fresh opaque ID; the header binds the function's
    /// task-side marshaller.
    pub fn compose_task(
        &self,
        name: &str,
        options: TaskOptions,
        args: Vec<Value>,
    ) -> Result<Task, RegistryError> {
        let entry = self.entry(name)?;
        let header = Header::new(Uuid::new_v4().to_string(), name, entry.task_mid());
        Ok(Task::new(header, options, args))
    }

    /// Encodes a task with the marshaller named in its header.
    pub fn encode_task(&self, task: &Task) -> Result<Vec<u8>, RegistryError> {
        let entry = self.entry(task.name())?;
        let codec = self.codec(task.header().marshaller())?;
        Ok(codec.marshaller().encode_task(entry.func(), task)?)
    }

    /// Decodes a task frame, dispatching on the marshaller ID it carries.
    pub fn decode_task(&self, frame: &[u8]) -> Result<Task, RegistryError> {
        let (header, chunks) = decompose_bytes(frame).map_err(MarshalError::from)?;
        let entry = self.entry(header.name())?;
        let codec = self.codec(header.marshaller())?;
        Ok(codec.marshaller().decode_task(header, entry.func(), chunks)?)
    }

    /// Encodes a report with the marshaller named in its header.
    pub fn encode_report(&self, report: &Report) -> Result<Vec<u8>, RegistryError> {
        let entry = self.entry(report.name())?;
        let codec = self.codec(report.header().marshaller())?;
        Ok(codec.marshaller().encode_report(entry.func(), report)?)
    }

    /// Decodes a report frame, dispatching on the marshaller ID it carries.
    pub fn decode_report(&self, frame: &[u8]) -> Result<Report, RegistryError> {
        let (header, chunks) = decompose_bytes(frame).map_err(MarshalError::from)?;
        let entry = self.entry(header.name())?;
        let codec = self.codec(header.marshaller())?;
        Ok(codec
            .marshaller()
            .decode_report(header, entry.func(), chunks)?)
    }
}

impl Default for MarshallerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarshallerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codecs = self.codecs.read().expect("codec registry lock poisoned");
        let functions = self
            .functions
            .read()
            .expect("function registry lock poisoned");
        f.debug_struct("MarshallerRegistry")
            .field("codecs", &codecs.len())
            .field("functions", &functions.len())
            .finish()
    }
}
