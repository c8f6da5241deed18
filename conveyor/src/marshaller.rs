//! Task and report payload codecs.
//!
//! A marshaller turns a [`Task`] or [`Report`] into the chunk sequence
//! framed by [`crate::frame`] and back. The options, status and error
//! parts are always framed by the core; marshallers differ in how the
//! argument and return values are represented.
//!
//! Built-ins:
//! - [`JsonMarshaller`] — the default: one JSON chunk per value, with
//!   arity validated against the registered function;
//! - [`ValueMarshaller`] — the same wire shape without validation, for
//!   callers that treat values as opaque;
//! - [`CustomMarshaller`] — user-supplied encode/decode hooks for the
//!   value chunks, with the core still framing options/status/error.

use crate::frame::{compose_bytes, FrameError, Header};
use crate::invoker::TaskFn;
use crate::report::{Report, Status, TaskError};
use crate::task::{Task, TaskOptions, Value};
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// Frame-level failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A value could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A chunk could not be parsed back into its value.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Encoder/decoder for task and report payloads.
///
/// `prepare` is called once per registered function so implementations
/// can cache per-function metadata. Encoders emit complete frames;
/// decoders receive the pre-split header and chunk sequence (the registry
/// decomposes frames exactly once). Encode and decode must be exact
/// inverses for all legal inputs.
pub trait Marshaller: Send + Sync {
    /// Caches any per-function metadata. Called at registration.
    fn prepare(&self, name: &str, func: &TaskFn) -> Result<(), MarshalError>;

    /// Encodes a task into a wire frame.
    fn encode_task(&self, func: &TaskFn, task: &Task) -> Result<Vec<u8>, MarshalError>;

    /// Rebuilds a task from its header and payload chunks.
    fn decode_task(
        &self,
        header: Header,
        func: &TaskFn,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Task, MarshalError>;

    /// Encodes a report into a wire frame.
    fn encode_report(&self, func: &TaskFn, report: &Report) -> Result<Vec<u8>, MarshalError>;

    /// Rebuilds a report from its header and payload chunks.
    fn decode_report(
        &self,
        header: Header,
        func: &TaskFn,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Report, MarshalError>;
}

fn to_chunk<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, MarshalError> {
    serde_json::to_vec(value).map_err(|e| MarshalError::Encode(e.to_string()))
}

fn from_chunk<T: serde::de::DeserializeOwned>(chunk: &[u8]) -> Result<T, MarshalError> {
    serde_json::from_slice(chunk).map_err(|e| MarshalError::Decode(e.to_string()))
}

fn task_to_chunks(task: &Task) -> Result<Vec<Vec<u8>>, MarshalError> {
    let mut chunks = Vec::with_capacity(task.args().len() + 1);
    chunks.push(to_chunk(&task.options())?);
    for arg in task.args() {
        chunks.push(to_chunk(arg)?);
    }
    Ok(chunks)
}

fn task_from_chunks(header: Header, chunks: Vec<Vec<u8>>) -> Result<Task, MarshalError> {
    let Some((head, rest)) = chunks.split_first() else {
        return Err(MarshalError::Decode("task frame missing options".into()));
    };
    let options: TaskOptions = from_chunk(head)?;
    let args = rest
        .iter()
        .map(|c| from_chunk::<Value>(c))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Task::new(header, options, args))
}

fn report_head_chunks(report: &Report) -> Result<Vec<Vec<u8>>, MarshalError> {
    Ok(vec![
        to_chunk(&report.status().as_u16())?,
        to_chunk(&report.error())?,
        to_chunk(&report.options())?,
    ])
}

fn report_head_from_chunks(
    chunks: &[Vec<u8>],
) -> Result<(Status, Option<TaskError>, TaskOptions), MarshalError> {
    let [status, error, options] = chunks else {
        return Err(MarshalError::Decode("report frame missing head chunks".into()));
    };
    let raw: u16 = from_chunk(status)?;
    let status = Status::from_u16(raw)
        .ok_or_else(|| MarshalError::Decode(format!("unknown status value {}", raw)))?;
    Ok((status, from_chunk(error)?, from_chunk(options)?))
}

/// The default marshaller: JSON value chunks, validated against the
/// registered function's declared arity.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn prepare(&self, _name: &str, _func: &TaskFn) -> Result<(), MarshalError> {
        Ok(())
    }

    fn encode_task(&self, func: &TaskFn, task: &Task) -> Result<Vec<u8>, MarshalError> {
        if task.args().len() != func.arity() {
            return Err(MarshalError::Encode(format!(
                "task {} carries {} args, function declares {}",
                task.header(),
                task.args().len(),
                func.arity()
            )));
        }
        Ok(compose_bytes(task.header(), &task_to_chunks(task)?)?)
    }

    fn decode_task(
        &self,
        header: Header,
        func: &TaskFn,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Task, MarshalError> {
        let task = task_from_chunks(header, chunks)?;
        if task.args().len() != func.arity() {
            return Err(MarshalError::Decode(format!(
                "task {} carries {} args, function declares {}",
                task.header(),
                task.args().len(),
                func.arity()
            )));
        }
        Ok(task)
    }

    fn encode_report(&self, _func: &TaskFn, report: &Report) -> Result<Vec<u8>, MarshalError> {
        let mut chunks = report_head_chunks(report)?;
        for value in report.returns() {
            chunks.push(to_chunk(value)?);
        }
        Ok(compose_bytes(report.header(), &chunks)?)
    }

    fn decode_report(
        &self,
        header: Header,
        _func: &TaskFn,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Report, MarshalError> {
        if chunks.len() < 3 {
            return Err(MarshalError::Decode("report frame missing head chunks".into()));
        }
        let (head, rest) = chunks.split_at(3);
        let (status, error, options) = report_head_from_chunks(head)?;
        let returns = rest
            .iter()
            .map(|c| from_chunk::<Value>(c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Report::from_parts(header, status, error, options, returns))
    }
}

/// JSON-value passthrough without per-function validation.
///
/// Same wire shape as [`JsonMarshaller`]; useful when the caller treats
/// argument lists as opaque and defers all checking to the invoker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueMarshaller;

impl Marshaller for ValueMarshaller {
    fn prepare(&self, _name: &str, _func: &TaskFn) -> Result<(), MarshalError> {
        Ok(())
    }

    fn encode_task(&self, _func: &TaskFn, task: &Task) -> Result<Vec<u8>, MarshalError> {
        Ok(compose_bytes(task.header(), &task_to_chunks(task)?)?)
    }

    fn decode_task(
        &self,
        header: Header,
        _func: &TaskFn,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Task, MarshalError> {
        task_from_chunks(header, chunks)
    }

    fn encode_report(&self, func: &TaskFn, report: &Report) -> Result<Vec<u8>, MarshalError> {
        JsonMarshaller.encode_report(func, report)
    }

    fn decode_report(
        &self,
        header: Header,
        func: &TaskFn,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Report, MarshalError> {
        JsonMarshaller.decode_report(header, func, chunks)
    }
}

/// Hook encoding a value list into chunks. The flag is `false` for task
/// arguments and `true` for return values.
pub type EncodeHook = dyn Fn(bool, &[Value]) -> Result<Vec<Vec<u8>>, MarshalError> + Send + Sync;

/// Hook decoding chunks back into a value list. Flag as in [`EncodeHook`].
pub type DecodeHook = dyn Fn(bool, &[Vec<u8>]) -> Result<Vec<Value>, MarshalError> + Send + Sync;

/// A marshaller built from user-supplied value hooks.
///
/// The hooks only see argument and return values; the core frames
/// options, status and error around them. Return chunks are emitted only
/// for successful reports, so a decode hook sees either the full return
/// chunk list or nothing.
#[derive(Clone)]
pub struct CustomMarshaller {
    encode: Arc<EncodeHook>,
    decode: Arc<DecodeHook>,
}

impl CustomMarshaller {
    /// Builds a marshaller from the two hooks.
    pub fn new(
        encode: impl Fn(bool, &[Value]) -> Result<Vec<Vec<u8>>, MarshalError> + Send + Sync + 'static,
        decode: impl Fn(bool, &[Vec<u8>]) -> Result<Vec<Value>, MarshalError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }
}

impl std::fmt::Debug for CustomMarshaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomMarshaller").finish_non_exhaustive()
    }
}

impl Marshaller for CustomMarshaller {
    fn prepare(&self, _name: &str, _func: &TaskFn) -> Result<(), MarshalError> {
        Ok(())
    }

    fn encode_task(&self, _func: &TaskFn, task: &Task) -> Result<Vec<u8>, MarshalError> {
        let mut chunks = vec![to_chunk(&task.options())?];
        chunks.extend((self.encode)(false, task.args())?);
        Ok(compose_bytes(task.header(), &chunks)?)
    }

    fn decode_task(
        &self,
        header: Header,
        _func: &TaskFn,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Task, MarshalError> {
        let Some((head, rest)) = chunks.split_first() else {
            return Err(MarshalError::Decode("task frame missing options".into()));
        };
        let options: TaskOptions = from_chunk(head)?;
        let args = (self.decode)(false, rest)?;
        Ok(Task::new(header, options, args))
    }

    fn encode_report(&self, _func: &TaskFn, report: &Report) -> Result<Vec<u8>, MarshalError> {
        let mut chunks = report_head_chunks(report)?;
        if report.is_ok() {
            chunks.extend((self.encode)(true, report.returns())?);
        }
        Ok(compose_bytes(report.header(), &chunks)?)
    }

    fn decode_report(
        &self,
        header: Header,
        _func: &TaskFn,
        chunks: Vec<Vec<u8>>,
    ) -> Result<Report, MarshalError> {
        if chunks.len() < 3 {
            return Err(MarshalError::Decode("report frame missing head chunks".into()));
        }
        let (head, rest) = chunks.split_at(3);
        let (status, error, options) = report_head_from_chunks(head)?;
        let returns = if rest.is_empty() {
            Vec::new()
        } else {
            (self.decode)(true, rest)?
        };
        Ok(Report::from_parts(header, status, error, options, returns))
    }
}
