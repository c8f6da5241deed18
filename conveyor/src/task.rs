//! Task and per-task options.
//!
//! A task is a single named function invocation in flight: a [`Header`]
//! identifying it plus the options and argument list it was composed with.
//! Arguments travel as an ordered sequence of JSON values; only the
//! marshaller and invoker bound to the function know the concrete types.

use crate::frame::Header;
use serde::{Deserialize, Serialize};

/// Heterogeneous value as carried in task arguments and report returns.
pub type Value = serde_json::Value;

/// Per-task configuration attached at composition time.
///
/// Options ride along with the task and every report derived from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    ignore_report: bool,
    only_result: bool,
}

impl TaskOptions {
    /// Creates the default options: full report stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, no reports are emitted or streamed for the task and
    /// `call` returns no report stream at all.
    pub fn set_ignore_report(mut self, yes: bool) -> Self {
        self.ignore_report = yes;
        self
    }

    /// When set, only the single terminal report is emitted; the
    /// intermediate `Sent` and `Progress` states are suppressed.
    pub fn set_only_result(mut self, yes: bool) -> Self {
        self.only_result = yes;
        self
    }

    /// Whether reporting is disabled entirely.
    pub fn ignore_report(&self) -> bool {
        self.ignore_report
    }

    /// Whether only the terminal report is wanted.
    pub fn only_result(&self) -> bool {
        self.only_result
    }
}

/// A named function invocation in flight.
///
/// Created by the registry on `compose_task`, transported as bytes in
/// remote mode, reconstructed at the worker and discarded after the
/// terminal report is emitted. Tasks are single-owner while on a channel;
/// the mapper takes ownership when it dequeues one.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    header: Header,
    options: TaskOptions,
    args: Vec<Value>,
}

impl Task {
    /// Assembles a task from its parts.
    pub fn new(header: Header, options: TaskOptions, args: Vec<Value>) -> Self {
        Self {
            header,
            options,
            args,
        }
    }

    /// The immutable header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The task's unique identifier.
    pub fn id(&self) -> &str {
        self.header.id()
    }

    /// The registered function name.
    pub fn name(&self) -> &str {
        self.header.name()
    }

    /// The options the task was composed with.
    pub fn options(&self) -> TaskOptions {
        self.options
    }

    /// The argument list, in call order.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Consumes the task into header, options and arguments.
    pub fn into_parts(self) -> (Header, TaskOptions, Vec<Value>) {
        (self.header, self.options, self.args)
    }
}
