//! Execution reports, the status lattice and broker receipts.
//!
//! One or more reports are produced for each non-ignored task. The last
//! one carries a terminal status; after it the report stream is closed.
//! When [`Report::is_done`] is true no more reports will follow, and the
//! outcome is one of success (returns available), failure or panic (error
//! available), or runtime shutdown.

use crate::frame::Header;
use crate::task::{TaskOptions, Value};
use serde::{Deserialize, Serialize};

/// Execution status of a task, as carried in a report.
///
/// The numeric values are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    /// No status; never emitted by the runtime.
    #[default]
    None = 0,

    /// The task was handed to a worker set.
    Sent = 1,

    /// A worker is executing the task.
    Progress = 2,

    /// The task completed; returns are available.
    Success = 3,

    /// The task execution failed.
    Fail = 4,

    /// The invoked function panicked.
    Panic = 5,

    /// The runtime is shutting down before the task could complete.
    Shutdown = 6,
}

impl Status {
    /// Returns true for a terminal status (no further reports follow).
    ///
    /// Terminal statuses are: Success, Fail, Panic, Shutdown.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Fail | Self::Panic | Self::Shutdown
        )
    }

    /// The wire representation.
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Parses the wire representation.
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Sent),
            2 => Some(Self::Progress),
            3 => Some(Self::Success),
            4 => Some(Self::Fail),
            5 => Some(Self::Panic),
            6 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Sent => write!(f, "Sent"),
            Self::Progress => write!(f, "Progress"),
            Self::Success => write!(f, "Success"),
            Self::Fail => write!(f, "Fail"),
            Self::Panic => write!(f, "Panic"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Structured error transported verbatim through reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    code: i32,
    message: String,
}

/// Error code for a routing failure: no function registered under the name.
pub const ERR_UNKNOWN_FUNCTION: i32 = 1;
/// Error code for invocation failures (arity or type mismatch).
pub const ERR_INVOKE: i32 = 2;
/// Error code for a panic inside the invoked function.
pub const ERR_PANIC: i32 = 3;
/// Error code for tasks abandoned by runtime shutdown.
pub const ERR_SHUTDOWN: i32 = 4;

impl TaskError {
    /// Creates an error with the given code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The integer error code.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// One status update on a task's execution.
///
/// Constructed through the status-specific constructors so the payload
/// invariants hold: only `Success` carries returns, `Fail` and `Panic`
/// always carry an error. Returns are normalized to an empty vector at
/// creation, never an absent value.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    header: Header,
    status: Status,
    error: Option<TaskError>,
    options: TaskOptions,
    returns: Vec<Value>,
}

impl Report {
    /// A `Sent` report: the task was handed to a worker set.
    pub fn sent(header: Header, options: TaskOptions) -> Self {
        Self::bare(header, Status::Sent, options)
    }

    /// A `Progress` report: a worker started executing the task.
    pub fn progress(header: Header, options: TaskOptions) -> Self {
        Self::bare(header, Status::Progress, options)
    }

    /// A terminal `Success` report carrying the coerced return values.
    pub fn success(header: Header, options: TaskOptions, returns: Vec<Value>) -> Self {
        Self {
            header,
            status: Status::Success,
            error: None,
            options,
            returns,
        }
    }

    /// A terminal `Fail` report carrying the failure reason.
    pub fn fail(header: Header, options: TaskOptions, error: TaskError) -> Self {
        Self {
            header,
            status: Status::Fail,
            error: Some(error),
            options,
            returns: Vec::new(),
        }
    }

    /// A terminal `Panic` report carrying the captured panic payload.
    pub fn panicked(header: Header, options: TaskOptions, error: TaskError) -> Self {
        Self {
            header,
            status: Status::Panic,
            error: Some(error),
            options,
            returns: Vec::new(),
        }
    }

    /// A terminal `Shutdown` report for a task abandoned at teardown.
    pub fn shutdown(header: Header, options: TaskOptions) -> Self {
        Self::bare(header, Status::Shutdown, options)
    }

    /// Reassembles a report from decoded parts. Intended for marshallers.
    pub fn from_parts(
        header: Header,
        status: Status,
        error: Option<TaskError>,
        options: TaskOptions,
        returns: Vec<Value>,
    ) -> Self {
        Self {
            header,
            status,
            error,
            options,
            returns,
        }
    }

    fn bare(header: Header, status: Status, options: TaskOptions) -> Self {
        Self {
            header,
            status,
            error: None,
            options,
            returns: Vec::new(),
        }
    }

    /// The immutable header; carries the originating task's ID and name.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The originating task's identifier.
    pub fn id(&self) -> &str {
        self.header.id()
    }

    /// The originating task's function name.
    pub fn name(&self) -> &str {
        self.header.name()
    }

    /// The status carried by this report.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The transported error, if any.
    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// The options of the originating task.
    pub fn options(&self) -> TaskOptions {
        self.options
    }

    /// The return values; non-empty only for `Success`.
    pub fn returns(&self) -> &[Value] {
        &self.returns
    }

    /// Replaces the return values (used after return-type coercion).
    pub fn set_returns(&mut self, returns: Vec<Value>) {
        self.returns = returns;
    }

    /// True once no further reports will be sent for the task.
    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }

    /// True if the task completed successfully.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Success
    }
}

/// Broker acknowledgement that a task was picked up, emitted once per
/// consumed task. The channel carrying receipts flows from the runtime
/// back to the broker and is owned by the runtime side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    id: String,
    disposition: Disposition,
}

/// Whether a consumed task was accepted for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The task was routed to a worker set.
    Accepted,
    /// The task could not be routed (e.g. unknown function name).
    Rejected,
}

impl Receipt {
    /// An accepted receipt for the given task ID.
    pub fn accepted(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            disposition: Disposition::Accepted,
        }
    }

    /// A rejected receipt for the given task ID.
    pub fn rejected(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            disposition: Disposition::Rejected,
        }
    }

    /// The task ID this receipt acknowledges.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The disposition.
    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// True when the task was accepted for execution.
    pub fn is_accepted(&self) -> bool {
        self.disposition == Disposition::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header() -> Header {
        Header::new("id-7", "Work", 0)
    }

    #[test]
    fn test_status_terminal_set() {
        assert!(!Status::None.is_terminal());
        assert!(!Status::Sent.is_terminal());
        assert!(!Status::Progress.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::Fail.is_terminal());
        assert!(Status::Panic.is_terminal());
        assert!(Status::Shutdown.is_terminal());
    }

    #[test]
    fn test_status_wire_round_trip() {
        for raw in 0..=6 {
            let status = Status::from_u16(raw).unwrap();
            assert_eq!(status.as_u16(), raw);
        }
        assert_eq!(Status::from_u16(7), None);
    }

    #[test]
    fn test_success_carries_returns() {
        let report = Report::success(header(), TaskOptions::new(), vec![json!("done")]);
        assert!(report.is_done());
        assert!(report.is_ok());
        assert_eq!(report.returns(), &[json!("done")]);
        assert!(report.error().is_none());
    }

    #[test]
    fn test_fail_carries_error_and_empty_returns() {
        let report = Report::fail(
            header(),
            TaskOptions::new(),
            TaskError::new(ERR_INVOKE, "boom"),
        );
        assert!(report.is_done());
        assert!(!report.is_ok());
        assert_eq!(report.error().unwrap().message(), "boom");
        assert!(report.returns().is_empty());
    }

    #[test]
    fn test_intermediate_reports_not_done() {
        assert!(!Report::sent(header(), TaskOptions::new()).is_done());
        assert!(!Report::progress(header(), TaskOptions::new()).is_done());
        assert!(Report::shutdown(header(), TaskOptions::new()).is_done());
    }

    #[test]
    fn test_report_keeps_task_identity() {
        let report = Report::progress(header(), TaskOptions::new());
        assert_eq!(report.id(), "id-7");
        assert_eq!(report.name(), "Work");
    }

    #[test]
    fn test_receipt_dispositions() {
        assert!(Receipt::accepted("a").is_accepted());
        assert!(!Receipt::rejected("a").is_accepted());
        assert_eq!(Receipt::accepted("a").id(), "a");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", Status::Progress), "Progress");
        assert_eq!(format!("{}", Status::Shutdown), "Shutdown");
    }
}
