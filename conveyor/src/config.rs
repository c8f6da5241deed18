//! Runtime configuration.
//!
//! Channel capacities and routine counts for the dispatch fabric. The
//! defaults suit an embedded runtime with a handful of registered
//! functions; integration tests shrink them to exercise back-pressure.

/// Default capacity of the task ingress channel between a listener and
/// the mapper routines.
pub const DEFAULT_TASK_CHANNEL_CAPACITY: usize = 64;

/// Default capacity of a receipt channel back to the broker.
pub const DEFAULT_RECEIPT_CHANNEL_CAPACITY: usize = 16;

/// Default capacity of a per-task report stream handed to the caller.
pub const DEFAULT_REPORT_STREAM_CAPACITY: usize = 10;

/// Default number of mapper routines pulling the ingress channel.
pub const DEFAULT_MAPPER_COUNT: usize = 3;

/// Default capacity of encoded-frame channels in the driver-backed bridge.
pub const DEFAULT_BYTE_CHANNEL_CAPACITY: usize = 64;

/// Extra slots on every per-worker report channel beyond the configured
/// queue size, so a full Sent/Progress/terminal sequence never blocks the
/// worker before the caller starts draining.
pub const REPORT_CHANNEL_HEADROOM: usize = 3;

/// Capacity of the pool-level channel for reports that have no worker
/// set, such as routing failures.
pub const STRAY_REPORT_CAPACITY: usize = 64;

/// Configuration for a [`crate::runtime::Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Capacity of the task ingress channel (the `B` in the
    /// parallel-mapping property: with `W` workers, `W + B` in-flight
    /// tasks are accepted before the submitter feels back-pressure).
    pub task_channel_capacity: usize,

    /// Capacity of receipt channels back to the broker.
    pub receipt_channel_capacity: usize,

    /// Capacity of each per-task report stream.
    pub report_stream_capacity: usize,

    /// Number of mapper routines pulling the ingress channel.
    pub mapper_count: usize,

    /// Capacity of encoded-frame channels in the driver-backed bridge.
    pub byte_channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            task_channel_capacity: DEFAULT_TASK_CHANNEL_CAPACITY,
            receipt_channel_capacity: DEFAULT_RECEIPT_CHANNEL_CAPACITY,
            report_stream_capacity: DEFAULT_REPORT_STREAM_CAPACITY,
            mapper_count: DEFAULT_MAPPER_COUNT,
            byte_channel_capacity: DEFAULT_BYTE_CHANNEL_CAPACITY,
        }
    }
}
