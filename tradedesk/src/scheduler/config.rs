//! Scheduler configuration.
//!
//! The stall constants (60-second checks, 5 consecutive misses) mirror the
//! production defaults of the system this core drives. They are product
//! choices, not correctness requirements, so they stay configurable.

use std::time::Duration;

/// Default number of worker slots (jobs executing concurrently).
pub const DEFAULT_MAX_CONCURRENCY: usize = 50;

/// Default interval between stall monitor sweeps.
pub const DEFAULT_STALL_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of consecutive silent sweeps before a job is interrupted.
pub const DEFAULT_STALL_MISS_THRESHOLD: u32 = 5;

/// Default per-job event buffer capacity (replay window).
pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 1024;

/// Default per-listener outbox capacity (slow-listener bound).
pub const DEFAULT_LISTENER_OUTBOX_CAPACITY: usize = 256;

/// Default grace period before a terminal job's event buffer is released.
pub const DEFAULT_BUFFER_GRACE: Duration = Duration::from_secs(300);

/// Configuration for the scheduler core.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Global worker pool size. At most this many jobs occupy
    /// Initializing/Running at any time.
    pub max_concurrency: usize,

    /// Interval between stall monitor sweeps.
    pub stall_check_interval: Duration,

    /// Consecutive silent sweeps before a job is interrupted with reason
    /// `stall-timeout`.
    pub stall_miss_threshold: u32,

    /// Events retained per job for late-subscriber replay.
    pub event_buffer_capacity: usize,

    /// Bounded outbox size per listener; the oldest entry is dropped first
    /// when a listener falls behind.
    pub listener_outbox_capacity: usize,

    /// How long a terminal job's event buffer survives without listeners.
    pub buffer_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            stall_check_interval: DEFAULT_STALL_CHECK_INTERVAL,
            stall_miss_threshold: DEFAULT_STALL_MISS_THRESHOLD,
            event_buffer_capacity: DEFAULT_EVENT_BUFFER_CAPACITY,
            listener_outbox_capacity: DEFAULT_LISTENER_OUTBOX_CAPACITY,
            buffer_grace: DEFAULT_BUFFER_GRACE,
        }
    }
}
