//! Error types for the scheduler.
//!
//! Per-job failures are contained to that job and reported through its
//! terminal event; the error types here are the ones surfaced synchronously
//! to callers of `submit` and `stop`.

use thiserror::Error;

use super::job::{JobId, JobState, UserId};

/// Rejected submission parameters.
///
/// Raised before any job record is created, so a bad submission never
/// consumes a queue slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Ticker was missing or blank.
    #[error("ticker must not be empty")]
    EmptyTicker,

    /// Analysis date did not parse as YYYY-MM-DD.
    #[error("invalid analysis date: {date} (expected YYYY-MM-DD)")]
    InvalidDate { date: String },

    /// No analysts selected.
    #[error("at least one analyst must be selected")]
    NoAnalysts,

    /// Research depth outside the accepted range.
    #[error("research depth {depth} out of range")]
    DepthOutOfRange { depth: u32 },
}

/// Failure of a `stop` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopError {
    /// No job with this ID is known to the scheduler.
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    /// The requester is neither the job's owner nor an admin.
    #[error("{requester} is not allowed to stop job {job_id}")]
    NotOwner { job_id: JobId, requester: UserId },
}

/// Outcome of a successful `stop` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The job was removed from the queue before a runner ever started.
    Dequeued,

    /// The running job's cancellation token was signalled; it will reach
    /// `Interrupted` at its next phase boundary.
    SignalSent,

    /// The job was already terminal; nothing to do.
    AlreadyTerminal(JobState),
}
