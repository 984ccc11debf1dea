//! Progress and lifecycle events.
//!
//! Events are the only channel through which a running job communicates with
//! the outside world. They are immutable, produced only by the job's runner
//! (plus the scheduler for jobs cancelled while still queued), and carry a
//! per-job sequence number that is strictly increasing so listeners can
//! detect gaps and resume after a reconnect.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::job::JobId;

/// Kind of a job event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A log line from a pipeline phase.
    Log,

    /// A progress callback carrying a percentage.
    Progress,

    /// The job moved to a new lifecycle state.
    StatusChange,

    /// Terminal: the job finished with a decision payload.
    Complete,

    /// Terminal: a pipeline phase failed.
    Error,

    /// Terminal: the job was stopped.
    Interrupted,
}

impl EventKind {
    /// Returns true if this event marks a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Interrupted)
    }
}

/// An ordered, immutable record of something that happened to a job.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    /// Job this event belongs to.
    pub job_id: JobId,

    /// Sequence number, strictly increasing per job, starting at 1.
    pub seq: u64,

    /// Wall-clock time the event was published.
    pub timestamp: DateTime<Utc>,

    /// What happened.
    pub kind: EventKind,

    /// Structured payload; shape depends on `kind`.
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_terminal() {
        assert!(!EventKind::Log.is_terminal());
        assert!(!EventKind::Progress.is_terminal());
        assert!(!EventKind::StatusChange.is_terminal());
        assert!(EventKind::Complete.is_terminal());
        assert!(EventKind::Error.is_terminal());
        assert!(EventKind::Interrupted.is_terminal());
    }

    #[test]
    fn test_event_serializes_kind_lowercase() {
        let event = Event {
            job_id: JobId::new("analysis-1"),
            seq: 1,
            timestamp: Utc::now(),
            kind: EventKind::StatusChange,
            payload: serde_json::json!({"state": "running"}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "statuschange");
        assert_eq!(json["seq"], 1);
    }
}
