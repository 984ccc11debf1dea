//! Job identity, lifecycle state, and submission parameters.
//!
//! A job is one analysis request's full lifecycle record. Jobs are owned by
//! the scheduler's registry; everything outside the scheduler sees them only
//! as read-only [`JobSnapshot`] views.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::error::ValidationError;

/// Global counter for generating unique job IDs.
static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for an analysis job.
///
/// Job IDs are opaque strings. Generated IDs embed the ticker for log
/// readability but nothing in the core depends on the format.
#[derive(Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a job ID with the given string value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a unique job ID for an analysis of `ticker`.
    pub fn generate(ticker: &str) -> Self {
        let counter = JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("analysis-{}-{}", counter, ticker))
    }

    /// Returns the string value of this job ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of the user who owns a job.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user-{}", self.0)
    }
}

/// Lifecycle state of an analysis job.
///
/// Transitions are linear per job:
/// `Queued → Initializing → Running → {Completed | Error | Interrupted}`.
/// Terminal states are final; the job record is retained for history but no
/// longer mutated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for a worker slot.
    #[default]
    Queued,

    /// Worker slot acquired, pipeline being set up.
    Initializing,

    /// Pipeline phases executing.
    Running,

    /// All phases finished and a decision was produced.
    Completed,

    /// A pipeline phase failed.
    Error,

    /// Stopped by the user, the stall monitor, or shutdown.
    Interrupted,
}

impl JobState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Interrupted)
    }

    /// Returns true if the job occupies (or will occupy) a worker slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Initializing | Self::Running)
    }

    /// Returns true if the job currently holds a worker slot.
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::Initializing | Self::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
        };
        write!(f, "{}", s)
    }
}

/// Why a job was interrupted.
///
/// Downstream consumers render different messaging for a user-requested stop
/// versus an automatic stall interruption, so the reason rides along on the
/// terminal event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// Explicit stop call from the job's owner (or an admin).
    UserRequested,

    /// The stall monitor observed no activity for too long.
    StallTimeout,

    /// The scheduler is shutting down.
    Shutdown,
}

impl StopReason {
    /// Wire tag carried in `Interrupted` event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserRequested => "user-requested",
            Self::StallTimeout => "stall-timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters of one analysis request.
///
/// The core treats most of this as an opaque payload handed to the pipeline
/// factory; only `validate()` inspects it, and `credentials` values are
/// treated as secrets (never echoed into events, redacted from error
/// messages).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisParams {
    /// Ticker symbol to analyze.
    pub ticker: String,

    /// Trade date in `YYYY-MM-DD` format.
    pub analysis_date: String,

    /// Selected analyst set (e.g. "market", "news", "fundamentals").
    pub analysts: Vec<String>,

    /// Debate/risk-discussion depth.
    pub research_depth: u32,

    /// LLM provider name.
    pub llm_provider: String,

    /// Model used for quick reasoning steps.
    pub quick_model: String,

    /// Model used for deep reasoning steps.
    pub deep_model: String,

    /// Provider credentials, keyed by provider. Values are secrets.
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

/// Maximum accepted research depth.
pub const MAX_RESEARCH_DEPTH: u32 = 10;

impl AnalysisParams {
    /// Validates the parameter set.
    ///
    /// Called by the scheduler before any job record exists, so a bad
    /// submission never consumes a queue slot.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.ticker.trim().is_empty() {
            return Err(ValidationError::EmptyTicker);
        }
        if NaiveDate::parse_from_str(&self.analysis_date, "%Y-%m-%d").is_err() {
            return Err(ValidationError::InvalidDate {
                date: self.analysis_date.clone(),
            });
        }
        if self.analysts.is_empty() {
            return Err(ValidationError::NoAnalysts);
        }
        if self.research_depth == 0 || self.research_depth > MAX_RESEARCH_DEPTH {
            return Err(ValidationError::DepthOutOfRange {
                depth: self.research_depth,
            });
        }
        Ok(())
    }

    /// Returns the secret values that must never appear in event payloads.
    pub fn secret_values(&self) -> Vec<String> {
        self.credentials
            .values()
            .filter(|v| !v.is_empty())
            .cloned()
            .collect()
    }
}

/// Read-only view of a job's current state.
///
/// Snapshots are eventually consistent with the event stream: `get` may
/// briefly lag behind the latest published event for the same job.
#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    /// Job identity.
    pub job_id: JobId,

    /// Owning user.
    pub owner: UserId,

    /// Ticker under analysis.
    pub ticker: String,

    /// Current lifecycle state.
    pub state: JobState,

    /// Human-readable label of the current step.
    pub current_step: String,

    /// Progress percentage, monotonically non-decreasing in [0, 100].
    pub progress: f32,

    /// When the job was submitted.
    pub created_at: DateTime<Utc>,

    /// When a worker slot was acquired, if it has been.
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state, if it has.
    pub completed_at: Option<DateTime<Utc>>,

    /// Stop reason, present only for `Interrupted` jobs.
    pub stop_reason: Option<StopReason>,
}
