//! External agent-pipeline interface.
//!
//! The scheduler treats the multi-agent analysis graph as an opaque sequence
//! of named phases ("analyst team", "research debate", "risk review", ...).
//! Each phase reports progress through a [`PhaseContext`] and either returns
//! an optional payload or fails with a [`PhaseError`]. The last payload a
//! phase returns becomes the job's final decision payload.
//!
//! Cancellation is cooperative: the runner checks its token between phases,
//! and well-behaved phases also poll `ctx.is_cancelled()` at their own
//! checkpoints. A phase already in flight runs to its next checkpoint; there
//! is no preemption of external LLM/data calls.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::scheduler::{AnalysisParams, JobId};

/// A progress callback from a pipeline phase.
#[derive(Clone, Debug)]
pub struct ProgressUpdate {
    /// Name of the phase reporting.
    pub phase: String,

    /// Agent within the phase (e.g. "market_analyst"), or "system".
    pub agent: String,

    /// Human-readable message.
    pub message: String,

    /// Reported completion percentage, if the callback carries one.
    pub percent: Option<f32>,
}

/// Receiver side of phase progress callbacks.
///
/// Implemented by the job runner; emitting must never block the phase.
pub trait ProgressSink: Send + Sync {
    /// Accepts one progress callback.
    fn emit(&self, update: ProgressUpdate);
}

/// Execution context handed to each phase.
pub struct PhaseContext {
    job_id: JobId,
    cancel: CancellationToken,
    sink: Arc<dyn ProgressSink>,
}

impl PhaseContext {
    /// Creates a phase context. Called by the job runner.
    pub(crate) fn new(
        job_id: JobId,
        cancel: CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            job_id,
            cancel,
            sink,
        }
    }

    /// Returns the job this phase belongs to.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Reports progress. Translated 1:1 into a bus event by the runner.
    pub fn emit(&mut self, update: ProgressUpdate) {
        self.sink.emit(update);
    }

    /// Returns true if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested, for phases that want to
    /// race their I/O against it.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl fmt::Debug for PhaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseContext")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Result of a phase: an optional payload, or a failure.
pub type PhaseResult = Result<Option<serde_json::Value>, PhaseError>;

/// One named stage of the analysis pipeline.
pub trait Phase: Send {
    /// Short phase name for logs and step labels.
    fn name(&self) -> &str;

    /// Executes the phase.
    fn run<'a>(
        &'a mut self,
        ctx: &'a mut PhaseContext,
    ) -> Pin<Box<dyn Future<Output = PhaseResult> + Send + 'a>>;
}

/// The opaque agent pipeline for one job.
pub trait Pipeline: Send + 'static {
    /// Produces the phases to run, in order.
    fn phases(&mut self) -> Vec<Box<dyn Phase>>;
}

/// Builds a pipeline from validated submission parameters.
///
/// The factory is the seam between the scheduler core and the actual agent
/// graph; the core never looks inside what it returns.
pub trait PipelineFactory: Send + Sync {
    /// Builds the pipeline for one job.
    fn build(&self, job_id: &JobId, params: &AnalysisParams) -> Box<dyn Pipeline>;
}

/// Failure raised by a pipeline phase.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PhaseError {
    message: String,
}

impl PhaseError {
    /// Creates a phase error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the raw error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classifies the error for user-facing messaging.
    pub fn kind(&self) -> PipelineErrorKind {
        PipelineErrorKind::classify(&self.message)
    }
}

/// Broad classification of pipeline failures.
///
/// Matches the triage the surrounding product applies to LLM provider
/// errors so clients can render actionable messaging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// The model's context window was exceeded.
    ContextLength,

    /// Credential rejected or missing.
    Authentication,

    /// Network failure or provider timeout.
    Network,

    /// Provider rate limit hit.
    RateLimit,

    /// Anything else.
    Other,
}

impl PipelineErrorKind {
    /// Classifies an error message by substring heuristics.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("context_length_exceeded") || lower.contains("maximum context length") {
            Self::ContextLength
        } else if lower.contains("api_key")
            || lower.contains("api key")
            || lower.contains("authentication")
            || lower.contains("unauthorized")
        {
            Self::Authentication
        } else if lower.contains("rate_limit")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
        {
            Self::RateLimit
        } else if lower.contains("connection") || lower.contains("timeout") {
            Self::Network
        } else {
            Self::Other
        }
    }

    /// Returns advice appended to user-facing error messages, if any.
    pub fn advice(&self) -> Option<&'static str> {
        match self {
            Self::ContextLength => Some(
                "analysis exceeded the model context window; reduce the analyst \
                 set, lower the research depth, or pick a larger-context model",
            ),
            Self::Authentication => Some(
                "credential was rejected; check that the key is valid, unexpired, \
                 and has remaining quota",
            ),
            Self::Network => Some("network failure reaching the provider; retry later"),
            Self::RateLimit => Some("provider rate limit hit; retry later"),
            Self::Other => None,
        }
    }
}
