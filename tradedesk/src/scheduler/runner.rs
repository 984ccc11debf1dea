//! Per-job execution.
//!
//! A runner owns one dispatched job from slot acquisition to its terminal
//! event. It walks the pipeline's phases in order, checking for cancellation
//! at every phase boundary, translating progress callbacks into bus events,
//! and producing exactly one terminal event whatever happens: completion,
//! phase failure, cancellation, or a panic inside a phase.
//!
//! Error messages pass through secret redaction before they reach the bus;
//! provider errors are fond of echoing the request, credentials included.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::persistence::Persistence;
use crate::pipeline::{PhaseContext, PhaseError, Pipeline, ProgressSink, ProgressUpdate};

use super::bus::EventBus;
use super::event::{Event, EventKind};
use super::job::{JobId, JobState, StopReason};
use super::monitor::ActivityTracker;
use super::registry::{DispatchTicket, Registry};

/// Replacement text for secret values in outbound messages.
const REDACTED: &str = "***";

/// Replaces every occurrence of each secret in `message`.
pub(crate) fn redact(message: &str, secrets: &[String]) -> String {
    let mut out = message.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            out = out.replace(secret.as_str(), REDACTED);
        }
    }
    out
}

enum RunOutcome {
    Completed(Option<serde_json::Value>),
    Failed(PhaseError),
    Interrupted,
}

/// Executes one dispatched job to its terminal event.
pub(crate) struct JobRunner {
    ticket: DispatchTicket,
    pipeline: Box<dyn Pipeline>,
    bus: Arc<EventBus>,
    registry: Arc<Registry>,
    persistence: Arc<dyn Persistence>,
}

impl JobRunner {
    pub(crate) fn new(
        ticket: DispatchTicket,
        pipeline: Box<dyn Pipeline>,
        bus: Arc<EventBus>,
        registry: Arc<Registry>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            ticket,
            pipeline,
            bus,
            registry,
            persistence,
        }
    }

    /// Runs the job. Always publishes exactly one terminal event.
    pub(crate) async fn run(self) {
        let JobRunner {
            ticket,
            pipeline,
            bus,
            registry,
            persistence,
        } = self;
        let job_id = ticket.job_id.clone();
        let secrets = ticket.params.secret_values();

        // Dispatch already moved the job to Initializing under the registry
        // lock; the runner only announces it.
        publish_status(&bus, &*persistence, &job_id, JobState::Initializing).await;
        persist_snapshot(&registry, &*persistence, &job_id).await;

        // A stop can land between dispatch and here.
        if ticket.cancel.is_cancelled() {
            finish_interrupted(&bus, &registry, &*persistence, &job_id).await;
            return;
        }

        registry.mark_running(&job_id);
        publish_status(&bus, &*persistence, &job_id, JobState::Running).await;
        ticket.activity.touch();
        info!(job_id = %job_id, ticker = %ticket.params.ticker, "job running");

        let sink: Arc<dyn ProgressSink> = Arc::new(RunnerSink {
            job_id: job_id.clone(),
            bus: Arc::clone(&bus),
            registry: Arc::clone(&registry),
            persistence: Arc::clone(&persistence),
            activity: Arc::clone(&ticket.activity),
            secrets: secrets.clone(),
        });

        // The pipeline runs in its own task so a panicking phase is contained
        // and still yields a terminal Error event for the job.
        let drive = tokio::spawn(drive_pipeline(
            pipeline,
            job_id.clone(),
            ticket.cancel.clone(),
            sink,
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::clone(&persistence),
        ));
        let outcome = match drive.await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => {
                error!(job_id = %job_id, "pipeline panicked");
                RunOutcome::Failed(PhaseError::new("analysis pipeline panicked"))
            }
            Err(_) => RunOutcome::Interrupted,
        };

        match outcome {
            RunOutcome::Completed(payload) => {
                registry.finish(&job_id, JobState::Completed, None, payload.clone());
                let event = bus.publish(
                    &job_id,
                    EventKind::Complete,
                    serde_json::json!({
                        "ticker": ticket.params.ticker,
                        "decision": payload,
                    }),
                );
                persist_event(&*persistence, &event).await;
                info!(job_id = %job_id, "job completed");
            }
            RunOutcome::Failed(err) => {
                let message = redact(err.message(), &secrets);
                let mut display = message.clone();
                if let Some(advice) = err.kind().advice() {
                    display = format!("{message} ({advice})");
                }
                registry.finish(&job_id, JobState::Error, None, None);
                let event = bus.publish(
                    &job_id,
                    EventKind::Error,
                    serde_json::json!({ "message": display }),
                );
                persist_event(&*persistence, &event).await;
                error!(job_id = %job_id, error = %message, "job failed");
            }
            RunOutcome::Interrupted => {
                finish_interrupted(&bus, &registry, &*persistence, &job_id).await;
                return;
            }
        }
        persist_snapshot(&registry, &*persistence, &job_id).await;
    }
}

async fn finish_interrupted(
    bus: &EventBus,
    registry: &Registry,
    persistence: &dyn Persistence,
    job_id: &JobId,
) {
    let reason = registry
        .pending_stop(job_id)
        .unwrap_or(StopReason::UserRequested);
    registry.finish(job_id, JobState::Interrupted, Some(reason), None);
    let event = bus.publish(
        job_id,
        EventKind::Interrupted,
        serde_json::json!({ "reason": reason.as_str() }),
    );
    persist_event(persistence, &event).await;
    info!(job_id = %job_id, reason = %reason, "job interrupted");
    persist_snapshot(registry, persistence, job_id).await;
}

async fn publish_status(
    bus: &EventBus,
    persistence: &dyn Persistence,
    job_id: &JobId,
    state: JobState,
) {
    let event = bus.publish(
        job_id,
        EventKind::StatusChange,
        serde_json::json!({ "state": state.to_string() }),
    );
    persist_event(persistence, &event).await;
}

/// Mirrors one published event into storage; failures are logged and
/// swallowed like every other persistence failure.
pub(crate) async fn persist_event(persistence: &dyn Persistence, event: &Event) {
    if let Err(err) = persistence.save_event(event).await {
        warn!(job_id = %event.job_id, seq = event.seq, %err, "failed to persist event");
    }
}

/// Persistence failures are logged and swallowed; storage must never take a
/// job down with it.
async fn persist_snapshot(registry: &Registry, persistence: &dyn Persistence, job_id: &JobId) {
    if let Some(snapshot) = registry.snapshot(job_id) {
        if let Err(err) = persistence.save_snapshot(&snapshot).await {
            warn!(job_id = %job_id, %err, "failed to persist job snapshot");
        }
    }
}

async fn drive_pipeline(
    mut pipeline: Box<dyn Pipeline>,
    job_id: JobId,
    cancel: CancellationToken,
    sink: Arc<dyn ProgressSink>,
    bus: Arc<EventBus>,
    registry: Arc<Registry>,
    persistence: Arc<dyn Persistence>,
) -> RunOutcome {
    let phases = pipeline.phases();
    let total = phases.len();
    let mut ctx = PhaseContext::new(job_id.clone(), cancel.clone(), sink);
    let mut final_payload = None;

    for (index, mut phase) in phases.into_iter().enumerate() {
        if cancel.is_cancelled() {
            debug!(job_id = %job_id, phase = phase.name(), "stop observed at phase boundary");
            return RunOutcome::Interrupted;
        }

        let name = phase.name().to_string();
        registry.record_progress(&job_id, Some(&name), None);
        let event = bus.publish(
            &job_id,
            EventKind::Log,
            serde_json::json!({
                "phase": name,
                "message": format!("phase {}/{} started: {}", index + 1, total, name),
            }),
        );
        persist_event(&*persistence, &event).await;

        match phase.run(&mut ctx).await {
            Ok(Some(payload)) => final_payload = Some(payload),
            Ok(None) => {}
            Err(err) => return RunOutcome::Failed(err),
        }
    }

    // The end of the pipeline is a boundary too: a stop that raced the last
    // phase wins over completion, matching what the caller asked for.
    if cancel.is_cancelled() {
        return RunOutcome::Interrupted;
    }
    RunOutcome::Completed(final_payload)
}

/// Bridges phase progress callbacks onto the bus and the registry.
struct RunnerSink {
    job_id: JobId,
    bus: Arc<EventBus>,
    registry: Arc<Registry>,
    persistence: Arc<dyn Persistence>,
    activity: Arc<ActivityTracker>,
    secrets: Vec<String>,
}

impl ProgressSink for RunnerSink {
    fn emit(&self, update: ProgressUpdate) {
        self.activity.touch();
        self.registry
            .record_progress(&self.job_id, Some(&update.phase), update.percent);

        let message = redact(&update.message, &self.secrets);
        let kind = if update.percent.is_some() {
            EventKind::Progress
        } else {
            EventKind::Log
        };
        let mut payload = serde_json::json!({
            "phase": update.phase,
            "agent": update.agent,
            "message": message,
        });
        if let Some(percent) = update.percent {
            payload["percent"] = serde_json::json!(percent.clamp(0.0, 100.0));
        }
        let event = self.bus.publish(&self.job_id, kind, payload);
        // emit() is called from inside a phase; the storage write must not
        // stall the pipeline, so it runs detached.
        let persistence = Arc::clone(&self.persistence);
        tokio::spawn(async move {
            persist_event(&*persistence, &event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_replaces_all_occurrences() {
        let secrets = vec!["sk-abc123".to_string()];
        let message = "auth failed for key sk-abc123 (sk-abc123 expired)";
        assert_eq!(
            redact(message, &secrets),
            "auth failed for key *** (*** expired)"
        );
    }

    #[test]
    fn test_redact_handles_multiple_secrets() {
        let secrets = vec!["alpha".to_string(), "beta".to_string()];
        assert_eq!(redact("alpha sent beta", &secrets), "*** sent ***");
    }

    #[test]
    fn test_redact_ignores_empty_secret() {
        let secrets = vec![String::new()];
        assert_eq!(redact("unchanged", &secrets), "unchanged");
    }

    #[test]
    fn test_redact_no_secrets() {
        assert_eq!(redact("plain message", &[]), "plain message");
    }
}
