//! Job registry: the scheduler's single source of truth.
//!
//! All job records, the FIFO dispatch queue, and the per-user dedupe index
//! live behind one lock. Every mutation goes through a registry method, so
//! invariants (one active-or-queued job per user, monotone progress, linear
//! state transitions) are enforced in exactly one place.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::error::{StopError, StopOutcome};
use super::job::{AnalysisParams, JobId, JobSnapshot, JobState, StopReason, UserId};
use super::monitor::ActivityTracker;

/// Outcome of registering a submission.
#[derive(Debug)]
pub(crate) enum SubmitDecision {
    /// A new job record was created and queued.
    Queued(JobId),

    /// The user already has an active-or-queued job; no record was created.
    Duplicate(JobId),
}

/// Aggregate counts across all job records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub executing: usize,
    pub completed: usize,
    pub errored: usize,
    pub interrupted: usize,
}

/// One job's full record.
struct JobEntry {
    snapshot: JobSnapshot,
    params: AnalysisParams,
    cancel: CancellationToken,
    activity: Arc<ActivityTracker>,
    pending_stop: Option<StopReason>,
    result: Option<serde_json::Value>,
}

pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    jobs: HashMap<JobId, JobEntry>,
    /// Insertion order, for history listings.
    order: Vec<JobId>,
    /// FIFO of jobs awaiting a worker slot.
    queue: VecDeque<JobId>,
    /// Active-or-queued job per user; at most one entry per user.
    active_by_user: HashMap<UserId, JobId>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                jobs: HashMap::new(),
                order: Vec::new(),
                queue: VecDeque::new(),
                active_by_user: HashMap::new(),
            }),
        }
    }

    /// Registers a submission, enforcing the one-active-job-per-user rule.
    ///
    /// Parameters must already be validated.
    pub(crate) fn submit(&self, owner: UserId, params: AnalysisParams) -> SubmitDecision {
        let mut inner = self.lock();
        if let Some(existing) = inner.active_by_user.get(&owner) {
            return SubmitDecision::Duplicate(existing.clone());
        }

        let job_id = JobId::generate(&params.ticker);
        let entry = JobEntry {
            snapshot: JobSnapshot {
                job_id: job_id.clone(),
                owner,
                ticker: params.ticker.clone(),
                state: JobState::Queued,
                current_step: "queued".to_string(),
                progress: 0.0,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                stop_reason: None,
            },
            params,
            cancel: CancellationToken::new(),
            activity: Arc::new(ActivityTracker::new()),
            pending_stop: None,
            result: None,
        };
        inner.jobs.insert(job_id.clone(), entry);
        inner.order.push(job_id.clone());
        inner.queue.push_back(job_id.clone());
        inner.active_by_user.insert(owner, job_id.clone());
        SubmitDecision::Queued(job_id)
    }

    /// Pops the next queued job for dispatch, in submission order.
    ///
    /// The popped job is moved to `Initializing` under the registry lock,
    /// so a concurrent stop always sees it as executing and signals its
    /// token instead of taking the dequeue path. Jobs interrupted while
    /// still queued were already removed from the queue by `request_stop`.
    pub(crate) fn take_next_queued(&self) -> Option<DispatchTicket> {
        let mut inner = self.lock();
        while let Some(job_id) = inner.queue.pop_front() {
            match inner.jobs.get_mut(&job_id) {
                Some(entry) if entry.snapshot.state == JobState::Queued => {
                    entry.snapshot.state = JobState::Initializing;
                    entry.snapshot.started_at = Some(Utc::now());
                    entry.snapshot.current_step = "initializing".to_string();
                    return Some(DispatchTicket {
                        job_id,
                        params: entry.params.clone(),
                        cancel: entry.cancel.clone(),
                        activity: Arc::clone(&entry.activity),
                    });
                }
                Some(_) => {}
                None => warn!(job_id = %job_id, "queued job vanished from registry"),
            }
        }
        None
    }

    /// Number of jobs currently awaiting dispatch.
    pub(crate) fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Marks a job's pipeline as executing.
    pub(crate) fn mark_running(&self, job_id: &JobId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(job_id) {
            entry.snapshot.state = JobState::Running;
            entry.snapshot.current_step = "running".to_string();
        }
    }

    /// Records a progress report, clamping to [0, 100] and ignoring
    /// regressions so the observed percentage never moves backwards.
    pub(crate) fn record_progress(&self, job_id: &JobId, step: Option<&str>, percent: Option<f32>) {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(job_id) {
            if let Some(step) = step {
                entry.snapshot.current_step = step.to_string();
            }
            if let Some(percent) = percent {
                let clamped = percent.clamp(0.0, 100.0);
                if clamped > entry.snapshot.progress {
                    entry.snapshot.progress = clamped;
                }
            }
        }
    }

    /// Moves a job to a terminal state and releases its owner's dedupe slot.
    pub(crate) fn finish(
        &self,
        job_id: &JobId,
        state: JobState,
        stop_reason: Option<StopReason>,
        result: Option<serde_json::Value>,
    ) {
        debug_assert!(state.is_terminal());
        let mut inner = self.lock();
        let owner = match inner.jobs.get_mut(job_id) {
            Some(entry) => {
                if entry.snapshot.state.is_terminal() {
                    return;
                }
                entry.snapshot.state = state;
                entry.snapshot.stop_reason = stop_reason;
                entry.snapshot.completed_at = Some(Utc::now());
                if state == JobState::Completed {
                    entry.snapshot.progress = 100.0;
                    entry.snapshot.current_step = "completed".to_string();
                }
                entry.result = result;
                entry.snapshot.owner
            }
            None => return,
        };
        if inner.active_by_user.get(&owner) == Some(job_id) {
            inner.active_by_user.remove(&owner);
        }
    }

    /// Handles a stop request against the current state of the job.
    ///
    /// Queued jobs are interrupted in place (they never reach a runner);
    /// executing jobs get their cancellation token signalled and the reason
    /// parked for the runner to report. Terminal jobs are left untouched.
    pub(crate) fn request_stop(
        &self,
        job_id: &JobId,
        requester: Option<UserId>,
        reason: StopReason,
    ) -> Result<StopOutcome, StopError> {
        let mut inner = self.lock();
        let entry = match inner.jobs.get_mut(job_id) {
            Some(entry) => entry,
            None => return Err(StopError::UnknownJob(job_id.clone())),
        };
        if let Some(requester) = requester {
            if entry.snapshot.owner != requester {
                return Err(StopError::NotOwner {
                    job_id: job_id.clone(),
                    requester,
                });
            }
        }
        match entry.snapshot.state {
            state if state.is_terminal() => Ok(StopOutcome::AlreadyTerminal(state)),
            JobState::Queued => {
                entry.snapshot.state = JobState::Interrupted;
                entry.snapshot.stop_reason = Some(reason);
                entry.snapshot.completed_at = Some(Utc::now());
                let owner = entry.snapshot.owner;
                inner.queue.retain(|id| id != job_id);
                if inner.active_by_user.get(&owner) == Some(job_id) {
                    inner.active_by_user.remove(&owner);
                }
                Ok(StopOutcome::Dequeued)
            }
            _ => {
                entry.pending_stop.get_or_insert(reason);
                entry.cancel.cancel();
                Ok(StopOutcome::SignalSent)
            }
        }
    }

    /// Returns the stop reason parked by `request_stop`, if any.
    pub(crate) fn pending_stop(&self, job_id: &JobId) -> Option<StopReason> {
        self.lock().jobs.get(job_id).and_then(|e| e.pending_stop)
    }

    /// Read-only view of one job.
    pub(crate) fn snapshot(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.lock().jobs.get(job_id).map(|e| e.snapshot.clone())
    }

    /// Final decision payload of a completed job.
    pub(crate) fn result(&self, job_id: &JobId) -> Option<serde_json::Value> {
        self.lock().jobs.get(job_id).and_then(|e| e.result.clone())
    }

    /// All jobs in submission order, optionally filtered by owner.
    pub(crate) fn list(&self, owner: Option<UserId>) -> Vec<JobSnapshot> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|e| owner.map_or(true, |o| e.snapshot.owner == o))
            .map(|e| e.snapshot.clone())
            .collect()
    }

    /// Jobs currently holding a worker slot, with their activity trackers.
    /// Consumed by the stall monitor.
    pub(crate) fn executing(&self) -> Vec<(JobId, Arc<ActivityTracker>)> {
        let inner = self.lock();
        inner
            .jobs
            .values()
            .filter(|e| e.snapshot.state.is_executing())
            .map(|e| (e.snapshot.job_id.clone(), Arc::clone(&e.activity)))
            .collect()
    }

    /// All non-terminal job IDs, for shutdown.
    pub(crate) fn active_job_ids(&self) -> Vec<JobId> {
        let inner = self.lock();
        inner
            .jobs
            .values()
            .filter(|e| e.snapshot.state.is_active())
            .map(|e| e.snapshot.job_id.clone())
            .collect()
    }

    /// Aggregate counts by state.
    pub(crate) fn stats(&self) -> SchedulerStats {
        let inner = self.lock();
        let mut stats = SchedulerStats::default();
        for entry in inner.jobs.values() {
            match entry.snapshot.state {
                JobState::Queued => stats.queued += 1,
                JobState::Initializing | JobState::Running => stats.executing += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Error => stats.errored += 1,
                JobState::Interrupted => stats.interrupted += 1,
            }
        }
        stats
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything a worker needs to run one dispatched job.
pub(crate) struct DispatchTicket {
    pub job_id: JobId,
    pub params: AnalysisParams,
    pub cancel: CancellationToken,
    pub activity: Arc<ActivityTracker>,
}
