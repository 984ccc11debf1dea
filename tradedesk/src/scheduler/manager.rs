//! The scheduler: submission, dedupe, FIFO dispatch, stop, shutdown.
//!
//! One [`Scheduler`] instance owns everything: the registry, the event bus,
//! the worker pool, the dispatcher task, and the stall monitor. Handles are
//! cheap clones; every clone talks to the same core.
//!
//! Dispatch is a slot-gated FIFO. Submissions join a queue in arrival order;
//! a dispatcher task pairs the queue head with a free semaphore permit and
//! spawns a runner, moving the permit into the worker so the slot is
//! released exactly when the worker finishes, however it finishes.

use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::persistence::{Persistence, PersistenceError};
use crate::pipeline::PipelineFactory;

use super::bus::{EventBus, EventListener};
use super::config::SchedulerConfig;
use super::error::{StopError, StopOutcome, ValidationError};
use super::event::{Event, EventKind};
use super::job::{AnalysisParams, JobId, JobSnapshot, StopReason, UserId};
use super::monitor::StallMonitor;
use super::registry::{Registry, SchedulerStats, SubmitDecision};
use super::runner::{persist_event, JobRunner};

/// Accepted submission.
#[derive(Clone, Debug)]
pub struct Submission {
    /// The job to follow. For duplicates, the already-active job.
    pub job_id: JobId,

    /// True if the user already had an active-or-queued job and no new one
    /// was created.
    pub duplicate: bool,
}

/// Handle to the scheduler core. Clone freely.
#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    persistence: Arc<dyn Persistence>,
    factory: Arc<dyn PipelineFactory>,
    work: Arc<Notify>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Creates the scheduler and spawns its dispatcher and stall monitor.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        factory: Arc<dyn PipelineFactory>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(EventBus::new(
            config.event_buffer_capacity,
            config.listener_outbox_capacity,
        ));
        let scheduler = Self {
            slots: Arc::new(Semaphore::new(config.max_concurrency)),
            work: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            registry: Arc::clone(&registry),
            bus: Arc::clone(&bus),
            persistence,
            factory,
            config,
        };

        StallMonitor::new(
            registry,
            bus,
            scheduler.config.stall_check_interval,
            scheduler.config.stall_miss_threshold,
        )
        .spawn(scheduler.shutdown.clone());

        let dispatcher = scheduler.clone();
        tokio::spawn(async move { dispatcher.dispatch_loop().await });

        info!(
            max_concurrency = scheduler.config.max_concurrency,
            "scheduler started"
        );
        scheduler
    }

    /// Submits an analysis request.
    ///
    /// Validation failures reject the request outright. A user with an
    /// active-or-queued job gets that job back instead of a new one.
    pub async fn submit(
        &self,
        owner: UserId,
        params: AnalysisParams,
    ) -> Result<Submission, ValidationError> {
        params.validate()?;

        match self.registry.submit(owner, params) {
            SubmitDecision::Duplicate(job_id) => {
                debug!(%owner, %job_id, "submission deduplicated onto active job");
                Ok(Submission {
                    job_id,
                    duplicate: true,
                })
            }
            SubmitDecision::Queued(job_id) => {
                let event = self.bus.publish(
                    &job_id,
                    EventKind::StatusChange,
                    serde_json::json!({ "state": "queued" }),
                );
                persist_event(&*self.persistence, &event).await;
                self.persist_snapshot(&job_id).await;
                info!(%owner, %job_id, "job queued");
                self.work.notify_one();
                Ok(Submission {
                    job_id,
                    duplicate: false,
                })
            }
        }
    }

    /// Requests a stop on behalf of `requester`, who must own the job.
    /// Pass `None` to bypass the ownership check (admin/system paths).
    pub async fn stop(
        &self,
        job_id: &JobId,
        requester: Option<UserId>,
    ) -> Result<StopOutcome, StopError> {
        let outcome = self
            .registry
            .request_stop(job_id, requester, StopReason::UserRequested)?;
        match outcome {
            StopOutcome::Dequeued => {
                // No runner exists or ever will; the terminal event is ours
                // to publish.
                let event = self.bus.publish(
                    job_id,
                    EventKind::Interrupted,
                    serde_json::json!({ "reason": StopReason::UserRequested.as_str() }),
                );
                persist_event(&*self.persistence, &event).await;
                self.persist_snapshot(job_id).await;
                info!(%job_id, "queued job cancelled");
            }
            StopOutcome::SignalSent => {
                info!(%job_id, "stop signalled to running job");
            }
            StopOutcome::AlreadyTerminal(state) => {
                debug!(%job_id, %state, "stop on terminal job ignored");
            }
        }
        Ok(outcome)
    }

    /// Current snapshot of one job.
    pub fn get(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.registry.snapshot(job_id)
    }

    /// Final decision payload of a completed job.
    pub fn result(&self, job_id: &JobId) -> Option<serde_json::Value> {
        self.registry.result(job_id)
    }

    /// All jobs this scheduler has seen, in submission order.
    pub fn list(&self, owner: Option<UserId>) -> Vec<JobSnapshot> {
        self.registry.list(owner)
    }

    /// Aggregate counts by state.
    pub fn stats(&self) -> SchedulerStats {
        self.registry.stats()
    }

    /// History from the storage collaborator (survives restarts).
    pub async fn stored_history(
        &self,
        owner: Option<UserId>,
        limit: usize,
    ) -> Result<Vec<JobSnapshot>, PersistenceError> {
        self.persistence.load_history(owner, limit).await
    }

    /// Subscribes to a job's event stream, replaying retained events after
    /// the `from_seq` cursor (the last sequence number the caller already
    /// holds; 0 replays everything retained). Returns `None` for a job this
    /// scheduler has never seen.
    pub fn subscribe(
        &self,
        job_id: &JobId,
        from_seq: u64,
    ) -> Option<(Vec<Event>, EventListener)> {
        self.registry.snapshot(job_id)?;
        Some(self.bus.subscribe(job_id, from_seq))
    }

    /// Graceful shutdown: stops intake, interrupts all active jobs, waits
    /// for workers to drain, then closes all event streams.
    pub async fn shutdown(&self) {
        info!("scheduler shutting down");
        self.shutdown.cancel();

        for job_id in self.registry.active_job_ids() {
            match self
                .registry
                .request_stop(&job_id, None, StopReason::Shutdown)
            {
                Ok(StopOutcome::Dequeued) => {
                    let event = self.bus.publish(
                        &job_id,
                        EventKind::Interrupted,
                        serde_json::json!({ "reason": StopReason::Shutdown.as_str() }),
                    );
                    persist_event(&*self.persistence, &event).await;
                    self.persist_snapshot(&job_id).await;
                }
                Ok(_) => {}
                Err(err) => warn!(%job_id, %err, "stop during shutdown failed"),
            }
        }

        // Workers hold permits until they finish; acquiring the whole pool
        // waits for every in-flight job to reach its terminal event.
        let _drain = self
            .slots
            .acquire_many(self.config.max_concurrency as u32)
            .await;
        self.bus.close_all();
        info!("scheduler stopped");
    }

    async fn dispatch_loop(&self) {
        let mut sweep = tokio::time::interval(self.config.stall_check_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.work.notified() => self.dispatch_ready(),
                _ = sweep.tick() => {
                    let released = self.bus.sweep_terminal(self.config.buffer_grace);
                    if released > 0 {
                        debug!(released, "terminal event buffers released");
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    /// Pairs queued jobs with free worker slots until one of them runs out.
    fn dispatch_ready(&self) {
        loop {
            if self.registry.queued_len() == 0 {
                return;
            }
            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let ticket = match self.registry.take_next_queued() {
                Some(ticket) => ticket,
                None => return,
            };

            let job_id = ticket.job_id.clone();
            let pipeline = self.factory.build(&ticket.job_id, &ticket.params);
            let runner = JobRunner::new(
                ticket,
                pipeline,
                Arc::clone(&self.bus),
                Arc::clone(&self.registry),
                Arc::clone(&self.persistence),
            );
            let work = Arc::clone(&self.work);
            debug!(%job_id, "job dispatched");
            tokio::spawn(async move {
                let _slot = permit;
                runner.run().await;
                // Slot free again; the queue may have a successor waiting.
                work.notify_one();
            });
        }
    }

    async fn persist_snapshot(&self, job_id: &JobId) {
        if let Some(snapshot) = self.registry.snapshot(job_id) {
            if let Err(err) = self.persistence.save_snapshot(&snapshot).await {
                warn!(%job_id, %err, "failed to persist job snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::NullPersistence;
    use crate::pipeline::{Phase, PhaseContext, PhaseResult, Pipeline};
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    struct InstantPhase;

    impl Phase for InstantPhase {
        fn name(&self) -> &str {
            "instant"
        }

        fn run<'a>(
            &'a mut self,
            _ctx: &'a mut PhaseContext,
        ) -> Pin<Box<dyn Future<Output = PhaseResult> + Send + 'a>> {
            Box::pin(async { Ok(Some(serde_json::json!({ "decision": "HOLD" }))) })
        }
    }

    struct InstantPipeline;

    impl Pipeline for InstantPipeline {
        fn phases(&mut self) -> Vec<Box<dyn Phase>> {
            vec![Box::new(InstantPhase)]
        }
    }

    struct InstantFactory;

    impl PipelineFactory for InstantFactory {
        fn build(&self, _job_id: &JobId, _params: &AnalysisParams) -> Box<dyn Pipeline> {
            Box::new(InstantPipeline)
        }
    }

    fn params(ticker: &str) -> AnalysisParams {
        AnalysisParams {
            ticker: ticker.to_string(),
            analysis_date: "2025-06-02".to_string(),
            analysts: vec!["market".to_string()],
            research_depth: 1,
            llm_provider: "openai".to_string(),
            quick_model: "gpt-4o-mini".to_string(),
            deep_model: "gpt-4o".to_string(),
            credentials: BTreeMap::new(),
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(InstantFactory),
            Arc::new(NullPersistence),
        )
    }

    async fn wait_terminal(scheduler: &Scheduler, job_id: &JobId) -> JobSnapshot {
        for _ in 0..200 {
            if let Some(snapshot) = scheduler.get(job_id) {
                if snapshot.state.is_terminal() {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_submit_validates_params() {
        let scheduler = scheduler();
        let mut bad = params("AAPL");
        bad.analysts.clear();
        let err = scheduler.submit(UserId(1), bad).await.unwrap_err();
        assert_eq!(err, ValidationError::NoAnalysts);
        assert!(scheduler.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let scheduler = scheduler();
        let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
        assert!(!submission.duplicate);
        let snapshot = wait_terminal(&scheduler, &submission.job_id).await;
        assert_eq!(snapshot.state, crate::scheduler::JobState::Completed);
        assert_eq!(snapshot.progress, 100.0);
        assert_eq!(
            scheduler.result(&submission.job_id).unwrap()["decision"],
            "HOLD"
        );
    }

    #[tokio::test]
    async fn test_subscribe_unknown_job() {
        let scheduler = scheduler();
        assert!(scheduler.subscribe(&JobId::new("nope"), 0).is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_job() {
        let scheduler = scheduler();
        let err = scheduler
            .stop(&JobId::new("nope"), Some(UserId(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StopError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_terminal_event_stream_has_complete() {
        let scheduler = scheduler();
        let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
        wait_terminal(&scheduler, &submission.job_id).await;

        let (replay, _listener) = scheduler.subscribe(&submission.job_id, 0).unwrap();
        let last = replay.last().unwrap();
        assert_eq!(last.kind, EventKind::Complete);
        // Gap-free, in-order sequence from 1.
        for (i, event) in replay.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1);
        }
    }
}
