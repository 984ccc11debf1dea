//! End-to-end scheduler tests with scripted pipelines.
//!
//! Pipelines are driven by per-ticker scripts so each test controls exactly
//! when phases block, emit progress, fail, or panic. Gates are semaphores:
//! a phase acquires one permit, the test releases permits when it wants the
//! phase to proceed.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;

use tradedesk::persistence::{MemoryPersistence, NullPersistence, Persistence};
use tradedesk::pipeline::{
    Phase, PhaseContext, PhaseError, PhaseResult, Pipeline, PipelineFactory, ProgressUpdate,
};
use tradedesk::scheduler::{
    AnalysisParams, EventKind, JobId, JobState, Scheduler, SchedulerConfig, StopOutcome,
    StopReason, UserId,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
enum Behavior {
    /// Return a decision payload.
    Complete(serde_json::Value),
    /// Emit one progress update, then succeed.
    Progress(f32, String),
    /// Block until the test releases a permit on the gate.
    Hold(Arc<Semaphore>),
    /// Block until the job is cancelled, without any activity.
    UntilCancelled,
    /// Fail with this message.
    Fail(String),
    /// Append a label to a shared log, then succeed.
    Record(Arc<Mutex<Vec<String>>>, String),
    /// Track how many jobs sit in this phase at once, gated.
    TrackConcurrency {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
    },
    /// Panic inside the phase.
    Panic,
}

struct ScriptedPhase {
    name: String,
    behavior: Behavior,
}

impl Phase for ScriptedPhase {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(
        &'a mut self,
        ctx: &'a mut PhaseContext,
    ) -> Pin<Box<dyn Future<Output = PhaseResult> + Send + 'a>> {
        Box::pin(async move {
            match &self.behavior {
                Behavior::Complete(value) => Ok(Some(value.clone())),
                Behavior::Progress(percent, message) => {
                    ctx.emit(ProgressUpdate {
                        phase: self.name.clone(),
                        agent: "analyst".to_string(),
                        message: message.clone(),
                        percent: Some(*percent),
                    });
                    Ok(None)
                }
                Behavior::Hold(gate) => {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    Ok(None)
                }
                Behavior::UntilCancelled => {
                    ctx.cancelled().await;
                    Ok(None)
                }
                Behavior::Fail(message) => Err(PhaseError::new(message.clone())),
                Behavior::Record(log, label) => {
                    log.lock().unwrap().push(label.clone());
                    Ok(None)
                }
                Behavior::TrackConcurrency {
                    current,
                    peak,
                    gate,
                } => {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(None)
                }
                Behavior::Panic => panic!("scripted phase panic"),
            }
        })
    }
}

struct ScriptedPipeline {
    script: Vec<(String, Behavior)>,
}

impl Pipeline for ScriptedPipeline {
    fn phases(&mut self) -> Vec<Box<dyn Phase>> {
        self.script
            .drain(..)
            .map(|(name, behavior)| Box::new(ScriptedPhase { name, behavior }) as Box<dyn Phase>)
            .collect()
    }
}

/// Builds pipelines from scripts keyed by ticker.
#[derive(Clone, Default)]
struct ScriptedFactory {
    scripts: Arc<Mutex<HashMap<String, Vec<(String, Behavior)>>>>,
}

impl ScriptedFactory {
    fn script(&self, ticker: &str, phases: Vec<(&str, Behavior)>) {
        self.scripts.lock().unwrap().insert(
            ticker.to_string(),
            phases
                .into_iter()
                .map(|(n, b)| (n.to_string(), b))
                .collect(),
        );
    }
}

impl PipelineFactory for ScriptedFactory {
    fn build(&self, _job_id: &JobId, params: &AnalysisParams) -> Box<dyn Pipeline> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&params.ticker)
            .cloned()
            .unwrap_or_else(|| {
                vec![(
                    "decide".to_string(),
                    Behavior::Complete(serde_json::json!({ "decision": "HOLD" })),
                )]
            });
        Box::new(ScriptedPipeline { script })
    }
}

fn params(ticker: &str) -> AnalysisParams {
    AnalysisParams {
        ticker: ticker.to_string(),
        analysis_date: "2025-06-02".to_string(),
        analysts: vec!["market".to_string(), "news".to_string()],
        research_depth: 2,
        llm_provider: "openai".to_string(),
        quick_model: "gpt-4o-mini".to_string(),
        deep_model: "gpt-4o".to_string(),
        credentials: BTreeMap::new(),
    }
}

fn scheduler_with(factory: &ScriptedFactory, config: SchedulerConfig) -> Scheduler {
    Scheduler::new(config, Arc::new(factory.clone()), Arc::new(NullPersistence))
}

async fn wait_for_state(scheduler: &Scheduler, job_id: &JobId, state: JobState) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if scheduler.get(job_id).map(|s| s.state) == Some(state) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "job {job_id} never reached {state}, currently {:?}",
                scheduler.get(job_id).map(|s| s.state)
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_terminal(scheduler: &Scheduler, job_id: &JobId) -> JobState {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if let Some(snapshot) = scheduler.get(job_id) {
            if snapshot.state.is_terminal() {
                return snapshot.state;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("job {job_id} never reached a terminal state");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn happy_path_produces_ordered_stream_and_decision() {
    let factory = ScriptedFactory::default();
    factory.script(
        "AAPL",
        vec![
            ("analysts", Behavior::Progress(30.0, "analyst team done".into())),
            ("research", Behavior::Progress(60.0, "debate settled".into())),
            (
                "decide",
                Behavior::Complete(serde_json::json!({ "decision": "BUY" })),
            ),
        ],
    );
    let scheduler = scheduler_with(&factory, SchedulerConfig::default());

    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    assert!(!submission.duplicate);
    assert_eq!(wait_terminal(&scheduler, &submission.job_id).await, JobState::Completed);

    let snapshot = scheduler.get(&submission.job_id).unwrap();
    assert_eq!(snapshot.progress, 100.0);
    assert!(snapshot.started_at.is_some());
    assert!(snapshot.completed_at.is_some());
    assert_eq!(
        scheduler.result(&submission.job_id).unwrap()["decision"],
        "BUY"
    );

    let (replay, _listener) = scheduler.subscribe(&submission.job_id, 0).unwrap();
    // Strictly increasing, gap-free sequence from 1.
    for (i, event) in replay.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1);
    }
    assert_eq!(replay.first().unwrap().kind, EventKind::StatusChange);
    assert_eq!(replay.last().unwrap().kind, EventKind::Complete);
    assert!(replay.iter().any(|e| e.kind == EventKind::Progress));
    // Exactly one terminal event.
    assert_eq!(replay.iter().filter(|e| e.kind.is_terminal()).count(), 1);
}

#[tokio::test]
async fn duplicate_submission_returns_existing_job() {
    let factory = ScriptedFactory::default();
    let gate = Arc::new(Semaphore::new(0));
    factory.script("AAPL", vec![("hold", Behavior::Hold(Arc::clone(&gate)))]);
    let scheduler = scheduler_with(&factory, SchedulerConfig::default());

    let first = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    wait_for_state(&scheduler, &first.job_id, JobState::Running).await;

    // Same user again, even with different parameters: no new job.
    let second = scheduler.submit(UserId(1), params("NVDA")).await.unwrap();
    assert!(second.duplicate);
    assert_eq!(second.job_id, first.job_id);

    // A different user is unaffected.
    let other = scheduler.submit(UserId(2), params("MSFT")).await.unwrap();
    assert!(!other.duplicate);

    gate.add_permits(1);
    wait_terminal(&scheduler, &first.job_id).await;

    // Slot released: the user can submit again and gets a fresh job.
    let third = scheduler.submit(UserId(1), params("MSFT")).await.unwrap();
    assert!(!third.duplicate);
    assert_ne!(third.job_id, first.job_id);
}

#[tokio::test]
async fn dispatch_is_fifo_within_pool_limit() {
    let factory = ScriptedFactory::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    for ticker in ["AAPL", "NVDA", "MSFT"] {
        factory.script(
            ticker,
            vec![
                ("record", Behavior::Record(Arc::clone(&log), ticker.to_string())),
                ("hold", Behavior::Hold(Arc::clone(&gate))),
            ],
        );
    }
    let config = SchedulerConfig {
        max_concurrency: 1,
        ..SchedulerConfig::default()
    };
    let scheduler = scheduler_with(&factory, config);

    let a = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    let b = scheduler.submit(UserId(2), params("NVDA")).await.unwrap();
    let c = scheduler.submit(UserId(3), params("MSFT")).await.unwrap();

    wait_for_state(&scheduler, &a.job_id, JobState::Running).await;
    // Only one slot: the others are still queued.
    assert_eq!(scheduler.get(&b.job_id).unwrap().state, JobState::Queued);
    assert_eq!(scheduler.get(&c.job_id).unwrap().state, JobState::Queued);

    gate.add_permits(1);
    wait_terminal(&scheduler, &a.job_id).await;
    wait_for_state(&scheduler, &b.job_id, JobState::Running).await;
    gate.add_permits(1);
    wait_terminal(&scheduler, &b.job_id).await;
    gate.add_permits(1);
    wait_terminal(&scheduler, &c.job_id).await;

    assert_eq!(*log.lock().unwrap(), vec!["AAPL", "NVDA", "MSFT"]);
}

#[tokio::test]
async fn worker_pool_never_exceeds_max_concurrency() {
    let factory = ScriptedFactory::default();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));
    let tickers = ["AAPL", "NVDA", "MSFT", "AMZN"];
    for ticker in tickers {
        factory.script(
            ticker,
            vec![(
                "work",
                Behavior::TrackConcurrency {
                    current: Arc::clone(&current),
                    peak: Arc::clone(&peak),
                    gate: Arc::clone(&gate),
                },
            )],
        );
    }
    let config = SchedulerConfig {
        max_concurrency: 2,
        ..SchedulerConfig::default()
    };
    let scheduler = scheduler_with(&factory, config);

    let mut jobs = Vec::new();
    for (i, ticker) in tickers.iter().enumerate() {
        jobs.push(
            scheduler
                .submit(UserId(i as u64 + 1), params(ticker))
                .await
                .unwrap(),
        );
    }

    // Let the first two occupy both slots, then release everyone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(scheduler.stats().executing <= 2);
    gate.add_permits(4);
    for job in &jobs {
        assert_eq!(wait_terminal(&scheduler, &job.job_id).await, JobState::Completed);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stop_running_job_interrupts_at_phase_boundary() {
    let factory = ScriptedFactory::default();
    let gate = Arc::new(Semaphore::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));
    factory.script(
        "AAPL",
        vec![
            ("hold", Behavior::Hold(Arc::clone(&gate))),
            ("after", Behavior::Record(Arc::clone(&log), "after".to_string())),
        ],
    );
    let scheduler = scheduler_with(&factory, SchedulerConfig::default());

    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    wait_for_state(&scheduler, &submission.job_id, JobState::Running).await;

    let outcome = scheduler
        .stop(&submission.job_id, Some(UserId(1)))
        .await
        .unwrap();
    assert_eq!(outcome, StopOutcome::SignalSent);

    // The in-flight phase finishes; the next boundary observes the stop.
    gate.add_permits(1);
    assert_eq!(
        wait_terminal(&scheduler, &submission.job_id).await,
        JobState::Interrupted
    );
    assert!(log.lock().unwrap().is_empty(), "phase after the stop must not run");

    let snapshot = scheduler.get(&submission.job_id).unwrap();
    assert_eq!(snapshot.stop_reason, Some(StopReason::UserRequested));

    let (replay, _listener) = scheduler.subscribe(&submission.job_id, 0).unwrap();
    let last = replay.last().unwrap();
    assert_eq!(last.kind, EventKind::Interrupted);
    assert_eq!(last.payload["reason"], "user-requested");
}

#[tokio::test]
async fn stop_queued_job_never_runs() {
    let factory = ScriptedFactory::default();
    let gate = Arc::new(Semaphore::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));
    factory.script("AAPL", vec![("hold", Behavior::Hold(Arc::clone(&gate)))]);
    factory.script(
        "NVDA",
        vec![("record", Behavior::Record(Arc::clone(&log), "ran".to_string()))],
    );
    let config = SchedulerConfig {
        max_concurrency: 1,
        ..SchedulerConfig::default()
    };
    let scheduler = scheduler_with(&factory, config);

    let running = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    wait_for_state(&scheduler, &running.job_id, JobState::Running).await;
    let queued = scheduler.submit(UserId(2), params("NVDA")).await.unwrap();

    let outcome = scheduler
        .stop(&queued.job_id, Some(UserId(2)))
        .await
        .unwrap();
    assert_eq!(outcome, StopOutcome::Dequeued);
    assert_eq!(
        scheduler.get(&queued.job_id).unwrap().state,
        JobState::Interrupted
    );

    // The cancelled job still gets its terminal event, published by the
    // scheduler since no runner will ever exist for it.
    let (replay, _listener) = scheduler.subscribe(&queued.job_id, 0).unwrap();
    let last = replay.last().unwrap();
    assert_eq!(last.kind, EventKind::Interrupted);
    assert_eq!(last.payload["reason"], "user-requested");

    gate.add_permits(1);
    wait_terminal(&scheduler, &running.job_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.lock().unwrap().is_empty(), "dequeued job must never run");
}

#[tokio::test]
async fn stop_is_denied_to_non_owners() {
    let factory = ScriptedFactory::default();
    let gate = Arc::new(Semaphore::new(0));
    factory.script("AAPL", vec![("hold", Behavior::Hold(Arc::clone(&gate)))]);
    let scheduler = scheduler_with(&factory, SchedulerConfig::default());

    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    wait_for_state(&scheduler, &submission.job_id, JobState::Running).await;

    assert!(scheduler
        .stop(&submission.job_id, Some(UserId(2)))
        .await
        .is_err());
    assert_eq!(
        scheduler.get(&submission.job_id).unwrap().state,
        JobState::Running
    );
    gate.add_permits(1);
    wait_terminal(&scheduler, &submission.job_id).await;
}

#[tokio::test]
async fn stalled_job_is_interrupted_with_stall_reason() {
    let factory = ScriptedFactory::default();
    factory.script("AAPL", vec![("silent", Behavior::UntilCancelled)]);
    let config = SchedulerConfig {
        stall_check_interval: Duration::from_millis(25),
        stall_miss_threshold: 3,
        ..SchedulerConfig::default()
    };
    let scheduler = scheduler_with(&factory, config);

    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    assert_eq!(
        wait_terminal(&scheduler, &submission.job_id).await,
        JobState::Interrupted
    );
    let snapshot = scheduler.get(&submission.job_id).unwrap();
    assert_eq!(snapshot.stop_reason, Some(StopReason::StallTimeout));

    let (replay, _listener) = scheduler.subscribe(&submission.job_id, 0).unwrap();
    let last = replay.last().unwrap();
    assert_eq!(last.kind, EventKind::Interrupted);
    assert_eq!(last.payload["reason"], "stall-timeout");
    // The monitor leaves a trace of why.
    assert!(replay
        .iter()
        .any(|e| e.payload["source"] == "stall-monitor"));
}

#[tokio::test]
async fn active_job_survives_sweeps_while_reporting() {
    let factory = ScriptedFactory::default();
    let gate = Arc::new(Semaphore::new(0));
    factory.script(
        "AAPL",
        vec![
            ("step1", Behavior::Progress(20.0, "working".into())),
            ("step2", Behavior::Progress(40.0, "working".into())),
            ("hold", Behavior::Hold(Arc::clone(&gate))),
        ],
    );
    let config = SchedulerConfig {
        stall_check_interval: Duration::from_millis(25),
        stall_miss_threshold: 4,
        ..SchedulerConfig::default()
    };
    let scheduler = scheduler_with(&factory, config);

    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    wait_for_state(&scheduler, &submission.job_id, JobState::Running).await;
    // Two sweep intervals pass with the job legitimately working.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        scheduler.get(&submission.job_id).unwrap().state,
        JobState::Running
    );
    gate.add_permits(1);
    assert_eq!(
        wait_terminal(&scheduler, &submission.job_id).await,
        JobState::Completed
    );
}

#[tokio::test]
async fn failed_phase_yields_error_event_with_redacted_secrets() {
    let factory = ScriptedFactory::default();
    factory.script(
        "AAPL",
        vec![(
            "analysts",
            Behavior::Fail("provider rejected credential sk-live-12345".to_string()),
        )],
    );
    let scheduler = scheduler_with(&factory, SchedulerConfig::default());

    let mut request = params("AAPL");
    request
        .credentials
        .insert("openai".to_string(), "sk-live-12345".to_string());
    let submission = scheduler.submit(UserId(1), request).await.unwrap();
    assert_eq!(
        wait_terminal(&scheduler, &submission.job_id).await,
        JobState::Error
    );

    let (replay, _listener) = scheduler.subscribe(&submission.job_id, 0).unwrap();
    let last = replay.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    let message = last.payload["message"].as_str().unwrap();
    assert!(!message.contains("sk-live-12345"), "secret leaked: {message}");
    assert!(message.contains("***"));

    // The failure frees the user's slot.
    let next = scheduler.submit(UserId(1), params("NVDA")).await.unwrap();
    assert!(!next.duplicate);
}

#[tokio::test]
async fn panicking_phase_is_contained_as_error() {
    let factory = ScriptedFactory::default();
    factory.script("AAPL", vec![("boom", Behavior::Panic)]);
    let scheduler = scheduler_with(&factory, SchedulerConfig::default());

    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    assert_eq!(
        wait_terminal(&scheduler, &submission.job_id).await,
        JobState::Error
    );
    let (replay, _listener) = scheduler.subscribe(&submission.job_id, 0).unwrap();
    assert_eq!(replay.last().unwrap().kind, EventKind::Error);

    // The worker slot was released despite the panic.
    let next = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    assert!(!next.duplicate);
    wait_terminal(&scheduler, &next.job_id).await;
}

#[tokio::test]
async fn late_subscriber_sees_contiguous_stream() {
    let factory = ScriptedFactory::default();
    let gate = Arc::new(Semaphore::new(0));
    factory.script(
        "AAPL",
        vec![
            ("step1", Behavior::Progress(25.0, "working".into())),
            ("hold", Behavior::Hold(Arc::clone(&gate))),
            ("step2", Behavior::Progress(75.0, "almost".into())),
            (
                "decide",
                Behavior::Complete(serde_json::json!({ "decision": "SELL" })),
            ),
        ],
    );
    let scheduler = scheduler_with(&factory, SchedulerConfig::default());

    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    wait_for_state(&scheduler, &submission.job_id, JobState::Running).await;

    // Subscribe mid-run, from the beginning.
    let (replay, listener) = scheduler.subscribe(&submission.job_id, 0).unwrap();
    gate.add_permits(1);

    let mut seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
    let last_kind = timeout(TEST_TIMEOUT, async {
        loop {
            let event = listener.recv().await.expect("stream closed early");
            seqs.push(event.seq);
            if event.kind.is_terminal() {
                break event.kind;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(last_kind, EventKind::Complete);
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected, "stream must be gap-free and in order");
    assert_eq!(listener.dropped(), 0);
}

#[tokio::test]
async fn resubscribe_from_cursor_resumes_without_overlap() {
    let factory = ScriptedFactory::default();
    factory.script(
        "AAPL",
        vec![
            ("step1", Behavior::Progress(30.0, "working".into())),
            ("step2", Behavior::Progress(60.0, "working".into())),
            (
                "decide",
                Behavior::Complete(serde_json::json!({ "decision": "BUY" })),
            ),
        ],
    );
    let scheduler = scheduler_with(&factory, SchedulerConfig::default());
    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    wait_terminal(&scheduler, &submission.job_id).await;

    let (all, _l1) = scheduler.subscribe(&submission.job_id, 0).unwrap();
    // Resume from the last sequence already seen; the cursor is exclusive.
    let cursor = all[2].seq;
    let (resumed, _l2) = scheduler.subscribe(&submission.job_id, cursor).unwrap();
    assert_eq!(resumed.first().unwrap().seq, cursor + 1);
    assert_eq!(resumed.len(), all.len() - 3);
}

#[tokio::test]
async fn persistence_failures_do_not_fail_jobs() {
    let factory = ScriptedFactory::default();
    let store = Arc::new(MemoryPersistence::new());
    store.fail_writes(true);
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        Arc::new(factory.clone()),
        Arc::clone(&store) as Arc<dyn Persistence>,
    );

    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    assert_eq!(
        wait_terminal(&scheduler, &submission.job_id).await,
        JobState::Completed
    );
    assert!(store.is_empty());
}

#[tokio::test]
async fn completed_jobs_are_mirrored_to_storage() {
    let factory = ScriptedFactory::default();
    let store = Arc::new(MemoryPersistence::new());
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        Arc::new(factory.clone()),
        Arc::clone(&store) as Arc<dyn Persistence>,
    );

    let submission = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    wait_terminal(&scheduler, &submission.job_id).await;

    let stored = store.get(&submission.job_id).unwrap();
    assert_eq!(stored.state, JobState::Completed);

    let history = scheduler.stored_history(Some(UserId(1)), 10).await.unwrap();
    assert_eq!(history.len(), 1);

    // The event log is mirrored too, through the terminal event.
    let events = store.events_for(&submission.job_id);
    assert!(events.iter().any(|e| e.kind == EventKind::Complete));
    let queued = events.first().unwrap();
    assert_eq!(queued.kind, EventKind::StatusChange);
    assert_eq!(queued.payload["state"], "queued");
}

#[tokio::test]
async fn shutdown_interrupts_running_and_queued_jobs() {
    let factory = ScriptedFactory::default();
    factory.script("AAPL", vec![("silent", Behavior::UntilCancelled)]);
    let gate = Arc::new(Semaphore::new(0));
    factory.script("NVDA", vec![("hold", Behavior::Hold(Arc::clone(&gate)))]);
    let config = SchedulerConfig {
        max_concurrency: 1,
        ..SchedulerConfig::default()
    };
    let scheduler = scheduler_with(&factory, config);

    let running = scheduler.submit(UserId(1), params("AAPL")).await.unwrap();
    wait_for_state(&scheduler, &running.job_id, JobState::Running).await;
    let queued = scheduler.submit(UserId(2), params("NVDA")).await.unwrap();

    timeout(TEST_TIMEOUT, scheduler.shutdown()).await.unwrap();

    let running_snap = scheduler.get(&running.job_id).unwrap();
    assert_eq!(running_snap.state, JobState::Interrupted);
    assert_eq!(running_snap.stop_reason, Some(StopReason::Shutdown));

    let queued_snap = scheduler.get(&queued.job_id).unwrap();
    assert_eq!(queued_snap.state, JobState::Interrupted);
    assert_eq!(queued_snap.stop_reason, Some(StopReason::Shutdown));
}
