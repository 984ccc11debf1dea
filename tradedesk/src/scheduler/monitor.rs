//! Stall detection for executing jobs.
//!
//! Agent phases call out to LLM providers and data vendors that can hang
//! indefinitely. Every progress report touches the job's [`ActivityTracker`];
//! the monitor sweeps on a fixed interval and counts consecutive sweeps in
//! which a job produced no activity at all. At the threshold it requests a
//! stop with reason `stall-timeout`, exactly as if the owner had asked,
//! and the job's runner reports `Interrupted` at its next cancellation
//! checkpoint.
//!
//! Detection is count-based, not wall-clock-based: the sweep that first
//! sees a job only records a baseline, and a miss is charged only when a
//! whole `check_interval` passes between sweeps with the touch counter
//! unchanged. A job is interrupted after `miss_threshold` consecutive
//! misses, so it is guaranteed at least `interval x threshold` of true
//! silence, and the default 60s x 5 tolerates slow-but-alive phases and
//! one-off hiccups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::EventBus;
use super::event::EventKind;
use super::job::StopReason;
use super::registry::Registry;

/// Lock-free activity marker shared between a job's runner and the monitor.
pub struct ActivityTracker {
    epoch: Instant,
    last_millis: AtomicU64,
    touches: AtomicU64,
}

impl ActivityTracker {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_millis: AtomicU64::new(0),
            touches: AtomicU64::new(0),
        }
    }

    /// Records activity. Called on every progress report the job produces.
    pub fn touch(&self) {
        let millis = self.epoch.elapsed().as_millis() as u64;
        self.last_millis.store(millis, Ordering::Relaxed);
        self.touches.fetch_add(1, Ordering::Relaxed);
    }

    /// Total number of touches so far.
    pub fn touch_count(&self) -> u64 {
        self.touches.load(Ordering::Relaxed)
    }

    /// Time since the last touch (or since creation, if never touched).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Periodic sweep over executing jobs, interrupting the silent ones.
pub(crate) struct StallMonitor {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    check_interval: Duration,
    miss_threshold: u32,
    /// Consecutive-silent-sweep counters, keyed by job. Monitor-local:
    /// nothing else reads them, and entries die with the job.
    misses: HashMap<super::job::JobId, MissRecord>,
}

struct MissRecord {
    last_seen_touches: u64,
    consecutive_misses: u32,
}

impl StallMonitor {
    pub(crate) fn new(
        registry: Arc<Registry>,
        bus: Arc<EventBus>,
        check_interval: Duration,
        miss_threshold: u32,
    ) -> Self {
        Self {
            registry,
            bus,
            check_interval,
            miss_threshold,
            misses: HashMap::new(),
        }
    }

    /// Spawns the monitor loop; it runs until `shutdown` is cancelled.
    pub(crate) fn spawn(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.check_interval.as_secs(),
                threshold = self.miss_threshold,
                "stall monitor started"
            );
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so the first real sweep
            // happens one full interval after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.sweep(),
                }
            }
            info!("stall monitor stopped");
        })
    }

    /// One sweep over all executing jobs.
    pub(crate) fn sweep(&mut self) {
        let executing = self.registry.executing();

        // Forget jobs that are no longer executing.
        let live: std::collections::HashSet<_> =
            executing.iter().map(|(id, _)| id.clone()).collect();
        self.misses.retain(|id, _| live.contains(id));

        for (job_id, activity) in executing {
            let touches = activity.touch_count();
            let record = match self.misses.get_mut(&job_id) {
                Some(record) => record,
                None => {
                    // First sighting is baseline only: a miss may only be
                    // charged once a full check interval has passed with the
                    // touch counter unchanged, never on the sweep that
                    // started watching.
                    self.misses.insert(
                        job_id.clone(),
                        MissRecord {
                            last_seen_touches: touches,
                            consecutive_misses: 0,
                        },
                    );
                    continue;
                }
            };

            if touches != record.last_seen_touches {
                record.last_seen_touches = touches;
                record.consecutive_misses = 0;
                continue;
            }

            record.consecutive_misses += 1;
            debug!(
                job_id = %job_id,
                misses = record.consecutive_misses,
                idle_secs = activity.idle_for().as_secs(),
                "no activity this sweep"
            );
            if record.consecutive_misses < self.miss_threshold {
                continue;
            }

            warn!(
                job_id = %job_id,
                idle_secs = activity.idle_for().as_secs(),
                "job stalled, interrupting"
            );
            self.bus.publish(
                &job_id,
                EventKind::Log,
                serde_json::json!({
                    "source": "stall-monitor",
                    "message": format!(
                        "no activity for {} consecutive checks, interrupting",
                        record.consecutive_misses
                    ),
                }),
            );
            // No requester: the monitor bypasses the ownership check.
            if let Err(err) =
                self.registry
                    .request_stop(&job_id, None, StopReason::StallTimeout)
            {
                warn!(job_id = %job_id, %err, "stall stop request failed");
            }
            self.misses.remove(&job_id);
        }
    }
}
