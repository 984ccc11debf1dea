//! Analysis job scheduling.
//!
//! The scheduler is the coordination core of the trading-analysis backend:
//! it accepts analysis requests, enforces one active-or-queued job per user,
//! dispatches jobs FIFO onto a bounded worker pool, watches executing jobs
//! for stalls, and streams each job's ordered event log to subscribers.
//!
//! # Architecture
//!
//! ```text
//!   submit/stop            ┌───────────┐   events    ┌─────────┐
//!  ───────────────────────►│ Scheduler │────────────►│ EventBus│──► listeners
//!                          │ (registry,│             └─────────┘
//!                          │  dispatch)│   tickets   ┌─────────┐
//!                          │           │────────────►│ JobRunner│ (per job,
//!                          └─────┬─────┘             └─────────┘  slot-gated)
//!                                │ sweeps
//!                          ┌─────▼────────┐
//!                          │ StallMonitor │
//!                          └──────────────┘
//! ```
//!
//! [`Scheduler`] is the only entry point; [`SubscriptionGateway`] adapts it
//! to connection-oriented transports.

mod bus;
mod config;
mod error;
mod event;
mod gateway;
mod job;
mod manager;
mod monitor;
mod registry;
mod runner;

pub use bus::{EventBus, EventListener};
pub use config::{
    SchedulerConfig, DEFAULT_BUFFER_GRACE, DEFAULT_EVENT_BUFFER_CAPACITY,
    DEFAULT_LISTENER_OUTBOX_CAPACITY, DEFAULT_MAX_CONCURRENCY, DEFAULT_STALL_CHECK_INTERVAL,
    DEFAULT_STALL_MISS_THRESHOLD,
};
pub use error::{StopError, StopOutcome, ValidationError};
pub use event::{Event, EventKind};
pub use gateway::{ClientMessage, ServerMessage, SubscriptionGateway};
pub use job::{
    AnalysisParams, JobId, JobSnapshot, JobState, StopReason, UserId, MAX_RESEARCH_DEPTH,
};
pub use manager::{Scheduler, Submission};
pub use monitor::ActivityTracker;
pub use registry::SchedulerStats;
