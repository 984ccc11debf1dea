//! TradeDesk - execution core for a multi-agent trading-analysis backend
//!
//! This library schedules long-running analysis jobs: one user, one active
//! job; FIFO dispatch onto a bounded worker pool; cooperative cancellation
//! at phase boundaries; stall detection; and an ordered, replayable event
//! stream per job.
//!
//! # High-Level API
//!
//! ```ignore
//! use std::sync::Arc;
//! use tradedesk::persistence::NullPersistence;
//! use tradedesk::scheduler::{Scheduler, SchedulerConfig, UserId};
//!
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     pipeline_factory,
//!     Arc::new(NullPersistence),
//! );
//! let submission = scheduler.submit(UserId(7), params).await?;
//! let (replay, listener) = scheduler.subscribe(&submission.job_id, 0).unwrap();
//! ```
//!
//! The agent graph itself is behind the [`pipeline`] traits; this crate
//! never looks inside a phase.

pub mod logging;
pub mod persistence;
pub mod pipeline;
pub mod scheduler;

/// Version of the TradeDesk library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
