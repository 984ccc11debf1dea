//! Storage collaborator.
//!
//! The scheduler's source of truth is in memory; storage only mirrors job
//! snapshots and published events so history survives a restart. Every
//! persistence failure is non-fatal by contract: callers log and move on,
//! and a job must never fail because the database hiccupped.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::scheduler::{Event, JobId, JobSnapshot, UserId};

/// Storage failure. Always non-fatal to the job that triggered it.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The backing store rejected or never received the write.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The record could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Mirror of job state into durable storage.
pub trait Persistence: Send + Sync {
    /// Upserts one job snapshot.
    fn save_snapshot<'a>(
        &'a self,
        snapshot: &'a JobSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>>;

    /// Appends one published event to the job's stored log.
    fn save_event<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>>;

    /// Loads stored snapshots, newest first, optionally filtered by owner.
    fn load_history<'a>(
        &'a self,
        owner: Option<UserId>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<JobSnapshot>, PersistenceError>> + Send + 'a>>;
}

/// Persistence that stores nothing. The default collaborator.
pub struct NullPersistence;

impl Persistence for NullPersistence {
    fn save_snapshot<'a>(
        &'a self,
        _snapshot: &'a JobSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn save_event<'a>(
        &'a self,
        _event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn load_history<'a>(
        &'a self,
        _owner: Option<UserId>,
        _limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<JobSnapshot>, PersistenceError>> + Send + 'a>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// In-memory persistence, keyed by job ID. Used in tests and as a reference
/// implementation of the upsert semantics.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<Vec<JobSnapshot>>,
    events: Mutex<Vec<Event>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, to exercise non-fatal handling.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    /// Returns the stored snapshot for `job_id`, if any.
    pub fn get(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| &s.job_id == job_id)
            .cloned()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored events for `job_id`, in the order they were written.
    pub fn events_for(&self, job_id: &JobId) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| &e.job_id == job_id)
            .cloned()
            .collect()
    }
}

impl Persistence for MemoryPersistence {
    fn save_snapshot<'a>(
        &'a self,
        snapshot: &'a JobSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(PersistenceError::Unavailable("writes disabled".to_string()));
            }
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = records.iter_mut().find(|s| s.job_id == snapshot.job_id) {
                *existing = snapshot.clone();
            } else {
                records.push(snapshot.clone());
            }
            Ok(())
        })
    }

    fn save_event<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(PersistenceError::Unavailable("writes disabled".to_string()));
            }
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            Ok(())
        })
    }

    fn load_history<'a>(
        &'a self,
        owner: Option<UserId>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<JobSnapshot>, PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(records
                .iter()
                .rev()
                .filter(|s| owner.map_or(true, |o| s.owner == o))
                .take(limit)
                .cloned()
                .collect())
        })
    }
}
