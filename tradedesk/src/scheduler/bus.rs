//! In-process event bus.
//!
//! One logical channel per job. Publishing assigns the job's next sequence
//! number, appends the event to a bounded replay buffer, and fans it out to
//! every subscribed listener's outbox. Subscribing replays buffered events
//! after a cursor (the last sequence number the caller already holds) and
//! attaches a live outbox under the same lock that publishers take, so a
//! subscriber never observes a gap between its replay batch and its live
//! stream.
//!
//! Listener outboxes are bounded. A listener that stops draining loses its
//! oldest entries first and can detect the loss from the sequence numbers;
//! it never blocks the publisher or other listeners.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::event::{Event, EventKind};
use super::job::JobId;

/// Fan-out hub for job events.
pub struct EventBus {
    inner: Mutex<BusInner>,
    event_buffer_capacity: usize,
    listener_outbox_capacity: usize,
}

struct BusInner {
    channels: HashMap<JobId, JobChannel>,
    /// Jobs whose channel was released after their grace period. A late
    /// subscribe must not resurrect the channel.
    released: HashSet<JobId>,
}

/// Per-job event state: sequence counter, replay buffer, listeners.
struct JobChannel {
    next_seq: u64,
    buffer: VecDeque<Event>,
    listeners: Vec<Arc<Outbox>>,
    terminal_at: Option<Instant>,
}

impl JobChannel {
    fn new() -> Self {
        Self {
            next_seq: 1,
            buffer: VecDeque::new(),
            listeners: Vec::new(),
            terminal_at: None,
        }
    }
}

impl EventBus {
    /// Creates a bus with the given per-job replay buffer capacity and
    /// per-listener outbox capacity.
    pub fn new(event_buffer_capacity: usize, listener_outbox_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                channels: HashMap::new(),
                released: HashSet::new(),
            }),
            event_buffer_capacity,
            listener_outbox_capacity,
        }
    }

    /// Publishes an event for `job_id`, assigning its sequence number.
    ///
    /// Never blocks on listeners: a full outbox drops its oldest entry to
    /// make room. Returns the published event.
    pub fn publish(&self, job_id: &JobId, kind: EventKind, payload: serde_json::Value) -> Event {
        let mut inner = self.lock_inner();
        let channel = inner
            .channels
            .entry(job_id.clone())
            .or_insert_with(JobChannel::new);

        let event = Event {
            job_id: job_id.clone(),
            seq: channel.next_seq,
            timestamp: Utc::now(),
            kind,
            payload,
        };
        channel.next_seq += 1;

        if channel.buffer.len() == self.event_buffer_capacity {
            channel.buffer.pop_front();
        }
        channel.buffer.push_back(event.clone());

        channel.listeners.retain(|outbox| !outbox.is_closed());
        for outbox in &channel.listeners {
            outbox.push(event.clone());
        }

        if kind.is_terminal() {
            channel.terminal_at = Some(Instant::now());
        }

        trace!(job_id = %job_id, seq = event.seq, kind = ?kind, "event published");
        event
    }

    /// Subscribes to `job_id`, replaying buffered events with `seq > after`
    /// and returning a live listener for everything published afterwards.
    /// The cursor is exclusive: pass the last sequence number already
    /// delivered, or 0 for everything retained.
    ///
    /// Replay and attachment happen atomically with respect to `publish`, so
    /// the replay batch plus the listener stream covers every retained event
    /// exactly once, in order.
    ///
    /// Subscribing to a job whose channel was already released returns an
    /// empty replay and a listener that is closed from the start; the
    /// channel is not resurrected.
    pub fn subscribe(&self, job_id: &JobId, after: u64) -> (Vec<Event>, EventListener) {
        let mut inner = self.lock_inner();
        if !inner.channels.contains_key(job_id) && inner.released.contains(job_id) {
            let outbox = Arc::new(Outbox::new(self.listener_outbox_capacity));
            outbox.close();
            debug!(job_id = %job_id, "subscribe after stream release");
            return (Vec::new(), EventListener { outbox });
        }
        let channel = inner
            .channels
            .entry(job_id.clone())
            .or_insert_with(JobChannel::new);

        let replay: Vec<Event> = channel
            .buffer
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect();

        let outbox = Arc::new(Outbox::new(self.listener_outbox_capacity));
        channel.listeners.push(Arc::clone(&outbox));

        debug!(
            job_id = %job_id,
            after,
            replayed = replay.len(),
            listeners = channel.listeners.len(),
            "listener subscribed"
        );
        (replay, EventListener { outbox })
    }

    /// Returns the earliest sequence number still held in the replay buffer
    /// for `job_id`, or `None` if nothing is buffered.
    pub fn oldest_buffered_seq(&self, job_id: &JobId) -> Option<u64> {
        let inner = self.lock_inner();
        inner
            .channels
            .get(job_id)
            .and_then(|c| c.buffer.front().map(|e| e.seq))
    }

    /// Releases replay buffers of jobs that reached a terminal event at
    /// least `grace` ago. Their remaining listeners are closed after
    /// draining whatever is already queued.
    ///
    /// Returns the number of channels released.
    pub fn sweep_terminal(&self, grace: Duration) -> usize {
        let mut inner = self.lock_inner();
        let expired: Vec<JobId> = inner
            .channels
            .iter()
            .filter(|(_, channel)| {
                channel
                    .terminal_at
                    .map(|at| at.elapsed() >= grace)
                    .unwrap_or(false)
            })
            .map(|(job_id, _)| job_id.clone())
            .collect();
        for job_id in &expired {
            if let Some(channel) = inner.channels.remove(job_id) {
                for outbox in &channel.listeners {
                    outbox.close();
                }
                debug!(job_id = %job_id, "event buffer released");
            }
            inner.released.insert(job_id.clone());
        }
        expired.len()
    }

    /// Closes every listener on every channel. Used on shutdown.
    pub fn close_all(&self) {
        let inner = self.lock_inner();
        for channel in inner.channels.values() {
            for outbox in &channel.listeners {
                outbox.close();
            }
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live subscription to one job's event stream.
///
/// Dropping the listener detaches it; the publisher prunes closed outboxes
/// on its next publish.
pub struct EventListener {
    outbox: Arc<Outbox>,
}

impl EventListener {
    /// Receives the next event, waiting if none is queued.
    ///
    /// Returns `None` once the channel is closed and the outbox drained.
    pub async fn recv(&self) -> Option<Event> {
        self.outbox.recv().await
    }

    /// Receives the next event if one is already queued.
    pub fn try_recv(&self) -> Option<Event> {
        self.outbox.try_recv()
    }

    /// Number of events this listener lost to outbox overflow.
    pub fn dropped(&self) -> u64 {
        self.outbox.dropped()
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.outbox.close();
    }
}

/// Bounded single-consumer queue feeding one listener.
///
/// Overflow drops the oldest entry so the listener always converges on the
/// most recent events.
struct Outbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            capacity,
        }
    }

    fn push(&self, event: Event) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<Event> {
        loop {
            // Register interest before checking the queue so a push between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn try_recv(&self) -> Option<Event> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
