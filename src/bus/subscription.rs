//! Per-subscription bounded queue and overflow policy (spec §4.2).
//!
//! `tokio::mpsc` alone gives us `block` (via `send().await`) and a crude
//! form of `drop_newest` (via `try_send`), but has no way to evict the head
//! of the queue for `drop_oldest`. `BoundedQueue` implements all three
//! policies uniformly over a `parking_lot::Mutex<VecDeque<_>>`, following
//! the pack's convention (`oddjobs`, `hlieu5402-collab-spark2026`) of
//! reaching for `parking_lot` rather than `std::sync::Mutex` for small,
//! frequently-taken locks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::contracts::Envelope;
use crate::error::BusError;

/// What the bus does when a subscription's queue is full (spec glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for room, up to the publish deadline, then fail with `PublishTimeout`.
    Block,
    /// Discard the incoming message; the drop counter increments.
    DropNewest,
    /// Evict the head of the queue to make room for the incoming message.
    DropOldest,
}

/// Default maximum a subscription may request (spec §4.2).
pub const MAX_CAPACITY: usize = 4096;
/// Default subscription capacity when the caller doesn't specify one.
pub const DEFAULT_CAPACITY: usize = 64;
/// Default publish deadline for `block` policy (spec §5).
pub const DEFAULT_PUBLISH_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    DroppedNewest,
    DroppedOldest,
    TimedOut,
    Cancelled,
}

struct QueueState {
    items: VecDeque<Arc<Envelope>>,
    capacity: usize,
    closed: bool,
}

/// A bounded, multi-policy queue owned exclusively by one subscription.
pub struct BoundedQueue {
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(256)),
                capacity,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        })
    }

    pub fn depth(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn oldest_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().items.front().map(|e| e.timestamp)
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Attempt to enqueue under the given policy, suspending only for `Block`.
    pub async fn enqueue(
        &self,
        envelope: Arc<Envelope>,
        policy: OverflowPolicy,
        deadline: Duration,
    ) -> EnqueueOutcome {
        match policy {
            OverflowPolicy::DropNewest => {
                let mut guard = self.state.lock();
                if guard.closed {
                    return EnqueueOutcome::Cancelled;
                }
                if guard.items.len() >= guard.capacity {
                    EnqueueOutcome::DroppedNewest
                } else {
                    guard.items.push_back(envelope);
                    drop(guard);
                    self.not_empty.notify_one();
                    EnqueueOutcome::Enqueued
                }
            }
            OverflowPolicy::DropOldest => {
                let mut guard = self.state.lock();
                if guard.closed {
                    return EnqueueOutcome::Cancelled;
                }
                let evicted = if guard.items.len() >= guard.capacity {
                    guard.items.pop_front()
                } else {
                    None
                };
                guard.items.push_back(envelope);
                drop(guard);
                self.not_empty.notify_one();
                if evicted.is_some() {
                    EnqueueOutcome::DroppedOldest
                } else {
                    EnqueueOutcome::Enqueued
                }
            }
            OverflowPolicy::Block => {
                let deadline_at = tokio::time::Instant::now() + deadline;
                loop {
                    {
                        let mut guard = self.state.lock();
                        if guard.closed {
                            return EnqueueOutcome::Cancelled;
                        }
                        if guard.items.len() < guard.capacity {
                            guard.items.push_back(envelope);
                            drop(guard);
                            self.not_empty.notify_one();
                            return EnqueueOutcome::Enqueued;
                        }
                    }
                    let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return EnqueueOutcome::TimedOut;
                    }
                    if tokio::time::timeout(remaining, self.not_full.notified())
                        .await
                        .is_err()
                    {
                        return EnqueueOutcome::TimedOut;
                    }
                }
            }
        }
    }

    /// Wait for and remove the head of the queue, or `None` once closed and drained.
    pub async fn pop(&self) -> Option<Arc<Envelope>> {
        loop {
            {
                let mut guard = self.state.lock();
                if let Some(item) = guard.items.pop_front() {
                    drop(guard);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if guard.closed {
                    return None;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Drop everything currently queued, returning how many were discarded.
    pub fn drain_discard(&self) -> usize {
        let mut guard = self.state.lock();
        let n = guard.items.len();
        guard.items.clear();
        n
    }
}

/// Opaque handle returned by `Bus::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub(crate) u64);

/// A sync predicate evaluated before the queue; rejected messages are not
/// counted as drops (spec §4.2).
pub type Filter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Runtime state for one subscription, owned exclusively by the bus.
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub subscriber_id: String,
    pub topic: String,
    pub queue: Arc<BoundedQueue>,
    pub capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub filter: Option<Filter>,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub consecutive_failures: AtomicUsize,
    pub degraded: std::sync::atomic::AtomicBool,
}

impl Subscription {
    pub fn validate_capacity(capacity: usize) -> Result<(), BusError> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(BusError::CapacityExceeded(capacity, MAX_CAPACITY));
        }
        Ok(())
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Records a failure (handler error or handler timeout); returns `true`
    /// if this failure just crossed the degrade threshold.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= 3 && !self.degraded.swap(true, Ordering::Relaxed) {
            return true;
        }
        false
    }

    pub fn record_dropped(&self, n: u64) {
        if n > 0 {
            self.dropped.fetch_add(n, Ordering::Relaxed);
        }
    }
}
