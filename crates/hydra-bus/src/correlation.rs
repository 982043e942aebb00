//! # Correlation Table
//!
//! Maps correlation ids to directed requests waiting for a reply.
//!
//! Flow:
//! 1. `request()` calls [`CorrelationTable::register`] and gets an id plus a receiver
//! 2. The request envelope is sent with that id
//! 3. The directed dispatch loop calls [`CorrelationTable::resolve`] when the reply arrives
//! 4. `request()` awaits the receiver, or calls [`CorrelationTable::fail`] on timeout
//!
//! Every entry is resolved exactly once: whoever removes it from the map owns
//! the result slot, so a second `resolve`/`fail` for the same id is a no-op.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::BusError;

/// Outcome delivered to a waiting requester.
pub type RequestResult = Result<Bytes, BusError>;

/// Longest deadline honoured; larger timeouts are clamped to it.
const MAX_DEADLINE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout` without overflowing, so `Duration::MAX` means "no
/// practical timeout".
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout.min(MAX_DEADLINE)).unwrap_or(now)
}

/// A directed request waiting for its reply.
struct PendingRequest {
    /// Topic, for logging and timeout errors.
    topic: String,
    /// When the request was registered.
    created_at: Instant,
    /// When the sweep may evict it.
    deadline: Instant,
    /// Resolved exactly once.
    result_slot: oneshot::Sender<RequestResult>,
}

/// Counters for the table's lifetime.
#[derive(Debug, Default)]
pub struct CorrelationStats {
    /// Requests registered.
    pub registered: AtomicU64,
    /// Requests resolved with a reply.
    pub resolved: AtomicU64,
    /// Requests failed (transport, remote error, shutdown).
    pub failed: AtomicU64,
    /// Requests evicted by deadline.
    pub timed_out: AtomicU64,
}

/// Outstanding directed requests keyed by correlation id.
pub struct CorrelationTable {
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
    stats: CorrelationStats,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    /// Create an empty table. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create an empty table whose first id is `first_id`.
    #[must_use]
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(first_id),
            stats: CorrelationStats::default(),
        }
    }

    /// Register a pending request and get a receiver for its outcome.
    ///
    /// Ids come from a wrapping counter. An id still held by an unresolved
    /// entry is skipped, so an id is only reused after its previous entry
    /// was resolved or evicted.
    pub fn register(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> (u64, oneshot::Receiver<RequestResult>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let request = PendingRequest {
            topic: topic.to_string(),
            created_at: now,
            deadline: deadline_after(now, timeout),
            result_slot: tx,
        };

        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match self.pending.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(request);
                    self.stats.registered.fetch_add(1, Ordering::Relaxed);
                    debug!(correlation_id = id, topic, "Registered pending request");
                    return (id, rx);
                }
                // Wrapped onto a live id; try the next one.
                Entry::Occupied(_) => continue,
            }
        }
    }

    /// Resolve a pending request with its reply payload.
    ///
    /// Returns `false` if the id is unknown (late reply after timeout, or a
    /// reply meant for another process).
    pub fn resolve(&self, correlation_id: u64, payload: Bytes) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            debug!(correlation_id, "Reply for unknown or expired correlation id");
            return false;
        };

        self.stats.resolved.fetch_add(1, Ordering::Relaxed);
        debug!(
            correlation_id,
            topic = %pending.topic,
            response_time_ms = pending.created_at.elapsed().as_millis() as u64,
            "Resolved pending request"
        );
        Self::deliver(correlation_id, pending, Ok(payload));
        true
    }

    /// Fail a pending request.
    ///
    /// Returns `false` if the id is unknown or already resolved.
    pub fn fail(&self, correlation_id: u64, error: BusError) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            return false;
        };

        match &error {
            BusError::TimedOut { .. } => self.stats.timed_out.fetch_add(1, Ordering::Relaxed),
            _ => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        debug!(correlation_id, topic = %pending.topic, %error, "Failed pending request");
        Self::deliver(correlation_id, pending, Err(error));
        true
    }

    /// Evict every entry past its deadline, failing it with `TimedOut`.
    ///
    /// Returns the number of entries evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for id in expired {
            let Some((_, pending)) = self.pending.remove_if(&id, |_, p| p.deadline <= now) else {
                continue;
            };
            let after = now.duration_since(pending.created_at);
            warn!(
                correlation_id = id,
                topic = %pending.topic,
                elapsed_ms = after.as_millis() as u64,
                "Evicting expired pending request"
            );
            self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
            let error = BusError::TimedOut {
                topic: pending.topic.clone(),
                after,
            };
            Self::deliver(id, pending, Err(error));
            evicted += 1;
        }
        evicted
    }

    /// Fail every pending request with `error`. Used at shutdown.
    pub fn fail_all(&self, error: &BusError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.fail(*id, error.clone()))
            .count()
    }

    /// Number of requests currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether `correlation_id` is waiting for a reply.
    #[must_use]
    pub fn is_pending(&self, correlation_id: u64) -> bool {
        self.pending.contains_key(&correlation_id)
    }

    /// Lifetime counters.
    #[must_use]
    pub fn stats(&self) -> &CorrelationStats {
        &self.stats
    }

    fn deliver(correlation_id: u64, pending: PendingRequest, result: RequestResult) {
        if pending.result_slot.send(result).is_err() {
            // Requester dropped its future (cancelled).
            debug!(correlation_id, "Pending request receiver dropped");
        }
    }
}
