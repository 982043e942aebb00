//! # Caller-Side Retry
//!
//! The bus never retries on its own: a directed request may have side effects
//! and only the caller knows whether repeating it is safe. Callers that do
//! want retries drive a [`RetryState`] or use [`request_with_retry`].
//!
//! ```text
//! attempt 1 ──fail(transient)──▶ wait backoff ──▶ attempt 2 ──▶ ...
//!     │                                              │
//!     └──fail(terminal)──▶ Exhausted ◀──max_attempts─┘
//! ```

use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::error::BusError;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single wait.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    RetryAfter(Duration),
    /// Stop and report the error.
    Exhausted,
}

/// Progress through one retry sequence.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    next_backoff: Duration,
}

impl RetryState {
    /// Start a sequence; the first attempt is number 1.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 1,
            next_backoff: policy.initial_backoff.min(policy.max_backoff),
        }
    }

    /// Number of the attempt in progress.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and decide what comes next.
    pub fn on_failure(&mut self, error: &BusError) -> RetryDecision {
        if !error.is_transient() || self.attempt >= self.policy.max_attempts.max(1) {
            return RetryDecision::Exhausted;
        }

        let wait = self.next_backoff;
        self.next_backoff = self
            .next_backoff
            .saturating_mul(2)
            .min(self.policy.max_backoff);
        self.attempt += 1;
        RetryDecision::RetryAfter(wait)
    }
}

/// [`Bus::request`] repeated on `TimedOut` and `Transport` failures.
///
/// Every attempt gets the full `timeout`. Only use this for requests whose
/// handler is safe to run more than once.
///
/// # Errors
///
/// The error of the last attempt.
pub async fn request_with_retry(
    bus: &Bus,
    topic: &str,
    payload: Bytes,
    timeout: Duration,
    policy: RetryPolicy,
) -> Result<Bytes, BusError> {
    let mut state = RetryState::new(policy);
    loop {
        let error = match bus.request(topic, payload.clone(), timeout).await {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };

        match state.on_failure(&error) {
            RetryDecision::RetryAfter(wait) => {
                debug!(
                    topic,
                    attempt = state.attempt(),
                    wait_ms = wait.as_millis() as u64,
                    error = %error,
                    "Retrying request"
                );
                tokio::time::sleep(wait).await;
            }
            RetryDecision::Exhausted => {
                warn!(topic, attempts = state.attempt(), error = %error, "Request failed");
                return Err(error);
            }
        }
    }
}
