//! Token-bucket admission gate for new loads.
//!
//! Bursty callers (a scroll through an image grid, a prefetch sweep) can
//! submit far more loads per second than the transport should start. The
//! limiter admits work immediately while the bucket holds tokens and queues
//! the rest in FIFO order; the pipeline drains the queue on refill ticks.
//!
//! Policy:
//! - capacity 30 tokens, refill 25 tokens/second, refilled lazily from
//!   elapsed time;
//! - one token per admission; an empty bucket enqueues the work;
//! - queued work whose token was cancelled by the time it becomes runnable
//!   is dropped silently;
//! - no minimum latency: a non-empty bucket never delays work.

use crate::cancellation::CancellationToken;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default bucket capacity.
pub const DEFAULT_BUCKET_CAPACITY: f64 = 30.0;

/// Default refill rate, tokens per second.
pub const DEFAULT_REFILL_RATE: f64 = 25.0;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was consumed; run the work now.
    Ready,
    /// The bucket was empty (or others are already waiting); the work was
    /// queued and will surface from [`RateLimiter::drain_ready`].
    Enqueued,
}

struct Pending<T> {
    token: CancellationToken,
    item: T,
}

/// FIFO token-bucket rate limiter.
///
/// Pure state machine: the owner decides when to call
/// [`RateLimiter::drain_ready`], typically from a timer scheduled with
/// [`RateLimiter::next_ready_delay`]. All methods are intended to run on the
/// pipeline's serial context.
pub struct RateLimiter<T> {
    capacity: f64,
    rate: f64,
    available: f64,
    last_refill: Instant,
    pending: VecDeque<Pending<T>>,
}

impl<T> RateLimiter<T> {
    /// Creates a limiter with explicit capacity and refill rate.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `rate` is not positive.
    pub fn new(capacity: f64, rate: f64) -> Self {
        assert!(capacity > 0.0, "capacity must be > 0");
        assert!(rate > 0.0, "rate must be > 0");
        Self {
            capacity,
            rate,
            available: capacity,
            last_refill: Instant::now(),
            pending: VecDeque::new(),
        }
    }

    /// Creates a limiter with the default burst profile (30 tokens, 25/s).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BUCKET_CAPACITY, DEFAULT_REFILL_RATE)
    }

    /// Attempts to admit one unit of work.
    ///
    /// Work is admitted immediately only when nothing is already waiting, so
    /// queued arrivals keep their FIFO order.
    pub fn try_admit(&mut self, token: CancellationToken, item: T) -> Admission {
        self.refill(Instant::now());
        if self.pending.is_empty() && self.available >= 1.0 {
            self.available -= 1.0;
            Admission::Ready
        } else {
            self.pending.push_back(Pending { token, item });
            Admission::Enqueued
        }
    }

    /// Drains queued work that the bucket can now pay for.
    ///
    /// Cancelled entries are dropped without consuming a token. Returns the
    /// admitted items in FIFO order.
    pub fn drain_ready(&mut self) -> Vec<T> {
        self.refill(Instant::now());
        let mut ready = Vec::new();
        while let Some(front) = self.pending.front() {
            if front.token.is_cancelled() {
                self.pending.pop_front();
                continue;
            }
            if self.available < 1.0 {
                break;
            }
            self.available -= 1.0;
            if let Some(pending) = self.pending.pop_front() {
                ready.push(pending.item);
            }
        }
        ready
    }

    /// Returns true while queued work is waiting for tokens.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Returns the number of queued work items.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Time until the next queued item could be admitted, or `None` when the
    /// queue is empty.
    pub fn next_ready_delay(&self) -> Option<Duration> {
        if self.pending.is_empty() {
            return None;
        }
        if self.available >= 1.0 {
            return Some(Duration::ZERO);
        }
        let deficit = 1.0 - self.available;
        Some(Duration::from_secs_f64(deficit / self.rate))
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.available = (self.available + elapsed * self.rate).min(self.capacity);
    }
}
