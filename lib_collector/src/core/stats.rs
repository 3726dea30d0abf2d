//! # Pipeline Statistics
//!
//! Lock-free counters shared by every stage of the pipeline, plus the rate
//! meters that periodically log throughput.
//!
//! ## Core Functionality:
//!
//! - **Atomic Accounting**: each counter is an `AtomicU64` bumped with
//!   `Ordering::Relaxed`. Counters are independent of one another and only
//!   ever read for reporting, so no cross-counter ordering is needed.
//!
//! - **Rate Logging**: a [`RateMeter`] logs `"<stage> rate: N/sec"` every
//!   `every` ticks and then restarts its window.
//!
//! - **Liveness Timestamp**: the instant of the last received message, read by
//!   the health check to detect an empty channel.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

/// How many ticks between two rate log lines.
pub const RATE_LOG_EVERY: u64 = 10_000;

/// # Rate Meter
///
/// Counts ticks and, every `every` ticks, logs the rate over the elapsed window.
#[derive(Debug)]
pub struct RateMeter {
    stage: &'static str,
    every: u64,
    window: Mutex<(u64, Instant)>,
}

impl RateMeter {
    /// Creates a meter labelled `stage`.
    pub fn new(stage: &'static str, every: u64) -> Self {
        Self {
            stage,
            every: every.max(1),
            window: Mutex::new((0, Instant::now())),
        }
    }

    /// Records one event. Returns the measured rate when a window closed.
    pub fn tick(&self) -> Option<u64> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.0 += 1;
        if window.0 < self.every {
            return None;
        }
        let secs = window.1.elapsed().as_secs_f64();
        let rate = if secs > 0.0 { (window.0 as f64 / secs) as u64 } else { window.0 };
        info!(stage = self.stage, "{} rate: {}/sec", self.stage, rate);
        *window = (0, Instant::now());
        Some(rate)
    }
}

/// # Pipeline Stats
///
/// Shared by the subscriber, dispatcher, worker pool and health check.
#[derive(Debug)]
pub struct PipelineStats {
    received: AtomicU64,
    evicted: AtomicU64,
    batches: AtomicU64,
    handled: AtomicU64,
    updated: AtomicU64,
    created: AtomicU64,
    unchanged: AtomicU64,
    unresolved: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    resets: AtomicU64,
    receive_rate: RateMeter,
    handle_rate: RateMeter,
    last_message: Mutex<Option<Instant>>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Payloads accepted from the channel (or mock injection).
    pub received: u64,
    /// Payloads discarded by intake eviction.
    pub evicted: u64,
    /// Batches handed to the worker pool.
    pub batches: u64,
    /// Messages a worker started on.
    pub handled: u64,
    /// Messages that produced a host or instance update.
    pub updated: u64,
    /// Discovery messages that created a new instance.
    pub created: u64,
    /// Messages whose attributes matched the cache.
    pub unchanged: u64,
    /// Messages that could not be attributed to a host.
    pub unresolved: u64,
    /// Messages that failed to decode or persist.
    pub failed: u64,
    /// Messages skipped because their batch was reset.
    pub abandoned: u64,
    /// Cooperative resets raised.
    pub resets: u64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            received: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            created: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            unresolved: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            receive_rate: RateMeter::new("receive", RATE_LOG_EVERY),
            handle_rate: RateMeter::new("handle", RATE_LOG_EVERY),
            last_message: Mutex::new(None),
        }
    }
}

impl PipelineStats {
    /// Fresh, zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// A payload arrived; stamps the liveness clock.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        *self.last_message.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.receive_rate.tick();
    }

    /// `n` payloads were evicted from the intake queue.
    pub fn record_evicted(&self, n: usize) {
        self.evicted.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// A batch was submitted.
    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker started on a message.
    pub fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.handle_rate.tick();
    }

    /// A host update was written.
    pub fn record_updated(&self) {
        self.updated.fetch_add(1, Ordering::Relaxed);
    }

    /// A discovered instance was created.
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Nothing differed.
    pub fn record_unchanged(&self) {
        self.unchanged.fetch_add(1, Ordering::Relaxed);
    }

    /// No host matched.
    pub fn record_unresolved(&self) {
        self.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    /// Decode or persistence failure.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// `n` messages of a reset batch were skipped.
    pub fn record_abandoned(&self, n: usize) {
        self.abandoned.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// A cooperative reset was raised.
    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// When the last payload arrived, if ever.
    pub fn last_message_at(&self) -> Option<Instant> {
        *self.last_message.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}
