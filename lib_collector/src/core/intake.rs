//! # Intake Queue
//!
//! The bounded FIFO between the channel subscriber and the batch dispatcher.
//!
//! ## Core Design Principles:
//! - **Lossy Backpressure**: pushing onto a queue that holds at least twice the
//!   batch size first discards the oldest `len - batch_size` payloads. The
//!   subscriber never blocks on a slow pipeline; it sheds stale snapshots.
//! - **One Lock**: eviction, push and batch draining all run under the same
//!   mutex, so a batch is never half-built while an eviction rewinds the queue.
//! - **Stall Detection**: the queue counts flushed batches. An eviction that
//!   sees no flush since the previous eviction reports the intake as stalled,
//!   which the subscriber escalates into a cooperative reset.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

/// Queue capacity as a multiple of the batch size.
pub const CAPACITY_FACTOR: usize = 4;

/// What happened while pushing one payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Payloads discarded to make room.
    pub evicted: usize,
    /// An eviction happened with no batch flushed since the previous one.
    pub stalled: bool,
    /// Queue length after the push.
    pub len: usize,
}

struct IntakeState {
    queue: VecDeque<String>,
    flushes: u64,
    flushes_at_last_eviction: Option<u64>,
}

/// # Intake Queue
///
/// Shared by exactly one producer (the subscriber or `Collector::mock`) and one
/// consumer (the dispatcher).
pub struct IntakeQueue {
    state: Mutex<IntakeState>,
    notify: Notify,
    batch_size: usize,
}

impl IntakeQueue {
    /// Creates a queue sized for `batch_size` (zero is treated as one).
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            state: Mutex::new(IntakeState {
                queue: VecDeque::with_capacity(batch_size * CAPACITY_FACTOR),
                flushes: 0,
                flushes_at_last_eviction: None,
            }),
            notify: Notify::new(),
            batch_size,
        }
    }

    /// The batch size this queue was sized for.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Nominal capacity, a fixed multiple of the batch size.
    pub fn capacity(&self) -> usize {
        self.batch_size * CAPACITY_FACTOR
    }

    /// Current number of buffered payloads.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Push
    ///
    /// ## Logic:
    /// 1. At or above twice the batch size, drop the oldest `len - batch_size`.
    /// 2. Flag the eviction as stalled if no batch was flushed since the last one.
    /// 3. Append the payload and wake the dispatcher.
    pub fn push(&self, payload: String) -> PushReport {
        let mut report = PushReport::default();
        {
            let mut state = self.lock();
            let len = state.queue.len();
            if len >= self.batch_size * 2 {
                report.evicted = len - self.batch_size;
                state.queue.drain(..report.evicted);
                report.stalled = state.flushes_at_last_eviction == Some(state.flushes);
                state.flushes_at_last_eviction = Some(state.flushes);
            }
            state.queue.push_back(payload);
            report.len = state.queue.len();
        }
        self.notify.notify_one();
        report
    }

    /// Moves up to `max - batch.len()` payloads into `batch`; returns how many moved.
    pub(crate) fn drain_into(&self, batch: &mut Vec<String>, max: usize) -> usize {
        let room = max.saturating_sub(batch.len());
        if room == 0 {
            return 0;
        }
        let mut state = self.lock();
        let take = room.min(state.queue.len());
        batch.extend(state.queue.drain(..take));
        take
    }

    /// Records that a batch left the queue.
    pub(crate) fn mark_flushed(&self) {
        self.lock().flushes += 1;
    }

    /// Number of batches flushed so far.
    pub fn flushes(&self) -> u64 {
        self.lock().flushes
    }

    /// Resolves after the next push (or immediately if one is pending).
    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IntakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_down_to_one_batch() {
        let queue = IntakeQueue::new(10);
        for i in 0..20 {
            assert_eq!(queue.push(i.to_string()).evicted, 0);
        }
        let report = queue.push("20".into());
        assert_eq!(report.evicted, 10);
        assert!(!report.stalled);
        assert_eq!(report.len, 11);

        let mut batch = Vec::new();
        queue.drain_into(&mut batch, 100);
        assert_eq!(batch.first().map(String::as_str), Some("10"));
        assert_eq!(batch.last().map(String::as_str), Some("20"));
    }

    #[test]
    fn repeated_eviction_without_flush_is_stalled() {
        let queue = IntakeQueue::new(2);
        let reports: Vec<_> = (0..12).map(|i| queue.push(i.to_string())).collect();
        let stalls = reports.iter().filter(|r| r.stalled).count();
        let evictions = reports.iter().filter(|r| r.evicted > 0).count();
        assert!(evictions >= 2);
        assert_eq!(stalls, evictions - 1);

        queue.mark_flushed();
        for i in 0..10 {
            let r = queue.push(i.to_string());
            if r.evicted > 0 {
                assert!(!r.stalled, "first eviction after a flush is not a stall");
                break;
            }
        }
    }

    #[test]
    fn length_stays_bounded_under_flood() {
        let queue = IntakeQueue::new(50);
        for i in 0..500 {
            queue.push(i.to_string());
            assert!(queue.len() <= 2 * queue.batch_size());
        }
        assert_eq!(queue.capacity(), 200);
    }
}
