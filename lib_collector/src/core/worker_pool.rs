//! # Worker Pool
//!
//! Runs batches concurrently under a fixed ceiling. Submission waits for a
//! free slot by polling; if the pool stays saturated for more than twice the
//! ceiling in poll rounds, it assumes the workers are stuck behind a slow
//! backend, raises a cooperative reset and keeps waiting. Reset workers finish
//! the message in hand, drop the remainder of their batch and free their slot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::core::reset::{ResetSignal, ResetToken};
use crate::core::stats::PipelineStats;
use crate::snapshot::decoder::DecodeError;
use crate::storage::StoreError;

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Changed attributes were written to an existing record.
    Updated {
        /// Host id or model instance id.
        id: i64,
        /// Number of attributes written.
        changed: usize,
    },
    /// A discovered instance had no stored record and was created.
    Created {
        /// New instance id.
        id: i64,
    },
    /// The record was found and nothing differed.
    Unchanged {
        /// Resolved record.
        id: i64,
    },
    /// No known host matches the message.
    Unresolved,
    /// The message was well formed but carried nothing to act on.
    Skipped(&'static str),
}

/// Why a message could not be handled.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Processes one raw payload.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles `raw`; errors are logged and counted by the pool, never retried.
    async fn handle(&self, raw: &str) -> Result<HandleOutcome, HandleError>;
}

/// Why a batch was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The pool is shutting down.
    ShuttingDown,
}

/// # Worker Pool
pub struct WorkerPool {
    ceiling: usize,
    permits: Arc<Semaphore>,
    reset: ResetSignal,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<PipelineStats>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl WorkerPool {
    /// Creates a pool of at most `ceiling` concurrent batches.
    pub fn new(
        ceiling: usize,
        poll_interval: Duration,
        handler: Arc<dyn MessageHandler>,
        stats: Arc<PipelineStats>,
        shutdown: CancellationToken,
    ) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            permits: Arc::new(Semaphore::new(ceiling)),
            reset: ResetSignal::new(),
            handler,
            stats,
            tracker: TaskTracker::new(),
            shutdown,
            poll_interval,
        }
    }

    /// Concurrency ceiling.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Batches currently running.
    pub fn in_flight(&self) -> usize {
        self.ceiling - self.permits.available_permits()
    }

    /// Handle used by the subscriber to raise resets on overload.
    pub fn reset_signal(&self) -> ResetSignal {
        self.reset.clone()
    }

    /// # Submit
    ///
    /// ## Logic:
    /// 1. Try to take a slot, waiting at most one poll interval.
    /// 2. After more than `2 * ceiling` failed rounds, raise a reset and restart the count.
    /// 3. Spawn the batch with a fresh reset token; the slot is freed when it ends.
    pub async fn submit(&self, batch: Vec<String>) -> Result<(), SubmitError> {
        let mut waited = 0usize;
        let permit = loop {
            if self.shutdown.is_cancelled() {
                return Err(SubmitError::ShuttingDown);
            }
            if waited > self.ceiling * 2 {
                warn!(in_flight = self.in_flight(), "worker pool saturated, resetting handlers");
                self.reset.reset();
                self.stats.record_reset();
                waited = 0;
            }
            let acquire = Arc::clone(&self.permits).acquire_owned();
            match tokio::time::timeout(self.poll_interval, acquire).await {
                Ok(Ok(permit)) => break permit,
                Ok(Err(_closed)) => return Err(SubmitError::ShuttingDown),
                Err(_elapsed) => waited += 1,
            }
        };

        let token = self.reset.token();
        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);
        let shutdown = self.shutdown.clone();
        self.tracker
            .spawn(run_batch(batch, handler, token, stats, shutdown, permit));
        Ok(())
    }

    /// Stops accepting work and waits for running batches, up to `limit`.
    pub async fn close(&self, limit: Duration) -> bool {
        self.permits.close();
        self.tracker.close();
        match tokio::time::timeout(limit, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(in_flight = self.tracker.len(), "worker pool did not drain in time");
                false
            }
        }
    }
}

/// Processes one batch in order, checking for a reset or shutdown before each message.
async fn run_batch(
    batch: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    token: ResetToken,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let total = batch.len();
    for (index, raw) in batch.iter().enumerate() {
        if token.is_reset() || shutdown.is_cancelled() {
            let remaining = total - index;
            info!(remaining, total, "batch abandoned");
            stats.record_abandoned(remaining);
            return;
        }
        if raw.is_empty() {
            continue;
        }
        stats.record_handled();
        match handler.handle(raw).await {
            Ok(HandleOutcome::Updated { id, changed }) => {
                debug!(id, changed, "record updated");
                stats.record_updated();
            }
            Ok(HandleOutcome::Created { id }) => {
                debug!(id, "instance created");
                stats.record_created();
            }
            Ok(HandleOutcome::Unchanged { .. }) => stats.record_unchanged(),
            Ok(HandleOutcome::Unresolved) => stats.record_unresolved(),
            Ok(HandleOutcome::Skipped(reason)) => debug!(reason, "message skipped"),
            Err(e) => {
                error!(error = %e, "handle message failed");
                stats.record_failed();
            }
        }
    }
}
