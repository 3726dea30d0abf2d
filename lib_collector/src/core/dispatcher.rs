//! # Batch Dispatcher
//!
//! The single task that turns the intake queue into batches. A batch opens on
//! the first payload and closes when either the batch window elapses or it
//! reaches the batch size, whichever comes first. Closed batches go straight
//! to the worker pool; a saturated pool therefore throttles the dispatcher,
//! and the intake queue absorbs the difference (or evicts).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::intake::IntakeQueue;
use crate::core::stats::PipelineStats;
use crate::core::worker_pool::WorkerPool;

/// # Batch Dispatcher
pub struct BatchDispatcher {
    intake: Arc<IntakeQueue>,
    pool: Arc<WorkerPool>,
    stats: Arc<PipelineStats>,
    max_batch: usize,
    window: Duration,
}

impl BatchDispatcher {
    /// Creates a dispatcher cutting batches of at most `max_batch`.
    pub fn new(
        intake: Arc<IntakeQueue>,
        pool: Arc<WorkerPool>,
        stats: Arc<PipelineStats>,
        max_batch: usize,
        window: Duration,
    ) -> Self {
        Self { intake, pool, stats, max_batch: max_batch.max(1), window }
    }

    /// # Next Batch
    ///
    /// ## Logic:
    /// 1. Wait for at least one payload.
    /// 2. Start the window timer.
    /// 3. Keep draining arrivals until the window fires or the batch is full.
    pub async fn next_batch(&self) -> Vec<String> {
        let mut batch = Vec::with_capacity(self.max_batch);
        while self.intake.drain_into(&mut batch, self.max_batch) == 0 {
            self.intake.notified().await;
        }

        let deadline = Instant::now() + self.window;
        while batch.len() < self.max_batch {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = self.intake.notified() => {
                    self.intake.drain_into(&mut batch, self.max_batch);
                }
            }
        }
        self.intake.mark_flushed();
        batch
    }

    /// Cuts and submits batches until `shutdown` fires or the pool closes.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(max_batch = self.max_batch, window_ms = self.window.as_millis() as u64, "dispatcher started");
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = self.next_batch() => batch,
            };
            debug!(size = batch.len(), queued = self.intake.len(), "batch closed");
            self.stats.record_batch();
            if self.pool.submit(batch).await.is_err() {
                break;
            }
        }
        info!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::worker_pool::{HandleError, HandleOutcome, MessageHandler};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _raw: &str) -> Result<HandleOutcome, HandleError> {
            Ok(HandleOutcome::Skipped("noop"))
        }
    }

    fn dispatcher(max_batch: usize) -> (BatchDispatcher, Arc<IntakeQueue>) {
        let intake = Arc::new(IntakeQueue::new(max_batch));
        let stats = Arc::new(PipelineStats::new());
        let pool = Arc::new(WorkerPool::new(
            1,
            Duration::from_millis(100),
            Arc::new(Noop),
            stats.clone(),
            CancellationToken::new(),
        ));
        let d = BatchDispatcher::new(intake.clone(), pool, stats, max_batch, Duration::from_secs(1));
        (d, intake)
    }

    #[tokio::test(start_paused = true)]
    async fn closes_when_full() {
        let (d, intake) = dispatcher(3);
        for i in 0..5 {
            intake.push(i.to_string());
        }
        let start = Instant::now();
        let batch = d.next_batch().await;
        assert_eq!(batch, vec!["0", "1", "2"]);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(intake.len(), 2);
        assert_eq!(intake.flushes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closes_on_window_with_late_arrivals() {
        let (d, intake) = dispatcher(100);
        intake.push("a".into());
        let late = intake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            late.push("b".into());
            tokio::time::sleep(Duration::from_millis(2000)).await;
            late.push("c".into());
        });
        let start = Instant::now();
        let batch = d.next_batch().await;
        assert_eq!(batch, vec!["a", "b"]);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_millis(1100));
    }
}
