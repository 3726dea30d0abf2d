//! # Channel Subscriber
//!
//! While this instance is leader, reads the snapshot channel one message at a
//! time and pushes each payload onto the intake queue. Leadership is re-checked
//! before every blocking read, and a read never blocks longer than the receive
//! timeout, so a demoted instance stops within one timeout.
//!
//! ## Error Handling:
//! - `Transient` (timeout, nil reply): looped past.
//! - `Closed` (end of stream): one in-place resubscribe; failure is a fault.
//! - `Fatal`: reported as a fault, which makes the collector concede.
//! - Persistent overload: `overload_relinquish_after` stalled evictions in a
//!   row are reported as a fault as well.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::intake::IntakeQueue;
use crate::core::leadership::LeadershipLock;
use crate::core::reset::ResetSignal;
use crate::core::stats::PipelineStats;
use crate::storage::{ChannelError, ChannelSource};

/// Why the subscriber gave up while still leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberFault {
    /// The channel failed beyond recovery.
    Channel(String),
    /// The intake stayed stalled for this many consecutive evictions.
    Overloaded(u32),
}

/// # Channel Subscriber
pub struct ChannelSubscriber {
    source: Arc<dyn ChannelSource>,
    channels: Vec<String>,
    lock: Arc<LeadershipLock>,
    intake: Arc<IntakeQueue>,
    reset: ResetSignal,
    stats: Arc<PipelineStats>,
    receive_timeout: Duration,
    relinquish_after: u32,
}

impl ChannelSubscriber {
    /// Wires a subscriber to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn ChannelSource>,
        channels: Vec<String>,
        lock: Arc<LeadershipLock>,
        intake: Arc<IntakeQueue>,
        reset: ResetSignal,
        stats: Arc<PipelineStats>,
        receive_timeout: Duration,
        relinquish_after: u32,
    ) -> Self {
        Self {
            source,
            channels,
            lock,
            intake,
            reset,
            stats,
            receive_timeout,
            relinquish_after: relinquish_after.max(1),
        }
    }

    /// Subscribes and reads until leadership is lost, `shutdown` fires or a
    /// fault is reported on `faults`.
    pub async fn run(&self, faults: mpsc::Sender<SubscriberFault>, shutdown: CancellationToken) {
        let mut subscription = match self.source.subscribe(&self.channels).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, channels = ?self.channels, "subscribe channel failed");
                let _ = faults.send(SubscriberFault::Channel(e.to_string())).await;
                return;
            }
        };
        info!(channels = ?self.channels, "subscribing channel");

        let mut stalls = 0u32;
        while self.lock.is_leader() {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = subscription.next_message(self.receive_timeout) => r,
            };
            match received {
                Ok(payload) => {
                    if payload.is_empty() {
                        continue;
                    }
                    if let Some(fault) = self.accept(payload, &mut stalls) {
                        let _ = faults.send(fault).await;
                        break;
                    }
                }
                Err(ChannelError::Transient(reason)) => {
                    debug!(reason, "receive message transient error");
                }
                Err(ChannelError::Closed) => {
                    warn!("subscription closed, resubscribing");
                    match self.source.subscribe(&self.channels).await {
                        Ok(fresh) => subscription = fresh,
                        Err(e) => {
                            error!(error = %e, "resubscribe failed");
                            let _ = faults.send(SubscriberFault::Channel(e.to_string())).await;
                            return;
                        }
                    }
                }
                Err(e @ ChannelError::Fatal(_)) => {
                    error!(error = %e, "receive message failed");
                    let _ = faults.send(SubscriberFault::Channel(e.to_string())).await;
                    break;
                }
            }
        }

        if !self.lock.is_leader() {
            info!("no longer master, closing subscription");
        }
        if let Err(e) = subscription.unsubscribe().await {
            warn!(error = %e, "unsubscribe failed");
        }
        info!("subscription closed");
    }

    /// Pushes one payload, escalating persistent stalls.
    fn accept(&self, payload: String, stalls: &mut u32) -> Option<SubscriberFault> {
        self.stats.record_received();
        let report = self.intake.push(payload);
        if report.len != 0 && report.len % 10 == 0 {
            debug!(len = report.len, "intake buffer length");
        }
        if report.evicted == 0 {
            return None;
        }

        warn!(evicted = report.evicted, batch_size = self.intake.batch_size(), "intake full, dropped oldest messages");
        self.stats.record_evicted(report.evicted);
        if !report.stalled {
            *stalls = 0;
            return None;
        }

        *stalls += 1;
        self.reset.reset();
        self.stats.record_reset();
        warn!(stalls = *stalls, "intake stalled, resetting workers");
        if *stalls >= self.relinquish_after {
            error!(stalls = *stalls, "intake overloaded, giving up leadership");
            return Some(SubscriberFault::Overloaded(*stalls));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::{MemoryChannel, MemoryKvStore};

    async fn leader() -> Arc<LeadershipLock> {
        let lock = Arc::new(LeadershipLock::new(
            Arc::new(MemoryKvStore::new()),
            "test",
            "me",
            Duration::from_secs(20),
        ));
        assert!(lock.try_acquire_or_renew().await.unwrap());
        lock
    }

    fn subscriber(hub: Arc<MemoryChannel>, lock: Arc<LeadershipLock>, intake: Arc<IntakeQueue>) -> ChannelSubscriber {
        ChannelSubscriber::new(
            hub,
            vec!["snap".to_string()],
            lock,
            intake,
            ResetSignal::new(),
            Arc::new(PipelineStats::new()),
            Duration::from_millis(50),
            2,
        )
    }

    #[tokio::test]
    async fn stops_when_leadership_is_lost() {
        let hub = Arc::new(MemoryChannel::new());
        let lock = leader().await;
        let intake = Arc::new(IntakeQueue::new(10));
        let sub = subscriber(hub.clone(), lock.clone(), intake.clone());
        let (tx, mut rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { sub.run(tx, CancellationToken::new()).await });

        while hub.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        hub.publish("snap", "one");
        while intake.is_empty() {
            tokio::task::yield_now().await;
        }
        lock.relinquish().await.unwrap();
        task.await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(intake.len(), 1);
    }

    #[tokio::test]
    async fn persistent_stall_reports_overload() {
        let lock = leader().await;
        let intake = Arc::new(IntakeQueue::new(2));
        let sub = subscriber(Arc::new(MemoryChannel::new()), lock, intake);
        let mut stalls = 0;
        let faults: Vec<_> = (0..20)
            .filter_map(|i| sub.accept(i.to_string(), &mut stalls))
            .collect();
        assert_eq!(faults.first(), Some(&SubscriberFault::Overloaded(2)));
    }
}
