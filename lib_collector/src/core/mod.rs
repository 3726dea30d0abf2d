//! # Core Engine Module
//!
//! This module forms the heart of the collector. It aggregates the components
//! that move a snapshot from the shared channel to a conditional host update,
//! plus the coordination that makes exactly one instance do so.
//!
//! ## Core Components:
//!
//! - **`leadership`**: the lease-based lock; only the holder subscribes.
//!
//! - **`subscriber`**: reads the channel while leader and feeds the intake
//!   queue, applying lossy backpressure when the queue runs away.
//!
//! - **`intake`** / **`dispatcher`**: the bounded FIFO and the single task that
//!   cuts it into batches by size or by a one second window.
//!
//! - **`worker_pool`** / **`reset`**: the bounded set of batch workers and the
//!   generation counter that tells stale workers to abandon their batch.
//!
//! - **`reference_cache`**: the double-buffered host lookup table.
//!
//! - **`collector`**: the Leader/Follower state machine wiring all of the above
//!   together, with `health` reporting channel status alongside it.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The Leader/Follower state machine and supervised restart loop.
pub mod collector;
/// Batch cutting from the intake queue.
pub mod dispatcher;
/// Periodic channel status reporting.
pub mod health;
/// Bounded, lossy FIFO of raw payloads.
pub mod intake;
/// Lease-based mutual exclusion across instances.
pub mod leadership;
/// Double-buffered host lookup table.
pub mod reference_cache;
/// Cooperative cancellation of in-flight batches.
pub mod reset;
/// Pipeline tunables.
pub mod settings;
/// Counters and rate meters.
pub mod stats;
/// Channel reading while leader.
pub mod subscriber;
/// Bounded concurrent batch processing.
pub mod worker_pool;

// --- Public API Re-exports ---
pub use collector::{Collector, CollectorDeps, CollectorError, CollectorRole};
pub use dispatcher::BatchDispatcher;
pub use intake::{IntakeQueue, PushReport};
pub use leadership::{LeadershipLock, LeaseError};
pub use reference_cache::{HostEntry, ReferenceCache};
pub use reset::{ResetSignal, ResetToken};
pub use settings::CollectorSettings;
pub use stats::{PipelineStats, StatsSnapshot};
pub use worker_pool::{HandleOutcome, MessageHandler, WorkerPool};
