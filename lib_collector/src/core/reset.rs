//! # Cooperative Reset
//!
//! A generation counter shared by the worker pool and its workers. Each worker
//! captures the generation when its batch starts; raising a reset bumps the
//! counter, and any worker whose captured value is stale abandons the rest of
//! its batch at the next message boundary. Nothing is interrupted mid-message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared, cloneable reset handle.
#[derive(Debug, Clone, Default)]
pub struct ResetSignal {
    generation: Arc<AtomicU64>,
}

impl ResetSignal {
    /// Starts at generation zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current generation for a worker about to start a batch.
    pub fn token(&self) -> ResetToken {
        ResetToken {
            generation: Arc::clone(&self.generation),
            captured: self.generation.load(Ordering::Acquire),
        }
    }

    /// Invalidates every outstanding token; returns the new generation.
    pub fn reset(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// A worker's view of the generation it started in.
#[derive(Debug)]
pub struct ResetToken {
    generation: Arc<AtomicU64>,
    captured: u64,
}

impl ResetToken {
    /// True once a reset was raised after this token was taken.
    pub fn is_reset(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.captured
    }
}
