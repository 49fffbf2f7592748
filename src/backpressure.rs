//! Backpressure for the outbound message queue.
//!
//! Fragment sends are pipelined without waiting for per-fragment acks, so a
//! slow transport would otherwise let queued fragments pile up in memory.
//! The [`BackpressureController`] counts messages handed to the writer task
//! but not yet written; once `max_pending` is reached, senders wait (up to a
//! timeout) for the writer to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, WireDropError};

/// Interval between backpressure checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Shared counter of queued outbound messages.
///
/// Clones share the same counter: the writer handle reserves, the writer
/// task releases.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    pub fn new(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
            timeout,
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Try to reserve a slot without blocking.
    pub fn try_reserve(&self) -> Result<()> {
        if self.is_active() {
            return Err(WireDropError::BackpressureTimeout);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Reserve a slot, waiting up to the timeout for the queue to drain.
    pub async fn reserve(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.try_reserve().is_ok() {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(WireDropError::BackpressureTimeout);
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Release one slot.
    #[inline]
    pub fn release(&self) {
        self.pending.fetch_sub(1, Ordering::Release);
    }

    /// Release the slots of a written batch.
    #[inline]
    pub fn release_many(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::Release);
    }
}
