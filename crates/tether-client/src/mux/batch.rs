//! Adaptive coalescing of shell output.
//!
//! Interactive traffic (small reads) is delivered almost immediately, bulk
//! traffic is held a little longer so consumers see fewer, larger chunks.
//! The batcher is pure: callers pass the current instant in.

use std::time::{Duration, Instant};

/// Hard cap on a single delivered chunk.
pub const MAX_BATCH_BYTES: usize = 64 * 1024;

const INTERACTIVE_DELAY: Duration = Duration::from_millis(1);
const BULK_DELAY: Duration = Duration::from_millis(5);
/// Average read size at or below which a channel counts as interactive.
const INTERACTIVE_READ: f64 = 100.0;
/// Average read size at or above which a channel counts as bulk.
const BULK_READ: f64 = 1000.0;
/// Weight of the newest sample in the moving average.
const SAMPLE_WEIGHT: f64 = 0.3;

#[derive(Debug)]
pub struct ReadBatcher {
    pending: Vec<u8>,
    last_flush: Instant,
    avg_read: f64,
}

impl ReadBatcher {
    pub fn new(now: Instant) -> Self {
        Self {
            pending: Vec::new(),
            last_flush: now,
            avg_read: 0.0,
        }
    }

    /// Record a successful read. Returns a chunk when one is due.
    pub fn push(&mut self, data: &[u8], now: Instant) -> Option<Vec<u8>> {
        self.avg_read = self.avg_read * (1.0 - SAMPLE_WEIGHT) + data.len() as f64 * SAMPLE_WEIGHT;
        self.pending.extend_from_slice(data);

        if self.pending.len() >= MAX_BATCH_BYTES
            || now.saturating_duration_since(self.last_flush) >= self.flush_delay()
        {
            self.flush(now)
        } else {
            None
        }
    }

    /// The channel has nothing more right now: deliver what is held and
    /// treat the next burst as interactive.
    pub fn idle(&mut self, now: Instant) -> Option<Vec<u8>> {
        self.avg_read = 0.0;
        self.flush(now)
    }

    /// Whatever is still buffered, for end-of-stream delivery.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Current coalescing window, interpolated between the interactive and
    /// bulk delays.
    pub fn flush_delay(&self) -> Duration {
        if self.avg_read <= INTERACTIVE_READ {
            INTERACTIVE_DELAY
        } else if self.avg_read >= BULK_READ {
            BULK_DELAY
        } else {
            let t = (self.avg_read - INTERACTIVE_READ) / (BULK_READ - INTERACTIVE_READ);
            INTERACTIVE_DELAY + (BULK_DELAY - INTERACTIVE_DELAY).mul_f64(t)
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn flush(&mut self, now: Instant) -> Option<Vec<u8>> {
        let chunk = self.take()?;
        self.last_flush = now;
        Some(chunk)
    }
}
