//! Per-source buffer and flush policy (§4.4).

use std::collections::VecDeque;

use telemetry_proto::Record;
use tokio::time::{Duration, Instant};

/// Tunables governing when a source's buffer is flushed.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub source_idle: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        BatchPolicy {
            batch_size: 100,
            batch_interval: Duration::from_secs(5),
            source_idle: Duration::from_secs(10 * 60),
        }
    }
}

/// State held for one `source` (§3 "Source state").
pub(crate) struct SourceBuffer {
    pub(crate) buffer: VecDeque<Record>,
    pub(crate) last_flush: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) connection_count: u32,
    /// Set once a `goodbye` record has been ingested; the next drain empties
    /// the buffer unconditionally and the source is torn down afterward.
    pub(crate) closing: bool,
}

impl SourceBuffer {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        SourceBuffer {
            buffer: VecDeque::new(),
            last_flush: now,
            last_activity: now,
            connection_count: 1,
            closing: false,
        }
    }

    /// Whether this source's buffer should be flushed right now under
    /// `policy` (§4.4 batching policy).
    pub(crate) fn should_flush(&self, policy: &BatchPolicy, now: Instant) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        if self.closing {
            return true;
        }
        if self.buffer.len() >= policy.batch_size {
            return true;
        }
        if self.buffer.iter().any(Record::forces_flush) {
            return true;
        }
        now.saturating_duration_since(self.last_flush) >= policy.batch_interval
    }

    /// Drain up to `max_batch` records in FIFO order.
    pub(crate) fn drain(&mut self, max_batch: usize, now: Instant) -> Vec<Record> {
        let n = self.buffer.len().min(max_batch);
        let out: Vec<Record> = self.buffer.drain(..n).collect();
        self.last_flush = now;
        out
    }

    pub(crate) fn is_idle(&self, policy: &BatchPolicy, now: Instant) -> bool {
        self.buffer.is_empty() && now.saturating_duration_since(self.last_activity) >= policy.source_idle
    }
}
