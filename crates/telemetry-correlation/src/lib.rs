//! telemetry-correlation: per-source buffering, batching, and trace assembly (§4.4).
//!
//! Owns two pieces of exclusive state behind a lock each, the same shape as
//! the receiver's `StreamCounts`/session pairing in the teacher workspace:
//! per-source buffers (this crate's `source` module) and the live trace
//! table (`trace` module). `ingest` never suspends beyond lock acquisition;
//! `drain` and `drain_completed_traces` are polled by the routing engine on
//! a timer.

use std::collections::HashMap;
use std::sync::Arc;

use telemetry_proto::Record;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

mod source;
mod trace;

pub use source::BatchPolicy;
pub use trace::{AssembledTrace, SpanNode, TracePolicy};

use source::SourceBuffer;
use trace::TraceTable;

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("source mismatch: connection established as '{bound}', record carries '{got}'")]
    SourceMismatch { bound: String, got: String },
}

/// An ordered set of records for one source, ready for routing (§4.5 input).
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub source: String,
    pub records: Vec<Record>,
}

pub struct CorrelationEngine {
    sources: Mutex<HashMap<String, SourceBuffer>>,
    traces: Mutex<TraceTable>,
    batch_policy: BatchPolicy,
    trace_policy: TracePolicy,
}

impl CorrelationEngine {
    pub fn new(batch_policy: BatchPolicy, trace_policy: TracePolicy) -> Arc<Self> {
        Arc::new(CorrelationEngine {
            sources: Mutex::new(HashMap::new()),
            traces: Mutex::new(TraceTable::new()),
            batch_policy,
            trace_policy,
        })
    }

    /// Admit one record. Nonblocking beyond internal lock acquisition
    /// (§4.4, §5 emit-path contract). Span records are also folded into the
    /// live trace table; the caller still forwards the original record.
    pub async fn ingest(&self, record: Record) {
        if let (Some(_), telemetry_proto::RecordKind::Span) = (&record.trace_id, record.kind()) {
            let mut traces = self.traces.lock().await;
            traces.record_span(&record, Instant::now());
        }

        let source = record.source.clone();
        let closing = matches!(record.payload, telemetry_proto::Payload::Goodbye);

        let mut sources = self.sources.lock().await;
        let buf = sources.entry(source).or_insert_with(SourceBuffer::new);
        buf.last_activity = Instant::now();
        buf.buffer.push_back(record);
        if closing {
            buf.closing = true;
        }
    }

    /// Current buffered record count for `source` (§4.3 per-source backpressure).
    pub async fn source_queue_len(&self, source: &str) -> usize {
        self.sources
            .lock()
            .await
            .get(source)
            .map(|b| b.buffer.len())
            .unwrap_or(0)
    }

    /// Total buffered record count across every source (§4.3 global cap).
    pub async fn global_queue_len(&self) -> usize {
        self.sources.lock().await.values().map(|b| b.buffer.len()).sum()
    }

    /// Register an additional connection for a source that is already
    /// buffering (a source may, in principle, be revisited after its
    /// connection drops and a new one reconnects before idle eviction).
    pub async fn note_connection(&self, source: &str) {
        let mut sources = self.sources.lock().await;
        sources
            .entry(source.to_owned())
            .or_insert_with(SourceBuffer::new)
            .connection_count += 1;
    }

    /// Produce every batch ready to flush right now, draining at most
    /// `max_batch` records per source.
    pub async fn drain(&self, max_batch: usize) -> Vec<Batch> {
        let now = Instant::now();
        let mut sources = self.sources.lock().await;
        let mut out = Vec::new();
        for (source, buf) in sources.iter_mut() {
            if buf.should_flush(&self.batch_policy, now) {
                let records = buf.drain(max_batch, now);
                if !records.is_empty() {
                    out.push(Batch {
                        source: source.clone(),
                        records,
                    });
                }
            }
        }
        out
    }

    /// Evict sources idle past `source_idle_ms` with an empty buffer, and
    /// sources that issued `goodbye` and have nothing left to drain.
    pub async fn evict_idle_sources(&self) -> Vec<String> {
        let now = Instant::now();
        let mut sources = self.sources.lock().await;
        let mut evicted = Vec::new();
        sources.retain(|source, buf| {
            let done = buf.buffer.is_empty() && (buf.closing || buf.is_idle(&self.batch_policy, now));
            if done {
                evicted.push(source.clone());
            }
            !done
        });
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted idle sources");
        }
        evicted
    }

    /// Surface traces that are complete, idle, or past TTL as synthetic
    /// assembled forests (§4.4 trace assembly, §8 property 9). The original
    /// span records were already forwarded through `drain`.
    pub async fn drain_completed_traces(&self) -> Vec<AssembledTrace> {
        let mut traces = self.traces.lock().await;
        traces.drain_completed(&self.trace_policy, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_proto::{Level, Payload, RecordKind, SCHEMA_VERSION};

    fn record(source: &str, payload: Payload) -> Record {
        Record {
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            timestamp_ms: 0,
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            payload,
        }
    }

    fn event(source: &str, level: Level) -> Record {
        record(
            source,
            Payload::Event {
                level,
                message: "x".into(),
                context: Default::default(),
            },
        )
    }

    #[tokio::test]
    async fn fifo_order_preserved_within_a_source() {
        let engine = CorrelationEngine::new(BatchPolicy::default(), TracePolicy::default());
        for i in 0..5 {
            engine
                .ingest(record(
                    "A",
                    Payload::Metric {
                        name: format!("m{i}"),
                        value: i as f64,
                        unit: "count".into(),
                        tags: Default::default(),
                    },
                ))
                .await;
        }
        // Force a flush by lowering the threshold via a goodbye.
        engine.ingest(record("A", Payload::Goodbye)).await;
        let batches = engine.drain(1000).await;
        assert_eq!(batches.len(), 1);
        let names: Vec<_> = batches[0]
            .records
            .iter()
            .filter_map(|r| match &r.payload {
                Payload::Metric { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn error_event_forces_immediate_flush() {
        let engine = CorrelationEngine::new(BatchPolicy::default(), TracePolicy::default());
        engine.ingest(event("A", Level::Info)).await;
        // Below batch_size and interval hasn't elapsed: nothing to drain yet.
        assert!(engine.drain(1000).await.is_empty());

        engine.ingest(event("A", Level::Error)).await;
        let batches = engine.drain(1000).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 2);
    }

    #[tokio::test]
    async fn batch_size_threshold_triggers_flush() {
        let policy = BatchPolicy {
            batch_size: 3,
            ..BatchPolicy::default()
        };
        let engine = CorrelationEngine::new(policy, TracePolicy::default());
        for _ in 0..3 {
            engine.ingest(event("A", Level::Info)).await;
        }
        let batches = engine.drain(1000).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 3);
    }

    #[tokio::test]
    async fn different_sources_do_not_share_buffers() {
        let engine = CorrelationEngine::new(BatchPolicy::default(), TracePolicy::default());
        engine.ingest(event("A", Level::Error)).await;
        engine.ingest(event("B", Level::Error)).await;
        let mut batches = engine.drain(1000).await;
        batches.sort_by(|a, b| a.source.cmp(&b.source));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].source, "A");
        assert_eq!(batches[1].source, "B");
    }

    #[tokio::test]
    async fn source_with_only_low_priority_records_is_not_flushed_early() {
        let engine = CorrelationEngine::new(BatchPolicy::default(), TracePolicy::default());
        engine
            .ingest(record(
                "A",
                Payload::Resource {
                    cpu: 0.1,
                    memory: 1.0,
                    disk_io: 0.0,
                    net_io: 0.0,
                    pid: 1,
                },
            ))
            .await;
        assert!(engine.drain(1000).await.is_empty());
    }

    #[tokio::test]
    async fn goodbye_drains_and_marks_source_for_eviction() {
        let engine = CorrelationEngine::new(BatchPolicy::default(), TracePolicy::default());
        engine.ingest(event("A", Level::Info)).await;
        engine.ingest(record("A", Payload::Goodbye)).await;
        let batches = engine.drain(1000).await;
        assert_eq!(batches[0].records.len(), 2);
        assert_eq!(batches[0].records.last().unwrap().kind(), RecordKind::Goodbye);

        let evicted = engine.evict_idle_sources().await;
        assert_eq!(evicted, vec!["A".to_string()]);
    }
}
