//! Distributed-trace assembly from `span` records (§4.4, Testable Property 9).

use std::collections::HashMap;

use telemetry_proto::{Payload, Record, SpanSummary, SCHEMA_VERSION};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TracePolicy {
    pub trace_ttl: Duration,
    pub trace_idle: Duration,
}

impl Default for TracePolicy {
    fn default() -> Self {
        TracePolicy {
            trace_ttl: Duration::from_secs(60 * 60),
            trace_idle: Duration::from_secs(30),
        }
    }
}

/// One span as known to the trace table, merged across open/close updates.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanNode {
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub source: String,
    pub name: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub status: String,
    pub tags: HashMap<String, serde_json::Value>,
}

impl SpanNode {
    pub fn is_complete(&self) -> bool {
        self.end_ms != 0
    }
}

/// Assembled forest for one `trace_id` (§3 "Trace state", §8 property 9).
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledTrace {
    pub trace_id: String,
    pub spans: Vec<SpanNode>,
}

impl AssembledTrace {
    /// Spans with no `parent_span_id`, or whose parent is not present in
    /// this trace's span set.
    pub fn roots(&self) -> Vec<&SpanNode> {
        let known: std::collections::HashSet<&str> =
            self.spans.iter().map(|s| s.span_id.as_str()).collect();
        self.spans
            .iter()
            .filter(|s| match &s.parent_span_id {
                None => true,
                Some(p) => !known.contains(p.as_str()),
            })
            .collect()
    }

    pub fn children_of<'a>(&'a self, span_id: &str) -> Vec<&'a SpanNode> {
        self.spans
            .iter()
            .filter(|s| s.parent_span_id.as_deref() == Some(span_id))
            .collect()
    }

    /// Render this forest as the synthetic `trace` record routing dispatches
    /// (§4.4, §8 property 9). Bound to the first root span's source, or the
    /// first span's if no root is found, so per-source routing rules still
    /// apply to it like any other record.
    pub fn to_record(&self) -> Record {
        let source = self
            .roots()
            .into_iter()
            .next()
            .or_else(|| self.spans.first())
            .map(|s| s.source.clone())
            .unwrap_or_default();

        Record {
            schema_version: SCHEMA_VERSION,
            source,
            timestamp_ms: 0,
            trace_id: Some(self.trace_id.clone()),
            span_id: None,
            parent_span_id: None,
            payload: Payload::Trace {
                spans: self
                    .spans
                    .iter()
                    .map(|s| SpanSummary {
                        span_id: s.span_id.clone(),
                        parent_span_id: s.parent_span_id.clone(),
                        source: s.source.clone(),
                        name: s.name.clone(),
                        start_ms: s.start_ms,
                        end_ms: s.end_ms,
                        status: s.status.clone(),
                        tags: s.tags.clone(),
                    })
                    .collect(),
            },
        }
    }
}

struct TraceState {
    spans: HashMap<String, SpanNode>,
    first_seen: Instant,
    last_update: Instant,
}

/// Live trace table, owned exclusively by the correlation engine.
#[derive(Default)]
pub(crate) struct TraceTable {
    traces: HashMap<String, TraceState>,
}

impl TraceTable {
    pub(crate) fn new() -> Self {
        TraceTable::default()
    }

    /// Fold a `span` record into its trace, creating the trace and/or span
    /// entry as needed. A span_id may be updated at most twice in practice
    /// (open, then close); later writes merge non-default fields in rather
    /// than overwrite wholesale, so an open-then-close pair keeps its
    /// original `start_ms`.
    pub(crate) fn record_span(&mut self, record: &Record, now: Instant) {
        let Payload::Span {
            name,
            start_ms,
            end_ms,
            status,
            tags,
        } = &record.payload
        else {
            return;
        };
        let Some(trace_id) = record.trace_id.clone() else {
            return;
        };
        let Some(span_id) = record.span_id.clone() else {
            return;
        };

        let state = self.traces.entry(trace_id.clone()).or_insert_with(|| TraceState {
            spans: HashMap::new(),
            first_seen: now,
            last_update: now,
        });
        state.last_update = now;

        state
            .spans
            .entry(span_id.clone())
            .and_modify(|existing| {
                if existing.start_ms == 0 {
                    existing.start_ms = *start_ms;
                }
                if *end_ms != 0 {
                    existing.end_ms = *end_ms;
                    existing.status = status.clone();
                }
                if existing.parent_span_id.is_none() {
                    existing.parent_span_id = record.parent_span_id.clone();
                }
            })
            .or_insert_with(|| SpanNode {
                span_id,
                parent_span_id: record.parent_span_id.clone(),
                source: record.source.clone(),
                name: name.clone(),
                start_ms: *start_ms,
                end_ms: *end_ms,
                status: status.clone(),
                tags: tags.clone(),
            });
    }

    /// Remove and return every trace that is complete (every span has
    /// `end_ms`), idle past `trace_idle`, or older than `trace_ttl`.
    pub(crate) fn drain_completed(&mut self, policy: &TracePolicy, now: Instant) -> Vec<AssembledTrace> {
        let mut done = Vec::new();
        self.traces.retain(|trace_id, state| {
            let all_complete = !state.spans.is_empty() && state.spans.values().all(SpanNode::is_complete);
            let idle = now.saturating_duration_since(state.last_update) >= policy.trace_idle;
            let expired = now.saturating_duration_since(state.first_seen) >= policy.trace_ttl;

            if all_complete || idle || expired {
                done.push(AssembledTrace {
                    trace_id: trace_id.clone(),
                    spans: state.spans.values().cloned().collect(),
                });
                false
            } else {
                true
            }
        });
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_proto::SCHEMA_VERSION;

    fn span_record(source: &str, trace_id: &str, span_id: &str, parent: Option<&str>, end_ms: i64) -> Record {
        Record {
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            timestamp_ms: 0,
            trace_id: Some(trace_id.into()),
            span_id: Some(span_id.into()),
            parent_span_id: parent.map(String::from),
            payload: Payload::Span {
                name: format!("span-{span_id}"),
                start_ms: 100,
                end_ms,
                status: "success".into(),
                tags: HashMap::new(),
            },
        }
    }

    #[test]
    fn assembles_three_source_chain_and_finds_single_root() {
        let mut table = TraceTable::new();
        let now = Instant::now();
        table.record_span(&span_record("A", "T", "sA", None, 10), now);
        table.record_span(&span_record("B", "T", "sB", Some("sA"), 20), now);
        table.record_span(&span_record("C", "T", "sC", Some("sB"), 30), now);

        let done = table.drain_completed(&TracePolicy::default(), now);
        assert_eq!(done.len(), 1);
        let trace = &done[0];
        assert_eq!(trace.trace_id, "T");
        let roots = trace.roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].span_id, "sA");
        assert_eq!(trace.children_of("sA")[0].span_id, "sB");
        assert_eq!(trace.children_of("sB")[0].span_id, "sC");
    }

    #[test]
    fn open_then_close_merges_into_one_span_preserving_start() {
        let mut table = TraceTable::new();
        let now = Instant::now();
        table.record_span(&span_record("A", "T", "s1", None, 0), now);
        table.record_span(&span_record("A", "T", "s1", None, 500), now);

        let done = table.drain_completed(&TracePolicy::default(), now);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].spans.len(), 1);
        assert_eq!(done[0].spans[0].start_ms, 100);
        assert_eq!(done[0].spans[0].end_ms, 500);
    }

    #[test]
    fn incomplete_trace_is_not_drained_until_idle_or_ttl() {
        let mut table = TraceTable::new();
        let now = Instant::now();
        table.record_span(&span_record("A", "T", "s1", None, 0), now);
        let policy = TracePolicy {
            trace_ttl: Duration::from_secs(3600),
            trace_idle: Duration::from_secs(30),
        };
        assert!(table.drain_completed(&policy, now).is_empty());

        let later = now + Duration::from_secs(31);
        let done = table.drain_completed(&policy, later);
        assert_eq!(done.len(), 1);
    }
}
