//! telemetry-proto: wire types and line-delimited JSON codec.
//!
//! One `Record` per line, terminated by `\n`. Field names on the wire are
//! short (`v,src,ts,type,tid,sid,pid,data`) to keep frames small; this crate
//! maps them to the readable [`Record`] type internally so callers never see
//! the short names.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod frame;

pub use frame::{FrameError, FrameReader, MAX_FRAME_LEN};

/// Current wire schema version. Records with a higher `v` are rejected.
pub const SCHEMA_VERSION: u32 = 1;

/// Default accepted clock skew between producer `ts` and sidecar wall clock.
pub const DEFAULT_SKEW_WINDOW_MS: i64 = 10 * 60 * 1000;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A single telemetry record, decoded from one line of the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub schema_version: u32,
    pub source: String,
    pub timestamp_ms: i64,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub payload: Payload,
}

impl Record {
    /// The record kind, derived from the payload variant.
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    /// True for records considered highest-priority under global backpressure
    /// (anything other than `resource`/`heartbeat`, see §4.3).
    pub fn is_high_priority(&self) -> bool {
        !matches!(self.kind(), RecordKind::Resource | RecordKind::Heartbeat)
    }

    /// True when this record forces an immediate batch flush (§4.4): an
    /// error/fatal event, or a span that did not complete successfully.
    pub fn forces_flush(&self) -> bool {
        match &self.payload {
            Payload::Event { level, .. } => matches!(level, Level::Error | Level::Fatal),
            Payload::Span { status, .. } => status != "success",
            _ => false,
        }
    }
}

/// The discriminant of a [`Record`]'s payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Event,
    Metric,
    Progress,
    Resource,
    Span,
    Heartbeat,
    Goodbye,
    /// Synthetic: an assembled trace forest, emitted once per completed
    /// trace by the correlation engine rather than received on the wire
    /// from a client (§4.4, §8 property 9).
    Trace,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordKind::Event => "event",
            RecordKind::Metric => "metric",
            RecordKind::Progress => "progress",
            RecordKind::Resource => "resource",
            RecordKind::Span => "span",
            RecordKind::Heartbeat => "heartbeat",
            RecordKind::Goodbye => "goodbye",
            RecordKind::Trace => "trace",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Kind-specific payload bag (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Event {
        level: Level,
        message: String,
        #[serde(default)]
        context: HashMap<String, serde_json::Value>,
    },
    Metric {
        name: String,
        value: f64,
        unit: String,
        #[serde(default)]
        tags: HashMap<String, serde_json::Value>,
    },
    Progress {
        job_id: String,
        percent: u8,
        status: String,
    },
    Resource {
        cpu: f64,
        memory: f64,
        disk_io: f64,
        net_io: f64,
        pid: u64,
    },
    Span {
        name: String,
        start_ms: i64,
        /// `0` means "start only" (no end yet).
        end_ms: i64,
        status: String,
        #[serde(default)]
        tags: HashMap<String, serde_json::Value>,
    },
    Heartbeat,
    Goodbye,
    /// An assembled trace forest, delivered once a trace is complete, idle,
    /// or past TTL (§4.4). `spans` carries every span known for the trace.
    Trace {
        spans: Vec<SpanSummary>,
    },
}

/// One span as carried by a `Payload::Trace` forest (§3 "Trace state").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanSummary {
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub source: String,
    pub name: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub status: String,
    #[serde(default)]
    pub tags: HashMap<String, serde_json::Value>,
}

impl Payload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Payload::Event { .. } => RecordKind::Event,
            Payload::Metric { .. } => RecordKind::Metric,
            Payload::Progress { .. } => RecordKind::Progress,
            Payload::Resource { .. } => RecordKind::Resource,
            Payload::Span { .. } => RecordKind::Span,
            Payload::Heartbeat => RecordKind::Heartbeat,
            Payload::Goodbye => RecordKind::Goodbye,
            Payload::Trace { .. } => RecordKind::Trace,
        }
    }

    /// Clamp `percent` into `[0, 100]` as required for `progress` payloads.
    pub fn clamp_percent(self) -> Self {
        match self {
            Payload::Progress {
                job_id,
                percent,
                status,
            } => Payload::Progress {
                job_id,
                percent: percent.min(100),
                status,
            },
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shape (short field names)
// ---------------------------------------------------------------------------

/// The on-wire JSON shape, using the short field names from §4.1. Decoding
/// goes `&[u8] -> WireRecord -> Record`; encoding is the reverse.
#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    v: u32,
    src: String,
    ts: i64,
    #[serde(flatten)]
    body: WireBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    tid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "pid")]
    parent_span_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decode one already-newline-stripped JSON line into a [`Record`].
///
/// Returns a [`FrameError`] variant classifying the failure so the caller can
/// tag its drop counter with a reason (§4.1, §7 `protocol_error`).
pub fn decode_line(line: &[u8]) -> Result<Record, FrameError> {
    let line = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(FrameError::Empty);
    }

    let wire: WireRecord =
        serde_json::from_str(trimmed).map_err(|e| FrameError::MalformedJson(e.to_string()))?;

    if wire.v > SCHEMA_VERSION {
        return Err(FrameError::UnsupportedVersion(wire.v));
    }
    if wire.src.is_empty() {
        return Err(FrameError::MissingField("src"));
    }

    let payload = decode_payload(&wire.body.kind, wire.body.data)?;

    Ok(Record {
        schema_version: wire.v,
        source: wire.src,
        timestamp_ms: wire.ts,
        trace_id: wire.tid,
        span_id: wire.sid,
        parent_span_id: wire.parent_span_id,
        payload: payload.clamp_percent(),
    })
}

fn decode_payload(kind: &str, data: serde_json::Value) -> Result<Payload, FrameError> {
    // Payload deserializes through the same `#[serde(tag = "type")]` enum as
    // the typed record, so splice `type` back in alongside `data`'s fields.
    let mut obj = match data {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        _ => return Err(FrameError::MalformedJson("data must be an object".into())),
    };
    obj.insert("type".into(), serde_json::Value::String(kind.to_owned()));
    serde_json::from_value(serde_json::Value::Object(obj))
        .map_err(|_| FrameError::UnknownKind(kind.to_owned()))
}

/// Encode a [`Record`] back into one wire-format JSON line, without the
/// trailing newline (callers append `\n` when framing for the socket).
pub fn encode_line(record: &Record) -> String {
    let value = serde_json::to_value(&record.payload).expect("Payload always serializes");
    let serde_json::Value::Object(mut obj) = value else {
        unreachable!("Payload always serializes to an object")
    };
    let kind = obj
        .remove("type")
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default();
    let data = serde_json::Value::Object(obj);

    let wire = WireRecord {
        v: record.schema_version,
        src: record.source.clone(),
        ts: record.timestamp_ms,
        body: WireBody { kind, data },
        tid: record.trace_id.clone(),
        sid: record.span_id.clone(),
        parent_span_id: record.parent_span_id.clone(),
    };
    serde_json::to_string(&wire).expect("WireRecord always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind_payload: Payload) -> Record {
        Record {
            schema_version: SCHEMA_VERSION,
            source: "queue-service".into(),
            timestamp_ms: 1_697_821_234_567,
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            payload: kind_payload,
        }
    }

    #[test]
    fn round_trip_event() {
        let r = sample(Payload::Event {
            level: Level::Info,
            message: "Job started".into(),
            context: HashMap::new(),
        });
        let line = encode_line(&r);
        let decoded = decode_line(line.as_bytes()).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn round_trip_metric_span_progress_resource() {
        for r in [
            sample(Payload::Metric {
                name: "jobs_processed".into(),
                value: 1.0,
                unit: "count".into(),
                tags: HashMap::new(),
            }),
            sample(Payload::Span {
                name: "process_job".into(),
                start_ms: 1,
                end_ms: 2,
                status: "success".into(),
                tags: HashMap::new(),
            }),
            sample(Payload::Progress {
                job_id: "j1".into(),
                percent: 50,
                status: "running".into(),
            }),
            sample(Payload::Resource {
                cpu: 0.5,
                memory: 100.0,
                disk_io: 0.0,
                net_io: 0.0,
                pid: 123,
            }),
            sample(Payload::Heartbeat),
            sample(Payload::Goodbye),
            sample(Payload::Trace {
                spans: vec![SpanSummary {
                    span_id: "s1".into(),
                    parent_span_id: None,
                    source: "queue-service".into(),
                    name: "process_job".into(),
                    start_ms: 1,
                    end_ms: 2,
                    status: "success".into(),
                    tags: HashMap::new(),
                }],
            }),
        ] {
            let line = encode_line(&r);
            let decoded = decode_line(line.as_bytes()).unwrap();
            assert_eq!(decoded, r);
        }
    }

    #[test]
    fn decode_ignores_surrounding_whitespace() {
        let r = sample(Payload::Heartbeat);
        let line = format!("  {}  ", encode_line(&r));
        assert_eq!(decode_line(line.as_bytes()).unwrap(), r);
    }

    #[test]
    fn rejects_unsupported_version() {
        let line = br#"{"v":2,"src":"a","ts":1,"type":"heartbeat","data":{}}"#;
        assert!(matches!(
            decode_line(line),
            Err(FrameError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        let line = br#"{"v":1,"src":"a","ts":1,"type":"bogus","data":{}}"#;
        assert!(matches!(decode_line(line), Err(FrameError::UnknownKind(_))));
    }

    #[test]
    fn rejects_malformed_json() {
        let line = b"{not json";
        assert!(matches!(decode_line(line), Err(FrameError::MalformedJson(_))));
    }

    #[test]
    fn rejects_empty_source() {
        let line = br#"{"v":1,"src":"","ts":1,"type":"heartbeat","data":{}}"#;
        assert!(matches!(
            decode_line(line),
            Err(FrameError::MissingField("src"))
        ));
    }

    #[test]
    fn progress_percent_is_clamped() {
        let line = br#"{"v":1,"src":"a","ts":1,"type":"progress","data":{"job_id":"j","percent":250,"status":"running"}}"#;
        let r = decode_line(line).unwrap();
        assert_eq!(
            r.payload,
            Payload::Progress {
                job_id: "j".into(),
                percent: 100,
                status: "running".into(),
            }
        );
    }

    #[test]
    fn forces_flush_on_error_and_failed_span() {
        let err = sample(Payload::Event {
            level: Level::Error,
            message: "boom".into(),
            context: HashMap::new(),
        });
        assert!(err.forces_flush());

        let failed_span = sample(Payload::Span {
            name: "x".into(),
            start_ms: 1,
            end_ms: 2,
            status: "failed".into(),
            tags: HashMap::new(),
        });
        assert!(failed_span.forces_flush());

        let ok_metric = sample(Payload::Metric {
            name: "n".into(),
            value: 1.0,
            unit: "count".into(),
            tags: HashMap::new(),
        });
        assert!(!ok_metric.forces_flush());
    }
}
