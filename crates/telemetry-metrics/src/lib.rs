//! telemetry-metrics: self-telemetry counters and the admin HTTP endpoints
//! (§4.8 reload trigger, §6 `/health`, `/metrics`, `/reload`, §5 no new
//! dependency for the hot path).
//!
//! Grounded directly on `status_http.rs`'s hand-rolled `TcpListener` server —
//! no web framework, no metrics crate. `health()`/`readyz()` reuse that
//! module's readiness-vs-liveness split (`/healthz` always 200, `/readyz`
//! reflects local subsystem state).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

mod counters;
mod http;

pub use http::{serve, ReloadOutcome, ReloadTrigger};

use counters::{CounterVec, GaugeVec, LatencyVec};

pub struct Metrics {
    started_at: Instant,
    version: String,
    records_received: CounterVec,
    records_dropped: CounterVec,
    records_routed: CounterVec,
    backend_latency: LatencyVec,
    backend_circuit_state: RwLock<HashMap<String, &'static str>>,
    source_queue_size: GaugeVec,
    config_reload: CounterVec,
}

impl Metrics {
    pub fn new(version: impl Into<String>) -> Self {
        Metrics {
            started_at: Instant::now(),
            version: version.into(),
            records_received: CounterVec::default(),
            records_dropped: CounterVec::default(),
            records_routed: CounterVec::default(),
            backend_latency: LatencyVec::default(),
            backend_circuit_state: RwLock::new(HashMap::new()),
            source_queue_size: GaugeVec::default(),
            config_reload: CounterVec::default(),
        }
    }

    pub fn record_received(&self, source: &str) {
        self.records_received.incr(source, 1);
    }

    pub fn record_dropped(&self, reason: &str, n: u64) {
        self.records_dropped.incr(reason, n);
    }

    pub fn record_routed(&self, backend: &str, n: u64) {
        self.records_routed.incr(backend, n);
    }

    pub fn observe_backend_latency(&self, backend: &str, duration: Duration) {
        self.backend_latency.observe(backend, duration);
    }

    pub fn set_circuit_state(&self, backend: &str, state: &'static str) {
        self.backend_circuit_state
            .write()
            .unwrap()
            .insert(backend.to_owned(), state);
    }

    pub fn set_source_queue_size(&self, source: &str, size: u64) {
        self.source_queue_size.set(source, size);
    }

    pub fn record_reload(&self, result: &str) {
        self.config_reload.incr(result, 1);
    }

    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Render every counter/gauge as Prometheus text exposition (§6).
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        render_counter(&mut out, "records_received_total", "source", &self.records_received);
        render_counter(&mut out, "records_dropped_total", "reason", &self.records_dropped);
        render_counter(&mut out, "records_routed_total", "backend", &self.records_routed);
        render_counter(&mut out, "config_reload_total", "result", &self.config_reload);

        out.push_str("# TYPE backend_latency_seconds summary\n");
        for (backend, sum_seconds, count) in self.backend_latency.snapshot() {
            out.push_str(&format!(
                "backend_latency_seconds_sum{{backend=\"{backend}\"}} {sum_seconds}\n"
            ));
            out.push_str(&format!(
                "backend_latency_seconds_count{{backend=\"{backend}\"}} {count}\n"
            ));
        }

        out.push_str("# TYPE backend_circuit_state gauge\n");
        for (backend, state) in self.backend_circuit_state.read().unwrap().iter() {
            let value = match *state {
                "closed" => 0,
                "half_open" => 1,
                "open" => 2,
                _ => -1,
            };
            out.push_str(&format!(
                "backend_circuit_state{{backend=\"{backend}\",state=\"{state}\"}} {value}\n"
            ));
        }

        out.push_str("# TYPE source_queue_size gauge\n");
        for (source, size) in self.source_queue_size.snapshot() {
            out.push_str(&format!("source_queue_size{{source=\"{source}\"}} {size}\n"));
        }

        out
    }
}

fn render_counter(out: &mut String, name: &str, label: &str, vec: &CounterVec) {
    out.push_str(&format!("# TYPE {name} counter\n"));
    for (value, count) in vec.snapshot() {
        out.push_str(&format!("{name}{{{label}=\"{value}\"}} {count}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_with_labels() {
        let metrics = Metrics::new("0.1.0");
        metrics.record_received("A");
        metrics.record_received("A");
        metrics.record_dropped("oversize_frame", 3);
        metrics.set_circuit_state("http", "open");

        let text = metrics.render_prometheus();
        assert!(text.contains(r#"records_received_total{source="A"} 2"#));
        assert!(text.contains(r#"records_dropped_total{reason="oversize_frame"} 3"#));
        assert!(text.contains(r#"backend_circuit_state{backend="http",state="open"} 2"#));
    }

    #[test]
    fn latency_snapshot_tracks_sum_and_count() {
        let metrics = Metrics::new("0.1.0");
        metrics.observe_backend_latency("fs", Duration::from_millis(500));
        metrics.observe_backend_latency("fs", Duration::from_millis(500));
        let text = metrics.render_prometheus();
        assert!(text.contains(r#"backend_latency_seconds_count{backend="fs"} 2"#));
    }
}
