//! telemetry-routing: rule evaluation, kind filtering and breaker-wrapped
//! dispatch to backend adapters (§4.5).
//!
//! Grounded on the teacher's `discovery.rs`/`local_fanout.rs` split: a
//! read-mostly snapshot of routing state, atomically swappable on reload,
//! with in-flight work pinned to the `Arc` it started against so a
//! mid-dispatch reload never yanks an adapter out from under a live send.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use telemetry_backends::{AdapterError, BackendAdapter};
use telemetry_breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use telemetry_config::{BackendConfig, RouteRule, SidecarConfig};
use telemetry_metrics::Metrics;
use telemetry_proto::{Record, RecordKind};
use tracing::warn;

/// Default per-call delivery timeout applied to every adapter (§5).
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One backend's adapter plus the breaker guarding it. Built once per
/// snapshot; reused across reloads when a backend's config is unchanged
/// would require comparing `BackendConfig` for equality, which the routing
/// layer does not attempt — every reload rebuilds every adapter (§4.8 notes
/// this as allowed, not required).
struct RoutedBackend {
    adapter: Box<dyn BackendAdapter>,
    breaker: CircuitBreaker,
    rule: RouteRule,
}

/// An immutable view of `{rules, backends}` (§4.5 "hot-reload contract").
pub struct RouteSnapshot {
    /// `source or '*'` → backend names in declared order, pre-deduplicated.
    rules: HashMap<String, Vec<String>>,
    backends: HashMap<String, RoutedBackend>,
}

impl RouteSnapshot {
    pub fn build(config: &SidecarConfig) -> Result<RouteSnapshot, String> {
        let mut backends = HashMap::with_capacity(config.backends.len());
        for (name, backend_config) in &config.backends {
            let adapter = telemetry_backends::build_adapter(name, backend_config)?;
            let rule = find_rule(config, name).unwrap_or_else(|| RouteRule {
                backend: name.clone(),
                enabled: true,
                priority: 0,
                kinds: all_kinds(),
            });
            backends.insert(
                name.clone(),
                RoutedBackend {
                    adapter,
                    breaker: CircuitBreaker::new(name.clone(), breaker_config_for(backend_config)),
                    rule,
                },
            );
        }

        let mut rules: HashMap<String, Vec<String>> = HashMap::with_capacity(config.routing.rules.len());
        for (source, route_rules) in &config.routing.rules {
            let mut seen = HashSet::new();
            let mut ordered = Vec::new();
            for rule in route_rules {
                if !rule.enabled {
                    continue;
                }
                if !backends.contains_key(&rule.backend) {
                    return Err(format!(
                        "routing rule for '{source}' references unknown backend '{}'",
                        rule.backend
                    ));
                }
                if seen.insert(rule.backend.clone()) {
                    ordered.push(rule.backend.clone());
                }
            }
            rules.insert(source.clone(), ordered);
        }

        Ok(RouteSnapshot { rules, backends })
    }

    /// Resolve the backend list for `source`: exact match first, then `*`,
    /// concatenated and deduplicated by first occurrence (§4.5 step 1).
    fn resolve(&self, source: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        for key in [source, "*"] {
            if let Some(names) = self.rules.get(key) {
                for name in names {
                    if seen.insert(name.as_str()) {
                        ordered.push(name.as_str());
                    }
                }
            }
        }
        ordered
    }

    async fn close(&self) {
        for backend in self.backends.values() {
            backend.adapter.close().await;
        }
    }
}

/// Polls `snapshot`'s reference count and closes its adapters once this
/// task holds the only remaining `Arc`, i.e. every dispatch spawned against
/// it has returned.
async fn close_when_drained(snapshot: Arc<RouteSnapshot>) {
    loop {
        if Arc::strong_count(&snapshot) == 1 {
            snapshot.close().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn find_rule(config: &SidecarConfig, backend_name: &str) -> Option<RouteRule> {
    config
        .routing
        .rules
        .values()
        .flatten()
        .find(|r| r.backend == backend_name)
        .cloned()
}

fn all_kinds() -> Vec<RecordKind> {
    vec![
        RecordKind::Event,
        RecordKind::Metric,
        RecordKind::Progress,
        RecordKind::Resource,
        RecordKind::Span,
        RecordKind::Heartbeat,
        RecordKind::Goodbye,
        RecordKind::Trace,
    ]
}

fn breaker_config_for(config: &BackendConfig) -> BreakerConfig {
    // Every backend kind shares the same defaults today; kept as a per-kind
    // hook since slower sinks (object-store, search) may warrant a longer
    // cool-down once that's observed in practice.
    let _ = config;
    BreakerConfig::default()
}

/// Holds the current [`RouteSnapshot`] and dispatches batches against it.
pub struct RoutingEngine {
    snapshot: tokio::sync::RwLock<Arc<RouteSnapshot>>,
    metrics: Option<Arc<Metrics>>,
}

impl RoutingEngine {
    pub fn new(config: &SidecarConfig, metrics: Option<Arc<Metrics>>) -> Result<Self, String> {
        let snapshot = RouteSnapshot::build(config)?;
        Ok(RoutingEngine {
            snapshot: tokio::sync::RwLock::new(Arc::new(snapshot)),
            metrics,
        })
    }

    /// Swap in a freshly built snapshot. The previous snapshot's adapters
    /// stay alive, owned by whatever in-flight dispatch still holds its
    /// `Arc`, and are closed once the last one finishes (§4.5 drain-then-close).
    pub async fn reload(&self, config: &SidecarConfig) -> Result<(), String> {
        let next = RouteSnapshot::build(config)?;
        let previous = {
            let mut guard = self.snapshot.write().await;
            std::mem::replace(&mut *guard, Arc::new(next))
        };
        tokio::spawn(close_when_drained(previous));
        Ok(())
    }

    /// Route one source's batch: resolve backends, filter by kind, dispatch
    /// concurrently without waiting on each other (§4.5 steps 2-4).
    pub async fn route(&self, source: &str, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        let snapshot = self.snapshot.read().await.clone();
        let mut backend_names: Vec<&str> = snapshot.resolve(source).to_vec();
        backend_names.sort_by_key(|name| {
            snapshot
                .backends
                .get(*name)
                .map(|b| b.rule.priority)
                .unwrap_or(0)
        });

        let records = Arc::new(records);
        for name in backend_names {
            let snapshot = snapshot.clone();
            let records = records.clone();
            let metrics = self.metrics.clone();
            let name = name.to_owned();
            tokio::spawn(async move {
                dispatch_one(&snapshot, &name, &records, metrics.as_deref()).await;
            });
        }
    }

    pub async fn close(&self) {
        self.snapshot.read().await.close().await;
    }
}

async fn dispatch_one(
    snapshot: &RouteSnapshot,
    backend_name: &str,
    records: &[Record],
    metrics: Option<&Metrics>,
) {
    let Some(backend) = snapshot.backends.get(backend_name) else {
        return;
    };

    let filtered: Vec<Record> = records
        .iter()
        .filter(|r| backend.rule.kinds.contains(&r.kind()))
        .cloned()
        .collect();
    if filtered.is_empty() {
        return;
    }

    let started = Instant::now();
    let result = backend
        .breaker
        .call(AdapterError::is_retryable, || async {
            match tokio::time::timeout(DELIVERY_TIMEOUT, backend.adapter.deliver(&filtered)).await {
                Ok(r) => r,
                Err(_) => Err(AdapterError::Retryable(format!(
                    "delivery to '{backend_name}' timed out after {DELIVERY_TIMEOUT:?}"
                ))),
            }
        })
        .await;

    if let Some(metrics) = metrics {
        metrics.observe_backend_latency(backend_name, started.elapsed());
        metrics.set_circuit_state(backend_name, state_label(&backend.breaker).await);
    }

    match result {
        Ok(outcome) => {
            if let Some(metrics) = metrics {
                metrics.record_routed(backend_name, outcome.delivered_count as u64);
            }
        }
        Err(BreakerError::Open) => {
            warn!(backend = backend_name, "dispatch skipped, circuit open");
            if let Some(metrics) = metrics {
                metrics.record_dropped("circuit_open", filtered.len() as u64);
            }
        }
        Err(BreakerError::Backend(e)) => {
            warn!(backend = backend_name, error = %e, "delivery failed after retries");
            if let Some(metrics) = metrics {
                metrics.record_dropped("delivery_failed", filtered.len() as u64);
            }
        }
    }
}

async fn state_label(breaker: &CircuitBreaker) -> &'static str {
    match breaker.state().await {
        telemetry_breaker::BreakerState::Closed => "closed",
        telemetry_breaker::BreakerState::Open => "open",
        telemetry_breaker::BreakerState::HalfOpen => "half_open",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use telemetry_proto::{Level, Payload, SCHEMA_VERSION};

    fn event(source: &str) -> Record {
        Record {
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            timestamp_ms: 1,
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            payload: Payload::Event {
                level: Level::Info,
                message: "x".into(),
                context: HashMap::new(),
            },
        }
    }

    fn config_with_routing(rules: HashMap<String, Vec<RouteRule>>, backends: Vec<&str>) -> SidecarConfig {
        let mut cfg = SidecarConfig::default();
        cfg.routing = telemetry_config::RoutingConfig { rules };
        for name in backends {
            cfg.backends.insert(
                name.to_owned(),
                BackendConfig::Webhook {
                    url: "http://127.0.0.1:1/unreachable".into(),
                    method: "POST".into(),
                    headers: HashMap::new(),
                },
            );
        }
        cfg
    }

    fn rule(backend: &str, priority: i32) -> RouteRule {
        RouteRule {
            backend: backend.to_owned(),
            enabled: true,
            priority,
            kinds: all_kinds(),
        }
    }

    #[test]
    fn resolve_dedups_exact_and_wildcard_preserving_first_occurrence() {
        let mut rules = HashMap::new();
        rules.insert("A".to_owned(), vec![rule("fs", 0), rule("http", 1)]);
        rules.insert("*".to_owned(), vec![rule("http", 1), rule("webhook", 2)]);
        let config = config_with_routing(rules, vec!["fs", "http", "webhook"]);
        let snapshot = RouteSnapshot::build(&config).unwrap();

        assert_eq!(snapshot.resolve("A"), vec!["fs", "http", "webhook"]);
    }

    #[test]
    fn resolve_falls_back_to_wildcard_only_when_no_exact_rule() {
        let mut rules = HashMap::new();
        rules.insert("*".to_owned(), vec![rule("webhook", 0)]);
        let config = config_with_routing(rules, vec!["webhook"]);
        let snapshot = RouteSnapshot::build(&config).unwrap();

        assert_eq!(snapshot.resolve("unknown-source"), vec!["webhook"]);
    }

    #[test]
    fn disabled_rule_is_excluded_from_resolution() {
        let mut rules = HashMap::new();
        let mut disabled = rule("fs", 0);
        disabled.enabled = false;
        rules.insert("A".to_owned(), vec![disabled]);
        let config = config_with_routing(rules, vec!["fs"]);
        let snapshot = RouteSnapshot::build(&config).unwrap();

        assert!(snapshot.resolve("A").is_empty());
    }

    #[test]
    fn unknown_backend_reference_is_rejected_at_build_time() {
        let mut rules = HashMap::new();
        rules.insert("A".to_owned(), vec![rule("ghost", 0)]);
        let config = config_with_routing(rules, vec![]);
        assert!(RouteSnapshot::build(&config).is_err());
    }

    #[tokio::test]
    async fn reload_swaps_snapshot_and_in_flight_dispatch_survives() {
        let cfg_a = config_with_routing(HashMap::new(), vec!["fs"]);
        let engine = RoutingEngine::new(&cfg_a, None).unwrap();

        let cfg_b = config_with_routing(HashMap::new(), vec!["fs", "webhook"]);
        engine.reload(&cfg_b).await.unwrap();

        let snapshot = engine.snapshot.read().await.clone();
        assert!(snapshot.backends.contains_key("webhook"));
    }

    struct TrackingAdapter {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackendAdapter for TrackingAdapter {
        async fn deliver(
            &self,
            batch: &[Record],
        ) -> Result<telemetry_backends::DeliverOutcome, AdapterError> {
            Ok(telemetry_backends::DeliverOutcome {
                delivered_count: batch.len(),
                failed_count: 0,
            })
        }
        async fn health(&self) -> telemetry_backends::HealthStatus {
            telemetry_backends::HealthStatus {
                healthy: true,
                detail: String::new(),
            }
        }
        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn reload_closes_superseded_snapshot_once_drained() {
        let cfg_a = config_with_routing(HashMap::new(), vec!["fs"]);
        let engine = RoutingEngine::new(&cfg_a, None).unwrap();

        let closed = Arc::new(AtomicUsize::new(0));
        {
            let mut backends = HashMap::new();
            backends.insert(
                "fs".to_owned(),
                RoutedBackend {
                    adapter: Box::new(TrackingAdapter { closed: closed.clone() }),
                    breaker: CircuitBreaker::new("fs", BreakerConfig::default()),
                    rule: rule("fs", 0),
                },
            );
            let mut guard = engine.snapshot.write().await;
            *guard = Arc::new(RouteSnapshot {
                rules: HashMap::new(),
                backends,
            });
        }

        let cfg_b = config_with_routing(HashMap::new(), vec!["fs", "webhook"]);
        engine.reload(&cfg_b).await.unwrap();

        for _ in 0..20 {
            if closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    struct CountingAdapter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackendAdapter for CountingAdapter {
        async fn deliver(
            &self,
            batch: &[Record],
        ) -> Result<telemetry_backends::DeliverOutcome, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(telemetry_backends::DeliverOutcome {
                delivered_count: batch.len(),
                failed_count: 0,
            })
        }
        async fn health(&self) -> telemetry_backends::HealthStatus {
            telemetry_backends::HealthStatus {
                healthy: true,
                detail: String::new(),
            }
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn kind_filter_drops_records_not_in_the_allow_set() {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = RoutedBackend {
            adapter: Box::new(CountingAdapter { calls: calls.clone() }),
            breaker: CircuitBreaker::new("x", BreakerConfig::default()),
            rule: RouteRule {
                backend: "x".into(),
                enabled: true,
                priority: 0,
                kinds: vec![RecordKind::Metric],
            },
        };
        let mut backends = HashMap::new();
        backends.insert("x".to_owned(), backend);
        let snapshot = RouteSnapshot {
            rules: HashMap::new(),
            backends,
        };

        dispatch_one(&snapshot, "x", &[event("A")], None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "event record should be filtered out");
    }
}
