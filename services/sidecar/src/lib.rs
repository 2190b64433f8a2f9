//! Sidecar wiring: config, correlation, routing, and the admin surface
//! (§5, §6). `run` is the single entry point the binary calls; it returns
//! a process exit code rather than calling `std::process::exit` itself so
//! tests can drive it without terminating the test harness.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use telemetry_config::SidecarConfig;
use telemetry_correlation::{BatchPolicy, CorrelationEngine, TracePolicy};
use telemetry_metrics::{Metrics, ReloadOutcome, ReloadTrigger};
use telemetry_routing::RoutingEngine;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

mod listener;

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_INVALID: i32 = 1;
pub const EXIT_LISTENER_BIND_FAILED: i32 = 2;
pub const EXIT_INTERNAL_ERROR: i32 = 3;

/// Runs the sidecar until a shutdown signal is observed, then returns the
/// process exit code it should report (§6 exit codes).
pub async fn run(config_path: PathBuf, mut shutdown: watch::Receiver<bool>) -> i32 {
    let config = match telemetry_config::load_config_from_path(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "invalid configuration at startup");
            return EXIT_CONFIG_INVALID;
        }
    };

    let version = env!("CARGO_PKG_VERSION");
    let metrics = Arc::new(Metrics::new(version));

    let batch_policy = BatchPolicy {
        batch_size: config.correlation.batch_size,
        batch_interval: Duration::from_millis(config.correlation.batch_interval_ms),
        source_idle: Duration::from_millis(config.correlation.source_idle_ms),
    };
    let trace_policy = TracePolicy {
        trace_ttl: Duration::from_millis(config.correlation.trace_ttl_ms),
        trace_idle: Duration::from_millis(config.correlation.trace_idle_ms),
    };
    let correlation = CorrelationEngine::new(batch_policy, trace_policy);

    let routing = match RoutingEngine::new(&config, Some(metrics.clone())) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "failed to build routing engine from startup configuration");
            return EXIT_CONFIG_INVALID;
        }
    };

    let live_config = Arc::new(RwLock::new(config.clone()));
    let ready = Arc::new(AtomicBool::new(false));

    let reload_trigger = Arc::new(SidecarReloadTrigger {
        config_path: config_path.clone(),
        live_config: live_config.clone(),
        routing: routing.clone(),
    });

    let ready_for_closure = ready.clone();
    let readiness: Arc<dyn Fn() -> bool + Send + Sync> =
        Arc::new(move || ready_for_closure.load(Ordering::Relaxed));

    let admin_bind = config.admin.bind.clone();
    let admin_metrics = metrics.clone();
    let admin_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match telemetry_metrics::serve(&admin_bind, admin_metrics, readiness, reload_trigger).await
        {
            Ok(addr) => info!(%addr, "admin endpoint listening"),
            Err(e) => error!(error = %e, "admin endpoint failed to start"),
        }
        let mut shutdown = admin_shutdown;
        let _ = shutdown.changed().await;
    });

    let limits = listener::ListenerLimits {
        per_source_queue_size: config.listener.per_source_queue_size,
        global_queue_size: config.listener.global_queue_size,
        max_connections: config.listener.max_connections,
    };
    let bind_addr = format!("{}:{}", config.listener.host, config.listener.port);
    let listener_shutdown = shutdown.clone();
    let listener_handle = tokio::spawn(listener::run(
        bind_addr,
        limits,
        correlation.clone(),
        metrics.clone(),
        listener_shutdown,
    ));

    // give the bind a moment before declaring readiness; a bind failure
    // surfaces as an immediate task completion below.
    tokio::time::sleep(Duration::from_millis(20)).await;
    if listener_handle.is_finished() {
        return match listener_handle.await {
            Ok(Ok(())) => EXIT_OK,
            Ok(Err(e)) => {
                error!(error = %e, "listener failed to bind");
                EXIT_LISTENER_BIND_FAILED
            }
            Err(e) => {
                error!(error = %e, "listener task panicked");
                EXIT_INTERNAL_ERROR
            }
        };
    }
    ready.store(true, Ordering::Relaxed);
    info!("sidecar ready");

    let pump_shutdown = shutdown.clone();
    let pump_correlation = correlation.clone();
    let pump_routing = routing.clone();
    let pump_handle = tokio::spawn(run_pump(pump_correlation, pump_routing, pump_shutdown));

    let poll_shutdown = shutdown.clone();
    let poll_handle = tokio::spawn(run_reload_poll(
        config_path,
        config,
        live_config,
        routing.clone(),
        metrics.clone(),
        poll_shutdown,
    ));

    let _ = shutdown.changed().await;
    info!("shutdown signal received, draining");

    let _ = listener_handle.await;
    let _ = pump_handle.await;
    let _ = poll_handle.await;
    routing.close().await;

    EXIT_OK
}

/// Periodically drains correlation batches into routing, evicts idle
/// sources, and surfaces assembled traces (§4.4, §8 property 9).
async fn run_pump(
    correlation: Arc<CorrelationEngine>,
    routing: Arc<RoutingEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    for batch in correlation.drain(usize::MAX).await {
                        routing.route(&batch.source, batch.records).await;
                    }
                    return;
                }
            }
            _ = tick.tick() => {
                for batch in correlation.drain(10_000).await {
                    routing.route(&batch.source, batch.records).await;
                }
                for evicted in correlation.evict_idle_sources().await {
                    info!(source = %evicted, "source evicted after idle timeout");
                }
                for trace in correlation.drain_completed_traces().await {
                    let record = trace.to_record();
                    info!(
                        trace_id = %trace.trace_id,
                        span_count = trace.spans.len(),
                        "trace assembled"
                    );
                    routing.route(&record.source, vec![record]).await;
                }
            }
        }
    }
}

/// Polls the config file for changes missed by an explicit `/reload` call
/// and applies them the same way (§4.8). On each tick the file's mtime is
/// checked first; only once it has gone 100ms without changing again is the
/// file actually parsed, so a write spread across several syscalls is read
/// once it has settled rather than mid-write.
async fn run_reload_poll(
    config_path: PathBuf,
    mut last_applied: SidecarConfig,
    live_config: Arc<RwLock<SidecarConfig>>,
    routing: Arc<RoutingEngine>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(last_applied.reload.check_interval_ms.max(200));
    let mut tick = tokio::time::interval(interval);
    let mut last_seen_mtime = file_mtime(&config_path).await;
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                if !last_applied.reload.enabled {
                    continue;
                }

                let mtime = file_mtime(&config_path).await;
                if mtime == last_seen_mtime {
                    continue;
                }

                // Debounce: editors often write a file in several syscalls.
                tokio::time::sleep(Duration::from_millis(100)).await;
                let settled = file_mtime(&config_path).await;
                if settled != mtime {
                    continue;
                }
                last_seen_mtime = settled;

                match telemetry_config::load_config_from_path(&config_path) {
                    Ok(new_config) if new_config != last_applied => {
                        match routing.reload(&new_config).await {
                            Ok(()) => {
                                *live_config.write().await = new_config.clone();
                                last_applied = new_config;
                                metrics.record_reload("applied");
                                info!("configuration reloaded from disk change");
                            }
                            Err(e) => {
                                warn!(error = %e, "discarded invalid configuration change on disk");
                                metrics.record_reload("rejected");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "failed to read configuration file during poll");
                        metrics.record_reload("rejected");
                    }
                }
            }
        }
    }
}

async fn file_mtime(path: &PathBuf) -> Option<std::time::SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Bridges the admin HTTP server's `/reload` to `telemetry-config` and
/// `telemetry-routing`. `serve`'s caller (`http.rs`) records the
/// applied/rejected metric itself, so this impl only performs the reload.
struct SidecarReloadTrigger {
    config_path: PathBuf,
    live_config: Arc<RwLock<SidecarConfig>>,
    routing: Arc<RoutingEngine>,
}

#[async_trait::async_trait]
impl ReloadTrigger for SidecarReloadTrigger {
    async fn reload(&self) -> ReloadOutcome {
        let new_config = match telemetry_config::load_config_from_path(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                return ReloadOutcome::Rejected {
                    reason: e.to_string(),
                }
            }
        };
        match self.routing.reload(&new_config).await {
            Ok(()) => {
                *self.live_config.write().await = new_config;
                ReloadOutcome::Applied {
                    snapshot_id: snapshot_id(),
                }
            }
            Err(e) => ReloadOutcome::Rejected { reason: e },
        }
    }
}

fn snapshot_id() -> u64 {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
