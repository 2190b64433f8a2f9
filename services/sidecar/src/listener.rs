//! TCP ingest listener (§4.3).
//!
//! One accept loop per bind address; each accepted socket gets its own
//! reader task, mirroring the teacher's `run_session_loop` shape (a
//! `tokio::select! { biased; }` between the shutdown watch and the next
//! unit of work) but driving a plain byte stream through
//! `telemetry_proto::FrameReader` instead of a WebSocket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use telemetry_correlation::CorrelationEngine;
use telemetry_metrics::Metrics;
use telemetry_proto::frame::{FrameEvent, FrameReader};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

const MAX_FRAMING_ERRORS: u32 = 16;
const FRAMING_ERROR_WINDOW: Duration = Duration::from_secs(10);

pub struct ListenerLimits {
    pub per_source_queue_size: usize,
    pub global_queue_size: usize,
    pub max_connections: usize,
}

pub async fn run(
    bind: String,
    limits: ListenerLimits,
    correlation: Arc<CorrelationEngine>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(&bind).await?;
    info!(addr = %bind, "ingest listener bound");
    let connection_slots = Arc::new(Semaphore::new(limits.max_connections.max(1)));
    let limits = Arc::new(limits);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("ingest listener shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let Ok(permit) = connection_slots.clone().try_acquire_owned() else {
                    debug!(%peer, "max_connections reached, rejecting connection");
                    continue;
                };
                let correlation = correlation.clone();
                let metrics = metrics.clone();
                let limits = limits.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_connection(stream, correlation, metrics, limits, conn_shutdown).await;
                });
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    correlation: Arc<CorrelationEngine>,
    metrics: Arc<Metrics>,
    limits: Arc<ListenerLimits>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = FrameReader::new();
    let mut read_buf = vec![0u8; 8 * 1024];
    let mut bound_source: Option<String> = None;
    let mut framing_errors: Vec<Instant> = Vec::new();

    loop {
        let n = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            read = stream.read(&mut read_buf) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                }
            }
        };

        for event in reader.push(&read_buf[..n]) {
            match event {
                FrameEvent::Line(line) => match telemetry_proto::decode_line(&line) {
                    Ok(record) => {
                        let source = record.source.clone();
                        match &bound_source {
                            None => {
                                bound_source = Some(source.clone());
                                correlation.note_connection(&source).await;
                            }
                            Some(bound) if bound != &source => {
                                metrics.record_dropped("source_mismatch", 1);
                                continue;
                            }
                            Some(_) => {}
                        }

                        if apply_backpressure(&correlation, &metrics, &limits, &source, &record).await {
                            metrics.record_received(&source);
                            correlation.ingest(record).await;
                        } else {
                            metrics.record_dropped("global_cap", 1);
                        }
                    }
                    Err(e) => {
                        metrics.record_dropped(e.reason_tag(), 1);
                        if note_framing_error(&mut framing_errors) {
                            warn!("too many framing errors, closing connection");
                            return;
                        }
                    }
                },
                FrameEvent::Oversize => {
                    metrics.record_dropped("oversize_frame", 1);
                    warn!("oversize frame, closing connection");
                    return;
                }
            }
        }
    }
}

/// Returns `true` if the record should be ingested, `false` if it must be
/// dropped under the global cap. Low-priority kinds (`resource`,
/// `heartbeat`) are the first to go once the global queue is full; other
/// kinds pause the reader (by looping here, which blocks this connection's
/// task without touching the socket) until room frees or a timeout elapses.
async fn apply_backpressure(
    correlation: &CorrelationEngine,
    metrics: &Metrics,
    limits: &ListenerLimits,
    source: &str,
    record: &telemetry_proto::Record,
) -> bool {
    metrics.set_source_queue_size(source, correlation.source_queue_len(source).await as u64);

    if correlation.global_queue_len().await >= limits.global_queue_size {
        if !record.is_high_priority() {
            return false;
        }
    }

    let wait_deadline = Instant::now() + Duration::from_secs(5);
    while correlation.source_queue_len(source).await >= limits.per_source_queue_size {
        if Instant::now() >= wait_deadline {
            return record.is_high_priority();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    metrics.set_source_queue_size(source, correlation.source_queue_len(source).await as u64);
    true
}

fn note_framing_error(history: &mut Vec<Instant>) -> bool {
    let now = Instant::now();
    history.retain(|t| now.duration_since(*t) <= FRAMING_ERROR_WINDOW);
    history.push(now);
    history.len() as u32 >= MAX_FRAMING_ERRORS
}
