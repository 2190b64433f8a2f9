//! Admin HTTP server.
//!
//! Provides:
//! - `GET /health`  — always 200, liveness only
//! - `GET /readyz`  — 200 when local subsystems ready, 503 otherwise
//! - `GET /metrics` — Prometheus text exposition
//! - `POST /reload` — trigger a config reload, 200 with the new snapshot id
//!                    or 400 with the validation error
//!
//! Hand-rolled on `TcpListener`, same shape as the forwarder's status server:
//! read a bounded request buffer, split the request line, match on
//! `(method, path)`, write a manually-framed response. No web framework.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::Metrics;

/// Abstracts the reload action so this crate stays independent of
/// `telemetry-config`'s concrete types, mirroring the forwarder's
/// `JournalAccess` trait split between the real implementation and tests.
#[async_trait::async_trait]
pub trait ReloadTrigger: Send + Sync {
    async fn reload(&self) -> ReloadOutcome;
}

pub enum ReloadOutcome {
    Applied { snapshot_id: u64 },
    Rejected { reason: String },
}

/// Bind the admin server and run its accept loop until the socket closes.
/// Each connection is handled on its own task, matching the forwarder's
/// status server.
pub async fn serve(
    bind: &str,
    metrics: Arc<Metrics>,
    readiness: Arc<dyn Fn() -> bool + Send + Sync>,
    reload: Arc<dyn ReloadTrigger>,
) -> Result<SocketAddr, std::io::Error> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let metrics = metrics.clone();
                    let readiness = readiness.clone();
                    let reload = reload.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, metrics, readiness, reload).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    Ok(local_addr)
}

async fn handle_connection(
    mut stream: TcpStream,
    metrics: Arc<Metrics>,
    readiness: Arc<dyn Fn() -> bool + Send + Sync>,
    reload: Arc<dyn ReloadTrigger>,
) {
    let mut buf = vec![0u8; 4096];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };

    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => {
            send_response(&mut stream, 400, "text/plain", "bad request").await;
            return;
        }
    };

    let first_line = match request.lines().next() {
        Some(l) => l,
        None => {
            send_response(&mut stream, 400, "text/plain", "bad request").await;
            return;
        }
    };

    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/");

    match (method, path) {
        ("GET", "/health") => {
            let body = format!(
                "{{\"status\":\"ok\",\"uptime_s\":{},\"version\":\"{}\"}}",
                metrics.uptime_s(),
                metrics.version()
            );
            send_response(&mut stream, 200, "application/json", &body).await;
        }
        ("GET", "/readyz") => {
            if readiness() {
                send_response(&mut stream, 200, "text/plain", "ready").await;
            } else {
                send_response(&mut stream, 503, "text/plain", "not ready").await;
            }
        }
        ("GET", "/metrics") => {
            let body = metrics.render_prometheus();
            send_response(&mut stream, 200, "text/plain; version=0.0.4", &body).await;
        }
        ("POST", "/reload") => match reload.reload().await {
            ReloadOutcome::Applied { snapshot_id } => {
                metrics.record_reload("applied");
                let body = format!("{{\"snapshot_id\":{snapshot_id}}}");
                send_response(&mut stream, 200, "application/json", &body).await;
            }
            ReloadOutcome::Rejected { reason } => {
                metrics.record_reload("rejected");
                let body = format!("{{\"error\":\"{reason}\"}}");
                send_response(&mut stream, 400, "application/json", &body).await;
            }
        },
        _ => {
            send_response(&mut stream, 404, "text/plain", "not found").await;
        }
    }
}

async fn send_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    };

    let response = format!(
        "HTTP/1.1 {status} {status_text}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        len = body.len(),
    );

    let _ = stream.write_all(response.as_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpStream as ClientStream;

    struct AlwaysApplies;

    #[async_trait::async_trait]
    impl ReloadTrigger for AlwaysApplies {
        async fn reload(&self) -> ReloadOutcome {
            ReloadOutcome::Applied { snapshot_id: 7 }
        }
    }

    async fn get(addr: SocketAddr, request_line: &str) -> String {
        let mut stream = ClientStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("{request_line} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn health_always_reports_ok() {
        let metrics = Arc::new(Metrics::new("0.1.0"));
        let addr = serve(
            "127.0.0.1:0",
            metrics,
            Arc::new(|| false),
            Arc::new(AlwaysApplies),
        )
        .await
        .unwrap();

        let response = get(addr, "GET /health").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn readyz_reflects_readiness_closure() {
        let metrics = Arc::new(Metrics::new("0.1.0"));
        let addr = serve(
            "127.0.0.1:0",
            metrics,
            Arc::new(|| false),
            Arc::new(AlwaysApplies),
        )
        .await
        .unwrap();

        let response = get(addr, "GET /readyz").await;
        assert!(response.starts_with("HTTP/1.1 503"));
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let metrics = Arc::new(Metrics::new("0.1.0"));
        metrics.record_received("A");
        let addr = serve(
            "127.0.0.1:0",
            metrics,
            Arc::new(|| true),
            Arc::new(AlwaysApplies),
        )
        .await
        .unwrap();

        let response = get(addr, "GET /metrics").await;
        assert!(response.contains("records_received_total"));
    }

    #[tokio::test]
    async fn reload_returns_snapshot_id() {
        let metrics = Arc::new(Metrics::new("0.1.0"));
        let addr = serve(
            "127.0.0.1:0",
            metrics,
            Arc::new(|| true),
            Arc::new(AlwaysApplies),
        )
        .await
        .unwrap();

        let response = get(addr, "POST /reload").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"snapshot_id\":7"));
    }
}
