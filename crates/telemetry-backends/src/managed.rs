//! Managed time-series store adapter: POSTs batches to an HTTP ingest
//! endpoint, bounded to `max_in_flight` concurrent requests (§4.6).

use std::sync::Arc;

use telemetry_proto::Record;
use tokio::sync::Semaphore;

use crate::{encode_ndjson, http, AdapterError, BackendAdapter, DeliverOutcome, HealthStatus};

pub struct ManagedAdapter {
    endpoint: String,
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
}

impl ManagedAdapter {
    pub fn new(endpoint: String, max_in_flight: usize) -> Self {
        ManagedAdapter {
            endpoint,
            client: reqwest::Client::new(),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for ManagedAdapter {
    async fn deliver(&self, batch: &[Record]) -> Result<DeliverOutcome, AdapterError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|e| AdapterError::Retryable(format!("semaphore closed: {e}")))?;

        let body = encode_ndjson(batch).into_bytes();
        http::send(&self.client, reqwest::Method::POST, &self.endpoint, &[], body).await?;

        Ok(DeliverOutcome {
            delivered_count: batch.len(),
            failed_count: 0,
        })
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            detail: format!("managed store at {}", self.endpoint),
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_support::stub_server;
    use std::collections::HashMap;
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

    #[tokio::test]
    async fn delivers_batch_as_ndjson_body() {
        let (addr, rx) = stub_server(200).await;
        let adapter = ManagedAdapter::new(addr, 4);
        let outcome = adapter.deliver(&[event("A"), event("A")]).await.unwrap();
        assert_eq!(outcome.delivered_count, 2);

        let body = rx.await.unwrap();
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn server_5xx_is_retryable() {
        let (addr, _rx) = stub_server(503).await;
        let adapter = ManagedAdapter::new(addr, 4);
        let err = adapter.deliver(&[event("A")]).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn server_4xx_is_fatal() {
        let (addr, _rx) = stub_server(400).await;
        let adapter = ManagedAdapter::new(addr, 4);
        let err = adapter.deliver(&[event("A")]).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
