//! Object-store sink: accumulates records up to a size/time threshold, then
//! uploads one newline-delimited object via an S3-style PUT (§4.6, SPEC_FULL
//! Open Question resolution #3).

use std::sync::Arc;

use telemetry_proto::Record;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::{encode_ndjson, http, AdapterError, BackendAdapter, DeliverOutcome, HealthStatus};

struct Accumulator {
    buf: String,
    records_buffered: usize,
    opened_at: Instant,
}

pub struct ObjectStoreAdapter {
    endpoint: String,
    bucket: String,
    key_prefix: String,
    max_batch_bytes: u64,
    max_batch_interval: Duration,
    client: reqwest::Client,
    accumulator: Arc<Mutex<Accumulator>>,
}

impl ObjectStoreAdapter {
    pub fn new(
        endpoint: String,
        bucket: String,
        key_prefix: String,
        max_batch_bytes: u64,
        max_batch_interval_ms: u64,
    ) -> Self {
        ObjectStoreAdapter {
            endpoint,
            bucket,
            key_prefix,
            max_batch_bytes,
            max_batch_interval: Duration::from_millis(max_batch_interval_ms.max(1)),
            client: reqwest::Client::new(),
            accumulator: Arc::new(Mutex::new(Accumulator {
                buf: String::new(),
                records_buffered: 0,
                opened_at: Instant::now(),
            })),
        }
    }

    fn object_key(&self, source: &str) -> String {
        let now = chrono::Utc::now();
        format!(
            "{}/{}/{}-{}.ndjson",
            self.key_prefix.trim_end_matches('/'),
            source,
            now.format("%Y%m%dT%H%M%S"),
            now.timestamp_millis()
        )
    }

    async fn upload(&self, source: &str, body: String) -> Result<(), AdapterError> {
        let url = format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            self.object_key(source)
        );
        http::send(&self.client, reqwest::Method::PUT, &url, &[], body.into_bytes()).await
    }
}

#[async_trait::async_trait]
impl BackendAdapter for ObjectStoreAdapter {
    async fn deliver(&self, batch: &[Record]) -> Result<DeliverOutcome, AdapterError> {
        let encoded = encode_ndjson(batch);
        let source = batch.first().map(|r| r.source.clone()).unwrap_or_else(|| "mixed".into());

        let flushed = {
            let mut acc = self.accumulator.lock().await;
            acc.buf.push_str(&encoded);
            acc.records_buffered += batch.len();

            let over_size = acc.buf.len() as u64 >= self.max_batch_bytes;
            let over_time = acc.opened_at.elapsed() >= self.max_batch_interval;
            if over_size || over_time {
                let body = std::mem::take(&mut acc.buf);
                let count = acc.records_buffered;
                acc.records_buffered = 0;
                acc.opened_at = Instant::now();
                Some((body, count))
            } else {
                None
            }
        };

        match flushed {
            Some((body, count)) => {
                self.upload(&source, body).await?;
                Ok(DeliverOutcome {
                    delivered_count: count,
                    failed_count: 0,
                })
            }
            None => Ok(DeliverOutcome {
                delivered_count: 0,
                failed_count: 0,
            }),
        }
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            detail: format!("object store bucket '{}' at {}", self.bucket, self.endpoint),
        }
    }

    async fn close(&self) {
        let flushed = {
            let mut acc = self.accumulator.lock().await;
            if acc.buf.is_empty() {
                None
            } else {
                Some((std::mem::take(&mut acc.buf), acc.records_buffered))
            }
        };
        if let Some((body, _count)) = flushed {
            let _ = self.upload("flush-on-close", body).await;
        }
    }
}
