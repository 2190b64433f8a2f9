//! Search-index sink: bulk-indexes records against a rolling index name
//! derived from the current date, Elasticsearch/OpenSearch `_bulk` style
//! (§4.6, SPEC_FULL Open Question resolution #3).

use telemetry_proto::Record;

use crate::{http, AdapterError, BackendAdapter, DeliverOutcome, HealthStatus};

pub struct SearchAdapter {
    endpoint: String,
    index_prefix: String,
    client: reqwest::Client,
}

impl SearchAdapter {
    pub fn new(endpoint: String, index_prefix: String) -> Self {
        SearchAdapter {
            endpoint,
            index_prefix,
            client: reqwest::Client::new(),
        }
    }

    fn rolling_index(&self) -> String {
        format!("{}-{}", self.index_prefix, chrono::Utc::now().format("%Y.%m.%d"))
    }

    fn bulk_body(&self, batch: &[Record]) -> String {
        let index = self.rolling_index();
        let mut body = String::new();
        for record in batch {
            body.push_str(&format!(r#"{{"index":{{"_index":"{index}"}}}}"#));
            body.push('\n');
            body.push_str(&serde_json::to_string(record).unwrap_or_default());
            body.push('\n');
        }
        body
    }
}

#[async_trait::async_trait]
impl BackendAdapter for SearchAdapter {
    async fn deliver(&self, batch: &[Record]) -> Result<DeliverOutcome, AdapterError> {
        if batch.is_empty() {
            return Ok(DeliverOutcome {
                delivered_count: 0,
                failed_count: 0,
            });
        }
        let url = format!("{}/_bulk", self.endpoint.trim_end_matches('/'));
        let body = self.bulk_body(batch).into_bytes();
        let headers = [("Content-Type".to_owned(), "application/x-ndjson".to_owned())];
        http::send(&self.client, reqwest::Method::POST, &url, &headers, body).await?;

        Ok(DeliverOutcome {
            delivered_count: batch.len(),
            failed_count: 0,
        })
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            detail: format!("search index prefix '{}' at {}", self.index_prefix, self.endpoint),
        }
    }

    async fn close(&self) {}
}
