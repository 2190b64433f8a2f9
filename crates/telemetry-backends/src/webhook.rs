//! Webhook sink: POSTs the batch as a JSON array to a user-configured URL
//! with user-defined headers and method (§4.6).

use std::collections::HashMap;

use telemetry_proto::Record;

use crate::{http, AdapterError, BackendAdapter, DeliverOutcome, HealthStatus};

pub struct WebhookAdapter {
    url: String,
    method: reqwest::Method,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(url: String, method: String, headers: HashMap<String, String>) -> Self {
        let method = method.parse().unwrap_or(reqwest::Method::POST);
        WebhookAdapter {
            url,
            method,
            headers: headers.into_iter().collect(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for WebhookAdapter {
    async fn deliver(&self, batch: &[Record]) -> Result<DeliverOutcome, AdapterError> {
        let body = serde_json::to_vec(batch)
            .map_err(|e| AdapterError::Fatal(format!("batch serialization failed: {e}")))?;
        http::send(&self.client, self.method.clone(), &self.url, &self.headers, body).await?;

        Ok(DeliverOutcome {
            delivered_count: batch.len(),
            failed_count: 0,
        })
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            detail: format!("webhook {} {}", self.method, self.url),
        }
    }

    async fn close(&self) {}
}
