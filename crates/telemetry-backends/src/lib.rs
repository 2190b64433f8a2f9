//! telemetry-backends: uniform delivery adapters for configured sinks (§4.6).
//!
//! Every adapter implements [`BackendAdapter`]; the routing engine holds them
//! as `Arc<dyn BackendAdapter>` and wraps each call in a
//! `telemetry_breaker::CircuitBreaker`. `async_trait` is used for the trait
//! object (the teacher never needed a dyn-safe async trait, so this is
//! enrichment from the rest of the pack rather than a teacher pattern).

use telemetry_proto::Record;

mod filesystem;
mod http;
mod managed;
mod object_store;
mod search;
mod webhook;

pub use filesystem::FilesystemAdapter;
pub use managed::ManagedAdapter;
pub use object_store::ObjectStoreAdapter;
pub use search::SearchAdapter;
pub use webhook::WebhookAdapter;

/// Outcome of one [`BackendAdapter::deliver`] call (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverOutcome {
    pub delivered_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub detail: String,
}

/// Classification an adapter attaches to a failed delivery, consumed by the
/// circuit breaker's retry policy (§4.7).
#[derive(Debug, Clone)]
pub enum AdapterError {
    /// Transient: network error, 5xx, timeout.
    Retryable(String),
    /// Permanent for this batch: 4xx, malformed config reference, etc.
    Fatal(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Retryable(_))
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Retryable(s) => write!(f, "retryable: {s}"),
            AdapterError::Fatal(s) => write!(f, "fatal: {s}"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// The uniform contract every backend kind implements (§4.6).
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync {
    async fn deliver(&self, batch: &[Record]) -> Result<DeliverOutcome, AdapterError>;
    async fn health(&self) -> HealthStatus;
    async fn close(&self);
}

/// Build a live adapter from its validated config (§4.8 "construction of new
/// adapter handles"). Errors here are construction-time only (bad URL, bad
/// path template), distinct from runtime [`AdapterError`].
pub fn build_adapter(
    name: &str,
    config: &telemetry_config::BackendConfig,
) -> Result<Box<dyn BackendAdapter>, String> {
    use telemetry_config::BackendConfig as BC;
    match config {
        BC::Managed { endpoint, max_in_flight } => Ok(Box::new(ManagedAdapter::new(
            endpoint.clone(),
            *max_in_flight,
        ))),
        BC::Filesystem {
            path_template,
            rotate_bytes,
            rotate_interval_secs,
        } => FilesystemAdapter::new(path_template.clone(), *rotate_bytes, *rotate_interval_secs)
            .map(|a| Box::new(a) as Box<dyn BackendAdapter>)
            .map_err(|e| format!("backend '{name}': {e}")),
        BC::ObjectStore {
            endpoint,
            bucket,
            key_prefix,
            max_batch_bytes,
            max_batch_interval_ms,
        } => Ok(Box::new(ObjectStoreAdapter::new(
            endpoint.clone(),
            bucket.clone(),
            key_prefix.clone(),
            *max_batch_bytes,
            *max_batch_interval_ms,
        ))),
        BC::Search { endpoint, index_prefix } => {
            Ok(Box::new(SearchAdapter::new(endpoint.clone(), index_prefix.clone())))
        }
        BC::Webhook { url, method, headers } => Ok(Box::new(WebhookAdapter::new(
            url.clone(),
            method.clone(),
            headers.clone(),
        ))),
    }
}

/// Encode a batch as newline-delimited JSON, the shape every HTTP-ish
/// adapter (object-store, search bulk body, filesystem lines) reuses.
pub(crate) fn encode_ndjson(batch: &[Record]) -> String {
    let mut out = String::new();
    for record in batch {
        out.push_str(&telemetry_proto::encode_line(record));
        out.push('\n');
    }
    out
}
