//! Filesystem sink: appends each record as one JSON line to a file resolved
//! from a path template containing `{source}`, `{date}`, `{hour}` (§4.6).
//! Append-only; `fsync` only happens at a rotation boundary, so a crash
//! mid-write never corrupts previously written lines.

use std::collections::HashMap;
use std::sync::Arc;

use telemetry_proto::Record;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::{AdapterError, BackendAdapter, DeliverOutcome, HealthStatus};

struct OpenFile {
    file: File,
    bytes_written: u64,
    opened_at: Instant,
    rotation_suffix: u32,
}

pub struct FilesystemAdapter {
    path_template: String,
    rotate_bytes: u64,
    rotate_interval: Duration,
    open_files: Arc<Mutex<HashMap<String, OpenFile>>>,
}

impl FilesystemAdapter {
    pub fn new(path_template: String, rotate_bytes: u64, rotate_interval_secs: u64) -> Result<Self, String> {
        if path_template.is_empty() {
            return Err("path_template must not be empty".into());
        }
        Ok(FilesystemAdapter {
            path_template,
            rotate_bytes: rotate_bytes.max(1),
            rotate_interval: Duration::from_secs(rotate_interval_secs.max(1)),
            open_files: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn resolve_base_path(&self, source: &str) -> String {
        let now = chrono::Utc::now();
        self.path_template
            .replace("{source}", source)
            .replace("{date}", &now.format("%Y-%m-%d").to_string())
            .replace("{hour}", &now.format("%Y-%m-%d-%H").to_string())
    }

    async fn append(&self, base_path: &str, lines: &str) -> Result<(), AdapterError> {
        let mut open_files = self.open_files.lock().await;
        let now = Instant::now();

        let needs_rotation = open_files
            .get(base_path)
            .map(|f| f.bytes_written >= self.rotate_bytes || now.duration_since(f.opened_at) >= self.rotate_interval)
            .unwrap_or(false);

        let mut next_suffix = 0;
        if needs_rotation {
            if let Some(mut existing) = open_files.remove(base_path) {
                let _ = existing.file.sync_all().await;
                next_suffix = existing.rotation_suffix + 1;
            }
        }

        if !open_files.contains_key(base_path) {
            let suffix = next_suffix;
            let path = if suffix == 0 {
                base_path.to_owned()
            } else {
                format!("{base_path}.{suffix}")
            };
            if let Some(parent) = std::path::Path::new(&path).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AdapterError::Retryable(format!("mkdir -p failed: {e}")))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| AdapterError::Retryable(format!("open failed for '{path}': {e}")))?;
            open_files.insert(
                base_path.to_owned(),
                OpenFile {
                    file,
                    bytes_written: 0,
                    opened_at: now,
                    rotation_suffix: suffix,
                },
            );
        }

        let entry = open_files.get_mut(base_path).expect("just inserted");
        entry
            .file
            .write_all(lines.as_bytes())
            .await
            .map_err(|e| AdapterError::Retryable(format!("write failed: {e}")))?;
        entry.bytes_written += lines.len() as u64;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BackendAdapter for FilesystemAdapter {
    async fn deliver(&self, batch: &[Record]) -> Result<DeliverOutcome, AdapterError> {
        let mut by_source: HashMap<String, Vec<&Record>> = HashMap::new();
        for record in batch {
            by_source.entry(record.source.clone()).or_default().push(record);
        }

        let mut delivered = 0;
        for (source, records) in by_source {
            let base_path = self.resolve_base_path(&source);
            let mut lines = String::new();
            for record in &records {
                lines.push_str(&telemetry_proto::encode_line(record));
                lines.push('\n');
            }
            self.append(&base_path, &lines).await?;
            delivered += records.len();
        }

        Ok(DeliverOutcome {
            delivered_count: delivered,
            failed_count: 0,
        })
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            detail: format!("filesystem sink at template '{}'", self.path_template),
        }
    }

    async fn close(&self) {
        let mut open_files = self.open_files.lock().await;
        for (_, mut f) in open_files.drain() {
            let _ = f.file.sync_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use telemetry_proto::{Payload, SCHEMA_VERSION};

    fn record(source: &str) -> Record {
        Record {
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            timestamp_ms: 1,
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            payload: Payload::Event {
                level: telemetry_proto::Level::Info,
                message: "x".into(),
                context: Map::new(),
            },
        }
    }

    #[tokio::test]
    async fn writes_one_line_per_record_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("{source}.jsonl").to_string_lossy().to_string();
        let adapter = FilesystemAdapter::new(template, 1024 * 1024, 86400).unwrap();

        let batch = vec![record("A"), record("A"), record("B")];
        let outcome = adapter.deliver(&batch).await.unwrap();
        assert_eq!(outcome.delivered_count, 3);
        adapter.close().await;

        let a_contents = std::fs::read_to_string(dir.path().join("A.jsonl")).unwrap();
        assert_eq!(a_contents.lines().count(), 2);
        let b_contents = std::fs::read_to_string(dir.path().join("B.jsonl")).unwrap();
        assert_eq!(b_contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn size_rotation_creates_suffixed_file() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("{source}.jsonl").to_string_lossy().to_string();
        let adapter = FilesystemAdapter::new(template, 10, 86400).unwrap();

        adapter.deliver(&[record("A")]).await.unwrap();
        adapter.deliver(&[record("A")]).await.unwrap();
        adapter.close().await;

        assert!(dir.path().join("A.jsonl").exists());
        assert!(dir.path().join("A.jsonl.1").exists());
    }
}
