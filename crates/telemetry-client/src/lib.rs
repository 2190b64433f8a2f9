//! telemetry-client: the emitting-application side of the wire protocol
//! (§4.2).
//!
//! Grounded on the teacher's uplink/fanout pair: `uplink.rs`'s
//! connect-handshake-send shape becomes the background reconnect loop here,
//! and `local_fanout.rs`'s "never block the caller, let a background task
//! own the socket" split becomes the mutex-protected bounded queue plus one
//! writer task. Unlike the teacher's WebSocket uplink, this speaks the
//! plain newline-delimited JSON protocol from `telemetry_proto`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use telemetry_proto::{Level, Payload, Record, SCHEMA_VERSION};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub queue_capacity: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub close_drain_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            queue_capacity: 1000,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            close_drain_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub sent: u64,
    pub dropped: u64,
    pub buffered: usize,
    pub state: ConnectionState,
}

struct Shared {
    source: String,
    queue_capacity: usize,
    queue: StdMutex<VecDeque<Record>>,
    notify: Notify,
    sent: AtomicU64,
    dropped: AtomicU64,
    connected: AtomicBool,
    overflow: AtomicBool,
    drain_deadline_passed: AtomicBool,
    trace_id: StdMutex<Option<String>>,
    context: StdMutex<HashMap<String, serde_json::Value>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Relaxed) {
            ConnectionState::Connected
        } else if self.overflow.load(Ordering::Relaxed) {
            ConnectionState::Overflow
        } else {
            ConnectionState::Disconnected
        }
    }

    fn enqueue(&self, record: Record) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.queue_capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.connected.load(Ordering::Relaxed) {
                self.overflow.store(true, Ordering::Relaxed);
            }
        }
        queue.push_back(record);
        drop(queue);
        self.notify.notify_one();
    }

    fn maybe_clear_overflow(&self) {
        if self.overflow.load(Ordering::Relaxed) {
            let len = self.queue.lock().unwrap().len();
            if self.connected.load(Ordering::Relaxed) && len < self.queue_capacity / 2 {
                self.overflow.store(false, Ordering::Relaxed);
            }
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Handle to a running client instance. Cheap to clone (all state lives in
/// the shared `Arc`); `close` consumes the owning handle.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    close_drain_timeout: Duration,
}

impl Client {
    /// Spawn the background connector and return immediately — never blocks
    /// on network I/O (§4.2).
    pub fn init(source: impl Into<String>, host: impl Into<String>, port: u16, options: ClientOptions) -> Client {
        let shared = Arc::new(Shared {
            source: source.into(),
            queue_capacity: options.queue_capacity.max(1),
            queue: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            overflow: AtomicBool::new(false),
            drain_deadline_passed: AtomicBool::new(false),
            trace_id: StdMutex::new(None),
            context: StdMutex::new(HashMap::new()),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let background_shared = shared.clone();
        let host = host.into();
        let close_drain_timeout = options.close_drain_timeout;
        tokio::spawn(async move {
            run_connector(background_shared, host, port, options, shutdown_rx).await;
        });

        Client {
            shared,
            shutdown: shutdown_tx,
            close_drain_timeout,
        }
    }

    pub fn log_event(&self, level: Level, message: impl Into<String>, context: HashMap<String, serde_json::Value>) {
        let merged = self.merge_context(context);
        self.push(Payload::Event {
            level,
            message: message.into(),
            context: merged,
        });
    }

    pub fn log_metric(&self, name: impl Into<String>, value: f64, unit: impl Into<String>, tags: HashMap<String, serde_json::Value>) {
        self.push(Payload::Metric {
            name: name.into(),
            value,
            unit: unit.into(),
            tags,
        });
    }

    pub fn log_progress(&self, job_id: impl Into<String>, percent: u8, status: impl Into<String>) {
        self.push(Payload::Progress {
            job_id: job_id.into(),
            percent: percent.min(100),
            status: status.into(),
        });
    }

    pub fn log_resource(&self, cpu: f64, memory: f64, disk_io: f64, net_io: f64, pid: u64) {
        self.push(Payload::Resource {
            cpu,
            memory,
            disk_io,
            net_io,
            pid,
        });
    }

    /// Enqueue the start half of a span and return its generated span id.
    pub fn start_span(&self, name: impl Into<String>) -> String {
        let span_id = uuid::Uuid::new_v4().to_string();
        self.push_span(Some(span_id.clone()), name.into(), now_ms(), 0, "running".into());
        span_id
    }

    /// Enqueue the end half of a previously started span.
    pub fn end_span(&self, span_id: impl Into<String>, name: impl Into<String>, status: impl Into<String>) {
        self.push_span(Some(span_id.into()), name.into(), 0, now_ms(), status.into());
    }

    fn push_span(&self, span_id: Option<String>, name: String, start_ms: i64, end_ms: i64, status: String) {
        let trace_id = self.shared.trace_id.lock().unwrap().clone();
        let record = Record {
            schema_version: SCHEMA_VERSION,
            source: self.shared.source.clone(),
            timestamp_ms: now_ms(),
            trace_id,
            span_id,
            parent_span_id: None,
            payload: Payload::Span {
                name,
                start_ms,
                end_ms,
                status,
                tags: HashMap::new(),
            },
        };
        self.shared.enqueue(record);
    }

    pub fn set_trace_id(&self, trace_id: impl Into<String>) {
        *self.shared.trace_id.lock().unwrap() = Some(trace_id.into());
    }

    pub fn set_context(&self, key: impl Into<String>, value: serde_json::Value) {
        self.shared.context.lock().unwrap().insert(key.into(), value);
    }

    pub fn get_stats(&self) -> Stats {
        Stats {
            sent: self.shared.sent.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            buffered: self.shared.queue.lock().unwrap().len(),
            state: self.shared.state(),
        }
    }

    /// Flush pending, emit a `goodbye`, close the socket and release all
    /// resources. Waits up to `close_drain_timeout` for the queue to empty;
    /// whatever is still queued once that deadline passes is dropped and
    /// counted rather than sent later (§4.2).
    pub async fn close(self) {
        self.push(Payload::Goodbye);
        let _ = self.shutdown.send(true);
        let deadline = tokio::time::Instant::now() + self.close_drain_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.shared.queue.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.shared.drain_deadline_passed.store(true, Ordering::Relaxed);
        let remaining = {
            let mut queue = self.shared.queue.lock().unwrap();
            let n = queue.len();
            queue.clear();
            n
        };
        if remaining > 0 {
            self.shared.dropped.fetch_add(remaining as u64, Ordering::Relaxed);
        }
    }

    fn merge_context(&self, explicit: HashMap<String, serde_json::Value>) -> HashMap<String, serde_json::Value> {
        let mut merged = self.shared.context.lock().unwrap().clone();
        merged.extend(explicit);
        merged
    }

    fn push(&self, payload: Payload) {
        let trace_id = self.shared.trace_id.lock().unwrap().clone();
        let record = Record {
            schema_version: SCHEMA_VERSION,
            source: self.shared.source.clone(),
            timestamp_ms: now_ms(),
            trace_id,
            span_id: None,
            parent_span_id: None,
            payload,
        };
        self.shared.enqueue(record);
    }
}

async fn run_connector(
    shared: Arc<Shared>,
    host: String,
    port: u16,
    options: ClientOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = options.reconnect_initial;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                shared.connected.store(true, Ordering::Relaxed);
                backoff = options.reconnect_initial;
                let keep_running = drive_connection(&shared, stream, &mut shutdown).await;
                shared.connected.store(false, Ordering::Relaxed);
                if !keep_running {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "connect failed, backing off");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
        backoff = (backoff * 2).min(options.reconnect_max);
    }
}

/// Drain the queue over `stream` until the connection fails or shutdown is
/// requested. Returns `false` when the caller should stop reconnecting.
async fn drive_connection(
    shared: &Arc<Shared>,
    mut stream: TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if shared.drain_deadline_passed.load(Ordering::Relaxed) {
            return false;
        }
        let next = shared.queue.lock().unwrap().pop_front();
        match next {
            Some(record) => {
                let mut line = telemetry_proto::encode_line(&record);
                line.push('\n');
                if stream.write_all(line.as_bytes()).await.is_err() {
                    shared.queue.lock().unwrap().push_front(record);
                    warn!("write failed, will reconnect");
                    return true;
                }
                shared.sent.fetch_add(1, Ordering::Relaxed);
                shared.maybe_clear_overflow();
            }
            None => {
                tokio::select! {
                    () = shared.notify.notified() => {}
                    () = tokio::time::sleep(Duration::from_millis(500)) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return false;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    async fn stub_listener() -> (u16, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let _ = tx.send(line.trim_end().to_owned());
                    }
                }
            }
        });
        (port, rx)
    }

    #[tokio::test]
    async fn enqueued_event_is_sent_once_connected() {
        let (port, mut rx) = stub_listener().await;
        let client = Client::init("svc-a", "127.0.0.1", port, ClientOptions::default());
        client.log_event(Level::Info, "hello", HashMap::new());

        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let record = telemetry_proto::decode_line(line.as_bytes()).unwrap();
        assert_eq!(record.source, "svc-a");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_record_while_disconnected() {
        let mut options = ClientOptions::default();
        options.queue_capacity = 2;
        let client = Client::init("svc-b", "127.0.0.1", 1, options);
        // Nothing listening on port 1: stays disconnected, queue fills up.
        client.log_event(Level::Info, "one", HashMap::new());
        client.log_event(Level::Info, "two", HashMap::new());
        client.log_event(Level::Info, "three", HashMap::new());

        let stats = client.get_stats();
        assert_eq!(stats.buffered, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.state, ConnectionState::Overflow);
    }

    #[tokio::test]
    async fn close_drops_remainder_once_drain_timeout_elapses() {
        let mut options = ClientOptions::default();
        options.close_drain_timeout = Duration::from_millis(50);
        // Nothing listening on port 1: the queue never drains.
        let client = Client::init("svc-e", "127.0.0.1", 1, options);
        let handle = client.clone();
        client.log_event(Level::Info, "one", HashMap::new());
        client.log_event(Level::Info, "two", HashMap::new());
        client.close().await;

        let stats = handle.get_stats();
        assert_eq!(stats.buffered, 0);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test]
    async fn close_emits_goodbye_and_drains_queue() {
        let (port, mut rx) = stub_listener().await;
        let client = Client::init("svc-c", "127.0.0.1", port, ClientOptions::default());
        client.log_event(Level::Info, "hi", HashMap::new());
        client.close().await;

        let mut saw_goodbye = false;
        for _ in 0..2 {
            if let Ok(Some(line)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                if line.contains("\"goodbye\"") {
                    saw_goodbye = true;
                }
            }
        }
        assert!(saw_goodbye);
    }
}
