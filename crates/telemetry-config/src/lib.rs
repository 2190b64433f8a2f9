//! telemetry-config: TOML config loading and validation (§4.8).
//!
//! Follows the same two-layer shape as `forwarder::config` in the teacher
//! workspace: a `Raw*` tree with `Option` fields deserializes the TOML
//! verbatim, then [`SidecarConfig::from_raw`] validates and fills defaults,
//! producing a strict public tree. Unknown top-level keys are rejected by
//! `#[serde(deny_unknown_fields)]` on every raw struct.
//!
//! Hot-reload polling, debouncing, and file mtime tracking live in
//! `services/sidecar`, which is the only caller and also owns the routing
//! engine the reload has to notify.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use telemetry_proto::RecordKind;

// ---------------------------------------------------------------------------
// Public, validated config tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SidecarConfig {
    pub listener: ListenerConfig,
    pub correlation: CorrelationConfig,
    pub routing: RoutingConfig,
    pub backends: HashMap<String, BackendConfig>,
    pub reload: ReloadConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub per_source_queue_size: usize,
    pub global_queue_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationConfig {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub trace_ttl_ms: u64,
    pub source_idle_ms: u64,
    pub trace_idle_ms: u64,
}

/// `source or '*'` → ordered route rules.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoutingConfig {
    pub rules: HashMap<String, Vec<RouteRule>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteRule {
    pub backend: String,
    pub enabled: bool,
    pub priority: i32,
    pub kinds: Vec<RecordKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Managed {
        endpoint: String,
        max_in_flight: usize,
    },
    Filesystem {
        path_template: String,
        rotate_bytes: u64,
        rotate_interval_secs: u64,
    },
    ObjectStore {
        endpoint: String,
        bucket: String,
        key_prefix: String,
        max_batch_bytes: u64,
        max_batch_interval_ms: u64,
    },
    Search {
        endpoint: String,
        index_prefix: String,
    },
    Webhook {
        url: String,
        method: String,
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub atomic_temp_suffix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdminConfig {
    pub bind: String,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        SidecarConfig {
            listener: ListenerConfig {
                host: "127.0.0.1".into(),
                port: 17000,
                max_connections: 1024,
                per_source_queue_size: 1000,
                global_queue_size: 50_000,
            },
            correlation: CorrelationConfig {
                batch_size: 100,
                batch_interval_ms: 5_000,
                trace_ttl_ms: 60 * 60 * 1000,
                source_idle_ms: 10 * 60 * 1000,
                trace_idle_ms: 30_000,
            },
            routing: RoutingConfig::default(),
            backends: HashMap::new(),
            reload: ReloadConfig {
                enabled: true,
                check_interval_ms: 2_000,
                atomic_temp_suffix: ".tmp".into(),
            },
            admin: AdminConfig {
                bind: "127.0.0.1:17001".into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    listener: Option<RawListener>,
    correlation: Option<RawCorrelation>,
    #[serde(default)]
    routing: HashMap<String, Vec<RawRouteRule>>,
    #[serde(default)]
    backends: HashMap<String, RawBackend>,
    reload: Option<RawReload>,
    admin: Option<RawAdmin>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListener {
    host: Option<String>,
    port: Option<u16>,
    max_connections: Option<usize>,
    per_source_queue_size: Option<usize>,
    global_queue_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCorrelation {
    batch_size: Option<usize>,
    batch_interval_ms: Option<u64>,
    trace_ttl_ms: Option<u64>,
    source_idle_ms: Option<u64>,
    trace_idle_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRouteRule {
    backend: String,
    enabled: Option<bool>,
    priority: Option<i32>,
    filter: Option<RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilter {
    kinds: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
enum RawBackend {
    Managed {
        endpoint: String,
        max_in_flight: Option<usize>,
    },
    Filesystem {
        path_template: String,
        rotate_bytes: Option<u64>,
        rotate_interval_secs: Option<u64>,
    },
    ObjectStore {
        endpoint: String,
        bucket: String,
        key_prefix: Option<String>,
        max_batch_bytes: Option<u64>,
        max_batch_interval_ms: Option<u64>,
    },
    Search {
        endpoint: String,
        index_prefix: Option<String>,
    },
    Webhook {
        url: String,
        method: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReload {
    enabled: Option<bool>,
    check_interval_ms: Option<u64>,
    atomic_temp_suffix: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAdmin {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
    UnknownBackend { rule_source: String, backend: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {s}"),
            ConfigError::UnknownBackend { rule_source, backend } => write!(
                f,
                "routing rule for '{rule_source}' references undefined backend '{backend}'"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Public loading API
// ---------------------------------------------------------------------------

/// Load from a path. A missing or empty file falls back to [`SidecarConfig::default`] (§4.8).
pub fn load_config_from_path(path: &Path) -> Result<SidecarConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(s) if s.trim().is_empty() => Ok(SidecarConfig::default()),
        Ok(s) => load_config_from_str(&s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SidecarConfig::default()),
        Err(e) => Err(ConfigError::Io(format!(
            "reading config file '{}': {e}",
            path.display()
        ))),
    }
}

pub fn load_config_from_str(toml_str: &str) -> Result<SidecarConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    SidecarConfig::from_raw(raw)
}

impl SidecarConfig {
    fn from_raw(raw: RawConfig) -> Result<SidecarConfig, ConfigError> {
        let defaults = SidecarConfig::default();

        let listener = match raw.listener {
            Some(l) => ListenerConfig {
                host: l.host.unwrap_or(defaults.listener.host),
                port: l.port.unwrap_or(defaults.listener.port),
                max_connections: l.max_connections.unwrap_or(defaults.listener.max_connections),
                per_source_queue_size: l
                    .per_source_queue_size
                    .unwrap_or(defaults.listener.per_source_queue_size),
                global_queue_size: l
                    .global_queue_size
                    .unwrap_or(defaults.listener.global_queue_size),
            },
            None => defaults.listener,
        };

        let correlation = match raw.correlation {
            Some(c) => CorrelationConfig {
                batch_size: c.batch_size.unwrap_or(defaults.correlation.batch_size),
                batch_interval_ms: c
                    .batch_interval_ms
                    .unwrap_or(defaults.correlation.batch_interval_ms),
                trace_ttl_ms: c.trace_ttl_ms.unwrap_or(defaults.correlation.trace_ttl_ms),
                source_idle_ms: c
                    .source_idle_ms
                    .unwrap_or(defaults.correlation.source_idle_ms),
                trace_idle_ms: c
                    .trace_idle_ms
                    .unwrap_or(defaults.correlation.trace_idle_ms),
            },
            None => defaults.correlation,
        };

        let mut backends = HashMap::with_capacity(raw.backends.len());
        for (name, raw_backend) in raw.backends {
            backends.insert(name, BackendConfig::from_raw(raw_backend)?);
        }

        let mut rules: HashMap<String, Vec<RouteRule>> = HashMap::with_capacity(raw.routing.len());
        for (source, raw_rules) in raw.routing {
            let mut parsed = Vec::with_capacity(raw_rules.len());
            for rr in raw_rules {
                if !backends.contains_key(&rr.backend) {
                    return Err(ConfigError::UnknownBackend {
                        rule_source: source.clone(),
                        backend: rr.backend,
                    });
                }
                let kinds = match rr.filter {
                    Some(f) => f
                        .kinds
                        .iter()
                        .map(|k| parse_kind(k))
                        .collect::<Result<Vec<_>, _>>()?,
                    None => all_kinds(),
                };
                parsed.push(RouteRule {
                    backend: rr.backend,
                    enabled: rr.enabled.unwrap_or(true),
                    priority: rr.priority.unwrap_or(100),
                    kinds,
                });
            }
            rules.insert(source, parsed);
        }

        let reload = match raw.reload {
            Some(r) => ReloadConfig {
                enabled: r.enabled.unwrap_or(defaults.reload.enabled),
                check_interval_ms: r
                    .check_interval_ms
                    .unwrap_or(defaults.reload.check_interval_ms),
                atomic_temp_suffix: r
                    .atomic_temp_suffix
                    .unwrap_or(defaults.reload.atomic_temp_suffix),
            },
            None => defaults.reload,
        };

        let admin = match raw.admin {
            Some(a) => AdminConfig {
                bind: a.bind.unwrap_or(defaults.admin.bind),
            },
            None => defaults.admin,
        };

        Ok(SidecarConfig {
            listener,
            correlation,
            routing: RoutingConfig { rules },
            backends,
            reload,
            admin,
        })
    }
}

impl BackendConfig {
    fn from_raw(raw: RawBackend) -> Result<BackendConfig, ConfigError> {
        Ok(match raw {
            RawBackend::Managed { endpoint, max_in_flight } => BackendConfig::Managed {
                endpoint,
                max_in_flight: max_in_flight.unwrap_or(16),
            },
            RawBackend::Filesystem {
                path_template,
                rotate_bytes,
                rotate_interval_secs,
            } => BackendConfig::Filesystem {
                path_template,
                rotate_bytes: rotate_bytes.unwrap_or(100 * 1024 * 1024),
                rotate_interval_secs: rotate_interval_secs.unwrap_or(24 * 60 * 60),
            },
            RawBackend::ObjectStore {
                endpoint,
                bucket,
                key_prefix,
                max_batch_bytes,
                max_batch_interval_ms,
            } => BackendConfig::ObjectStore {
                endpoint,
                bucket,
                key_prefix: key_prefix.unwrap_or_default(),
                max_batch_bytes: max_batch_bytes.unwrap_or(8 * 1024 * 1024),
                max_batch_interval_ms: max_batch_interval_ms.unwrap_or(30_000),
            },
            RawBackend::Search { endpoint, index_prefix } => BackendConfig::Search {
                endpoint,
                index_prefix: index_prefix.unwrap_or_else(|| "telemetry".into()),
            },
            RawBackend::Webhook { url, method, headers } => BackendConfig::Webhook {
                url,
                method: method.unwrap_or_else(|| "POST".into()),
                headers,
            },
        })
    }
}

fn parse_kind(s: &str) -> Result<RecordKind, ConfigError> {
    Ok(match s {
        "event" => RecordKind::Event,
        "metric" => RecordKind::Metric,
        "progress" => RecordKind::Progress,
        "resource" => RecordKind::Resource,
        "span" => RecordKind::Span,
        "heartbeat" => RecordKind::Heartbeat,
        "goodbye" => RecordKind::Goodbye,
        "trace" => RecordKind::Trace,
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "unknown record kind in filter: '{other}'"
            )))
        }
    })
}

fn all_kinds() -> Vec<RecordKind> {
    vec![
        RecordKind::Event,
        RecordKind::Metric,
        RecordKind::Progress,
        RecordKind::Resource,
        RecordKind::Span,
        RecordKind::Heartbeat,
        RecordKind::Goodbye,
        RecordKind::Trace,
    ]
}

/// Resolve a config path from CLI args/env the way the binary wants it,
/// without requiring the path to exist (fallback to defaults happens in
/// [`load_config_from_path`]).
pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/telemetry-sidecar/sidecar.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_config_from_path(Path::new("/nonexistent/path/sidecar.toml")).unwrap();
        assert_eq!(cfg, SidecarConfig::default());
    }

    #[test]
    fn empty_file_falls_back_to_defaults() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg, SidecarConfig::default());
    }

    #[test]
    fn valid_config_parses_backends_and_routing() {
        let toml_str = r#"
            [listener]
            port = 18000

            [backends.fs]
            type = "filesystem"
            path_template = "/tmp/mon/{source}.jsonl"

            [routing]
            "*" = [{ backend = "fs", priority = 0, filter = { kinds = ["event", "metric"] } }]
        "#;
        let cfg = load_config_from_str(toml_str).unwrap();
        assert_eq!(cfg.listener.port, 18000);
        assert_eq!(cfg.backends.len(), 1);
        let rules = &cfg.routing.rules["*"];
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].backend, "fs");
        assert_eq!(rules[0].kinds, vec![RecordKind::Event, RecordKind::Metric]);
    }

    #[test]
    fn routing_referencing_unknown_backend_is_rejected() {
        let toml_str = r#"
            [routing]
            "*" = [{ backend = "missing" }]
        "#;
        let err = load_config_from_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend { .. }));
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let toml_str = "typo_section = true";
        assert!(load_config_from_str(toml_str).is_err());
    }
}
