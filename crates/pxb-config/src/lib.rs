//! Broker configuration.
//!
//! Configuration comes from up to three layers, later layers overriding
//! earlier ones: built-in defaults, YAML file(s), environment variables.
//! The merged document is fingerprinted so the daemon can log exactly which
//! configuration it booted with.

use anyhow::{bail, Context, Result};
use serde_json::map::Entry;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;

pub const ENV_DB_URL: &str = "PXB_DATABASE_URL";
pub const ENV_EVENTS_URL: &str = "PXB_EVENTS_URL";
pub const ENV_BIND_ADDR: &str = "PXB_BIND_ADDR";
pub const ENV_TOKEN_SECRET: &str = "PXB_TOKEN_SECRET";
pub const ENV_REF_ALLOWLIST: &str = "PXB_REF_ALLOWLIST";
pub const ENV_FILES_DIR: &str = "PXB_FILES_DIR";
pub const ENV_FILES_BASE_URL: &str = "PXB_FILES_BASE_URL";
pub const ENV_DEV_HEADER_AUTH: &str = "PXB_DEV_ALLOW_HEADER_AUTH";

/// Typed broker configuration with every knob the runtime consumes.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Postgres URL for the relational store. `None` selects the in-memory
    /// store (development only).
    pub storage_url: Option<String>,
    /// Postgres URL for the event log; defaults to `storage_url`.
    pub event_log_url: Option<String>,
    pub bind_addr: String,
    /// HS256 signing secret for bearer tokens.
    pub token_secret: String,
    /// Comma-separated reference-URL allowlist patterns. Empty = allow all
    /// (development only).
    pub ref_allowlist: Vec<String>,
    /// Root directory where the local file backend places uploads.
    pub files_dir: String,
    pub files_base_url: String,
    /// How far before `deadline_at` the approaching-deadline warning fires.
    pub deadline_warning_secs: i64,
    pub schema_cache_capacity: usize,
    pub schema_cache_ttl_secs: u64,
    /// Per-subscriber fan-out queue depth; a full queue evicts the session.
    pub hub_queue_depth: usize,
    /// Accept the well-known entity header in place of a bearer token.
    /// Must stay off in production.
    pub dev_header_auth: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            storage_url: None,
            event_log_url: None,
            bind_addr: "127.0.0.1:8790".to_string(),
            token_secret: "dev-secret-change-me".to_string(),
            ref_allowlist: Vec::new(),
            files_dir: "./pxbox-files".to_string(),
            files_base_url: "http://127.0.0.1:8790/files".to_string(),
            deadline_warning_secs: 3600,
            schema_cache_capacity: 64,
            schema_cache_ttl_secs: 3600,
            hub_queue_depth: 256,
            dev_header_auth: false,
        }
    }
}

impl BrokerConfig {
    /// Defaults, overlaid with YAML files (in order), overlaid with env vars.
    pub fn load(yaml_paths: &[&str]) -> Result<LoadedConfig> {
        let mut merged = defaults_document();
        for p in yaml_paths {
            let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
            let yaml_val: serde_yaml::Value =
                serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
            let json_val =
                serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
            let Value::Object(layer) = json_val else {
                bail!("config file must be a YAML mapping: {p}");
            };
            merge_layer(&mut merged, layer);
        }
        let merged = Value::Object(merged);

        let mut cfg = BrokerConfig::from_document(&merged)?;
        cfg.apply_env();

        Ok(LoadedConfig {
            config: cfg,
            config_hash: config_fingerprint(&merged),
        })
    }

    fn from_document(doc: &Value) -> Result<Self> {
        let d = BrokerConfig::default();
        let get_str = |ptr: &str| doc.pointer(ptr).and_then(Value::as_str).map(String::from);
        let get_i64 = |ptr: &str| doc.pointer(ptr).and_then(Value::as_i64);
        let get_bool = |ptr: &str| doc.pointer(ptr).and_then(Value::as_bool);

        Ok(BrokerConfig {
            storage_url: get_str("/storage/url"),
            event_log_url: get_str("/events/url"),
            bind_addr: get_str("/server/bind").unwrap_or(d.bind_addr),
            token_secret: get_str("/auth/token_secret").unwrap_or(d.token_secret),
            ref_allowlist: doc
                .pointer("/schema/ref_allowlist")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            files_dir: get_str("/files/dir").unwrap_or(d.files_dir),
            files_base_url: get_str("/files/base_url").unwrap_or(d.files_base_url),
            deadline_warning_secs: get_i64("/scheduler/deadline_warning_secs")
                .unwrap_or(d.deadline_warning_secs),
            schema_cache_capacity: get_i64("/schema/cache_capacity")
                .map(|n| n.max(1) as usize)
                .unwrap_or(d.schema_cache_capacity),
            schema_cache_ttl_secs: get_i64("/schema/cache_ttl_secs")
                .map(|n| n.max(1) as u64)
                .unwrap_or(d.schema_cache_ttl_secs),
            hub_queue_depth: get_i64("/events/queue_depth")
                .map(|n| n.max(1) as usize)
                .unwrap_or(d.hub_queue_depth),
            dev_header_auth: get_bool("/auth/dev_header_auth").unwrap_or(d.dev_header_auth),
        })
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(ENV_DB_URL) {
            self.storage_url = Some(v);
        }
        if let Ok(v) = std::env::var(ENV_EVENTS_URL) {
            self.event_log_url = Some(v);
        }
        if let Ok(v) = std::env::var(ENV_BIND_ADDR) {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var(ENV_TOKEN_SECRET) {
            self.token_secret = v;
        }
        if let Ok(v) = std::env::var(ENV_REF_ALLOWLIST) {
            self.ref_allowlist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var(ENV_FILES_DIR) {
            self.files_dir = v;
        }
        if let Ok(v) = std::env::var(ENV_FILES_BASE_URL) {
            self.files_base_url = v;
        }
        if let Ok(v) = std::env::var(ENV_DEV_HEADER_AUTH) {
            self.dev_header_auth = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Event-log URL, falling back to the storage URL.
    pub fn effective_event_log_url(&self) -> Option<&str> {
        self.event_log_url
            .as_deref()
            .or(self.storage_url.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: BrokerConfig,
    pub config_hash: String,
}

fn defaults_document() -> Map<String, Value> {
    match serde_json::json!({
        "server": {"bind": "127.0.0.1:8790"},
        "scheduler": {"deadline_warning_secs": 3600},
        "schema": {"cache_capacity": 64, "cache_ttl_secs": 3600},
        "events": {"queue_depth": 256},
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Fold one configuration layer into the accumulated document. Nested
/// mappings merge key by key; arrays and scalars from the later layer win.
fn merge_layer(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, incoming) in overlay {
        match base.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(incoming);
            }
            Entry::Occupied(mut slot) => match (slot.get_mut(), incoming) {
                (Value::Object(nested), Value::Object(incoming_nested)) => {
                    merge_layer(nested, incoming_nested);
                }
                (settled, incoming) => *settled = incoming,
            },
        }
    }
}

/// Key-order-independent fingerprint of a configuration document.
///
/// The document is walked with object keys visited in sorted order and every
/// node framed by a type tag, feeding a single SHA-256 — no intermediate
/// canonical string is materialised. Two documents that differ only in key
/// order produce the same fingerprint.
pub fn config_fingerprint(doc: &Value) -> String {
    let mut hasher = Sha256::new();
    digest_value(doc, &mut hasher);
    hex::encode(hasher.finalize())
}

fn digest_value(v: &Value, hasher: &mut Sha256) {
    match v {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update([b'b', *b as u8]),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                digest_value(item, hasher);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            hasher.update(b"{");
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update((key.len() as u64).to_be_bytes());
                hasher.update(key.as_bytes());
                digest_value(&map[key.as_str()], hasher);
            }
            hasher.update(b"}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_files() {
        let loaded = BrokerConfig::load(&[]).unwrap();
        assert_eq!(loaded.config.deadline_warning_secs, 3600);
        assert_eq!(loaded.config.schema_cache_capacity, 64);
        assert_eq!(loaded.config.hub_queue_depth, 256);
        assert!(!loaded.config.dev_header_auth);
    }

    #[test]
    fn yaml_layer_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "events:\n  queue_depth: 16\nschema:\n  ref_allowlist:\n    - \"https://forms.example.com/*\""
        )
        .unwrap();
        let path = f.path().to_str().unwrap().to_string();

        let loaded = BrokerConfig::load(&[&path]).unwrap();
        assert_eq!(loaded.config.hub_queue_depth, 16);
        assert_eq!(
            loaded.config.ref_allowlist,
            vec!["https://forms.example.com/*".to_string()]
        );
        // untouched sections keep defaults
        assert_eq!(loaded.config.schema_cache_capacity, 64);
    }

    #[test]
    fn non_mapping_layer_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "- just\n- a\n- list").unwrap();
        let path = f.path().to_str().unwrap().to_string();
        assert!(BrokerConfig::load(&[&path]).is_err());
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(config_fingerprint(&a), config_fingerprint(&b));
    }

    #[test]
    fn fingerprint_separates_values_from_structure() {
        // "ab" + "c" must not collide with "a" + "bc"
        let a = serde_json::json!({"k": ["ab", "c"]});
        let b = serde_json::json!({"k": ["a", "bc"]});
        assert_ne!(config_fingerprint(&a), config_fingerprint(&b));

        let c = serde_json::json!({"k": 1});
        let d = serde_json::json!({"k": "1"});
        assert_ne!(config_fingerprint(&c), config_fingerprint(&d));
    }

    #[test]
    fn later_layers_replace_arrays_and_merge_maps() {
        let mut base = defaults_document();
        let Value::Object(layer) = serde_json::json!({
            "schema": {"ref_allowlist": ["https://a.example.com/*"]},
        }) else {
            unreachable!()
        };
        merge_layer(&mut base, layer);
        let Value::Object(layer) = serde_json::json!({
            "schema": {"ref_allowlist": ["https://b.example.com/*"], "cache_capacity": 8},
        }) else {
            unreachable!()
        };
        merge_layer(&mut base, layer);

        let doc = Value::Object(base);
        // arrays replaced wholesale
        assert_eq!(
            doc.pointer("/schema/ref_allowlist").unwrap(),
            &serde_json::json!(["https://b.example.com/*"])
        );
        // sibling keys from both layers survive
        assert_eq!(
            doc.pointer("/schema/cache_capacity").unwrap(),
            &serde_json::json!(8)
        );
        assert_eq!(
            doc.pointer("/schema/cache_ttl_secs").unwrap(),
            &serde_json::json!(3600)
        );
    }
}
