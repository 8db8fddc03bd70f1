//! Schema compiler.
//!
//! Classifies schema documents, enforces the reference-URL allowlist,
//! compiles to a cached validator, and validates response payloads.
//!
//! `prepare` and the allowlist check are pure functions of document content,
//! so a cache hit legitimately skips both.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use pxb_schemas::{BrokerError, Result, SchemaKind};

mod allowlist;
mod refs;
mod retriever;

pub use allowlist::RefAllowlist;
pub use refs::collect_ref_urls;
pub use retriever::{HttpRetriever, SchemaRetriever, StaticRetriever};

/// Compiled form of one schema document.
#[derive(Debug)]
pub struct PreparedSchema {
    pub kind: SchemaKind,
    /// None for `json-example`: examples are informational and never reject.
    validator: Option<jsonschema::Validator>,
}

impl PreparedSchema {
    /// Validate a payload, reporting the instance paths that failed.
    pub fn check(&self, value: &Value) -> Result<()> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let paths: Vec<String> = validator
            .iter_errors(value)
            .map(|e| {
                let p = e.instance_path.to_string();
                if p.is_empty() {
                    "/".to_string()
                } else {
                    p
                }
            })
            .collect();
        if paths.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::SchemaViolation { paths })
        }
    }
}

struct CacheEntry {
    prepared: Arc<PreparedSchema>,
    inserted: Instant,
}

/// Process-wide compiler with a bounded, time-expiring cache. Created at
/// startup and passed as a collaborator; nothing here is a singleton.
pub struct SchemaEngine {
    allowlist: RefAllowlist,
    retriever: Arc<dyn SchemaRetriever>,
    cache: Mutex<LruCache<[u8; 32], CacheEntry>>,
    ttl: Duration,
}

impl SchemaEngine {
    pub fn new(
        allowlist: RefAllowlist,
        retriever: Arc<dyn SchemaRetriever>,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            allowlist,
            retriever,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Classify a document when the caller did not say what it is.
    pub fn classify(doc: &Value) -> SchemaKind {
        if let Some(obj) = doc.as_object() {
            if let Some(Value::String(r)) = obj.get("$ref") {
                if is_remote_url(r) {
                    return SchemaKind::RemoteReference;
                }
            }
            let schema_markers = ["$schema", "type", "properties", "oneOf", "anyOf", "allOf"];
            if schema_markers.iter().any(|k| obj.contains_key(*k)) {
                return SchemaKind::InlineSchema;
            }
        }
        SchemaKind::JsonExample
    }

    /// Compile (or fetch from cache) the given document.
    ///
    /// Fails with `schema-invalid` when a discovered reference URL is not
    /// allowlisted, when a remote document cannot be retrieved, or when the
    /// document does not compile.
    pub async fn prepare(&self, kind: SchemaKind, doc: &Value) -> Result<Arc<PreparedSchema>> {
        let key = content_key(kind, doc);

        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.inserted.elapsed() < self.ttl {
                    return Ok(Arc::clone(&entry.prepared));
                }
                cache.pop(&key);
            }
        }

        let refs = collect_ref_urls(doc);
        for url in &refs {
            if !self.allowlist.permits(url) {
                return Err(BrokerError::SchemaInvalid(format!(
                    "ref-not-allowed: {url}"
                )));
            }
        }

        let prepared = match kind {
            SchemaKind::JsonExample => PreparedSchema {
                kind,
                validator: None,
            },
            SchemaKind::InlineSchema | SchemaKind::RemoteReference => {
                let bundled = if refs.is_empty() {
                    doc.clone()
                } else {
                    self.bundle(doc, refs).await?
                };
                let validator = jsonschema::validator_for(&bundled)
                    .map_err(|e| BrokerError::SchemaInvalid(e.to_string()))?;
                PreparedSchema {
                    kind,
                    validator: Some(validator),
                }
            }
        };

        let prepared = Arc::new(prepared);
        self.cache.lock().await.put(
            key,
            CacheEntry {
                prepared: Arc::clone(&prepared),
                inserted: Instant::now(),
            },
        );
        Ok(prepared)
    }

    /// Validate `value` against `doc`. `json-example` documents always pass.
    pub async fn validate(&self, kind: SchemaKind, doc: &Value, value: &Value) -> Result<()> {
        if kind == SchemaKind::JsonExample {
            return Ok(());
        }
        self.prepare(kind, doc).await?.check(value)
    }

    /// Inline every externally referenced document under `$defs`, stamped
    /// with its URL as `$id` so the original `$ref`s resolve against the
    /// embedded resources.
    async fn bundle(&self, doc: &Value, initial: Vec<String>) -> Result<Value> {
        const MAX_DOCS: usize = 32;

        let mut queue = initial;
        let mut fetched: Map<String, Value> = Map::new();
        let mut seen: Vec<String> = Vec::new();

        while let Some(url) = queue.pop() {
            if seen.contains(&url) {
                continue;
            }
            seen.push(url.clone());
            if seen.len() > MAX_DOCS {
                return Err(BrokerError::SchemaInvalid(
                    "too many referenced documents".to_string(),
                ));
            }
            if !self.allowlist.permits(&url) {
                return Err(BrokerError::SchemaInvalid(format!(
                    "ref-not-allowed: {url}"
                )));
            }

            let mut remote = self.retriever.fetch(&url).await?;
            let Some(obj) = remote.as_object_mut() else {
                return Err(BrokerError::SchemaInvalid(format!(
                    "referenced document is not an object: {url}"
                )));
            };
            obj.insert("$id".to_string(), Value::String(url.clone()));
            queue.extend(collect_ref_urls(&remote));
            fetched.insert(def_key(&url), remote);
        }

        let mut bundled = doc.clone();
        if !bundled.is_object() {
            return Err(BrokerError::SchemaInvalid(
                "schema document must be an object".to_string(),
            ));
        }
        let defs = bundled
            .as_object_mut()
            .expect("checked object above")
            .entry("$defs")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(defs) = defs.as_object_mut() {
            for (k, v) in fetched {
                defs.entry(k).or_insert(v);
            }
        }
        Ok(bundled)
    }
}

fn is_remote_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn content_key(kind: SchemaKind, doc: &Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    // serde_json maps are sorted, so serialization is canonical
    hasher.update(serde_json::to_vec(doc).unwrap_or_default());
    hasher.finalize().into()
}

fn def_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("ref_{}", &digest[..12])
}
