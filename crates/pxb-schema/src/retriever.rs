//! Retrieval of remote schema documents.
//!
//! `prepare` bundles external references through this seam so the engine
//! never hard-codes a transport: HTTP in production, a static map in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use pxb_schemas::{BrokerError, Result};

#[async_trait]
pub trait SchemaRetriever: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Value>;
}

/// Production retriever. The allowlist has already been enforced by the time
/// a URL reaches this point.
pub struct HttpRetriever {
    client: reqwest::Client,
}

impl HttpRetriever {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRetriever {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaRetriever for HttpRetriever {
    async fn fetch(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BrokerError::SchemaInvalid(format!("fetch {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(BrokerError::SchemaInvalid(format!(
                "fetch {url}: status {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| BrokerError::SchemaInvalid(format!("fetch {url}: bad JSON: {e}")))
    }
}

/// Serves documents from a fixed map. Used by tests and offline development.
#[derive(Default)]
pub struct StaticRetriever {
    docs: HashMap<String, Value>,
}

impl StaticRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, doc: Value) -> Self {
        self.docs.insert(url.to_string(), doc);
        self
    }
}

#[async_trait]
impl SchemaRetriever for StaticRetriever {
    async fn fetch(&self, url: &str) -> Result<Value> {
        self.docs
            .get(url)
            .cloned()
            .ok_or_else(|| BrokerError::SchemaInvalid(format!("unknown schema document: {url}")))
    }
}
