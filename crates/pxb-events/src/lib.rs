//! Event fabric: durable per-channel sequencing plus in-process fan-out.
//!
//! Publishing first appends to the durable log (seq assignment), then fans
//! the record out through the hub. Services treat publication as
//! fire-and-forget after their state write commits: a publish failure is
//! logged, never propagated, because the durable log plus client resume
//! covers redelivery.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use pxb_schemas::{EventRecord, Result};

mod hub;
mod log;

pub use hub::{EventFrame, Hub};
pub use log::{EventLog, MemEventLog, PgEventLog};

pub struct EventFabric {
    log: Arc<dyn EventLog>,
    hub: Hub,
}

impl EventFabric {
    pub fn new(log: Arc<dyn EventLog>, queue_depth: usize) -> Self {
        Self {
            log,
            hub: Hub::new(queue_depth),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Durably sequence `{kind, data}` on `channel`, then fan out.
    pub async fn publish(&self, channel: &str, kind: &str, data: Value) -> Result<i64> {
        let record = self
            .log
            .append(channel, json!({"kind": kind, "data": data}))
            .await?;
        self.hub.dispatch(&record).await;
        Ok(record.seq)
    }

    /// Publish after a committed state mutation. Failure is logged and
    /// swallowed — the mutation stands either way.
    pub async fn publish_logged(&self, channel: &str, kind: &str, data: Value) {
        if let Err(e) = self.publish(channel, kind, data).await {
            warn!(channel, kind, error = %e, "event publish failed");
        }
    }

    pub async fn replay(&self, channel: &str, since_seq: i64, max: i64) -> Result<Vec<EventRecord>> {
        self.log.replay(channel, since_seq, max).await
    }

    pub async fn ack(&self, channel: &str, subscriber: &str, seq: i64) -> Result<()> {
        self.log.ack(channel, subscriber, seq).await
    }

    pub async fn last_ack(&self, channel: &str, subscriber: &str) -> Result<i64> {
        self.log.last_ack(channel, subscriber).await
    }
}
