//! Durable per-channel event log.
//!
//! Appends assign the next sequence from a per-channel counter inside one
//! transaction, which keeps assigned seqs strictly increasing without gaps.
//! Channels come into existence on first append.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Mutex;

use pxb_schemas::{BrokerError, EventRecord, Result};

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append and return the stored record with its assigned seq.
    async fn append(&self, channel: &str, payload: Value) -> Result<EventRecord>;

    /// Entries with `seq > since_seq`, ordered, at most `max`.
    async fn replay(&self, channel: &str, since_seq: i64, max: i64) -> Result<Vec<EventRecord>>;

    /// Record the highest seq a subscriber has processed. Never regresses.
    async fn ack(&self, channel: &str, subscriber: &str, seq: i64) -> Result<()>;

    /// 0 when the subscriber has never acknowledged on this channel.
    async fn last_ack(&self, channel: &str, subscriber: &str) -> Result<i64>;
}

fn storage_err(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::StorageUnavailable(e.to_string())
}

// ---------------------------------------------------------------------------
// Postgres log
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, channel: &str, payload: Value) -> Result<EventRecord> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // The counter row is updated under row-level lock, so concurrent
        // appends to one channel serialize and seqs never repeat or skip.
        let (seq,): (i64,) = sqlx::query_as(
            r#"
            insert into event_seq (channel, last)
            values ($1, 1)
            on conflict (channel) do update set last = event_seq.last + 1
            returning last
            "#,
        )
        .bind(channel)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;

        let (ts_utc,): (DateTime<Utc>,) = sqlx::query_as(
            r#"
            insert into events (channel, seq, payload)
            values ($1, $2, $3)
            returning ts_utc
            "#,
        )
        .bind(channel)
        .bind(seq)
        .bind(&payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        Ok(EventRecord {
            channel: channel.to_string(),
            seq,
            ts_utc,
            payload,
        })
    }

    async fn replay(&self, channel: &str, since_seq: i64, max: i64) -> Result<Vec<EventRecord>> {
        let rows: Vec<(i64, DateTime<Utc>, Value)> = sqlx::query_as(
            r#"
            select seq, ts_utc, payload
              from events
             where channel = $1 and seq > $2
             order by seq asc
             limit $3
            "#,
        )
        .bind(channel)
        .bind(since_seq)
        .bind(max.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|(seq, ts_utc, payload)| EventRecord {
                channel: channel.to_string(),
                seq,
                ts_utc,
                payload,
            })
            .collect())
    }

    async fn ack(&self, channel: &str, subscriber: &str, seq: i64) -> Result<()> {
        sqlx::query(
            r#"
            insert into event_acks (channel, subscriber, last_seq)
            values ($1, $2, $3)
            on conflict (channel, subscriber)
            do update set last_seq = greatest(event_acks.last_seq, excluded.last_seq)
            "#,
        )
        .bind(channel)
        .bind(subscriber)
        .bind(seq)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn last_ack(&self, channel: &str, subscriber: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "select last_seq from event_acks where channel = $1 and subscriber = $2",
        )
        .bind(channel)
        .bind(subscriber)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.map(|(s,)| s).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// In-memory log
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    streams: HashMap<String, Vec<EventRecord>>,
    acks: HashMap<(String, String), i64>,
}

#[derive(Clone, Default)]
pub struct MemEventLog {
    inner: std::sync::Arc<Mutex<MemInner>>,
}

impl MemEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for MemEventLog {
    async fn append(&self, channel: &str, payload: Value) -> Result<EventRecord> {
        let mut g = self.inner.lock().await;
        let stream = g.streams.entry(channel.to_string()).or_default();
        let record = EventRecord {
            channel: channel.to_string(),
            seq: stream.len() as i64 + 1,
            ts_utc: Utc::now(),
            payload,
        };
        stream.push(record.clone());
        Ok(record)
    }

    async fn replay(&self, channel: &str, since_seq: i64, max: i64) -> Result<Vec<EventRecord>> {
        let g = self.inner.lock().await;
        Ok(g.streams
            .get(channel)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|r| r.seq > since_seq)
                    .take(max.clamp(1, 1000) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, channel: &str, subscriber: &str, seq: i64) -> Result<()> {
        let mut g = self.inner.lock().await;
        let slot = g
            .acks
            .entry((channel.to_string(), subscriber.to_string()))
            .or_insert(0);
        *slot = (*slot).max(seq);
        Ok(())
    }

    async fn last_ack(&self, channel: &str, subscriber: &str) -> Result<i64> {
        let g = self.inner.lock().await;
        Ok(g.acks
            .get(&(channel.to_string(), subscriber.to_string()))
            .copied()
            .unwrap_or(0))
    }
}
