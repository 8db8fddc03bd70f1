//! Postgres store.
//!
//! Runtime-bound SQL throughout; every state-machine mutation is a single
//! conditional UPDATE whose row count tells the caller whether it won.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pxb_schemas::{
    BrokerError, Entity, EntityKind, Flow, FlowStatus, ListFilter, Reminder, Request,
    RequestStatus, ResponseRecord, Result, SchemaKind, SortBy,
};

use crate::{storage_err, Store};

/// Connect with a small pool; callers should run [`migrate`] before serving.
pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .map_err(storage_err)
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(storage_err)?;
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_entity(row: &sqlx::postgres::PgRow) -> Result<Entity> {
    Ok(Entity {
        entity_id: row.try_get("entity_id").map_err(storage_err)?,
        kind: EntityKind::parse(&row.try_get::<String, _>("kind").map_err(storage_err)?)?,
        handle: row.try_get("handle").map_err(storage_err)?,
        metadata: row.try_get("metadata").map_err(storage_err)?,
        created_at_utc: row.try_get("created_at_utc").map_err(storage_err)?,
        updated_at_utc: row.try_get("updated_at_utc").map_err(storage_err)?,
    })
}

fn row_to_request(row: &sqlx::postgres::PgRow) -> Result<Request> {
    let file_policy: Option<Value> = row.try_get("file_policy").map_err(storage_err)?;
    Ok(Request {
        request_id: row.try_get("request_id").map_err(storage_err)?,
        created_by: row.try_get("created_by").map_err(storage_err)?,
        entity_id: row.try_get("entity_id").map_err(storage_err)?,
        status: RequestStatus::parse(&row.try_get::<String, _>("status").map_err(storage_err)?)?,
        schema_kind: SchemaKind::parse(
            &row.try_get::<String, _>("schema_kind").map_err(storage_err)?,
        )?,
        schema: row.try_get("schema").map_err(storage_err)?,
        ui_hints: row.try_get("ui_hints").map_err(storage_err)?,
        prefill: row.try_get("prefill").map_err(storage_err)?,
        expires_at: row.try_get("expires_at").map_err(storage_err)?,
        deadline_at: row.try_get("deadline_at").map_err(storage_err)?,
        attention_at: row.try_get("attention_at").map_err(storage_err)?,
        autocancel_grace_secs: row.try_get("autocancel_grace_secs").map_err(storage_err)?,
        callback_url: row.try_get("callback_url").map_err(storage_err)?,
        callback_secret: row.try_get("callback_secret").map_err(storage_err)?,
        file_policy: file_policy
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| BrokerError::Internal(format!("bad file_policy column: {e}")))?,
        flow_id: row.try_get("flow_id").map_err(storage_err)?,
        read_at: row.try_get("read_at").map_err(storage_err)?,
        answered_at: row.try_get("answered_at").map_err(storage_err)?,
        deleted_at: row.try_get("deleted_at").map_err(storage_err)?,
        created_at_utc: row.try_get("created_at_utc").map_err(storage_err)?,
        updated_at_utc: row.try_get("updated_at_utc").map_err(storage_err)?,
    })
}

fn row_to_flow(row: &sqlx::postgres::PgRow) -> Result<Flow> {
    Ok(Flow {
        flow_id: row.try_get("flow_id").map_err(storage_err)?,
        kind: row.try_get("kind").map_err(storage_err)?,
        owner_entity: row.try_get("owner_entity").map_err(storage_err)?,
        status: FlowStatus::parse(&row.try_get::<String, _>("status").map_err(storage_err)?)?,
        cursor: row.try_get("cursor").map_err(storage_err)?,
        last_event_id: row.try_get("last_event_id").map_err(storage_err)?,
        created_at_utc: row.try_get("created_at_utc").map_err(storage_err)?,
        updated_at_utc: row.try_get("updated_at_utc").map_err(storage_err)?,
    })
}

fn row_to_response(row: &sqlx::postgres::PgRow) -> Result<ResponseRecord> {
    let files: Value = row.try_get("files").map_err(storage_err)?;
    Ok(ResponseRecord {
        response_id: row.try_get("response_id").map_err(storage_err)?,
        request_id: row.try_get("request_id").map_err(storage_err)?,
        answered_by: row.try_get("answered_by").map_err(storage_err)?,
        payload: row.try_get("payload").map_err(storage_err)?,
        files: serde_json::from_value(files)
            .map_err(|e| BrokerError::Internal(format!("bad files column: {e}")))?,
        answered_at_utc: row.try_get("answered_at_utc").map_err(storage_err)?,
        signature: row.try_get("signature").map_err(storage_err)?,
    })
}

fn row_to_reminder(row: &sqlx::postgres::PgRow) -> Result<Reminder> {
    Ok(Reminder {
        reminder_id: row.try_get("reminder_id").map_err(storage_err)?,
        request_id: row.try_get("request_id").map_err(storage_err)?,
        entity_id: row.try_get("entity_id").map_err(storage_err)?,
        remind_at_utc: row.try_get("remind_at_utc").map_err(storage_err)?,
    })
}

const REQUEST_COLS: &str = "request_id, created_by, entity_id, status, schema_kind, schema, \
     ui_hints, prefill, expires_at, deadline_at, attention_at, autocancel_grace_secs, \
     callback_url, callback_secret, file_policy, flow_id, read_at, answered_at, deleted_at, \
     created_at_utc, updated_at_utc";

fn statuses_vec(statuses: &[RequestStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for PgStore {
    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        sqlx::query(
            r#"
            insert into entities (entity_id, kind, handle, metadata, created_at_utc, updated_at_utc)
            values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entity.entity_id)
        .bind(entity.kind.as_str())
        .bind(&entity.handle)
        .bind(&entity.metadata)
        .bind(entity.created_at_utc)
        .bind(entity.updated_at_utc)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn entity_by_id(&self, id: Uuid) -> Result<Option<Entity>> {
        let row = sqlx::query("select * from entities where entity_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_entity).transpose()
    }

    async fn entity_by_handle(&self, handle: &str) -> Result<Option<Entity>> {
        let row = sqlx::query("select * from entities where handle = $1")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_entity).transpose()
    }

    async fn update_entity_metadata(&self, id: Uuid, metadata: Value) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update entities
               set metadata = $2,
                   updated_at_utc = now()
             where entity_id = $1
            "#,
        )
        .bind(id)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn insert_request(&self, request: &Request) -> Result<()> {
        sqlx::query(
            r#"
            insert into requests (
              request_id, created_by, entity_id, status, schema_kind, schema,
              ui_hints, prefill, expires_at, deadline_at, attention_at,
              autocancel_grace_secs, callback_url, callback_secret, file_policy,
              flow_id, created_at_utc, updated_at_utc
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
              $16, $17, $18
            )
            "#,
        )
        .bind(request.request_id)
        .bind(&request.created_by)
        .bind(request.entity_id)
        .bind(request.status.as_str())
        .bind(request.schema_kind.as_str())
        .bind(&request.schema)
        .bind(&request.ui_hints)
        .bind(&request.prefill)
        .bind(request.expires_at)
        .bind(request.deadline_at)
        .bind(request.attention_at)
        .bind(request.autocancel_grace_secs)
        .bind(&request.callback_url)
        .bind(&request.callback_secret)
        .bind(
            request
                .file_policy
                .as_ref()
                .map(|p| serde_json::to_value(p).unwrap_or(Value::Null)),
        )
        .bind(request.flow_id)
        .bind(request.created_at_utc)
        .bind(request.updated_at_utc)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn request_by_id(&self, id: Uuid) -> Result<Option<Request>> {
        let sql = format!("select {REQUEST_COLS} from requests where request_id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_request).transpose()
    }

    async fn list_requests(&self, filter: &ListFilter) -> Result<Vec<Request>> {
        let order_col = match filter.sort_by {
            Some(SortBy::DeadlineAt) => "deadline_at",
            _ => "created_at_utc",
        };
        let dir = if filter.descending { "desc" } else { "asc" };
        let sql = format!(
            r#"
            select {REQUEST_COLS} from requests
             where ($1::uuid is null or entity_id = $1)
               and ($2::text is null or status = $2)
               and ($3::bool or deleted_at is null)
             order by {order_col} {dir} nulls last, request_id {dir}
             limit $4 offset $5
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.entity_id)
            .bind(filter.status.map(|s| s.as_str().to_string()))
            .bind(filter.include_deleted)
            .bind(filter.limit.unwrap_or(50).clamp(1, 500))
            .bind(filter.offset.unwrap_or(0).max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_request).collect()
    }

    async fn transition_request(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update requests
               set status = $2,
                   updated_at_utc = now()
             where request_id = $1
               and status = any($3)
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(statuses_vec(from))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn answer_request(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        response: &ResponseRecord,
    ) -> Result<bool> {
        // One transaction spans the status flip and the response insert, so
        // a crash can never leave an ANSWERED row without its response.
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            update requests
               set status = 'ANSWERED',
                   answered_at = coalesce(answered_at, $2),
                   updated_at_utc = now()
             where request_id = $1
               and status = any($3)
            returning request_id
            "#,
        )
        .bind(id)
        .bind(response.answered_at_utc)
        .bind(statuses_vec(from))
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;
        if updated.is_none() {
            tx.rollback().await.map_err(storage_err)?;
            return Ok(false);
        }

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            insert into responses (
              response_id, request_id, answered_by, payload, files,
              answered_at_utc, signature
            ) values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (request_id) do nothing
            returning response_id
            "#,
        )
        .bind(response.response_id)
        .bind(response.request_id)
        .bind(response.answered_by)
        .bind(&response.payload)
        .bind(serde_json::to_value(&response.files).unwrap_or(Value::Null))
        .bind(response.answered_at_utc)
        .bind(&response.signature)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;
        if inserted.is_none() {
            tx.rollback().await.map_err(storage_err)?;
            return Ok(false);
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(true)
    }

    async fn mark_request_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update requests
               set read_at = coalesce(read_at, $2),
                   updated_at_utc = now()
             where request_id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn soft_delete_request(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update requests
               set deleted_at = coalesce(deleted_at, $2),
                   updated_at_utc = now()
             where request_id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn requests_by_flow(&self, flow_id: Uuid) -> Result<Vec<Request>> {
        let sql = format!(
            "select {REQUEST_COLS} from requests where flow_id = $1 order by request_id asc"
        );
        let rows = sqlx::query(&sql)
            .bind(flow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_request).collect()
    }

    async fn open_timed_requests(&self) -> Result<Vec<Request>> {
        let sql = format!(
            r#"
            select {REQUEST_COLS} from requests
             where status in ('PENDING', 'CLAIMED')
               and (deadline_at is not null
                    or expires_at is not null
                    or attention_at is not null)
             order by request_id asc
            "#
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_request).collect()
    }

    async fn response_by_request(&self, request_id: Uuid) -> Result<Option<ResponseRecord>> {
        let row = sqlx::query("select * from responses where request_id = $1")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_response).transpose()
    }

    async fn insert_flow(&self, flow: &Flow) -> Result<()> {
        sqlx::query(
            r#"
            insert into flows (
              flow_id, kind, owner_entity, status, cursor, last_event_id,
              created_at_utc, updated_at_utc
            ) values ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(flow.flow_id)
        .bind(&flow.kind)
        .bind(flow.owner_entity)
        .bind(flow.status.as_str())
        .bind(&flow.cursor)
        .bind(&flow.last_event_id)
        .bind(flow.created_at_utc)
        .bind(flow.updated_at_utc)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn flow_by_id(&self, id: Uuid) -> Result<Option<Flow>> {
        let row = sqlx::query("select * from flows where flow_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_flow).transpose()
    }

    async fn update_flow(
        &self,
        id: Uuid,
        status: FlowStatus,
        cursor: &Value,
        last_event_id: Option<&str>,
    ) -> Result<bool> {
        // Terminal flows are sinks: the predicate refuses to resurrect them.
        let res = sqlx::query(
            r#"
            update flows
               set status = $2,
                   cursor = $3,
                   last_event_id = coalesce($4, last_event_id),
                   updated_at_utc = now()
             where flow_id = $1
               and status in ('RUNNING', 'SUSPENDED', 'WAITING_INPUT')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(cursor)
        .bind(last_event_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn flows_by_status(&self, statuses: &[FlowStatus]) -> Result<Vec<Flow>> {
        let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            "select * from flows where status = any($1) order by flow_id asc",
        )
        .bind(wanted)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(row_to_flow).collect()
    }

    async fn insert_reminder(&self, reminder: &Reminder) -> Result<()> {
        sqlx::query(
            r#"
            insert into reminders (reminder_id, request_id, entity_id, remind_at_utc)
            values ($1, $2, $3, $4)
            "#,
        )
        .bind(reminder.reminder_id)
        .bind(reminder.request_id)
        .bind(reminder.entity_id)
        .bind(reminder.remind_at_utc)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn reminder_by_id(&self, id: Uuid) -> Result<Option<Reminder>> {
        let row = sqlx::query("select * from reminders where reminder_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(row_to_reminder).transpose()
    }

    async fn delete_reminder(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query("delete from reminders where reminder_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn delete_reminders_for_request(&self, request_id: Uuid) -> Result<u64> {
        let res = sqlx::query("delete from reminders where request_id = $1")
            .bind(request_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(res.rows_affected())
    }

    async fn open_reminders(&self) -> Result<Vec<Reminder>> {
        let rows = sqlx::query("select * from reminders order by remind_at_utc asc")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(row_to_reminder).collect()
    }
}
