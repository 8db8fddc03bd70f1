//! Storage adapter.
//!
//! [`Store`] is the capability set every caller programs against; the two
//! implementations are [`PgStore`] (Postgres via sqlx) and [`MemStore`] (the
//! in-memory double used by tests and development mode). Both enforce the
//! same rule: state-machine mutations are conditional updates — callers never
//! read-then-write without a predicate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use pxb_schemas::{
    BrokerError, Entity, Flow, FlowStatus, ListFilter, Reminder, Request, RequestStatus,
    ResponseRecord, Result,
};

mod mem;
mod pg;

pub use mem::MemStore;
pub use pg::{connect, migrate, PgStore};

pub const ENV_DB_URL: &str = "PXB_DATABASE_URL";

/// Typed storage operations. All timestamps are UTC; reads that feed state
/// machine transitions see committed writes.
#[async_trait]
pub trait Store: Send + Sync {
    // -- entities ----------------------------------------------------------

    async fn insert_entity(&self, entity: &Entity) -> Result<()>;
    async fn entity_by_id(&self, id: Uuid) -> Result<Option<Entity>>;
    async fn entity_by_handle(&self, handle: &str) -> Result<Option<Entity>>;
    /// Entities are immutable except metadata.
    async fn update_entity_metadata(&self, id: Uuid, metadata: Value) -> Result<bool>;

    // -- requests ----------------------------------------------------------

    async fn insert_request(&self, request: &Request) -> Result<()>;
    async fn request_by_id(&self, id: Uuid) -> Result<Option<Request>>;
    async fn list_requests(&self, filter: &ListFilter) -> Result<Vec<Request>>;

    /// Conditional transition: moves the row to `to` only while its current
    /// status is one of `from`. Returns false when zero rows matched — the
    /// caller decides whether that is a conflict or an invalid transition.
    async fn transition_request(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<bool>;

    /// Accept a response: transition the request to ANSWERED (only while its
    /// status is one of `from`), stamp `answered_at`, and store the response
    /// row. The two writes commit together or not at all, keeping the
    /// answered-iff-response invariant across crashes. Returns false without
    /// writing when the transition matched no row or a response already
    /// exists.
    async fn answer_request(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        response: &ResponseRecord,
    ) -> Result<bool>;

    async fn mark_request_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
    async fn soft_delete_request(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
    async fn requests_by_flow(&self, flow_id: Uuid) -> Result<Vec<Request>>;
    /// Open (PENDING/CLAIMED) requests that carry any timer column; used to
    /// re-arm scheduler tasks at startup.
    async fn open_timed_requests(&self) -> Result<Vec<Request>>;

    // -- responses ---------------------------------------------------------

    async fn response_by_request(&self, request_id: Uuid) -> Result<Option<ResponseRecord>>;

    // -- flows -------------------------------------------------------------

    async fn insert_flow(&self, flow: &Flow) -> Result<()>;
    async fn flow_by_id(&self, id: Uuid) -> Result<Option<Flow>>;
    /// Persist cursor + status, only while the row is currently non-terminal.
    async fn update_flow(
        &self,
        id: Uuid,
        status: FlowStatus,
        cursor: &Value,
        last_event_id: Option<&str>,
    ) -> Result<bool>;
    async fn flows_by_status(&self, statuses: &[FlowStatus]) -> Result<Vec<Flow>>;

    // -- reminders ---------------------------------------------------------

    async fn insert_reminder(&self, reminder: &Reminder) -> Result<()>;
    async fn reminder_by_id(&self, id: Uuid) -> Result<Option<Reminder>>;
    async fn delete_reminder(&self, id: Uuid) -> Result<bool>;
    async fn delete_reminders_for_request(&self, request_id: Uuid) -> Result<u64>;
    async fn open_reminders(&self) -> Result<Vec<Reminder>>;
}

/// Map any storage-layer failure into the shared taxonomy.
pub(crate) fn storage_err(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::StorageUnavailable(e.to_string())
}
