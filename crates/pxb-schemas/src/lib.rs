//! Shared domain and wire types for the PxBox broker.
//!
//! Everything that crosses a crate boundary lives here: entity/request/flow
//! rows, status enums with their transition rules, the session message
//! envelope, event kind names, channel naming, and the error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod cursor;
pub mod envelope;
pub mod error;

pub use envelope::{Envelope, MsgType};
pub use error::{BrokerError, Result};

/// Time-ordered opaque ID. UUIDv7 sorts lexicographically by creation time,
/// which is what request/response/flow IDs rely on for stable listing order.
pub fn new_sortable_id() -> Uuid {
    Uuid::now_v7()
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Group,
    Role,
    Bot,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::Role => "role",
            EntityKind::Bot => "bot",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(EntityKind::User),
            "group" => Ok(EntityKind::Group),
            "role" => Ok(EntityKind::Role),
            "bot" => Ok(EntityKind::Bot),
            other => Err(BrokerError::InvalidInput(format!(
                "invalid entity kind: {other}"
            ))),
        }
    }
}

/// A routable target. Immutable after creation except for `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub entity_id: Uuid,
    pub kind: EntityKind,
    pub handle: Option<String>,
    pub metadata: Value,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: DateTime<Utc>,
}

/// Target of a request: exactly one of `id` or `handle` must be supplied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Claimed,
    Answered,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Claimed => "CLAIMED",
            RequestStatus::Answered => "ANSWERED",
            RequestStatus::Cancelled => "CANCELLED",
            RequestStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "CLAIMED" => Ok(RequestStatus::Claimed),
            "ANSWERED" => Ok(RequestStatus::Answered),
            "CANCELLED" => Ok(RequestStatus::Cancelled),
            "EXPIRED" => Ok(RequestStatus::Expired),
            other => Err(BrokerError::Internal(format!(
                "invalid request status: {other}"
            ))),
        }
    }

    /// Terminal states are sinks.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Answered | RequestStatus::Cancelled | RequestStatus::Expired
        )
    }

    /// Legal edges of the request state machine.
    pub fn may_become(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Pending, Answered)
                | (Claimed, Answered)
                | (Pending, Cancelled)
                | (Claimed, Cancelled)
                | (Pending, Expired)
        )
    }
}

/// How the schema payload of a request is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaKind {
    InlineSchema,
    JsonExample,
    RemoteReference,
}

impl SchemaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::InlineSchema => "inline-schema",
            SchemaKind::JsonExample => "json-example",
            SchemaKind::RemoteReference => "remote-reference",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "inline-schema" => Ok(SchemaKind::InlineSchema),
            "json-example" => Ok(SchemaKind::JsonExample),
            "remote-reference" => Ok(SchemaKind::RemoteReference),
            other => Err(BrokerError::InvalidInput(format!(
                "invalid schema kind: {other}"
            ))),
        }
    }
}

/// Upload constraints attached to a request. MIME patterns support a trailing
/// `/*`; extensions are matched case-insensitively and stored without a dot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilePolicy {
    #[serde(rename = "maxTotalMB", default, skip_serializing_if = "Option::is_none")]
    pub max_total_mb: Option<f64>,
    #[serde(rename = "maxFileMB", default, skip_serializing_if = "Option::is_none")]
    pub max_file_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
}

/// A stored file reference inside a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub url: String,
    /// Bytes; never negative.
    pub size: i64,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// A data-entry demand directed at an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: Uuid,
    pub created_by: String,
    pub entity_id: Uuid,
    pub status: RequestStatus,
    pub schema_kind: SchemaKind,
    pub schema: Value,
    pub ui_hints: Value,
    pub prefill: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocancel_grace_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_policy: Option<FilePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: DateTime<Utc>,
}

/// Input for creating a request. `entity` resolves by ID or handle; the
/// schema kind is classified from the document when not given explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestInput {
    pub entity: EntityRef,
    pub schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_kind: Option<SchemaKind>,
    #[serde(default)]
    pub ui_hints: Value,
    #[serde(default)]
    pub prefill: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocancel_grace_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_policy: Option<FilePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The validated answer to a request. At most one per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub response_id: Uuid,
    pub request_id: Uuid,
    pub answered_by: Uuid,
    pub payload: Value,
    pub files: Vec<FileDescriptor>,
    pub answered_at_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Running,
    Suspended,
    WaitingInput,
    Completed,
    Cancelled,
    Failed,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Running => "RUNNING",
            FlowStatus::Suspended => "SUSPENDED",
            FlowStatus::WaitingInput => "WAITING_INPUT",
            FlowStatus::Completed => "COMPLETED",
            FlowStatus::Cancelled => "CANCELLED",
            FlowStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(FlowStatus::Running),
            "SUSPENDED" => Ok(FlowStatus::Suspended),
            "WAITING_INPUT" => Ok(FlowStatus::WaitingInput),
            "COMPLETED" => Ok(FlowStatus::Completed),
            "CANCELLED" => Ok(FlowStatus::Cancelled),
            "FAILED" => Ok(FlowStatus::Failed),
            other => Err(BrokerError::Internal(format!(
                "invalid flow status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Cancelled | FlowStatus::Failed
        )
    }
}

/// A durable workflow instance. The cursor is opaque JSON; see [`cursor`] for
/// the helpers that read/write the conventional fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub flow_id: Uuid,
    pub kind: String,
    pub owner_entity: Uuid,
    pub status: FlowStatus,
    pub cursor: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reminder
// ---------------------------------------------------------------------------

/// A scheduled nudge for an open request. Deleted when the request leaves
/// PENDING/CLAIMED before the reminder fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub reminder_id: Uuid,
    pub request_id: Uuid,
    pub entity_id: Uuid,
    pub remind_at_utc: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One durable entry of a channel's ordered stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub channel: String,
    pub seq: i64,
    pub ts_utc: DateTime<Utc>,
    pub payload: Value,
}

/// Event kind names carried in event payloads.
pub mod events {
    pub const REQUEST_CREATED: &str = "request.created";
    pub const REQUEST_CLAIMED: &str = "request.claimed";
    pub const REQUEST_ANSWERED: &str = "request.answered";
    pub const REQUEST_CANCELLED: &str = "request.cancelled";
    pub const REQUEST_EXPIRED: &str = "request.expired";
    pub const REQUEST_DEADLINE_APPROACHING: &str = "request.deadline_approaching";
    pub const REQUEST_NEEDS_ATTENTION: &str = "request.needs_attention";
    pub const REQUEST_REMINDER: &str = "request.reminder";
    pub const FLOW_CREATED: &str = "flow.created";
    pub const FLOW_SUSPENDED: &str = "flow.suspended";
    pub const FLOW_UPDATED: &str = "flow.updated";
    pub const FLOW_COMPLETED: &str = "flow.completed";
    pub const FLOW_FAILED: &str = "flow.failed";
}

/// Channel naming. Channels are created lazily on first publish or subscribe.
pub mod channels {
    use uuid::Uuid;

    pub fn entity(entity_id: Uuid) -> String {
        format!("entity:{entity_id}")
    }

    pub fn request(request_id: Uuid) -> String {
        format!("request:{request_id}")
    }

    pub fn requestor(subject: &str) -> String {
        format!("requestor:{subject}")
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Authenticated caller context. Attribution only; no authorization decisions
/// hang off this.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    CreatedAt,
    DeadlineAt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<SortBy>,
    /// true = newest first.
    #[serde(default)]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default)]
    pub include_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_status_edges() {
        use RequestStatus::*;
        assert!(Pending.may_become(Claimed));
        assert!(Pending.may_become(Answered));
        assert!(Claimed.may_become(Answered));
        assert!(Pending.may_become(Cancelled));
        assert!(Claimed.may_become(Cancelled));
        assert!(Pending.may_become(Expired));

        assert!(!Claimed.may_become(Expired));
        assert!(!Answered.may_become(Cancelled));
        assert!(!Cancelled.may_become(Answered));
        assert!(!Expired.may_become(Claimed));
    }

    #[test]
    fn terminal_states_are_sinks() {
        use RequestStatus::*;
        for terminal in [Answered, Cancelled, Expired] {
            for next in [Pending, Claimed, Answered, Cancelled, Expired] {
                assert!(!terminal.may_become(next));
            }
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            RequestStatus::Pending,
            RequestStatus::Claimed,
            RequestStatus::Answered,
            RequestStatus::Cancelled,
            RequestStatus::Expired,
        ] {
            assert_eq!(RequestStatus::parse(s.as_str()).unwrap(), s);
        }
        for s in [
            FlowStatus::Running,
            FlowStatus::Suspended,
            FlowStatus::WaitingInput,
            FlowStatus::Completed,
            FlowStatus::Cancelled,
            FlowStatus::Failed,
        ] {
            assert_eq!(FlowStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn sortable_ids_increase() {
        let a = new_sortable_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_sortable_id();
        assert!(b.to_string() > a.to_string());
    }

    #[test]
    fn schema_kind_wire_names() {
        let v = serde_json::to_value(SchemaKind::RemoteReference).unwrap();
        assert_eq!(v, serde_json::json!("remote-reference"));
        assert_eq!(
            SchemaKind::parse("json-example").unwrap(),
            SchemaKind::JsonExample
        );
    }
}
