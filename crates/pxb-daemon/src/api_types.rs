//! Request/response DTOs for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use pxb_files::FileInput;
use pxb_schemas::{EntityKind, RequestStatus, SortBy};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntityBody {
    pub kind: EntityKind,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostResponseBody {
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub files: Vec<FileInput>,
    /// Overrides the responder entity; defaults to the caller's entity or
    /// the request's target.
    #[serde(default)]
    pub answered_by: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnoozeBody {
    pub remind_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowBody {
    pub kind: String,
    pub owner_entity: Uuid,
    #[serde(default)]
    pub cursor: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeFlowBody {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignFileBody {
    pub request_id: Uuid,
    pub name: String,
}

/// Query string of `GET /inquiries` and `GET /entities/{id}/queue`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub entity: Option<Uuid>,
    #[serde(default)]
    pub status: Option<RequestStatus>,
    #[serde(default)]
    pub sort_by: Option<SortBy>,
    /// "asc" (default) or "desc".
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub include_deleted: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Error body shared by every surface: stable code + human message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub message: String,
}
