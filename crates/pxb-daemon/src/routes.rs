//! Axum router and all HTTP handlers.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! layers after this call so the scenario tests can compose the bare router.
//! Handlers are `pub(crate)` for the same reason.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use serde_json::Value;
use uuid::Uuid;

use pxb_auth::DEV_ENTITY_HEADER;
use pxb_schemas::{
    BrokerError, CreateRequestInput, Identity, ListFilter,
};

use crate::api_types::{
    CreateEntityBody, CreateFlowBody, ErrorBody, HealthResponse, ListQuery, OkResponse,
    PostResponseBody, ResumeFlowBody, SignFileBody, SnoozeBody,
};
use crate::session;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Wrapper making [`BrokerError`] usable as an Axum rejection with the shared
/// `{error, code, message}` body.
pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.code().to_string(),
            code: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let authed = Router::new()
        .route("/entities", post(create_entity))
        .route("/entities/:id", get(get_entity))
        .route("/entities/:id/metadata", put(put_entity_metadata))
        .route("/entities/:id/queue", get(entity_queue))
        .route("/requests", post(create_request))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/claim", post(claim_request))
        .route(
            "/requests/:id/response",
            post(post_response).get(get_response),
        )
        .route("/requests/:id/cancel", post(cancel_request))
        .route("/inquiries", get(list_inquiries))
        .route("/inquiries/:id/markRead", post(mark_read))
        .route("/inquiries/:id/snooze", post(snooze))
        .route("/inquiries/:id/cancel", post(cancel_request))
        .route("/inquiries/:id", delete(soft_delete))
        .route("/flows", post(create_flow))
        .route("/flows/:id", get(get_flow))
        .route("/flows/:id/resume", post(resume_flow))
        .route("/flows/:id/cancel", post(cancel_flow))
        .route("/files/sign", post(sign_file))
        .route("/session", get(session::session_upgrade))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_identity,
        ));

    Router::new()
        .route("/healthz", get(health))
        .merge(authed)
        .with_state(state)
}

/// Resolve the caller identity from the bearer token (or the dev header when
/// enabled) and stash it in request extensions.
async fn require_identity(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    mut request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let dev_entity = headers.get(DEV_ENTITY_HEADER).and_then(|v| v.to_str().ok());

    match st.verifier.authenticate(authorization, dev_entity) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        service: st.build.service,
        version: st.build.version,
    })
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

pub(crate) async fn create_entity(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CreateEntityBody>,
) -> ApiResult<Response> {
    let entity = st
        .broker
        .create_entity(body.kind, body.handle, body.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(entity)).into_response())
}

pub(crate) async fn get_entity(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.entity(id).await?).into_response())
}

pub(crate) async fn put_entity_metadata(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(metadata): Json<Value>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.update_entity_metadata(id, metadata).await?).into_response())
}

pub(crate) async fn entity_queue(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    st.broker.entity(id).await?;
    let mut filter = filter_from(query);
    filter.entity_id = Some(id);
    Ok(Json(st.broker.requests.list(&filter).await?).into_response())
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub(crate) async fn create_request(
    State(st): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(input): Json<CreateRequestInput>,
) -> ApiResult<Response> {
    let request = st.broker.requests.create(&identity, input).await?;
    Ok((StatusCode::CREATED, Json(request)).into_response())
}

pub(crate) async fn get_request(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.requests.get(id).await?).into_response())
}

pub(crate) async fn claim_request(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.requests.claim(id).await?).into_response())
}

pub(crate) async fn post_response(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<PostResponseBody>,
) -> ApiResult<Response> {
    let responder = Identity {
        subject: identity.subject.clone(),
        entity_id: body.answered_by.or(identity.entity_id),
    };
    let response = st
        .broker
        .requests
        .post_response(id, &responder, body.payload, body.files)
        .await?;
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

pub(crate) async fn get_response(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.requests.response_for(id).await?).into_response())
}

pub(crate) async fn cancel_request(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.requests.cancel(id).await?).into_response())
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

pub(crate) async fn list_inquiries(
    State(st): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let filter = filter_from(query);
    Ok(Json(st.broker.requests.list(&filter).await?).into_response())
}

pub(crate) async fn mark_read(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.requests.mark_read(id).await?).into_response())
}

pub(crate) async fn snooze(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SnoozeBody>,
) -> ApiResult<Response> {
    let reminder = st.broker.requests.snooze(id, body.remind_at).await?;
    Ok((StatusCode::CREATED, Json(reminder)).into_response())
}

pub(crate) async fn soft_delete(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    st.broker.requests.soft_delete(id).await?;
    Ok(Json(OkResponse { ok: true }).into_response())
}

fn filter_from(query: ListQuery) -> ListFilter {
    ListFilter {
        entity_id: query.entity,
        status: query.status,
        sort_by: query.sort_by,
        descending: matches!(query.order.as_deref(), Some("desc")),
        limit: query.limit,
        offset: query.offset,
        include_deleted: query.include_deleted.unwrap_or(false),
    }
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

pub(crate) async fn create_flow(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CreateFlowBody>,
) -> ApiResult<Response> {
    let flow = st
        .broker
        .flows
        .create(&body.kind, body.owner_entity, body.cursor)
        .await?;
    Ok((StatusCode::CREATED, Json(flow)).into_response())
}

pub(crate) async fn get_flow(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.flows.get(id).await?).into_response())
}

pub(crate) async fn resume_flow(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResumeFlowBody>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.flows.resume(id, &body.event, body.data).await?).into_response())
}

pub(crate) async fn cancel_flow(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(st.broker.flows.cancel(id).await?).into_response())
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Issue an upload ticket, validated against the owning request's policy
/// (extension and inferable MIME; sizes are checked at submission).
pub(crate) async fn sign_file(
    State(st): State<Arc<AppState>>,
    Json(body): Json<SignFileBody>,
) -> ApiResult<Response> {
    let request = st.broker.requests.get(body.request_id).await?;
    if let Some(policy) = &request.file_policy {
        let probe = pxb_schemas::FileDescriptor {
            name: body.name.clone(),
            url: String::new(),
            size: 0,
            mime: pxb_files::infer_mime(&body.name).to_string(),
            sha256: None,
        };
        pxb_files::enforce_policy(policy, &[probe])?;
    }
    let signed = st.broker.files.sign(body.request_id, &body.name).await?;
    Ok(Json(signed).into_response())
}
