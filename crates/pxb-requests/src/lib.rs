//! Request lifecycle service.
//!
//! Owns the PENDING → CLAIMED/ANSWERED/CANCELLED/EXPIRED state machine.
//! Every transition is a conditional store update; events publish only after
//! the state write commits; a request bound to a flow wakes that flow through
//! the [`FlowWake`] seam rather than any in-memory back-pointer.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use pxb_db::Store;
use pxb_events::EventFabric;
use pxb_files::FileInput;
use pxb_schema::SchemaEngine;
use pxb_schemas::{
    channels, events, new_sortable_id, BrokerError, CreateRequestInput, Entity, Identity,
    ListFilter, Reminder, Request, RequestStatus, ResponseRecord, Result,
};
use pxb_scheduler::{Scheduler, TaskKind};

mod callback;

pub use callback::sign_callback_body;

/// How answering/cancelling a flow-bound request reaches the flow engine.
/// The flow service implements this; wiring happens at assembly time.
#[async_trait]
pub trait FlowWake: Send + Sync {
    async fn wake(&self, flow_id: Uuid, event: &str, data: Value);
}

pub struct RequestService {
    store: Arc<dyn Store>,
    schema: Arc<SchemaEngine>,
    fabric: Arc<EventFabric>,
    scheduler: Scheduler,
    warning_window: Duration,
    flow_hook: OnceLock<Arc<dyn FlowWake>>,
    http: reqwest::Client,
}

impl RequestService {
    pub fn new(
        store: Arc<dyn Store>,
        schema: Arc<SchemaEngine>,
        fabric: Arc<EventFabric>,
        scheduler: Scheduler,
        warning_window_secs: i64,
    ) -> Self {
        Self {
            store,
            schema,
            fabric,
            scheduler,
            warning_window: Duration::seconds(warning_window_secs.max(0)),
            flow_hook: OnceLock::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Late-bound flow hook; set exactly once at assembly.
    pub fn set_flow_hook(&self, hook: Arc<dyn FlowWake>) {
        let _ = self.flow_hook.set(hook);
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn fabric(&self) -> &Arc<EventFabric> {
        &self.fabric
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    pub async fn create(&self, identity: &Identity, input: CreateRequestInput) -> Result<Request> {
        let entity = self.resolve_entity(&input.entity).await?;

        let schema_kind = input
            .schema_kind
            .unwrap_or_else(|| SchemaEngine::classify(&input.schema));
        // creation fails when the document does not prepare
        self.schema.prepare(schema_kind, &input.schema).await?;

        if let Some(grace) = input.autocancel_grace_secs {
            if grace < 0 {
                return Err(BrokerError::InvalidInput(
                    "autocancelGraceSecs must be >= 0".into(),
                ));
            }
            if input.deadline_at.is_none() {
                return Err(BrokerError::InvalidInput(
                    "autocancelGraceSecs requires deadlineAt".into(),
                ));
            }
        }

        let now = Utc::now();
        let request = Request {
            request_id: new_sortable_id(),
            created_by: identity.subject.clone(),
            entity_id: entity.entity_id,
            status: RequestStatus::Pending,
            schema_kind,
            schema: input.schema,
            ui_hints: or_empty_object(input.ui_hints),
            prefill: or_empty_object(input.prefill),
            expires_at: input.expires_at,
            deadline_at: input.deadline_at,
            attention_at: input.attention_at,
            autocancel_grace_secs: input.autocancel_grace_secs,
            callback_url: input.callback_url,
            callback_secret: input.callback_secret,
            file_policy: input.file_policy,
            flow_id: input.flow_id,
            read_at: None,
            answered_at: None,
            deleted_at: None,
            created_at_utc: now,
            updated_at_utc: now,
        };
        self.store.insert_request(&request).await?;

        let data = json!({"request": request});
        self.fabric
            .publish_logged(
                &channels::entity(request.entity_id),
                events::REQUEST_CREATED,
                data.clone(),
            )
            .await;
        self.fabric
            .publish_logged(
                &channels::requestor(&request.created_by),
                events::REQUEST_CREATED,
                data,
            )
            .await;

        self.arm_timers(&request);
        Ok(request)
    }

    /// Arm every timer the row's timestamps call for. Also used by the
    /// startup re-arm scan, so arming twice must stay harmless (handlers
    /// re-check row state).
    pub fn arm_timers(&self, request: &Request) {
        let id = request.request_id;
        if let Some(deadline) = request.deadline_at {
            self.scheduler.schedule(
                TaskKind::DeadlineNotify { request_id: id },
                deadline - self.warning_window,
            );
            self.scheduler
                .schedule(TaskKind::DeadlineExpire { request_id: id }, deadline);
            if let Some(grace) = request.autocancel_grace_secs {
                self.scheduler.schedule(
                    TaskKind::AutoCancel { request_id: id },
                    deadline + Duration::seconds(grace),
                );
            }
        }
        if let Some(expires) = request.expires_at {
            self.scheduler
                .schedule(TaskKind::DeadlineExpire { request_id: id }, expires);
        }
        if let Some(attention) = request.attention_at {
            self.scheduler
                .schedule(TaskKind::Attention { request_id: id }, attention);
        }
    }

    async fn resolve_entity(&self, target: &pxb_schemas::EntityRef) -> Result<Entity> {
        match (&target.id, &target.handle) {
            (Some(id), None) => self
                .store
                .entity_by_id(*id)
                .await?
                .ok_or_else(|| BrokerError::EntityNotFound(id.to_string())),
            (None, Some(handle)) => self
                .store
                .entity_by_handle(handle)
                .await?
                .ok_or_else(|| BrokerError::EntityNotFound(handle.clone())),
            _ => Err(BrokerError::InvalidInput(
                "exactly one of entity.id or entity.handle must be supplied".into(),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // claim
    // -----------------------------------------------------------------------

    /// At most one of N concurrent claimers succeeds; the rest observe
    /// claim-conflict.
    pub async fn claim(&self, id: Uuid) -> Result<Request> {
        let request = self.get(id).await?;
        let won = self
            .store
            .transition_request(id, &[RequestStatus::Pending], RequestStatus::Claimed)
            .await?;
        if !won {
            return Err(BrokerError::ClaimConflict(id));
        }

        let data = json!({"requestId": id, "entityId": request.entity_id});
        self.fabric
            .publish_logged(&channels::request(id), events::REQUEST_CLAIMED, data.clone())
            .await;
        self.fabric
            .publish_logged(
                &channels::entity(request.entity_id),
                events::REQUEST_CLAIMED,
                data,
            )
            .await;

        self.get(id).await
    }

    // -----------------------------------------------------------------------
    // postResponse
    // -----------------------------------------------------------------------

    pub async fn post_response(
        &self,
        id: Uuid,
        identity: &Identity,
        payload: Value,
        files: Vec<FileInput>,
    ) -> Result<ResponseRecord> {
        let request = self.get(id).await?;
        if request.status.is_terminal() {
            return Err(BrokerError::InvalidTransition {
                id,
                state: request.status.as_str().to_string(),
            });
        }

        // responder defaults to the request's target entity
        let answered_by = match identity.entity_id {
            Some(e) => e,
            None => request.entity_id,
        };
        if self.store.entity_by_id(answered_by).await?.is_none() {
            return Err(BrokerError::EntityNotFound(answered_by.to_string()));
        }

        // no partial writes: validate payload and files before any mutation
        self.schema
            .validate(request.schema_kind, &request.schema, &payload)
            .await?;
        let files = pxb_files::normalize_and_check(request.file_policy.as_ref(), &files)?;

        let response = ResponseRecord {
            response_id: new_sortable_id(),
            request_id: id,
            answered_by,
            payload,
            files,
            answered_at_utc: Utc::now(),
            signature: None,
        };
        // status flip and response row commit atomically; losers of the
        // race observe a terminal row
        let won = self
            .store
            .answer_request(
                id,
                &[RequestStatus::Pending, RequestStatus::Claimed],
                &response,
            )
            .await?;
        if !won {
            let current = self.get(id).await?;
            return Err(BrokerError::InvalidTransition {
                id,
                state: current.status.as_str().to_string(),
            });
        }

        if let Err(e) = self.store.delete_reminders_for_request(id).await {
            warn!(request_id = %id, error = %e, "reminder cleanup failed");
        }

        let data = json!({
            "requestId": id,
            "responseId": response.response_id,
            "answeredBy": answered_by,
        });
        self.fabric
            .publish_logged(&channels::request(id), events::REQUEST_ANSWERED, data.clone())
            .await;
        self.fabric
            .publish_logged(
                &channels::entity(request.entity_id),
                events::REQUEST_ANSWERED,
                data.clone(),
            )
            .await;
        self.fabric
            .publish_logged(
                &channels::requestor(&request.created_by),
                events::REQUEST_ANSWERED,
                data.clone(),
            )
            .await;

        self.deliver_callback(&request, events::REQUEST_ANSWERED, data.clone());
        self.wake_flow(&request, events::REQUEST_ANSWERED, json!({"requestId": id}))
            .await;

        Ok(response)
    }

    pub async fn response_for(&self, id: Uuid) -> Result<ResponseRecord> {
        self.store
            .response_by_request(id)
            .await?
            .ok_or(BrokerError::RequestNotFound(id))
    }

    // -----------------------------------------------------------------------
    // cancel / expire
    // -----------------------------------------------------------------------

    pub async fn cancel(&self, id: Uuid) -> Result<Request> {
        self.cancel_inner(id, &[RequestStatus::Pending, RequestStatus::Claimed], true)
            .await
    }

    /// Cancellation driven by the owning flow's cascade: the flow is already
    /// being torn down, so it is not woken again.
    pub async fn cancel_for_flow(&self, id: Uuid) -> Result<Request> {
        self.cancel_inner(id, &[RequestStatus::Pending, RequestStatus::Claimed], false)
            .await
    }

    /// Scheduler-driven: cancels only while still PENDING.
    pub async fn auto_cancel(&self, id: Uuid) -> Result<bool> {
        match self.cancel_inner(id, &[RequestStatus::Pending], true).await {
            Ok(_) => Ok(true),
            Err(BrokerError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn cancel_inner(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        notify_flow: bool,
    ) -> Result<Request> {
        let request = self.get_any(id).await?;
        let won = self
            .store
            .transition_request(id, from, RequestStatus::Cancelled)
            .await?;
        if !won {
            return Err(BrokerError::InvalidTransition {
                id,
                state: request.status.as_str().to_string(),
            });
        }

        if let Err(e) = self.store.delete_reminders_for_request(id).await {
            warn!(request_id = %id, error = %e, "reminder cleanup failed");
        }

        let data = json!({"requestId": id, "entityId": request.entity_id});
        self.fabric
            .publish_logged(&channels::request(id), events::REQUEST_CANCELLED, data.clone())
            .await;
        self.fabric
            .publish_logged(
                &channels::entity(request.entity_id),
                events::REQUEST_CANCELLED,
                data.clone(),
            )
            .await;

        self.deliver_callback(&request, events::REQUEST_CANCELLED, data);
        if notify_flow {
            self.wake_flow(&request, events::REQUEST_CANCELLED, json!({"requestId": id}))
                .await;
        }

        self.get_any(id).await
    }

    /// Scheduler-driven expiry: only a still-PENDING request expires.
    /// Returns whether this firing performed the transition.
    pub async fn expire(&self, id: Uuid) -> Result<bool> {
        let request = match self.get_any(id).await {
            Ok(r) => r,
            Err(BrokerError::RequestNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let won = self
            .store
            .transition_request(id, &[RequestStatus::Pending], RequestStatus::Expired)
            .await?;
        if !won {
            return Ok(false);
        }

        if let Err(e) = self.store.delete_reminders_for_request(id).await {
            warn!(request_id = %id, error = %e, "reminder cleanup failed");
        }

        let data = json!({"requestId": id, "entityId": request.entity_id});
        self.fabric
            .publish_logged(&channels::request(id), events::REQUEST_EXPIRED, data.clone())
            .await;
        self.fabric
            .publish_logged(
                &channels::entity(request.entity_id),
                events::REQUEST_EXPIRED,
                data,
            )
            .await;

        self.wake_flow(&request, events::REQUEST_EXPIRED, json!({"requestId": id}))
            .await;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // notifications (scheduler-driven)
    // -----------------------------------------------------------------------

    pub async fn deadline_notify(&self, id: Uuid) -> Result<()> {
        let Ok(request) = self.get_any(id).await else {
            return Ok(());
        };
        if request.status != RequestStatus::Pending {
            return Ok(());
        }
        self.fabric
            .publish_logged(
                &channels::entity(request.entity_id),
                events::REQUEST_DEADLINE_APPROACHING,
                json!({"requestId": id, "deadlineAt": request.deadline_at}),
            )
            .await;
        Ok(())
    }

    pub async fn needs_attention(&self, id: Uuid) -> Result<()> {
        let Ok(request) = self.get_any(id).await else {
            return Ok(());
        };
        if request.status != RequestStatus::Pending {
            return Ok(());
        }
        self.fabric
            .publish_logged(
                &channels::entity(request.entity_id),
                events::REQUEST_NEEDS_ATTENTION,
                json!({"requestId": id}),
            )
            .await;
        Ok(())
    }

    /// Fire a snooze reminder, then delete it. A reminder whose request has
    /// already left PENDING/CLAIMED fires nothing.
    pub async fn fire_reminder(&self, reminder_id: Uuid) -> Result<()> {
        let Some(reminder) = self.store.reminder_by_id(reminder_id).await? else {
            return Ok(());
        };
        let request = self.get_any(reminder.request_id).await?;
        if matches!(
            request.status,
            RequestStatus::Pending | RequestStatus::Claimed
        ) {
            self.fabric
                .publish_logged(
                    &channels::entity(reminder.entity_id),
                    events::REQUEST_REMINDER,
                    json!({"requestId": reminder.request_id, "reminderId": reminder_id}),
                )
                .await;
        }
        self.store.delete_reminder(reminder_id).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // inbox accessors
    // -----------------------------------------------------------------------

    /// Read, hiding soft-deleted rows.
    pub async fn get(&self, id: Uuid) -> Result<Request> {
        let request = self.get_any(id).await?;
        if request.deleted_at.is_some() {
            return Err(BrokerError::RequestNotFound(id));
        }
        Ok(request)
    }

    /// Read including soft-deleted rows (lifecycle and flow bookkeeping
    /// ignore soft deletion).
    pub async fn get_any(&self, id: Uuid) -> Result<Request> {
        self.store
            .request_by_id(id)
            .await?
            .ok_or(BrokerError::RequestNotFound(id))
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Request>> {
        self.store.list_requests(filter).await
    }

    pub async fn mark_read(&self, id: Uuid) -> Result<Request> {
        self.get(id).await?;
        self.store.mark_request_read(id, Utc::now()).await?;
        self.get(id).await
    }

    /// Retains the row for audit and flow reference integrity.
    pub async fn soft_delete(&self, id: Uuid) -> Result<()> {
        self.get_any(id).await?;
        self.store.soft_delete_request(id, Utc::now()).await?;
        Ok(())
    }

    pub async fn snooze(&self, id: Uuid, remind_at: chrono::DateTime<Utc>) -> Result<Reminder> {
        let request = self.get(id).await?;
        if request.status.is_terminal() {
            return Err(BrokerError::InvalidTransition {
                id,
                state: request.status.as_str().to_string(),
            });
        }
        let reminder = Reminder {
            reminder_id: new_sortable_id(),
            request_id: id,
            entity_id: request.entity_id,
            remind_at_utc: remind_at,
        };
        self.store.insert_reminder(&reminder).await?;
        self.scheduler.schedule(
            TaskKind::Reminder {
                reminder_id: reminder.reminder_id,
            },
            remind_at,
        );
        Ok(reminder)
    }

    // -----------------------------------------------------------------------
    // flow + callback plumbing
    // -----------------------------------------------------------------------

    async fn wake_flow(&self, request: &Request, event: &str, data: Value) {
        let Some(flow_id) = request.flow_id else {
            return;
        };
        match self.flow_hook.get() {
            Some(hook) => hook.wake(flow_id, event, data).await,
            None => warn!(%flow_id, event, "flow hook not wired; wake dropped"),
        }
    }

    fn deliver_callback(&self, request: &Request, kind: &str, data: Value) {
        let Some(url) = request.callback_url.clone() else {
            return;
        };
        callback::spawn_delivery(
            self.http.clone(),
            url,
            request.callback_secret.clone(),
            json!({"kind": kind, "data": data}),
        );
    }
}

fn or_empty_object(v: Value) -> Value {
    if v.is_null() {
        json!({})
    } else {
        v
    }
}
