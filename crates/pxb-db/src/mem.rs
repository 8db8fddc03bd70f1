//! In-memory store.
//!
//! Backs tests and development mode. One mutex over the whole state keeps
//! conditional transitions atomic, so the claim race behaves exactly like the
//! Postgres conditional UPDATE.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use pxb_schemas::{
    Entity, Flow, FlowStatus, ListFilter, Reminder, Request, RequestStatus, ResponseRecord,
    Result, SortBy,
};

use crate::Store;

#[derive(Default)]
struct Inner {
    entities: HashMap<Uuid, Entity>,
    handles: HashMap<String, Uuid>,
    requests: HashMap<Uuid, Request>,
    // keyed by request_id: at most one response per request
    responses: HashMap<Uuid, ResponseRecord>,
    flows: HashMap<Uuid, Flow>,
    reminders: HashMap<Uuid, Reminder>,
}

#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        let mut g = self.inner.lock().await;
        if let Some(h) = &entity.handle {
            g.handles.insert(h.clone(), entity.entity_id);
        }
        g.entities.insert(entity.entity_id, entity.clone());
        Ok(())
    }

    async fn entity_by_id(&self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self.inner.lock().await.entities.get(&id).cloned())
    }

    async fn entity_by_handle(&self, handle: &str) -> Result<Option<Entity>> {
        let g = self.inner.lock().await;
        Ok(g.handles
            .get(handle)
            .and_then(|id| g.entities.get(id))
            .cloned())
    }

    async fn update_entity_metadata(&self, id: Uuid, metadata: Value) -> Result<bool> {
        let mut g = self.inner.lock().await;
        match g.entities.get_mut(&id) {
            Some(e) => {
                e.metadata = metadata;
                e.updated_at_utc = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_request(&self, request: &Request) -> Result<()> {
        self.inner
            .lock()
            .await
            .requests
            .insert(request.request_id, request.clone());
        Ok(())
    }

    async fn request_by_id(&self, id: Uuid) -> Result<Option<Request>> {
        Ok(self.inner.lock().await.requests.get(&id).cloned())
    }

    async fn list_requests(&self, filter: &ListFilter) -> Result<Vec<Request>> {
        let g = self.inner.lock().await;
        let mut out: Vec<Request> = g
            .requests
            .values()
            .filter(|r| filter.entity_id.map_or(true, |e| r.entity_id == e))
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.include_deleted || r.deleted_at.is_none())
            .cloned()
            .collect();

        match filter.sort_by {
            Some(SortBy::DeadlineAt) => {
                out.sort_by_key(|r| (r.deadline_at, r.request_id));
            }
            _ => {
                out.sort_by_key(|r| (r.created_at_utc, r.request_id));
            }
        }
        if filter.descending {
            out.reverse();
        }

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(50).clamp(1, 500) as usize;
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn transition_request(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<bool> {
        let mut g = self.inner.lock().await;
        let Some(r) = g.requests.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&r.status) {
            return Ok(false);
        }
        r.status = to;
        r.updated_at_utc = Utc::now();
        Ok(true)
    }

    async fn answer_request(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        response: &ResponseRecord,
    ) -> Result<bool> {
        // both writes happen under the one lock, so they land together
        let mut g = self.inner.lock().await;
        if g.responses.contains_key(&id) {
            return Ok(false);
        }
        let Some(r) = g.requests.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&r.status) {
            return Ok(false);
        }
        r.status = RequestStatus::Answered;
        r.answered_at.get_or_insert(response.answered_at_utc);
        r.updated_at_utc = Utc::now();
        g.responses.insert(id, response.clone());
        Ok(true)
    }

    async fn mark_request_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut g = self.inner.lock().await;
        match g.requests.get_mut(&id) {
            Some(r) => {
                r.read_at.get_or_insert(at);
                r.updated_at_utc = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn soft_delete_request(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut g = self.inner.lock().await;
        match g.requests.get_mut(&id) {
            Some(r) => {
                r.deleted_at.get_or_insert(at);
                r.updated_at_utc = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn requests_by_flow(&self, flow_id: Uuid) -> Result<Vec<Request>> {
        let g = self.inner.lock().await;
        let mut out: Vec<Request> = g
            .requests
            .values()
            .filter(|r| r.flow_id == Some(flow_id))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.request_id);
        Ok(out)
    }

    async fn open_timed_requests(&self) -> Result<Vec<Request>> {
        let g = self.inner.lock().await;
        let mut out: Vec<Request> = g
            .requests
            .values()
            .filter(|r| matches!(r.status, RequestStatus::Pending | RequestStatus::Claimed))
            .filter(|r| {
                r.deadline_at.is_some() || r.expires_at.is_some() || r.attention_at.is_some()
            })
            .cloned()
            .collect();
        out.sort_by_key(|r| r.request_id);
        Ok(out)
    }

    async fn response_by_request(&self, request_id: Uuid) -> Result<Option<ResponseRecord>> {
        Ok(self.inner.lock().await.responses.get(&request_id).cloned())
    }

    async fn insert_flow(&self, flow: &Flow) -> Result<()> {
        self.inner
            .lock()
            .await
            .flows
            .insert(flow.flow_id, flow.clone());
        Ok(())
    }

    async fn flow_by_id(&self, id: Uuid) -> Result<Option<Flow>> {
        Ok(self.inner.lock().await.flows.get(&id).cloned())
    }

    async fn update_flow(
        &self,
        id: Uuid,
        status: FlowStatus,
        cursor: &Value,
        last_event_id: Option<&str>,
    ) -> Result<bool> {
        let mut g = self.inner.lock().await;
        let Some(f) = g.flows.get_mut(&id) else {
            return Ok(false);
        };
        if f.status.is_terminal() {
            return Ok(false);
        }
        f.status = status;
        f.cursor = cursor.clone();
        if let Some(ev) = last_event_id {
            f.last_event_id = Some(ev.to_string());
        }
        f.updated_at_utc = Utc::now();
        Ok(true)
    }

    async fn flows_by_status(&self, statuses: &[FlowStatus]) -> Result<Vec<Flow>> {
        let g = self.inner.lock().await;
        let mut out: Vec<Flow> = g
            .flows
            .values()
            .filter(|f| statuses.contains(&f.status))
            .cloned()
            .collect();
        out.sort_by_key(|f| f.flow_id);
        Ok(out)
    }

    async fn insert_reminder(&self, reminder: &Reminder) -> Result<()> {
        self.inner
            .lock()
            .await
            .reminders
            .insert(reminder.reminder_id, reminder.clone());
        Ok(())
    }

    async fn reminder_by_id(&self, id: Uuid) -> Result<Option<Reminder>> {
        Ok(self.inner.lock().await.reminders.get(&id).cloned())
    }

    async fn delete_reminder(&self, id: Uuid) -> Result<bool> {
        Ok(self.inner.lock().await.reminders.remove(&id).is_some())
    }

    async fn delete_reminders_for_request(&self, request_id: Uuid) -> Result<u64> {
        let mut g = self.inner.lock().await;
        let before = g.reminders.len();
        g.reminders.retain(|_, r| r.request_id != request_id);
        Ok((before - g.reminders.len()) as u64)
    }

    async fn open_reminders(&self) -> Result<Vec<Reminder>> {
        let g = self.inner.lock().await;
        let mut out: Vec<Reminder> = g.reminders.values().cloned().collect();
        out.sort_by_key(|r| (r.remind_at_utc, r.reminder_id));
        Ok(out)
    }
}
