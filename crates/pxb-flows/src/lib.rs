//! Flow engine: durable workflows with an opaque checkpointed cursor.
//!
//! Concurrency contract: runner invocations for the same flow never
//! interleave (a per-flow mutex serialises resume/tick/cancel); different
//! flows run fully parallel. The cursor on disk is always consistent with the
//! last externally observable transition because the engine persists cursor +
//! status in one store call before emitting anything.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use async_trait::async_trait;
use pxb_db::Store;
use pxb_events::EventFabric;
use pxb_requests::{FlowWake, RequestService};
use pxb_schemas::{
    channels, cursor, events, new_sortable_id, BrokerError, Flow, FlowStatus, RequestStatus,
    Result,
};
use pxb_scheduler::{Scheduler, TaskKind};

mod recovery;
mod runner;

pub use recovery::RecoveryReport;
pub use runner::{BasicRunner, FlowRunner, StepCtx, StepOutcome, SuspendSpec};

pub struct FlowService {
    store: Arc<dyn Store>,
    fabric: Arc<EventFabric>,
    requests: Arc<RequestService>,
    scheduler: Scheduler,
    runners: HashMap<String, Arc<dyn FlowRunner>>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl FlowService {
    pub fn new(
        store: Arc<dyn Store>,
        fabric: Arc<EventFabric>,
        requests: Arc<RequestService>,
        scheduler: Scheduler,
    ) -> Self {
        let mut service = Self {
            store,
            fabric,
            requests,
            scheduler,
            runners: HashMap::new(),
            locks: Mutex::new(HashMap::new()),
        };
        service.register_runner("basic", Arc::new(BasicRunner));
        service
    }

    /// Kind → runner, resolved at startup before the service is shared.
    pub fn register_runner(&mut self, kind: &str, runner: Arc<dyn FlowRunner>) {
        self.runners.insert(kind.to_string(), runner);
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // public operations
    // -----------------------------------------------------------------------

    pub async fn create(
        &self,
        kind: &str,
        owner_entity: Uuid,
        initial_cursor: Value,
    ) -> Result<Flow> {
        if !self.runners.contains_key(kind) {
            return Err(BrokerError::InvalidInput(format!(
                "unknown flow kind: {kind}"
            )));
        }
        if self.store.entity_by_id(owner_entity).await?.is_none() {
            return Err(BrokerError::EntityNotFound(owner_entity.to_string()));
        }

        let now = chrono::Utc::now();
        let flow = Flow {
            flow_id: new_sortable_id(),
            kind: kind.to_string(),
            owner_entity,
            status: FlowStatus::Running,
            cursor: if initial_cursor.is_null() {
                json!({})
            } else {
                initial_cursor
            },
            last_event_id: None,
            created_at_utc: now,
            updated_at_utc: now,
        };
        self.store.insert_flow(&flow).await?;

        self.fabric
            .publish_logged(
                &channels::entity(owner_entity),
                events::FLOW_CREATED,
                json!({"flowId": flow.flow_id, "kind": kind}),
            )
            .await;
        Ok(flow)
    }

    pub async fn get(&self, id: Uuid) -> Result<Flow> {
        self.store
            .flow_by_id(id)
            .await?
            .ok_or(BrokerError::FlowNotFound(id))
    }

    /// Inject an external event and run the flow one step.
    pub async fn resume(&self, id: Uuid, event: &str, data: Value) -> Result<Flow> {
        let lock = self.flow_lock(id).await;
        let _guard = lock.lock().await;
        self.resume_locked(id, event, data).await
    }

    /// Re-invoke the runner without a new event.
    pub async fn tick(&self, id: Uuid) -> Result<Flow> {
        let lock = self.flow_lock(id).await;
        let _guard = lock.lock().await;
        let flow = self.load_open(id).await?;
        self.run_once(flow).await
    }

    /// Cancel the flow and cascade to every non-terminal owned request
    /// (soft-deleted rows included).
    pub async fn cancel(&self, id: Uuid) -> Result<Flow> {
        let lock = self.flow_lock(id).await;
        let _guard = lock.lock().await;

        let flow = self.load_open(id).await?;

        for request in self.store.requests_by_flow(id).await? {
            if request.status.is_terminal() {
                continue;
            }
            if let Err(e) = self.requests.cancel_for_flow(request.request_id).await {
                // a request answered in the same instant is already terminal
                if e.code() != "invalid-transition" {
                    return Err(e);
                }
            }
        }

        self.store
            .update_flow(id, FlowStatus::Cancelled, &flow.cursor, None)
            .await?;
        self.fabric
            .publish_logged(
                &channels::entity(flow.owner_entity),
                events::FLOW_UPDATED,
                json!({"flowId": id, "status": FlowStatus::Cancelled.as_str()}),
            )
            .await;
        self.get(id).await
    }

    /// Scheduler-armed suspension deadline: resume with a timeout event if
    /// the flow is still waiting.
    pub async fn timeout(&self, id: Uuid, label: Option<&str>) -> Result<()> {
        let flow = match self.get(id).await {
            Ok(f) => f,
            Err(BrokerError::FlowNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !matches!(
            flow.status,
            FlowStatus::Suspended | FlowStatus::WaitingInput
        ) {
            return Ok(());
        }
        self.resume(id, "timeout", json!({"label": label})).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // engine internals
    // -----------------------------------------------------------------------

    async fn resume_locked(&self, id: Uuid, event: &str, data: Value) -> Result<Flow> {
        let mut flow = self.load_open(id).await?;

        cursor::set_last_event(&mut flow.cursor, event, data.clone());
        if let Some(request_id) = data.get("requestId").and_then(Value::as_str) {
            if let Ok(rid) = Uuid::parse_str(request_id) {
                cursor::set_pending_status(&mut flow.cursor, rid, pending_status_for(event));
            }
        }

        // checkpoint the injected event before stepping, so a crash inside
        // the runner replays from the same observable state
        self.store
            .update_flow(id, FlowStatus::Running, &flow.cursor, Some(event))
            .await?;
        flow.status = FlowStatus::Running;
        flow.last_event_id = Some(event.to_string());

        self.run_once(flow).await
    }

    async fn load_open(&self, id: Uuid) -> Result<Flow> {
        let flow = self.get(id).await?;
        if flow.status.is_terminal() {
            return Err(BrokerError::InvalidTransition {
                id,
                state: flow.status.as_str().to_string(),
            });
        }
        Ok(flow)
    }

    /// One runner invocation plus interpretation of its outcome.
    async fn run_once(&self, flow: Flow) -> Result<Flow> {
        let runner = self
            .runners
            .get(&flow.kind)
            .cloned()
            .ok_or_else(|| BrokerError::Internal(format!("no runner for kind {}", flow.kind)))?;

        let mut ctx = StepCtx::new(&flow, &self.requests);
        let outcome = runner.run(&mut ctx).await;
        let cursor_next = ctx.into_cursor();
        let id = flow.flow_id;
        let owner = flow.owner_entity;

        match outcome {
            Ok(StepOutcome::Continue) => {
                self.store
                    .update_flow(id, FlowStatus::Running, &cursor_next, None)
                    .await?;
            }
            Ok(StepOutcome::Suspend(spec)) => {
                let status = if spec.event == events::REQUEST_ANSWERED {
                    FlowStatus::WaitingInput
                } else {
                    FlowStatus::Suspended
                };
                self.store
                    .update_flow(id, status, &cursor_next, None)
                    .await?;
                if let Some(deadline) = spec.deadline_at {
                    self.scheduler.schedule(
                        TaskKind::FlowTimeout {
                            flow_id: id,
                            label: spec.timeout_label.clone(),
                        },
                        deadline,
                    );
                }
                self.fabric
                    .publish_logged(
                        &channels::entity(owner),
                        events::FLOW_SUSPENDED,
                        json!({
                            "flowId": id,
                            "event": spec.event,
                            "requestId": spec.request_id,
                        }),
                    )
                    .await;
            }
            Ok(StepOutcome::Done) => {
                self.store
                    .update_flow(id, FlowStatus::Completed, &cursor_next, None)
                    .await?;
                self.fabric
                    .publish_logged(
                        &channels::entity(owner),
                        events::FLOW_COMPLETED,
                        json!({"flowId": id}),
                    )
                    .await;
            }
            Ok(StepOutcome::Fail(reason)) | Err(BrokerError::Internal(reason)) => {
                self.store
                    .update_flow(id, FlowStatus::Failed, &cursor_next, None)
                    .await?;
                self.fabric
                    .publish_logged(
                        &channels::entity(owner),
                        events::FLOW_FAILED,
                        json!({"flowId": id, "error": reason}),
                    )
                    .await;
            }
            Err(e) => {
                self.store
                    .update_flow(id, FlowStatus::Failed, &cursor_next, None)
                    .await?;
                self.fabric
                    .publish_logged(
                        &channels::entity(owner),
                        events::FLOW_FAILED,
                        json!({"flowId": id, "error": e.to_string()}),
                    )
                    .await;
            }
        }

        self.get(id).await
    }

    async fn flow_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut g = self.locks.lock().await;
        g.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

fn pending_status_for(event: &str) -> &'static str {
    match event {
        events::REQUEST_ANSWERED => RequestStatus::Answered.as_str(),
        events::REQUEST_CANCELLED => RequestStatus::Cancelled.as_str(),
        events::REQUEST_EXPIRED => RequestStatus::Expired.as_str(),
        _ => RequestStatus::Pending.as_str(),
    }
}

/// The request service wakes flows through this seam when a flow-bound
/// request reaches a terminal state. Errors log and stop there: the recovery
/// scan picks up anything a dropped wake left behind.
#[async_trait]
impl FlowWake for FlowService {
    async fn wake(&self, flow_id: Uuid, event: &str, data: Value) {
        match self.resume(flow_id, event, data).await {
            Ok(_) => {}
            Err(BrokerError::InvalidTransition { .. }) | Err(BrokerError::FlowNotFound(_)) => {}
            Err(e) => warn!(%flow_id, event, error = %e, "flow wake failed"),
        }
    }
}
