//! The runner seam: per-kind step logic dispatched by the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use pxb_requests::RequestService;
use pxb_schemas::{
    cursor, events, CreateRequestInput, Flow, Identity, Request, Result,
};

/// What a suspending step is waiting for.
#[derive(Debug, Clone)]
pub struct SuspendSpec {
    /// Event kind that resumes the flow (e.g. `request.answered`).
    pub event: String,
    pub request_id: Option<Uuid>,
    /// When set, a timeout task resumes the flow at this time.
    pub deadline_at: Option<DateTime<Utc>>,
    pub timeout_label: Option<String>,
}

/// Exactly one of these comes back from each runner invocation.
#[derive(Debug)]
pub enum StepOutcome {
    /// Persist the cursor; the flow stays RUNNING until a later tick/resume.
    Continue,
    /// Persist the cursor and suspend awaiting an external event.
    Suspend(SuspendSpec),
    /// Terminal success.
    Done,
    /// Terminal failure with a reason.
    Fail(String),
}

/// Mutable step context handed to the runner. The cursor edits made here are
/// persisted by the engine together with the resulting status, never earlier.
pub struct StepCtx<'a> {
    flow: &'a Flow,
    cursor: Value,
    requests: &'a RequestService,
}

impl<'a> StepCtx<'a> {
    pub(crate) fn new(flow: &'a Flow, requests: &'a RequestService) -> Self {
        Self {
            cursor: flow.cursor.clone(),
            flow,
            requests,
        }
    }

    pub fn flow(&self) -> &Flow {
        self.flow
    }

    pub fn step(&self) -> Option<&str> {
        cursor::step(&self.cursor)
    }

    pub fn set_step(&mut self, step: &str) {
        cursor::set_step(&mut self.cursor, step);
    }

    pub fn cursor(&self) -> &Value {
        &self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut Value {
        &mut self.cursor
    }

    /// The event injected by the `resume` that triggered this invocation.
    pub fn last_event(&self) -> Option<(String, Value)> {
        cursor::last_event(&self.cursor)
    }

    /// Create an inquiry owned by this flow and record it under
    /// `cursor.pending`. Returns the suspend descriptor to hand back from
    /// the step.
    pub async fn await_input(&mut self, mut input: CreateRequestInput) -> Result<SuspendSpec> {
        input.flow_id = Some(self.flow.flow_id);
        let deadline_at = input.deadline_at;
        let request: Request = self
            .requests
            .create(
                &Identity {
                    subject: format!("flow:{}", self.flow.flow_id),
                    entity_id: None,
                },
                input,
            )
            .await?;
        cursor::push_pending(
            &mut self.cursor,
            &cursor::PendingInput {
                request_id: request.request_id,
                input_type: "request".to_string(),
                status: "PENDING".to_string(),
            },
        );
        Ok(SuspendSpec {
            event: events::REQUEST_ANSWERED.to_string(),
            request_id: Some(request.request_id),
            deadline_at,
            timeout_label: None,
        })
    }

    pub(crate) fn into_cursor(self) -> Value {
        self.cursor
    }
}

#[async_trait]
pub trait FlowRunner: Send + Sync {
    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<StepOutcome>;
}

/// Built-in trivial runner: a fresh flow completes on its first invocation.
pub struct BasicRunner;

#[async_trait]
impl FlowRunner for BasicRunner {
    async fn run(&self, ctx: &mut StepCtx<'_>) -> Result<StepOutcome> {
        match ctx.step() {
            None | Some("init") => {
                ctx.set_step("done");
                Ok(StepOutcome::Done)
            }
            Some(_) => Ok(StepOutcome::Done),
        }
    }
}
