//! Scheduler task dispatch into the services.
//!
//! Every branch re-checks row state via the service it calls, which is what
//! makes at-least-once firing safe.

use std::sync::Arc;

use async_trait::async_trait;

use pxb_flows::FlowService;
use pxb_requests::RequestService;
use pxb_schemas::Result;
use pxb_scheduler::{TaskHandler, TaskKind};

pub struct BrokerTaskHandler {
    requests: Arc<RequestService>,
    flows: Arc<FlowService>,
}

impl BrokerTaskHandler {
    pub fn new(requests: Arc<RequestService>, flows: Arc<FlowService>) -> Self {
        Self { requests, flows }
    }
}

#[async_trait]
impl TaskHandler for BrokerTaskHandler {
    async fn handle(&self, task: &TaskKind) -> Result<()> {
        match task {
            TaskKind::DeadlineNotify { request_id } => {
                self.requests.deadline_notify(*request_id).await
            }
            TaskKind::DeadlineExpire { request_id } => {
                self.requests.expire(*request_id).await.map(|_| ())
            }
            TaskKind::AutoCancel { request_id } => {
                self.requests.auto_cancel(*request_id).await.map(|_| ())
            }
            TaskKind::Attention { request_id } => {
                self.requests.needs_attention(*request_id).await
            }
            TaskKind::Reminder { reminder_id } => self.requests.fire_reminder(*reminder_id).await,
            TaskKind::FlowTimeout { flow_id, label } => {
                self.flows.timeout(*flow_id, label.as_deref()).await
            }
        }
    }
}
