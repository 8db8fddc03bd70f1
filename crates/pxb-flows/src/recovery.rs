//! Startup recovery for open flows.
//!
//! Re-derives each open flow's next move from the current state of the
//! requests its cursor says it is waiting on. Running it again over the same
//! state lands on the same configuration, so a crash during recovery is
//! harmless.

use serde_json::json;
use tracing::info;

use pxb_schemas::{cursor, events, FlowStatus, RequestStatus, Result};

use crate::FlowService;

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub inspected: usize,
    pub resumed: usize,
    pub ticked: usize,
    pub left_suspended: usize,
}

impl FlowService {
    /// Walk every RUNNING / SUSPENDED / WAITING_INPUT flow and either resume
    /// it (a pending request already reached a terminal state), tick it
    /// (running with nothing pending), or leave it suspended. An ANSWERED
    /// request outranks a cancelled/expired one; only one resume fires per
    /// flow per pass.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let open = self
            .store()
            .flows_by_status(&[
                FlowStatus::Running,
                FlowStatus::Suspended,
                FlowStatus::WaitingInput,
            ])
            .await?;

        let mut report = RecoveryReport {
            inspected: open.len(),
            ..Default::default()
        };

        for flow in open {
            let pending = cursor::pending(&flow.cursor);
            let waiting: Vec<_> = pending
                .iter()
                .filter(|p| {
                    p.status == RequestStatus::Pending.as_str()
                        || p.status == RequestStatus::Claimed.as_str()
                })
                .collect();

            if waiting.is_empty() {
                if flow.status == FlowStatus::Running {
                    self.tick(flow.flow_id).await?;
                    report.ticked += 1;
                } else {
                    report.left_suspended += 1;
                }
                continue;
            }

            // read the authoritative status of every awaited request
            let mut answered = None;
            let mut ended = None;
            for entry in &waiting {
                let Some(request) = self.store().request_by_id(entry.request_id).await? else {
                    continue;
                };
                match request.status {
                    RequestStatus::Answered => {
                        answered = Some(request.request_id);
                        break;
                    }
                    RequestStatus::Cancelled if ended.is_none() => {
                        ended = Some((events::REQUEST_CANCELLED, request.request_id));
                    }
                    RequestStatus::Expired if ended.is_none() => {
                        ended = Some((events::REQUEST_EXPIRED, request.request_id));
                    }
                    _ => {}
                }
            }

            if let Some(request_id) = answered {
                self.resume(
                    flow.flow_id,
                    events::REQUEST_ANSWERED,
                    json!({"requestId": request_id}),
                )
                .await?;
                report.resumed += 1;
            } else if let Some((event, request_id)) = ended {
                self.resume(flow.flow_id, event, json!({"requestId": request_id}))
                    .await?;
                report.resumed += 1;
            } else {
                report.left_suspended += 1;
            }
        }

        info!(
            inspected = report.inspected,
            resumed = report.resumed,
            ticked = report.ticked,
            left_suspended = report.left_suspended,
            "flow recovery pass complete"
        );
        Ok(report)
    }
}
