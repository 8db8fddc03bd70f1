//! Clock-driven deferred tasks.
//!
//! The scheduler holds a min-heap of (due-at, task) pairs and fires each task
//! through the injected [`TaskHandler`] when its wall-clock time arrives.
//! Handlers re-check row state before acting, so firings are safe to repeat
//! after a crash: the state machine, not the timer, is the authority.
//!
//! Tasks already due at scheduling time follow the past-due policy:
//! notification kinds are skipped, mutation kinds run immediately.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Warn that a deadline is approaching (request still PENDING).
    DeadlineNotify { request_id: Uuid },
    /// Expire a still-PENDING request at its deadline.
    DeadlineExpire { request_id: Uuid },
    /// Cancel a still-PENDING request after the grace window.
    AutoCancel { request_id: Uuid },
    /// Surface a still-PENDING request for attention.
    Attention { request_id: Uuid },
    /// Fire a snooze reminder, then delete it.
    Reminder { reminder_id: Uuid },
    /// Resume a still-suspended flow with a timeout event.
    FlowTimeout {
        flow_id: Uuid,
        label: Option<String>,
    },
}

impl TaskKind {
    /// Notification-only tasks are skipped when their fire time has already
    /// passed; state-mutating tasks still run.
    fn is_notification(&self) -> bool {
        matches!(
            self,
            TaskKind::DeadlineNotify { .. }
                | TaskKind::Attention { .. }
                | TaskKind::Reminder { .. }
        )
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskKind) -> pxb_schemas::Result<()>;
}

struct HeapEntry {
    due: DateTime<Utc>,
    seq: u64,
    kind: TaskKind,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    // min-heap: earliest due first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

/// Cloneable scheduling handle. Dropping every handle stops the worker once
/// its queue drains.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<HeapEntry>,
}

pub struct SchedulerWorker {
    rx: mpsc::UnboundedReceiver<HeapEntry>,
}

impl Scheduler {
    pub fn new() -> (Scheduler, SchedulerWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Scheduler { tx }, SchedulerWorker { rx })
    }

    /// Enqueue a task for `due_at`. Applies the past-due policy.
    pub fn schedule(&self, kind: TaskKind, due_at: DateTime<Utc>) {
        if due_at <= Utc::now() && kind.is_notification() {
            debug!(?kind, "past-due notification skipped");
            return;
        }
        let _ = self.tx.send(HeapEntry {
            due: due_at,
            seq: 0,
            kind,
        });
    }
}

impl SchedulerWorker {
    /// Drive the heap until every [`Scheduler`] handle is dropped. Each
    /// firing runs in its own task with bounded-backoff retry.
    pub async fn run(mut self, handler: Arc<dyn TaskHandler>) {
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        let mut seq: u64 = 0;
        let mut open = true;

        loop {
            // fire everything due
            while heap
                .peek()
                .map(|e| e.due <= Utc::now())
                .unwrap_or(false)
            {
                let entry = heap.pop().expect("peeked entry exists");
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    fire_with_retry(handler, entry.kind).await;
                });
            }

            if !open && heap.is_empty() {
                return;
            }

            let wait = heap
                .peek()
                .map(|e| {
                    (e.due - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                })
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                incoming = self.rx.recv(), if open => match incoming {
                    Some(mut entry) => {
                        seq += 1;
                        entry.seq = seq;
                        heap.push(entry);
                    }
                    None => open = false,
                },
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Bounded exponential backoff; after the last attempt the task is abandoned
/// and the row's own state machine covers correctness.
async fn fire_with_retry(handler: Arc<dyn TaskHandler>, kind: TaskKind) {
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=ATTEMPTS {
        match handler.handle(&kind).await {
            Ok(()) => return,
            Err(e) if attempt == ATTEMPTS => {
                warn!(?kind, error = %e, "scheduled task abandoned after retries");
            }
            Err(e) => {
                debug!(?kind, attempt, error = %e, "scheduled task retry");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}
