//! In-process fan-out hub.
//!
//! Holds the live subscriber set per channel behind a read-mostly lock.
//! Dispatch iterates under the read lock and pushes into bounded
//! per-subscriber queues; a full queue evicts that subscriber from every
//! channel so back-pressure never reaches the publisher. Evicted sessions
//! reconnect and resume from their last acknowledged seq.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

use pxb_schemas::EventRecord;

/// What a subscriber receives per published event.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub channel: String,
    pub seq: i64,
    pub payload: Value,
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<EventFrame>,
}

pub struct Hub {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    queue_depth: usize,
}

impl Hub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Depth sessions should use when creating their event queue.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub async fn subscribe(&self, channel: &str, id: Uuid, tx: mpsc::Sender<EventFrame>) {
        let mut g = self.subscribers.write().await;
        let subs = g.entry(channel.to_string()).or_default();
        // re-subscribing replaces the previous sender
        subs.retain(|s| s.id != id);
        subs.push(Subscriber { id, tx });
    }

    pub async fn unsubscribe(&self, channel: &str, id: Uuid) {
        let mut g = self.subscribers.write().await;
        if let Some(subs) = g.get_mut(channel) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                g.remove(channel);
            }
        }
    }

    /// Remove a subscriber from every channel (session closed or evicted).
    pub async fn unsubscribe_all(&self, id: Uuid) {
        let mut g = self.subscribers.write().await;
        g.retain(|_, subs| {
            subs.retain(|s| s.id != id);
            !subs.is_empty()
        });
    }

    /// Fan an already-persisted record out to the channel's subscribers.
    /// Returns the number of queues the frame landed in.
    pub async fn dispatch(&self, record: &EventRecord) -> usize {
        let mut delivered = 0;
        let mut evict: Vec<Uuid> = Vec::new();

        {
            let g = self.subscribers.read().await;
            let Some(subs) = g.get(&record.channel) else {
                return 0;
            };
            for sub in subs {
                let frame = EventFrame {
                    channel: record.channel.clone(),
                    seq: record.seq,
                    payload: record.payload.clone(),
                };
                match sub.tx.try_send(frame) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            channel = %record.channel,
                            subscriber = %sub.id,
                            "subscriber queue full; evicting"
                        );
                        evict.push(sub.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => evict.push(sub.id),
                }
            }
        }

        for id in evict {
            self.unsubscribe_all(id).await;
        }
        delivered
    }

    /// Channels a subscriber is currently attached to (test observability).
    pub async fn channels_of(&self, id: Uuid) -> Vec<String> {
        let g = self.subscribers.read().await;
        let mut out: Vec<String> = g
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.id == id))
            .map(|(c, _)| c.clone())
            .collect();
        out.sort();
        out
    }
}
