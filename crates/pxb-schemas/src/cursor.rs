//! Helpers over the opaque flow cursor.
//!
//! The cursor stays schemaless for forward compatibility across runner
//! versions; these helpers read/write the conventional fields (`step`,
//! `pending`, `lastEvent`) and leave everything else untouched.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// One entry of `cursor.pending`: an input the flow is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInput {
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    #[serde(rename = "type")]
    pub input_type: String,
    pub status: String,
}

pub fn step(cursor: &Value) -> Option<&str> {
    cursor.get("step").and_then(Value::as_str)
}

pub fn set_step(cursor: &mut Value, step: &str) {
    ensure_object(cursor);
    cursor["step"] = json!(step);
}

pub fn pending(cursor: &Value) -> Vec<PendingInput> {
    cursor
        .get("pending")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub fn push_pending(cursor: &mut Value, entry: &PendingInput) {
    ensure_object(cursor);
    let arr = cursor
        .as_object_mut()
        .expect("cursor is an object")
        .entry("pending")
        .or_insert_with(|| json!([]));
    if let Some(items) = arr.as_array_mut() {
        items.push(json!(entry));
    }
}

/// Update the recorded status of one pending entry; unknown IDs are ignored.
pub fn set_pending_status(cursor: &mut Value, request_id: Uuid, status: &str) {
    let id = request_id.to_string();
    if let Some(items) = cursor.get_mut("pending").and_then(Value::as_array_mut) {
        for item in items {
            if item.get("requestId").and_then(Value::as_str) == Some(id.as_str()) {
                item["status"] = json!(status);
            }
        }
    }
}

pub fn clear_pending(cursor: &mut Value) {
    if let Some(obj) = cursor.as_object_mut() {
        obj.remove("pending");
    }
}

pub fn last_event(cursor: &Value) -> Option<(String, Value)> {
    let ev = cursor.get("lastEvent")?;
    let kind = ev.get("type")?.as_str()?.to_string();
    let data = ev.get("data").cloned().unwrap_or(Value::Null);
    Some((kind, data))
}

pub fn set_last_event(cursor: &mut Value, kind: &str, data: Value) {
    ensure_object(cursor);
    cursor["lastEvent"] = json!({"type": kind, "data": data});
}

fn ensure_object(cursor: &mut Value) {
    if !cursor.is_object() {
        *cursor = json!({});
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_and_last_event_round_trip() {
        let mut c = json!({"step": "init", "custom": 42});
        assert_eq!(step(&c), Some("init"));

        set_step(&mut c, "await-address");
        set_last_event(&mut c, "request.answered", json!({"requestId": "r1"}));

        assert_eq!(step(&c), Some("await-address"));
        let (kind, data) = last_event(&c).unwrap();
        assert_eq!(kind, "request.answered");
        assert_eq!(data["requestId"], json!("r1"));
        // passthrough fields survive
        assert_eq!(c["custom"], json!(42));
    }

    #[test]
    fn pending_tracking() {
        let mut c = json!({});
        let rid = Uuid::now_v7();
        push_pending(
            &mut c,
            &PendingInput {
                request_id: rid,
                input_type: "request".into(),
                status: "PENDING".into(),
            },
        );
        assert_eq!(pending(&c).len(), 1);

        set_pending_status(&mut c, rid, "ANSWERED");
        assert_eq!(pending(&c)[0].status, "ANSWERED");

        clear_pending(&mut c);
        assert!(pending(&c).is_empty());
    }

    #[test]
    fn non_object_cursor_is_replaced_on_write() {
        let mut c = Value::Null;
        set_step(&mut c, "init");
        assert_eq!(step(&c), Some("init"));
    }
}
