//! Scenario: at most one of N concurrent claimers wins.
//!
//! # Invariant under test
//! `transition_request(id, [PENDING], CLAIMED)` is an atomic conditional
//! transition: for any interleaving of concurrent callers, exactly one
//! observes `true`; the rest observe `false`.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use pxb_db::{MemStore, Store};
use pxb_schemas::{new_sortable_id, Entity, EntityKind, Request, RequestStatus, SchemaKind};

fn make_entity() -> Entity {
    Entity {
        entity_id: Uuid::now_v7(),
        kind: EntityKind::User,
        handle: Some("claimer@example.com".into()),
        metadata: json!({}),
        created_at_utc: Utc::now(),
        updated_at_utc: Utc::now(),
    }
}

fn make_request(entity_id: Uuid) -> Request {
    Request {
        request_id: new_sortable_id(),
        created_by: "agent:test".into(),
        entity_id,
        status: RequestStatus::Pending,
        schema_kind: SchemaKind::InlineSchema,
        schema: json!({"type": "object"}),
        ui_hints: json!({}),
        prefill: json!({}),
        expires_at: None,
        deadline_at: None,
        attention_at: None,
        autocancel_grace_secs: None,
        callback_url: None,
        callback_secret: None,
        file_policy: None,
        flow_id: None,
        read_at: None,
        answered_at: None,
        deleted_at: None,
        created_at_utc: Utc::now(),
        updated_at_utc: Utc::now(),
    }
}

#[tokio::test]
async fn exactly_one_of_ten_claimers_succeeds() {
    let store = MemStore::new();
    let entity = make_entity();
    store.insert_entity(&entity).await.unwrap();
    let request = make_request(entity.entity_id);
    store.insert_request(&request).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        let id = request.request_id;
        handles.push(tokio::spawn(async move {
            store
                .transition_request(id, &[RequestStatus::Pending], RequestStatus::Claimed)
                .await
                .unwrap()
        }));
    }

    let mut wins = 0;
    for h in handles {
        if h.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1, "exactly one claimer must win");

    let row = store
        .request_by_id(request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, RequestStatus::Claimed);
}

#[tokio::test]
async fn claim_on_terminal_row_is_refused() {
    let store = MemStore::new();
    let entity = make_entity();
    store.insert_entity(&entity).await.unwrap();
    let request = make_request(entity.entity_id);
    store.insert_request(&request).await.unwrap();

    assert!(store
        .transition_request(
            request.request_id,
            &[RequestStatus::Pending],
            RequestStatus::Cancelled
        )
        .await
        .unwrap());

    // Cancelled is a sink; no edge re-opens it.
    assert!(!store
        .transition_request(
            request.request_id,
            &[RequestStatus::Pending],
            RequestStatus::Claimed
        )
        .await
        .unwrap());
}
