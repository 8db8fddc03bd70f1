//! Scenario: response files are checked against the request's policy.
//!
//! # Invariants under test
//! - An oversized or wrong-MIME file rejects the submission with
//!   file-policy-violation and no state change.
//! - A conforming file is accepted and stored on the response, with MIME
//!   inferred when absent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use pxb_db::{MemStore, Store};
use pxb_events::{EventFabric, MemEventLog};
use pxb_files::FileInput;
use pxb_requests::RequestService;
use pxb_schema::{RefAllowlist, SchemaEngine, StaticRetriever};
use pxb_schemas::{
    CreateRequestInput, Entity, EntityKind, EntityRef, FilePolicy, Identity, RequestStatus,
};
use pxb_scheduler::Scheduler;

async fn fixture() -> (Arc<RequestService>, Arc<MemStore>, Entity, Uuid) {
    let store = Arc::new(MemStore::new());
    let schema = Arc::new(SchemaEngine::new(
        RefAllowlist::default(),
        Arc::new(StaticRetriever::new()),
        16,
        Duration::from_secs(60),
    ));
    let fabric = Arc::new(EventFabric::new(Arc::new(MemEventLog::new()), 64));
    // worker not driven: these tests never rely on timers
    let (scheduler, _worker) = Scheduler::new();
    let service = Arc::new(RequestService::new(
        store.clone(),
        schema,
        fabric,
        scheduler,
        3600,
    ));

    let entity = Entity {
        entity_id: Uuid::now_v7(),
        kind: EntityKind::User,
        handle: Some("files@example.com".into()),
        metadata: json!({}),
        created_at_utc: Utc::now(),
        updated_at_utc: Utc::now(),
    };
    store.insert_entity(&entity).await.unwrap();

    let request = service
        .create(
            &Identity {
                subject: "agent:files".into(),
                entity_id: None,
            },
            CreateRequestInput {
                entity: EntityRef {
                    id: Some(entity.entity_id),
                    handle: None,
                },
                schema: json!({"type": "object"}),
                schema_kind: None,
                ui_hints: json!({}),
                prefill: json!({}),
                expires_at: None,
                deadline_at: None,
                attention_at: None,
                autocancel_grace_secs: None,
                callback_url: None,
                callback_secret: None,
                file_policy: Some(FilePolicy {
                    max_file_mb: Some(1.0),
                    max_total_mb: None,
                    mime: Some(vec!["image/*".into(), "application/pdf".into()]),
                    extensions: Some(vec!["png".into(), "pdf".into()]),
                }),
                flow_id: None,
            },
        )
        .await
        .unwrap();

    let id = request.request_id;
    (service, store, entity, id)
}

fn responder(entity: &Entity) -> Identity {
    Identity {
        subject: "responder".into(),
        entity_id: Some(entity.entity_id),
    }
}

#[tokio::test]
async fn oversized_file_is_rejected_without_state_change() {
    let (service, store, entity, id) = fixture().await;

    let err = service
        .post_response(
            id,
            &responder(&entity),
            json!({}),
            vec![FileInput {
                name: "huge.png".into(),
                url: "https://files.example.com/huge.png".into(),
                size: Some(4 * 1024 * 1024),
                mime: Some("image/png".into()),
                sha256: None,
            }],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "file-policy-violation");

    assert_eq!(
        store.request_by_id(id).await.unwrap().unwrap().status,
        RequestStatus::Pending
    );
    assert!(store.response_by_request(id).await.unwrap().is_none());
}

#[tokio::test]
async fn disallowed_mime_is_rejected() {
    let (service, _store, entity, id) = fixture().await;
    let err = service
        .post_response(
            id,
            &responder(&entity),
            json!({}),
            vec![FileInput {
                name: "movie.png".into(),
                url: "https://files.example.com/movie.png".into(),
                size: Some(10),
                mime: Some("video/mp4".into()),
                sha256: None,
            }],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "file-policy-violation");
}

#[tokio::test]
async fn conforming_file_is_stored_with_inferred_mime() {
    let (service, store, entity, id) = fixture().await;
    service
        .post_response(
            id,
            &responder(&entity),
            json!({}),
            vec![FileInput {
                name: "scan.pdf".into(),
                url: "https://files.example.com/scan.pdf".into(),
                size: Some(1024),
                mime: None,
                sha256: Some("a".repeat(64)),
            }],
        )
        .await
        .unwrap();

    let stored = store.response_by_request(id).await.unwrap().unwrap();
    assert_eq!(stored.files.len(), 1);
    assert_eq!(stored.files[0].mime, "application/pdf");
    assert_eq!(stored.files[0].size, 1024);
}
