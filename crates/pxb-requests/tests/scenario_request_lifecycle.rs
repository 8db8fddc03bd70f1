//! Scenario: the request state machine end to end at the service level.
//!
//! # Invariants under test
//! - Happy path: create → claim → postResponse, with the three events on the
//!   entity channel in seq order 1, 2, 3.
//! - A payload failing the schema leaves the row CLAIMED and writes nothing.
//! - Exactly one of ten concurrent claimers wins; one claimed event total.
//! - Replaying a terminal-producing action reports invalid-transition with no
//!   side effects.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use pxb_db::{MemStore, Store};
use pxb_events::{EventFabric, MemEventLog};
use pxb_requests::RequestService;
use pxb_schema::{RefAllowlist, SchemaEngine, StaticRetriever};
use pxb_schemas::{
    channels, CreateRequestInput, Entity, EntityKind, EntityRef, Identity, RequestStatus,
};
use pxb_scheduler::Scheduler;

struct Fixture {
    service: Arc<RequestService>,
    store: Arc<MemStore>,
    fabric: Arc<EventFabric>,
    // keeps the scheduler queue alive; tests here never run the worker
    _worker: pxb_scheduler::SchedulerWorker,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemStore::new());
    let schema = Arc::new(SchemaEngine::new(
        RefAllowlist::default(),
        Arc::new(StaticRetriever::new()),
        16,
        Duration::from_secs(60),
    ));
    let fabric = Arc::new(EventFabric::new(Arc::new(MemEventLog::new()), 64));
    let (scheduler, worker) = Scheduler::new();
    let service = Arc::new(RequestService::new(
        store.clone(),
        schema,
        fabric.clone(),
        scheduler,
        3600,
    ));
    Fixture {
        service,
        store,
        fabric,
        _worker: worker,
    }
}

async fn seed_entity(store: &MemStore, handle: &str) -> Entity {
    let entity = Entity {
        entity_id: Uuid::now_v7(),
        kind: EntityKind::User,
        handle: Some(handle.to_string()),
        metadata: json!({}),
        created_at_utc: Utc::now(),
        updated_at_utc: Utc::now(),
    };
    store.insert_entity(&entity).await.unwrap();
    entity
}

fn requestor() -> Identity {
    Identity {
        subject: "agent:alpha".into(),
        entity_id: None,
    }
}

fn name_schema_input(handle: &str) -> CreateRequestInput {
    CreateRequestInput {
        entity: EntityRef {
            id: None,
            handle: Some(handle.to_string()),
        },
        schema: json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        }),
        schema_kind: None,
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
    }
}

#[tokio::test]
async fn happy_path_create_claim_answer() {
    let fx = fixture();
    let entity = seed_entity(&fx.store, "alice@example.com").await;

    let request = fx
        .service
        .create(&requestor(), name_schema_input("alice@example.com"))
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.entity_id, entity.entity_id);

    let claimed = fx.service.claim(request.request_id).await.unwrap();
    assert_eq!(claimed.status, RequestStatus::Claimed);

    let response = fx
        .service
        .post_response(
            request.request_id,
            &Identity {
                subject: "alice".into(),
                entity_id: Some(entity.entity_id),
            },
            json!({"name": "Alice"}),
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(response.request_id, request.request_id);

    let answered = fx.service.get(request.request_id).await.unwrap();
    assert_eq!(answered.status, RequestStatus::Answered);
    assert!(answered.answered_at.is_some());

    // entity channel carries created(1), claimed(2), answered(3)
    let events = fx
        .fabric
        .replay(&channels::entity(entity.entity_id), 0, 100)
        .await
        .unwrap();
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| e.payload["kind"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec!["request.created", "request.claimed", "request.answered"]
    );
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn schema_violation_leaves_row_claimed_and_writes_nothing() {
    let fx = fixture();
    let entity = seed_entity(&fx.store, "bob@example.com").await;

    let request = fx
        .service
        .create(&requestor(), name_schema_input("bob@example.com"))
        .await
        .unwrap();
    fx.service.claim(request.request_id).await.unwrap();

    let err = fx
        .service
        .post_response(
            request.request_id,
            &Identity {
                subject: "bob".into(),
                entity_id: Some(entity.entity_id),
            },
            json!({}),
            vec![],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "schema-violation");

    let row = fx.service.get(request.request_id).await.unwrap();
    assert_eq!(row.status, RequestStatus::Claimed);
    assert!(fx
        .store
        .response_by_request(request.request_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn concurrent_claims_admit_one_winner() {
    let fx = fixture();
    seed_entity(&fx.store, "carol@example.com").await;
    let request = fx
        .service
        .create(&requestor(), name_schema_input("carol@example.com"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let service = fx.service.clone();
        let id = request.request_id;
        handles.push(tokio::spawn(async move { service.claim(id).await }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => {
                assert_eq!(e.code(), "claim-conflict");
                conflicts += 1;
            }
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 9);

    // exactly one claimed event on the request channel
    let events = fx
        .fabric
        .replay(&channels::request(request.request_id), 0, 100)
        .await
        .unwrap();
    let claimed = events
        .iter()
        .filter(|e| e.payload["kind"] == json!("request.claimed"))
        .count();
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn terminal_replay_reports_invalid_transition() {
    let fx = fixture();
    let entity = seed_entity(&fx.store, "dave@example.com").await;
    let request = fx
        .service
        .create(&requestor(), name_schema_input("dave@example.com"))
        .await
        .unwrap();

    fx.service.cancel(request.request_id).await.unwrap();

    let err = fx.service.cancel(request.request_id).await.unwrap_err();
    assert_eq!(err.code(), "invalid-transition");

    let err = fx
        .service
        .post_response(
            request.request_id,
            &Identity {
                subject: "dave".into(),
                entity_id: Some(entity.entity_id),
            },
            json!({"name": "Dave"}),
            vec![],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid-transition");

    let err = fx.service.claim(request.request_id).await.unwrap_err();
    assert_eq!(err.code(), "claim-conflict");

    // exactly one cancelled event despite the replays
    let events = fx
        .fabric
        .replay(&channels::request(request.request_id), 0, 100)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["kind"], json!("request.cancelled"));
}

#[tokio::test]
async fn entity_resolution_failures() {
    let fx = fixture();
    let err = fx
        .service
        .create(&requestor(), name_schema_input("missing@example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "entity-not-found");

    let mut both = name_schema_input("x@example.com");
    both.entity.id = Some(Uuid::now_v7());
    let err = fx.service.create(&requestor(), both).await.unwrap_err();
    assert_eq!(err.code(), "invalid-input");
}

#[tokio::test]
async fn inbox_operations() {
    let fx = fixture();
    let entity = seed_entity(&fx.store, "erin@example.com").await;
    let request = fx
        .service
        .create(&requestor(), name_schema_input("erin@example.com"))
        .await
        .unwrap();

    let read = fx.service.mark_read(request.request_id).await.unwrap();
    assert!(read.read_at.is_some());

    let reminder = fx
        .service
        .snooze(request.request_id, Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(reminder.entity_id, entity.entity_id);
    assert_eq!(fx.store.open_reminders().await.unwrap().len(), 1);

    fx.service.soft_delete(request.request_id).await.unwrap();
    let err = fx.service.get(request.request_id).await.unwrap_err();
    assert_eq!(err.code(), "request-not-found");
    // the row itself survives for audit
    assert!(fx
        .store
        .request_by_id(request.request_id)
        .await
        .unwrap()
        .unwrap()
        .deleted_at
        .is_some());

    // cancelling the soft-deleted row still works and clears reminders
    fx.service.cancel(request.request_id).await.unwrap();
    assert!(fx.store.open_reminders().await.unwrap().is_empty());
}
