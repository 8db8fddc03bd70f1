//! Scenario: time-driven request milestones.
//!
//! # Invariants under test
//! - A request whose deadline passes becomes EXPIRED and emits
//!   `request.expired`; answering afterwards is invalid-transition.
//! - Expiry and auto-cancel only ever act on PENDING rows.
//! - Firing a scheduled task twice produces the same post-state as once.
//! - A fired reminder emits `request.reminder` and deletes itself.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use pxb_db::Store;
use pxb_schemas::{channels, Identity, RequestStatus};
use pxb_testkit::{name_request, TestBroker};

#[tokio::test]
async fn deadline_expires_pending_request() {
    let tb = TestBroker::new();
    let user = tb.seed_user("expiry@example.com").await;

    let mut input = name_request("expiry@example.com");
    input.deadline_at = Some(Utc::now() + chrono::Duration::milliseconds(50));
    let request = tb
        .broker
        .requests
        .create(&tb.requestor(), input)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let row = tb.broker.requests.get(request.request_id).await.unwrap();
    assert_eq!(row.status, RequestStatus::Expired);

    let events = tb
        .broker
        .fabric
        .replay(&channels::request(request.request_id), 0, 100)
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.payload["kind"] == json!("request.expired")));

    let err = tb
        .broker
        .requests
        .post_response(
            request.request_id,
            &Identity {
                subject: "late".into(),
                entity_id: Some(user.entity_id),
            },
            json!({"name": "Too Late"}),
            vec![],
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid-transition");
}

#[tokio::test]
async fn claimed_request_does_not_expire_or_autocancel() {
    let tb = TestBroker::new();
    tb.seed_user("claimed@example.com").await;

    let mut input = name_request("claimed@example.com");
    input.deadline_at = Some(Utc::now() + chrono::Duration::milliseconds(50));
    input.autocancel_grace_secs = Some(0);
    let request = tb
        .broker
        .requests
        .create(&tb.requestor(), input)
        .await
        .unwrap();

    tb.broker.requests.claim(request.request_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let row = tb.broker.requests.get(request.request_id).await.unwrap();
    assert_eq!(
        row.status,
        RequestStatus::Claimed,
        "deadline tasks only act on PENDING rows"
    );
}

#[tokio::test]
async fn autocancel_fires_after_grace() {
    let tb = TestBroker::new();
    tb.seed_user("grace@example.com").await;

    let mut input = name_request("grace@example.com");
    input.deadline_at = Some(Utc::now() + chrono::Duration::milliseconds(30));
    input.autocancel_grace_secs = Some(0);
    let request = tb
        .broker
        .requests
        .create(&tb.requestor(), input)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let row = tb.broker.requests.get(request.request_id).await.unwrap();
    // expire fires at the deadline and wins; auto-cancel then finds a
    // non-PENDING row and leaves it alone
    assert_eq!(row.status, RequestStatus::Expired);
}

#[tokio::test]
async fn firing_twice_equals_firing_once() {
    let tb = TestBroker::new();
    tb.seed_user("twice@example.com").await;

    let request = tb
        .broker
        .requests
        .create(&tb.requestor(), name_request("twice@example.com"))
        .await
        .unwrap();

    assert!(tb.broker.requests.expire(request.request_id).await.unwrap());
    assert!(!tb.broker.requests.expire(request.request_id).await.unwrap());

    let events = tb
        .broker
        .fabric
        .replay(&channels::request(request.request_id), 0, 100)
        .await
        .unwrap();
    let expired = events
        .iter()
        .filter(|e| e.payload["kind"] == json!("request.expired"))
        .count();
    assert_eq!(expired, 1);
}

#[tokio::test]
async fn reminder_fires_and_deletes_itself() {
    let tb = TestBroker::new();
    let user = tb.seed_user("remind@example.com").await;

    let request = tb
        .broker
        .requests
        .create(&tb.requestor(), name_request("remind@example.com"))
        .await
        .unwrap();

    let reminder = tb
        .broker
        .requests
        .snooze(
            request.request_id,
            Utc::now() + chrono::Duration::milliseconds(50),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let events = tb
        .broker
        .fabric
        .replay(&channels::entity(user.entity_id), 0, 100)
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.payload["kind"] == json!("request.reminder")));
    assert!(tb
        .store
        .reminder_by_id(reminder.reminder_id)
        .await
        .unwrap()
        .is_none());
}
