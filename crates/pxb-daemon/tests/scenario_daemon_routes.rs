//! Scenario: the stateless HTTP surface end to end, in process.
//!
//! # Invariants under test
//! - `/healthz` needs no credentials; everything else returns 401 without
//!   them.
//! - Creates return 201, reads 200, claim conflict 409, schema violation
//!   422, missing resources 404, all with the `{error, code, message}` body.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use pxb_daemon::{routes::build_router, state::AppState};
use pxb_testkit::TestBroker;

struct Harness {
    app: axum::Router,
    _tb: TestBroker,
    entity_id: uuid::Uuid,
}

async fn harness() -> Harness {
    let tb = TestBroker::new();
    let user = tb.seed_user("routes@example.com").await;
    let app = build_router(AppState::new(Arc::clone(&tb.broker)));
    Harness {
        app,
        entity_id: user.entity_id,
        _tb: tb,
    }
}

fn authed(req: Request<Body>, entity: uuid::Uuid) -> Request<Body> {
    let (mut parts, body) = req.into_parts();
    parts
        .headers
        .insert("x-pxbox-entity", entity.to_string().parse().unwrap());
    Request::from_parts(parts, body)
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn healthz_is_public() {
    let h = harness().await;
    let resp = h
        .app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["service"], json!("pxbox"));
}

#[tokio::test]
async fn missing_credentials_are_unauthorized() {
    let h = harness().await;
    let resp = h
        .app
        .oneshot(Request::get("/inquiries").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["code"], json!("unauthorized"));
}

#[tokio::test]
async fn request_lifecycle_over_http() {
    let h = harness().await;

    // create
    let resp = h
        .app
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                "/requests",
                json!({
                    "entity": {"handle": "routes@example.com"},
                    "schema": {
                        "type": "object",
                        "properties": {"name": {"type": "string"}},
                        "required": ["name"]
                    }
                }),
            ),
            h.entity_id,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let request = body_json(resp).await;
    assert_eq!(request["status"], json!("PENDING"));
    let id = request["requestId"].as_str().unwrap().to_string();

    // claim
    let resp = h
        .app
        .clone()
        .oneshot(authed(
            json_request("POST", &format!("/requests/{id}/claim"), json!({})),
            h.entity_id,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["status"], json!("CLAIMED"));

    // second claim conflicts
    let resp = h
        .app
        .clone()
        .oneshot(authed(
            json_request("POST", &format!("/requests/{id}/claim"), json!({})),
            h.entity_id,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(resp).await["code"], json!("claim-conflict"));

    // schema violation
    let resp = h
        .app
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                &format!("/requests/{id}/response"),
                json!({"payload": {}}),
            ),
            h.entity_id,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(resp).await["code"], json!("schema-violation"));

    // valid response
    let resp = h
        .app
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                &format!("/requests/{id}/response"),
                json!({"payload": {"name": "Alice"}}),
            ),
            h.entity_id,
        ))
        .await
        .unwrap();
    assert!(resp.status().is_success());

    // read back
    let resp = h
        .app
        .clone()
        .oneshot(authed(
            Request::get(format!("/requests/{id}"))
                .body(Body::empty())
                .unwrap(),
            h.entity_id,
        ))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["status"], json!("ANSWERED"));

    // stored response is readable
    let resp = h
        .app
        .clone()
        .oneshot(authed(
            Request::get(format!("/requests/{id}/response"))
                .body(Body::empty())
                .unwrap(),
            h.entity_id,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["payload"]["name"], json!("Alice"));
}

#[tokio::test]
async fn missing_resources_are_404() {
    let h = harness().await;
    let ghost = uuid::Uuid::now_v7();

    for uri in [
        format!("/requests/{ghost}"),
        format!("/entities/{ghost}"),
        format!("/flows/{ghost}"),
    ] {
        let resp = h
            .app
            .clone()
            .oneshot(authed(
                Request::get(uri.as_str()).body(Body::empty()).unwrap(),
                h.entity_id,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn entity_queue_and_inquiries_listing() {
    let h = harness().await;

    for _ in 0..3 {
        let resp = h
            .app
            .clone()
            .oneshot(authed(
                json_request(
                    "POST",
                    "/requests",
                    json!({
                        "entity": {"id": h.entity_id},
                        "schema": {"type": "object"}
                    }),
                ),
                h.entity_id,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    let resp = h
        .app
        .clone()
        .oneshot(authed(
            Request::get(format!("/entities/{}/queue", h.entity_id))
                .body(Body::empty())
                .unwrap(),
            h.entity_id,
        ))
        .await
        .unwrap();
    let queue = body_json(resp).await;
    assert_eq!(queue.as_array().unwrap().len(), 3);

    let resp = h
        .app
        .clone()
        .oneshot(authed(
            Request::get(format!(
                "/inquiries?entity={}&status=PENDING&limit=2",
                h.entity_id
            ))
            .body(Body::empty())
            .unwrap(),
            h.entity_id,
        ))
        .await
        .unwrap();
    let page = body_json(resp).await;
    assert_eq!(page.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn file_sign_respects_policy() {
    let h = harness().await;

    let resp = h
        .app
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                "/requests",
                json!({
                    "entity": {"id": h.entity_id},
                    "schema": {"type": "object"},
                    "filePolicy": {"extensions": ["pdf"]}
                }),
            ),
            h.entity_id,
        ))
        .await
        .unwrap();
    let id = body_json(resp).await["requestId"]
        .as_str()
        .unwrap()
        .to_string();

    let resp = h
        .app
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                "/files/sign",
                json!({"requestId": id, "name": "scan.pdf"}),
            ),
            h.entity_id,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let ticket = body_json(resp).await;
    assert!(ticket["putUrl"].as_str().unwrap().contains("scan.pdf"));
    assert!(ticket["getUrl"].as_str().unwrap().contains("op=get"));

    let resp = h
        .app
        .clone()
        .oneshot(authed(
            json_request(
                "POST",
                "/files/sign",
                json!({"requestId": id, "name": "malware.exe"}),
            ),
            h.entity_id,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(resp).await["code"],
        json!("file-policy-violation")
    );
}
