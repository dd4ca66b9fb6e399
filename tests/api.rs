//! HTTP API tests
//!
//! Requests go through the full router (extractors, layers, error mapping)
//! with in-memory storage and ledger behind the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use content_anchor::anchor::{AnchorOrchestrator, OrchestratorConfig, RetryPolicy};
use content_anchor::crypto::hash;
use content_anchor::ledger::memory::InMemoryLedger;
use content_anchor::server::{build_app, AppState};
use content_anchor::storage::memory::InMemoryStore;

const OWNER: &str = "0x00000000000000000000000000000000000000ab";
const BOUNDARY: &str = "anchor-test-boundary";

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
    ledger: Arc<InMemoryLedger>,
}

fn test_app_with(confirmation_timeout: Duration) -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let orchestrator = Arc::new(AnchorOrchestrator::new(
        store.clone(),
        ledger.clone(),
        OrchestratorConfig {
            confirmation_timeout,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        },
    ));

    TestApp {
        router: build_app(AppState { orchestrator }, 1024 * 1024),
        store,
        ledger,
    }
}

fn test_app() -> TestApp {
    test_app_with(Duration::from_secs(5))
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn post_form(&self, uri: &str, body: Vec<u8>) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }
}

/// Build a multipart body from text fields and an optional file.
fn form(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((filename, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

#[tokio::test]
async fn test_ping_and_health() {
    let app = test_app();

    let (status, _) = app
        .send(
            Request::builder()
                .method(Method::HEAD)
                .uri("/ping")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_mint_then_read_token() {
    let app = test_app();

    let (status, body) = app
        .post_json("/mint", json!({"to": OWNER, "metadataUri": "ipfs://Qm123"}))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["tokenId"], "1");
    assert_eq!(body["metadataUri"], "ipfs://Qm123");
    assert!(body["txHash"].as_str().unwrap().starts_with("0x"));
    assert!(body.get("imageCid").is_none());

    let (status, body) = app.get("/token/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"success": true, "tokenId": "1", "uri": "ipfs://Qm123"})
    );
}

#[tokio::test]
async fn test_evolve_existing_token() {
    let app = test_app();
    app.post_json("/mint", json!({"to": OWNER, "metadataUri": "ipfs://Qm123"}))
        .await;

    let (status, body) = app
        .post_json("/evolve/1", json!({"metadataUri": "ipfs://Qm999"}))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["tokenId"], "1");
    assert_eq!(body["metadataUri"], "ipfs://Qm999");

    let (_, body) = app.get("/token/1").await;
    assert_eq!(body["uri"], "ipfs://Qm999");

    let stored = app
        .ledger
        .record(content_anchor::anchor::RecordId::from(1u64))
        .await
        .unwrap();
    assert_eq!(stored.commitment, hash::bind("ipfs://Qm999"));
}

#[tokio::test]
async fn test_mint_missing_fields() {
    let app = test_app();

    let (status, body) = app.post_json("/mint", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "to and metadataUri are required");
    assert_eq!(body["success"], false);

    let (status, _) = app
        .post_json("/mint", json!({"to": "  ", "metadataUri": "ipfs://Qm1"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.ledger.submission_count().await, 0);
}

#[tokio::test]
async fn test_mint_rejects_malformed_input() {
    let app = test_app();

    let (status, _) = app
        .post_json("/mint", json!({"to": "0x1234", "metadataUri": "ipfs://Qm1"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post_json("/mint", json!({"to": OWNER, "metadataUri": "Qm1"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .send(
            Request::post("/mint")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.ledger.submission_count().await, 0);
}

#[tokio::test]
async fn test_evolve_validation() {
    let app = test_app();

    let (status, body) = app.post_json("/evolve/1", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "metadataUri is required");

    let (status, _) = app
        .post_json("/evolve/abc", json!({"metadataUri": "ipfs://Qm1"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post_json("/evolve/7", json!({"metadataUri": "ipfs://Qm1"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.ledger.submission_count().await, 0);
}

#[tokio::test]
async fn test_token_lookup_errors() {
    let app = test_app();

    let (status, body) = app.get("/token/42").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = app.get("/token/-1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_confirmation_timeout_returns_tx_hash() {
    let app = test_app_with(Duration::from_millis(100));
    app.ledger.set_withhold_receipts(true).await;

    let (status, body) = app
        .post_json("/mint", json!({"to": OWNER, "metadataUri": "ipfs://QmSlow"}))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
    let tx_hash = body["txHash"].as_str().unwrap().to_string();

    let (status, body) = app.get(&format!("/tx/{tx_hash}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");

    app.ledger.set_withhold_receipts(false).await;
    let (_, body) = app.get(&format!("/tx/{tx_hash}")).await;
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["tokenId"], "1");
}

#[tokio::test]
async fn test_reverted_mint_reports_tx_hash() {
    let app = test_app();
    app.ledger.set_fail_execution(true).await;

    let (status, body) = app
        .post_json("/mint", json!({"to": OWNER, "metadataUri": "ipfs://QmRejected"}))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    let tx_hash = body["txHash"].as_str().unwrap().to_string();

    let (status, body) = app.get(&format!("/tx/{tx_hash}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "reverted");
}

#[tokio::test]
async fn test_tx_lookup_rejects_bad_hash() {
    let app = test_app();

    let (status, _) = app.get("/tx/0x1234").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_image() {
    let app = test_app();

    let body = form(
        &[
            ("name", "Sprout"),
            ("description", "Stage 1"),
            ("attributes", r#"[{"trait_type":"stage","value":1}]"#),
        ],
        Some(("sprout.png", b"\x89PNG sprout")),
    );
    let (status, body) = app.post_form("/upload-image", body).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);

    let image_cid = body["imageCid"].as_str().unwrap();
    let metadata_cid = body["metadataCid"].as_str().unwrap();
    assert_eq!(body["metadataUri"], format!("ipfs://{metadata_cid}"));
    assert_eq!(body["metadata"]["image"], format!("ipfs://{image_cid}"));
    assert_eq!(body["metadata"]["attributes"][0]["value"], 1);

    let stored = app.store.get_json(metadata_cid).await.unwrap();
    assert_eq!(stored["name"], "Sprout");
    assert_eq!(app.ledger.submission_count().await, 0);
}

#[tokio::test]
async fn test_upload_image_requires_file() {
    let app = test_app();

    let (status, body) = app
        .post_form("/upload-image", form(&[("name", "Sprout")], None))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "file is required");
    assert_eq!(app.store.attempt_count().await, 0);
}

#[tokio::test]
async fn test_mint_image() {
    let app = test_app();

    let body = form(
        &[("to", OWNER), ("name", "Sprout")],
        Some(("sprout.png", b"\x89PNG sprout")),
    );
    let (status, body) = app.post_form("/mint-image", body).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["tokenId"], "1");

    let metadata_cid = body["metadataCid"].as_str().unwrap();
    assert_eq!(body["metadataUri"], format!("ipfs://{metadata_cid}"));

    let (_, token) = app.get("/token/1").await;
    assert_eq!(token["uri"], body["metadataUri"]);
}

#[tokio::test]
async fn test_mint_image_requires_recipient() {
    let app = test_app();

    let body = form(&[("name", "Sprout")], Some(("sprout.png", b"png")));
    let (status, body) = app.post_form("/mint-image", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "to is required");
    assert_eq!(app.store.attempt_count().await, 0);
}
