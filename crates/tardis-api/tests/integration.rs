//! Integration tests: incidents, keys, consent, vault, quota and the LLM fallback route.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tardis_api::config::TardisConfig;
use tardis_api::server::{self, AppState};
use tardis_llm::{FallbackManager, FallbackStrategy, MockProvider};
use tower::util::ServiceExt;

struct Harness {
    app: axum::Router,
    primary: Arc<MockProvider>,
    backup: Arc<MockProvider>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TardisConfig {
        data_dir: dir.path().to_path_buf(),
        master_key: Some(STANDARD.encode([7u8; 32])),
        ..Default::default()
    };
    let primary = Arc::new(MockProvider::new("together"));
    let backup = Arc::new(MockProvider::new("backup"));
    let llm = FallbackManager::new(primary.clone())
        .with_provider(backup.clone())
        .with_strategies(vec![
            FallbackStrategy::AlternateModel {
                model: "small".to_string(),
            },
            FallbackStrategy::AlternateProvider {
                provider: "backup".to_string(),
                model: None,
            },
        ]);
    let state = Arc::new(AppState::open(&cfg, llm).await.unwrap());
    Harness {
        app: server::router(state),
        primary,
        backup,
        _dir: dir,
    }
}

async fn open_app(cfg: &TardisConfig) -> axum::Router {
    let llm = FallbackManager::new(Arc::new(MockProvider::new("together")));
    server::router(Arc::new(AppState::open(cfg, llm).await.unwrap()))
}

async fn post(app: &axum::Router, uri: &str, body: Value) -> Value {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

async fn get(app: &axum::Router, uri: &str) -> Value {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health() {
    let h = harness().await;
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let res = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn incident_lifecycle() {
    let h = harness().await;
    let j = post(
        &h.app,
        "/incidents/create",
        json!({
            "actor": "alice",
            "incident": { "title": "Phishing wave", "owner": "alice", "severity": "high", "tags": ["email"] }
        }),
    )
    .await;
    assert_eq!(j["code"], 200);
    let id = j["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(j["data"]["status"], "open");

    let j = post(
        &h.app,
        "/incidents/status",
        json!({ "id": id, "actor": "alice", "status": "resolved", "note": "blocked sender" }),
    )
    .await;
    assert_eq!(j["code"], 200);
    assert!(j["data"]["resolved_at"].is_string());

    let j = post(
        &h.app,
        "/incidents/update",
        json!({ "id": id, "actor": "mallory", "patch": { "title": "nothing to see" } }),
    )
    .await;
    assert_eq!(j["code"], 403);

    let j = post(&h.app, "/incidents/list", json!({ "tag": "email" })).await;
    assert_eq!(j["data"].as_array().unwrap().len(), 1);

    let j = get(&h.app, "/incidents/summary").await;
    assert_eq!(j["data"]["total"], 1);
    assert_eq!(j["data"]["active"], 0);

    let j = post(&h.app, "/incidents/delete", json!({ "id": id, "actor": "system" })).await;
    assert_eq!(j["code"], 200);
    let j = post(&h.app, "/incidents/get", json!({ "id": id })).await;
    assert_eq!(j["code"], 404);
}

#[tokio::test]
async fn incident_quota_is_enforced() {
    let h = harness().await;
    for i in 0..20 {
        let j = post(
            &h.app,
            "/incidents/create",
            json!({ "actor": "bob", "incident": { "title": format!("incident {}", i), "owner": "bob" } }),
        )
        .await;
        assert_eq!(j["code"], 200);
    }
    let j = post(
        &h.app,
        "/incidents/create",
        json!({ "actor": "bob", "incident": { "title": "one too many", "owner": "bob" } }),
    )
    .await;
    assert_eq!(j["code"], 429);

    let j = post(
        &h.app,
        "/quota/check",
        json!({ "user_id": "bob", "resource": "incidents" }),
    )
    .await;
    assert_eq!(j["data"]["remaining"], 0);
    assert_eq!(j["data"]["allowed"], false);
}

#[tokio::test]
async fn api_key_reveal_and_revoke() {
    let h = harness().await;
    let j = post(
        &h.app,
        "/keys/create",
        json!({ "name": "together-prod", "owner": "alice", "provider": "together", "secret": "tg-secret-value-123" }),
    )
    .await;
    assert_eq!(j["code"], 200);
    let id = j["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(j["data"]["key_prefix"], "tg-s…");

    let j = post(&h.app, "/keys/reveal", json!({ "id": id, "actor": "alice" })).await;
    assert_eq!(j["data"]["secret"], "tg-secret-value-123");
    let j = post(&h.app, "/keys/reveal", json!({ "id": id, "actor": "bob" })).await;
    assert_eq!(j["code"], 403);

    let j = post(&h.app, "/keys/revoke", json!({ "id": id, "actor": "alice", "reason": "rotated out" })).await;
    assert_eq!(j["data"]["status"], "revoked");
    let j = post(&h.app, "/keys/reveal", json!({ "id": id, "actor": "alice" })).await;
    assert_eq!(j["code"], 409);

    let j = post(&h.app, "/keys/list", json!({ "owner": "alice", "status": "revoked" })).await;
    assert_eq!(j["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn consent_set_check_withdraw() {
    let h = harness().await;
    let j = post(
        &h.app,
        "/consent/set",
        json!({ "actor": "u1", "grant": { "user_id": "u1", "category": "health", "level": "standard" } }),
    )
    .await;
    assert_eq!(j["code"], 200);
    assert_eq!(j["data"]["status"], "granted");

    let j = post(
        &h.app,
        "/consent/check",
        json!({ "user_id": "u1", "category": "health", "required": "standard" }),
    )
    .await;
    assert_eq!(j["data"]["allowed"], true);

    let j = post(
        &h.app,
        "/consent/check",
        json!({ "user_id": "u1", "category": "financial" }),
    )
    .await;
    assert_eq!(j["data"]["allowed"], false);

    let j = post(
        &h.app,
        "/consent/withdraw",
        json!({ "user_id": "u1", "category": "health", "actor": "mallory" }),
    )
    .await;
    assert_eq!(j["code"], 403);
    let j = post(
        &h.app,
        "/consent/set",
        json!({ "actor": "mallory", "grant": { "user_id": "u1", "category": "financial", "level": "full" } }),
    )
    .await;
    assert_eq!(j["code"], 403);
    let j = post(
        &h.app,
        "/consent/set",
        json!({ "actor": "u1", "grant": { "user_id": "u1", "category": "financial", "level": "full", "ttl_secs": i64::MAX } }),
    )
    .await;
    assert_eq!(j["code"], 400);

    post(
        &h.app,
        "/consent/withdraw",
        json!({ "user_id": "u1", "category": "health", "actor": "u1" }),
    )
    .await;
    let j = post(&h.app, "/consent/get", json!({ "user_id": "u1", "category": "health" })).await;
    assert_eq!(j["data"], "none");
}

#[tokio::test]
async fn vault_store_share_and_delete() {
    let h = harness().await;
    let payload = STANDARD.encode(b"forensic image header");
    let j = post(
        &h.app,
        "/vault/store",
        json!({ "owner": "alice", "data": payload, "options": { "content_type": "application/octet-stream" } }),
    )
    .await;
    assert_eq!(j["code"], 200);
    let id = j["data"]["id"].as_str().unwrap().to_string();

    let j = post(&h.app, "/vault/retrieve", json!({ "id": id, "requester": "alice" })).await;
    assert_eq!(j["data"]["data"], payload);
    let j = post(&h.app, "/vault/retrieve", json!({ "id": id, "requester": "bob" })).await;
    assert_eq!(j["code"], 403);

    post(&h.app, "/vault/grant", json!({ "id": id, "actor": "alice", "user": "bob" })).await;
    let j = post(&h.app, "/vault/retrieve", json!({ "id": id, "requester": "bob" })).await;
    assert_eq!(j["code"], 200);

    let j = post(&h.app, "/vault/rotate", json!({})).await;
    assert_eq!(j["data"]["migrated"], 1);
    let j = post(&h.app, "/vault/retrieve", json!({ "id": id, "requester": "alice" })).await;
    assert_eq!(j["data"]["data"], payload);

    let j = post(&h.app, "/quota/usage", json!({ "user_id": "alice" })).await;
    let storage = j["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["resource"] == "storage_mb")
        .cloned()
        .unwrap();
    assert_eq!(storage["used"], 1);

    let j = post(&h.app, "/vault/delete", json!({ "id": id, "actor": "alice" })).await;
    assert_eq!(j["code"], 200);
    let j = post(&h.app, "/vault/retrieve", json!({ "id": id, "requester": "alice" })).await;
    assert_eq!(j["code"], 404);

    let j = post(&h.app, "/vault/store", json!({ "owner": "alice", "data": "%%%" })).await;
    assert_eq!(j["code"], 400);
}

#[tokio::test]
async fn rotated_vault_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TardisConfig {
        data_dir: dir.path().to_path_buf(),
        master_key: Some(STANDARD.encode([5u8; 32])),
        ..Default::default()
    };
    let payload = STANDARD.encode(b"disk image");

    let app = open_app(&cfg).await;
    let j = post(&app, "/vault/store", json!({ "owner": "alice", "data": payload })).await;
    let id = j["data"]["id"].as_str().unwrap().to_string();
    let j = post(&app, "/vault/rotate", json!({})).await;
    assert_eq!(j["data"]["retired"], json!(["k1"]));
    drop(app);

    let app = open_app(&cfg).await;
    let j = post(&app, "/vault/retrieve", json!({ "id": id, "requester": "alice" })).await;
    assert_eq!(j["code"], 200);
    assert_eq!(j["data"]["data"], payload);
}

#[tokio::test]
async fn llm_fallback_is_reported_and_recorded() {
    let h = harness().await;
    h.primary.fail_model("big");
    let body = json!({
        "user_id": "u1",
        "request": { "model": "big", "messages": [{ "role": "user", "content": "triage this alert" }] }
    });
    let j = post(&h.app, "/llm/complete", body.clone()).await;
    assert_eq!(j["code"], 200);
    assert_eq!(j["data"]["fallback_used"], true);
    assert_eq!(j["data"]["strategy"], "alternate_model");
    assert_eq!(j["data"]["response"]["model"], "small");
    assert_eq!(h.backup.call_count(), 0);

    let j = post(&h.app, "/analytics/events", json!({ "event_type": "llm_fallback" })).await;
    assert_eq!(j["data"].as_array().unwrap().len(), 1);

    h.primary.fail_always();
    h.backup.fail_always();
    let j = post(&h.app, "/llm/complete", body).await;
    assert_eq!(j["code"], 502);

    let j = get(&h.app, "/llm/stats").await;
    assert_eq!(j["data"]["primary"]["failures"], 2);
    assert_eq!(j["data"]["alternate_model"]["successes"], 1);

    let j = post(&h.app, "/quota/check", json!({ "user_id": "u1", "resource": "api_calls" })).await;
    assert_eq!(j["data"]["used"], 2);
    let j = post(&h.app, "/quota/check", json!({ "user_id": "u1", "resource": "tokens" })).await;
    assert!(j["data"]["used"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn usage_flushes_into_analytics() {
    let h = harness().await;
    post(
        &h.app,
        "/incidents/create",
        json!({ "actor": "carol", "incident": { "title": "Port scan", "owner": "carol" } }),
    )
    .await;
    let j = post(&h.app, "/quota/flush", json!({})).await;
    assert_eq!(j["data"]["flushed"], 1);

    let j = post(
        &h.app,
        "/analytics/aggregate",
        json!({
            "query": { "name": "usage.incidents", "tags": { "user_id": "carol" } },
            "bucket": "day",
            "aggregation": "sum"
        }),
    )
    .await;
    assert_eq!(j["code"], 200);
    assert_eq!(j["data"][0]["value"], 1.0);
}
