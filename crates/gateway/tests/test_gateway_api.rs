//! End-to-end router tests: the /analyze pipeline, signed reads, audit
//! endpoints, identity registry, and the operational surface.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use sentinel_common::{sign_canonical, verify_canonical};
use sentinel_gateway::{AppState, GatewayConfig, router};
use sentinel_kv::{now_unix, MemoryKv};
use sentinel_policy::{ReputationThresholds, ScoreThresholds};
use sentinel_reputation::DecayConfig;

const API_KEY: &str = "test-key";
const SIGNING_SECRET: &str = "test-signing-secret";

fn test_config(td: &TempDir) -> GatewayConfig {
    GatewayConfig {
        bind_addr: "127.0.0.1:0".into(),
        data_dir: td.path().join("runtime"),
        strict_mode: false,
        global_freeze: false,
        api_key: API_KEY.into(),
        signing_secret: SIGNING_SECRET.into(),
        audit_secret: "test-audit-secret".into(),
        vt_salt: "test-salt".into(),
        time_window_sec: 120,
        rate_limit_max: 30,
        rate_limit_window_sec: 60,
        rep_gates: ReputationThresholds::default(),
        score_gates: ScoreThresholds::default(),
        decay: DecayConfig::default(),
    }
}

fn state_with(cfg: GatewayConfig) -> AppState {
    AppState::new(cfg, Arc::new(MemoryKv::new())).unwrap()
}

fn analyze_request(agent_id: &str, command: &str, ts_unix: &str) -> Request<Body> {
    let body = json!({
        "agent_id": agent_id,
        "command": command,
        "timestamp": "123",
    });
    let signed = json!({
        "agent_id": agent_id,
        "command": command,
        "timestamp": "123",
        "ts_unix": ts_unix,
    });
    let sig = sign_canonical(SIGNING_SECRET, &signed).unwrap();

    Request::builder()
        .method("POST")
        .uri("/analyze")
        .header("content-type", "application/json")
        .header("x-api-key", API_KEY)
        .header("x-timestamp-unix", ts_unix)
        .header("x-signature", sig)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(state: &AppState, uri: &str) -> (StatusCode, Value) {
    let resp = router(state.clone())
        .oneshot(
            Request::builder()
                .uri(uri)
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

#[tokio::test]
async fn analyze_allows_and_signs_then_replays_409() {
    let td = TempDir::new().unwrap();
    let state = state_with(test_config(&td));
    let ts_unix = now_unix().to_string();

    let resp = router(state.clone())
        .oneshot(analyze_request("a1", "ls", &ts_unix))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;

    assert_eq!(body["decision"], "allow");
    assert_eq!(body["risk"], "low");
    assert_eq!(body["risk_score"], 0.05);
    assert_eq!(body["reason"], "No policy violations detected");
    assert_eq!(body["policy_version"], "v2");
    assert_eq!(body["vt"].as_str().unwrap().len(), 16);
    assert_eq!(body["replay_backend"], "primary");
    assert_eq!(body["ledger"]["reputation"], 1);
    assert_eq!(body["reputation"]["score_before"], 1.0);

    // response signature covers the canonical body minus `signature`
    let sig = body["signature"].as_str().unwrap().to_string();
    let mut unsigned = body.clone();
    unsigned.as_object_mut().unwrap().remove("signature");
    verify_canonical(SIGNING_SECRET, &unsigned, &sig).unwrap();

    // identical request within the window: replay
    let resp = router(state.clone())
        .oneshot(analyze_request("a1", "ls", &ts_unix))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "replay_detected");
}

#[tokio::test]
async fn hard_deny_pattern_wins_at_any_reputation() {
    let td = TempDir::new().unwrap();
    let state = state_with(test_config(&td));

    // earn a pile of reputation first
    for i in 0..5 {
        let ts = (now_unix() + i).to_string();
        let resp = router(state.clone())
            .oneshot(analyze_request("a1", &format!("echo {i}"), &ts))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let ts = (now_unix() + 100).to_string();
    let resp = router(state.clone())
        .oneshot(analyze_request("a1", "rm -rf /", &ts))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["decision"], "deny");
    assert_eq!(body["risk"], "high");
    assert_eq!(body["risk_score"], 0.95);
    assert!(body["reason"].as_str().unwrap().contains("rm -rf"));
    // deny costs the ledger 2 points: 5 - 2 = 3
    assert_eq!(body["ledger"]["reputation"], 3);
}

#[tokio::test]
async fn low_float_score_gates_an_allow_into_deny() {
    let td = TempDir::new().unwrap();
    let state = state_with(test_config(&td));
    state.oracle.set("a2", 0.15).unwrap();

    let ts = now_unix().to_string();
    let resp = router(state.clone())
        .oneshot(analyze_request("a2", "ls", &ts))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["decision"], "deny");
    assert!(body["reason"].as_str().unwrap().contains("Reputation score gate"));
}

#[tokio::test]
async fn auth_failures_return_401() {
    let td = TempDir::new().unwrap();
    let state = state_with(test_config(&td));
    let ts_unix = now_unix().to_string();

    // wrong api key
    let mut req = analyze_request("a1", "ls", &ts_unix);
    req.headers_mut().insert("x-api-key", "wrong".parse().unwrap());
    let resp = router(state.clone()).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"], "invalid_api_key");

    // missing signature headers
    let req = Request::builder()
        .method("POST")
        .uri("/analyze")
        .header("content-type", "application/json")
        .header("x-api-key", API_KEY)
        .body(Body::from(
            json!({"agent_id": "a1", "command": "ls", "timestamp": "123"}).to_string(),
        ))
        .unwrap();
    let resp = router(state.clone()).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"], "missing_signature");

    // tampered signature (command differs from the signed payload)
    let signed = json!({
        "agent_id": "a1", "command": "ls", "timestamp": "123", "ts_unix": ts_unix,
    });
    let sig = sign_canonical(SIGNING_SECRET, &signed).unwrap();
    let req = Request::builder()
        .method("POST")
        .uri("/analyze")
        .header("content-type", "application/json")
        .header("x-api-key", API_KEY)
        .header("x-timestamp-unix", &ts_unix)
        .header("x-signature", sig)
        .body(Body::from(
            json!({"agent_id": "a1", "command": "rm -rf /", "timestamp": "123"}).to_string(),
        ))
        .unwrap();
    let resp = router(state.clone()).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"], "bad_signature");

    // timestamp far outside the window
    let stale = (now_unix() - 10_000).to_string();
    let resp = router(state.clone())
        .oneshot(analyze_request("a1", "ls", &stale))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"], "timestamp_outside_window");
}

#[tokio::test]
async fn rate_limit_blocks_after_max_and_recovers() {
    let td = TempDir::new().unwrap();
    let mut cfg = test_config(&td);
    cfg.rate_limit_max = 2;
    cfg.rate_limit_window_sec = 1;
    let state = state_with(cfg);

    for i in 0..2 {
        let ts = (now_unix() + i).to_string();
        let resp = router(state.clone())
            .oneshot(analyze_request("a1", &format!("echo {i}"), &ts))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    // over the limit: 429, repeatedly, without consuming quota
    for i in 0..3 {
        let ts = (now_unix() + 10 + i).to_string();
        let resp = router(state.clone())
            .oneshot(analyze_request("a1", "echo over", &ts))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    // window expires; admission resumes
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let ts = (now_unix() + 100).to_string();
    let resp = router(state.clone())
        .oneshot(analyze_request("a1", "echo back", &ts))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn global_freeze_returns_503_but_health_stays_up() {
    let td = TempDir::new().unwrap();
    let mut cfg = test_config(&td);
    cfg.global_freeze = true;
    let state = state_with(cfg);

    let ts = now_unix().to_string();
    let resp = router(state.clone())
        .oneshot(analyze_request("a1", "ls", &ts))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = get(&state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn signed_status_read_reports_both_tracks() {
    let td = TempDir::new().unwrap();
    let state = state_with(test_config(&td));

    let ts = now_unix().to_string();
    let resp = router(state.clone())
        .oneshot(analyze_request("a1", "ls", &ts))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let ts_unix = now_unix().to_string();
    let signed = json!({"agent_id": "a1", "ts_unix": ts_unix});
    let sig = sign_canonical(SIGNING_SECRET, &signed).unwrap();
    let resp = router(state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/v1/status/a1")
                .header("x-api-key", API_KEY)
                .header("x-timestamp-unix", &ts_unix)
                .header("x-signature", sig)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["agent_id"], "a1");
    assert_eq!(body["ledger"]["allowed"], 1);
    assert!(body["score"].as_f64().unwrap() <= 1.0);
    assert!(body["audit"]["audit_head"].as_str().unwrap().len() == 64);
    assert_eq!(body["rate_limit"]["max"], 30);

    // unsigned status read is refused while signing is enabled
    let resp = router(state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/v1/status/a1")
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn audit_chain_is_verifiable_over_the_wire() {
    let td = TempDir::new().unwrap();
    let state = state_with(test_config(&td));

    for i in 0..3 {
        let ts = (now_unix() + i).to_string();
        let resp = router(state.clone())
            .oneshot(analyze_request("a1", &format!("echo {i}"), &ts))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let (status, body) = get(&state, "/audit/verify").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["lines"], 3);

    let (status, head) = get(&state, "/audit/head").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(head["audit_head"], body["head"]);
    assert!(head["audit_head_sig"].as_str().unwrap().len() == 64);
}

#[tokio::test]
async fn identity_lifecycle() {
    let td = TempDir::new().unwrap();
    let state = state_with(test_config(&td));

    let pub_b64 = {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode([3u8; 32])
    };

    let resp = router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v2/register")
                .header("content-type", "application/json")
                .header("x-api-key", API_KEY)
                .body(Body::from(
                    json!({"pub_b64": pub_b64, "display_name": "ops-bot"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let record = body_json(resp).await;
    let agent_id = record["agent_id"].as_str().unwrap().to_string();
    assert!(agent_id.starts_with("agent_"));
    assert_eq!(record["revoked"], false);

    let (status, fetched) = get(&state, &format!("/api/v2/agent/{agent_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["display_name"], "ops-bot");

    let resp = router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v2/revoke")
                .header("content-type", "application/json")
                .header("x-api-key", API_KEY)
                .body(Body::from(json!({"agent_id": agent_id}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (status, fetched) = get(&state, &format!("/api/v2/agent/{agent_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["revoked"], true);

    let (status, _) = get(&state, "/api/v2/agent/agent_missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_and_stats_surface_counters() {
    let td = TempDir::new().unwrap();
    let state = state_with(test_config(&td));

    let ts = now_unix().to_string();
    let resp = router(state.clone())
        .oneshot(analyze_request("a1", "ls", &ts))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router(state.clone())
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("sentinel_requests_total 1"));
    assert!(text.contains("sentinel_decision_allow_total 1"));

    let (status, stats) = get(&state, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["requests_ok"], 1);
    assert_eq!(stats["agents_seen"], 1);
    assert_eq!(stats["allowed_commands"]["ls"], 1);
}

#[test]
fn strict_mode_refuses_to_start_without_secrets() {
    let td = TempDir::new().unwrap();
    let mut cfg = test_config(&td);
    cfg.strict_mode = true;
    cfg.api_key = String::new();
    assert!(AppState::new(cfg, Arc::new(MemoryKv::new())).is_err());
}
