//! HTTP handlers.
//!
//! `/analyze` is the full pipeline: rate limit -> API key -> (when signing is
//! enabled) timestamp window -> replay check-and-set -> HMAC verify -> policy
//! evaluate -> float-reputation gate -> ledger update -> oracle update -> vt
//! -> audit append -> signed response.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use sentinel_common::{sign_canonical, variable_timestamp, verify_canonical};
use sentinel_kv::{now_iso, now_unix, replay_nonce};
use sentinel_policy::{apply_score_gate, evaluate};
use sentinel_audit::AuditEntry;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub agent_id: String,
    pub command: String,
    pub timestamp: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub reputation: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub pub_b64: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub agent_id: String,
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.trim())
}

fn client_ip(headers: &HeaderMap) -> String {
    header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

/// Route an error through the counters before returning it.
fn reject(state: &AppState, agent_id: Option<&str>, err: ApiError) -> ApiError {
    state.metrics.record_error(&err, agent_id);
    err
}

fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.cfg.api_key.is_empty() {
        // permissive outside strict mode; strict mode refuses startup instead
        return Ok(());
    }
    match header(headers, "x-api-key") {
        Some(provided) if provided == state.cfg.api_key => Ok(()),
        _ => Err(ApiError::InvalidApiKey),
    }
}

/// Timestamp window + replay + HMAC over the canonical signed payload.
fn check_signed(
    state: &AppState,
    headers: &HeaderMap,
    payload_for: impl Fn(&str) -> Value,
) -> Result<Option<&'static str>, ApiError> {
    if !state.cfg.signing_enabled() {
        return Ok(None);
    }

    let ts_unix = header(headers, "x-timestamp-unix")
        .ok_or(ApiError::MissingSignature)?
        .to_string();
    let ts: i64 = ts_unix
        .parse()
        .map_err(|_| ApiError::TimestampOutsideWindow)?;
    let now = now_unix() as i64;
    if (now - ts).unsigned_abs() > state.cfg.time_window_sec {
        return Err(ApiError::TimestampOutsideWindow);
    }

    let payload = payload_for(&ts_unix);
    // replay nonce binds (agent, command, ts_unix); signed reads carry no
    // command slot and skip the replay set
    let agent = payload.get("agent_id").and_then(|v| v.as_str()).unwrap_or("");
    let command = payload.get("command").and_then(|v| v.as_str()).unwrap_or("");
    let backend = if command.is_empty() {
        // signed read: no replay slot to burn
        None
    } else {
        let nonce = replay_nonce(agent, command, &ts_unix);
        let (fresh, backend) = state
            .replay
            .check_and_set(&nonce, std::time::Duration::from_secs(state.cfg.time_window_sec))
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        if !fresh {
            return Err(ApiError::ReplayDetected);
        }
        Some(match backend {
            sentinel_kv::ReplayBackend::Primary => "primary",
            sentinel_kv::ReplayBackend::Fallback => "fallback",
        })
    };

    let sig = header(headers, "x-signature").ok_or(ApiError::MissingSignature)?;
    verify_canonical(&state.cfg.signing_secret, &payload, sig)
        .map_err(|_| ApiError::BadSignature)?;

    Ok(backend)
}

fn sign_response(state: &AppState, mut body: Value) -> Value {
    let signature = if state.cfg.signing_enabled() {
        sign_canonical(&state.cfg.signing_secret, &body).unwrap_or_default()
    } else {
        String::new()
    };
    if let Some(map) = body.as_object_mut() {
        map.insert("signature".to_string(), Value::String(signature));
    }
    body
}

pub async fn analyze(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<Value>, ApiError> {
    use std::sync::atomic::Ordering;

    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let agent_id = req.agent_id.trim().to_string();
    if agent_id.is_empty() {
        return Err(reject(&state, None, ApiError::BadInput("agent_id is required".into())));
    }
    state.metrics.see_agent(&agent_id);

    if state.cfg.global_freeze {
        return Err(reject(&state, Some(&agent_id), ApiError::GlobalFreeze));
    }

    if !state.limiter.try_admit(&agent_id) {
        return Err(reject(&state, Some(&agent_id), ApiError::RateLimited));
    }

    check_api_key(&state, &headers).map_err(|e| reject(&state, Some(&agent_id), e))?;

    let replay_backend = check_signed(&state, &headers, |ts_unix| {
        json!({
            "agent_id": agent_id,
            "command": req.command,
            "timestamp": req.timestamp,
            "ts_unix": ts_unix,
        })
    })
    .map_err(|e| reject(&state, Some(&agent_id), e))?;

    // policy: integer-ledger gate + patterns, then the float-score gate
    let ledger_before = state
        .ledger
        .get_state(&agent_id)
        .map_err(|e| reject(&state, Some(&agent_id), ApiError::Internal(e.to_string())))?;
    let score_before = state
        .oracle
        .get(&agent_id)
        .map_err(|e| reject(&state, Some(&agent_id), ApiError::Internal(e.to_string())))?;

    let verdict = evaluate(&req.command, ledger_before.reputation, &state.cfg.rep_gates);
    let verdict = apply_score_gate(verdict, score_before, &state.cfg.score_gates);

    let ledger_after = state
        .ledger
        .update(&agent_id, verdict.decision)
        .map_err(|e| reject(&state, Some(&agent_id), ApiError::Internal(e.to_string())))?;
    let score_after = state
        .oracle
        .apply_outcome(&agent_id, verdict.decision)
        .map_err(|e| reject(&state, Some(&agent_id), ApiError::Internal(e.to_string())))?;

    let vt = variable_timestamp(&agent_id, &req.timestamp, &req.command, &state.cfg.vt_salt);

    let risk = verdict.risk.as_str().to_string();

    let mut audit_error = None;
    let entry = AuditEntry {
        ts: now_iso(),
        client_ip: client_ip(&headers),
        agent_id: agent_id.clone(),
        command: req.command.clone(),
        decision: verdict.decision.as_str().to_string(),
        risk: risk.clone(),
        risk_score: verdict.risk_score,
        reason: verdict.reason.clone(),
        policy_version: verdict.policy_version.clone(),
        vt: vt.clone(),
    };
    if let Err(e) = state.audit.append(entry) {
        warn!(error = %e, "audit append failed; decision still returned");
        audit_error = Some(e.to_string());
    }

    state
        .metrics
        .record_decision(verdict.decision.as_str(), &req.command, &agent_id);
    state.metrics.requests_ok.fetch_add(1, Ordering::Relaxed);

    let mut body = json!({
        "agent_id": agent_id,
        "command": req.command,
        "timestamp": req.timestamp,
        "decision": verdict.decision.as_str(),
        "risk": risk,
        "risk_score": verdict.risk_score,
        "reason": verdict.reason,
        "policy_version": verdict.policy_version,
        "vt": vt,
        "reputation": {
            "score_before": score_before,
            "score_after": score_after,
        },
        "ledger": ledger_after,
        "ts_unix": now_unix(),
    });
    if let Some(backend) = replay_backend {
        body["replay_backend"] = json!(backend);
    }
    if let Some(err) = audit_error {
        body["audit_error"] = json!(err);
    }

    Ok(Json(sign_response(&state, body)))
}

pub async fn status(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_api_key(&state, &headers).map_err(|e| reject(&state, Some(&agent_id), e))?;
    check_signed(&state, &headers, |ts_unix| {
        json!({"agent_id": agent_id, "ts_unix": ts_unix})
    })
    .map_err(|e| reject(&state, Some(&agent_id), e))?;

    let ledger = state
        .ledger
        .get_state(&agent_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let score = state
        .oracle
        .get(&agent_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let head = state
        .audit
        .head()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let (used, max) = state.limiter.usage(&agent_id);

    Ok(Json(json!({
        "agent_id": agent_id,
        "ledger": ledger,
        "score": score,
        "audit": head,
        "rate_limit": {
            "used": used,
            "max": max,
            "window_sec": state.cfg.rate_limit_window_sec,
        },
        "server_time": now_iso(),
        "ts_unix": now_unix(),
    })))
}

pub async fn rep(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_api_key(&state, &headers).map_err(|e| reject(&state, Some(&agent_id), e))?;
    let score = state
        .oracle
        .get(&agent_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({"agent_id": agent_id, "score": score})))
}

pub async fn audit_verify(State(state): State<AppState>) -> Json<Value> {
    match state.audit.verify() {
        Ok(report) => Json(json!({
            "ok": report.ok,
            "lines": report.lines,
            "head": report.head,
        })),
        Err(e) => Json(json!({"ok": false, "error": e.to_string()})),
    }
}

pub async fn audit_head(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let head = state
        .audit
        .head()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::to_value(head).unwrap_or_else(|_| json!({}))))
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let mut body = state.metrics.snapshot();
    if let Some(map) = body.as_object_mut() {
        map.insert("app".to_string(), json!("Sentinel Compliance Agent"));
        map.insert("uptime_sec".to_string(), json!(state.started.elapsed().as_secs()));
        map.insert("global_freeze".to_string(), json!(state.cfg.global_freeze));
    }
    Json(body)
}

pub async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    check_api_key(&state, &headers).map_err(|e| reject(&state, None, e))?;
    let record = state
        .identity
        .register(&req.pub_b64, &req.display_name, req.metadata)?;
    Ok(Json(serde_json::to_value(record).map_err(|e| ApiError::Internal(e.to_string()))?))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_api_key(&state, &headers).map_err(|e| reject(&state, Some(&agent_id), e))?;
    let record = state.identity.get(&agent_id)?;
    Ok(Json(serde_json::to_value(record).map_err(|e| ApiError::Internal(e.to_string()))?))
}

pub async fn revoke_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RevokeRequest>,
) -> Result<Json<Value>, ApiError> {
    check_api_key(&state, &headers).map_err(|e| reject(&state, None, e))?;
    let record = state.identity.revoke(&req.agent_id)?;
    Ok(Json(json!({"agent_id": record.agent_id, "revoked": record.revoked})))
}
