//! sentinel-control
//!
//! Operator entrypoints for the compliance agent:
//! - serve            gateway + (optionally) the whole ops worker set
//! - probe/manager/approver/executor/reaper   individual workers
//! - audit-verify     replay the audit hash chain
//! - guard            ask a running gateway to classify a command
//! - enqueue          wrap a payload in a signed queue envelope
//! - keygen           generate an Ed25519 agent keypair

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::{json, Value};
use thiserror::Error;

use sentinel_audit::AuditChain;
use sentinel_common::{agent_id_from_pub, sign_canonical};
use sentinel_gateway::{AppState, GatewayConfig};
use sentinel_kv::{now_iso, now_unix, KvStore, MemoryKv};
use sentinel_ops::{
    ApproverConfig, ApproverWorker, ComposeRunner, ExecutorConfig, ExecutorWorker,
    ManagerConfig, ManagerWorker, ProbeConfig, ProbeWorker, ReaperConfig, ReaperWorker,
};
use sentinel_policy::{evaluate, ReputationThresholds};

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signing error: {0}")]
    Sign(#[from] sentinel_common::SignError),
    #[error("audit error: {0}")]
    Audit(#[from] sentinel_audit::AuditError),
    #[error("gateway error: {0}")]
    Gateway(#[from] sentinel_gateway::GatewayError),
    #[error("ops error: {0}")]
    Ops(#[from] sentinel_ops::OpsError),
    #[error("kv error: {0}")]
    Kv(#[from] sentinel_kv::KvError),
}

#[derive(Parser)]
#[command(name = "sentinel-control", version, about = "Sentinel Compliance Agent control plane")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the policy gateway. By default the ops workers (probe, manager,
    /// approver, executor, reaper) run in-process on the same store.
    Serve {
        /// Gateway only; no ops workers.
        #[arg(long)]
        no_ops: bool,
    },

    /// Run only the health probe worker.
    Probe,
    /// Run only the triage/proposal worker.
    Manager,
    /// Run only the approval worker.
    Approver,
    /// Run only the execution worker.
    Executor,
    /// Run only the inflight-recovery worker.
    Reaper,

    /// Replay the audit hash chain and print {ok, lines, head}.
    AuditVerify {
        /// Directory holding audit.jsonl / audit.state / audit_head.txt.
        #[arg(long, default_value = "runtime/audit")]
        audit_dir: PathBuf,
    },

    /// Ask a running gateway to classify a command. Exit code mirrors the
    /// decision: 0 allow, 2 deny, 3 review. Falls back to local pattern
    /// evaluation when the gateway is unreachable.
    Guard {
        command: String,
        #[arg(default_value = "guard:local")]
        agent_id: String,
    },

    /// Wrap a JSON payload in a (optionally signed) queue envelope and print
    /// the exact line to push. Signing uses QUEUE_SIGNING_SECRET.
    Enqueue {
        queue: String,
        payload_json: String,
    },

    /// Generate an Ed25519 keypair plus the derived agent id.
    Keygen,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

async fn serve(no_ops: bool) -> Result<(), CliError> {
    let cfg = GatewayConfig::from_env();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let state = AppState::new(cfg, kv.clone())?;

    if !no_ops {
        let probe = ProbeWorker::new(kv.clone(), ProbeConfig::from_env())?;
        tokio::spawn(probe.run());
        tokio::spawn(ManagerWorker::new(kv.clone(), ManagerConfig::from_env()).run());
        tokio::spawn(ApproverWorker::new(kv.clone(), ApproverConfig::from_env()).run());
        let runner = Arc::new(ComposeRunner::from_env());
        tokio::spawn(ExecutorWorker::new(kv.clone(), ExecutorConfig::from_env(), runner).run());
        tokio::spawn(ReaperWorker::new(kv.clone(), ReaperConfig::from_env()).run());
    }

    sentinel_gateway::serve(state).await?;
    Ok(())
}

fn audit_verify(audit_dir: PathBuf) -> Result<i32, CliError> {
    let secret = std::env::var("AUDIT_SECRET")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let chain = AuditChain::open(&audit_dir, secret)?;
    match chain.verify() {
        Ok(report) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "ok": report.ok,
                    "lines": report.lines,
                    "head": report.head,
                }))?
            );
            Ok(0)
        }
        Err(e) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"ok": false, "error": e.to_string()}))?
            );
            Ok(1)
        }
    }
}

fn decision_exit_code(decision: &str) -> i32 {
    match decision {
        "allow" => 0,
        "deny" => 2,
        "review" => 3,
        _ => 1,
    }
}

fn guard_local_fallback(command: &str, agent_id: &str, api_error: &str) -> Value {
    let verdict = evaluate(command, 0, &ReputationThresholds::default());
    json!({
        "_status_code": 0,
        "agent_id": agent_id,
        "command": command,
        "decision": verdict.decision.as_str(),
        "risk": verdict.risk,
        "risk_score": verdict.risk_score,
        "reason": format!("(local fallback) {} | api_error={}", verdict.reason, api_error),
        "timestamp": "123",
        "policy_version": verdict.policy_version,
        "vt": "",
        "signature": "",
    })
}

async fn guard(command: String, agent_id: String) -> Result<i32, CliError> {
    let api_url = env_or("SENTINEL_API_URL", "http://127.0.0.1:8001/analyze");
    let api_key = env_or("API_KEY", "");
    let signing_secret = env_or("SIGNING_SECRET", "");
    let timeout_sec: u64 = env_or("SENTINEL_HTTP_TIMEOUT", "10").parse().unwrap_or(10);

    let body = json!({
        "agent_id": agent_id,
        "command": command,
        "timestamp": "123",
    });

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_sec))
        .build()
        .map_err(|e| CliError::Io(std::io::Error::other(e)))?;

    let mut req = client.post(&api_url).json(&body);
    if !api_key.is_empty() {
        req = req.header("X-API-Key", &api_key);
    }
    if !signing_secret.is_empty() {
        let ts_unix = now_unix().to_string();
        let signed = json!({
            "agent_id": agent_id,
            "command": command,
            "timestamp": "123",
            "ts_unix": ts_unix,
        });
        let sig = sign_canonical(&signing_secret, &signed)?;
        req = req.header("X-Timestamp-Unix", ts_unix).header("X-Signature", sig);
    }

    let data = match req.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let mut data: Value = resp.json().await.unwrap_or_else(|_| json!({}));
            if let Some(map) = data.as_object_mut() {
                map.insert("_status_code".to_string(), json!(status));
            }
            data
        }
        Err(e) => guard_local_fallback(&command, &agent_id, &e.to_string()),
    };

    println!("{}", serde_json::to_string_pretty(&data)?);
    let decision = data.get("decision").and_then(|v| v.as_str()).unwrap_or("");
    Ok(decision_exit_code(decision))
}

fn enqueue(queue: String, payload_json: String) -> Result<(), CliError> {
    let payload: Value = serde_json::from_str(&payload_json)?;
    let secret = std::env::var("QUEUE_SIGNING_SECRET")
        .ok()
        .filter(|s| !s.trim().is_empty());

    let line = match secret {
        None => sentinel_common::canonical_json_string(&payload)
            .map_err(sentinel_common::SignError::Canon)?,
        Some(secret) => {
            let body = json!({"v": 1, "ts": now_iso(), "payload": payload});
            let sig = sign_canonical(&secret, &body)?;
            let mut body = body;
            body["sig"] = json!(sig);
            sentinel_common::canonical_json_string(&body)
                .map_err(sentinel_common::SignError::Canon)?
        }
    };

    println!("{}", json!({"queue": queue, "line": line}));
    Ok(())
}

fn keygen() -> Result<(), CliError> {
    let sk = SigningKey::generate(&mut OsRng);
    let priv_b64 = BASE64.encode(sk.to_bytes());
    let pub_b64 = BASE64.encode(sk.verifying_key().to_bytes());
    let agent_id = agent_id_from_pub(&pub_b64);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "agent_id": agent_id,
            "pub_b64": pub_b64,
            "priv_b64": priv_b64,
        }))?
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::from_path(".env");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    let result: Result<i32, CliError> = match args.cmd {
        Command::Serve { no_ops } => serve(no_ops).await.map(|_| 0),
        Command::Probe => match ProbeWorker::new(kv, ProbeConfig::from_env()) {
            Ok(w) => {
                w.run().await;
                Ok(0)
            }
            Err(e) => Err(e.into()),
        },
        Command::Manager => {
            ManagerWorker::new(kv, ManagerConfig::from_env()).run().await;
            Ok(0)
        }
        Command::Approver => {
            ApproverWorker::new(kv, ApproverConfig::from_env()).run().await;
            Ok(0)
        }
        Command::Executor => {
            let runner = Arc::new(ComposeRunner::from_env());
            ExecutorWorker::new(kv, ExecutorConfig::from_env(), runner).run().await;
            Ok(0)
        }
        Command::Reaper => {
            ReaperWorker::new(kv, ReaperConfig::from_env()).run().await;
            Ok(0)
        }
        Command::AuditVerify { audit_dir } => audit_verify(audit_dir),
        Command::Guard { command, agent_id } => guard(command, agent_id).await,
        Command::Enqueue { queue, payload_json } => enqueue(queue, payload_json).map(|_| 0),
        Command::Keygen => keygen().map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
