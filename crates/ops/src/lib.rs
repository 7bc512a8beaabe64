//! sentinel_ops
//!
//! The incident -> action control pipeline:
//! - Probe: edge-triggered health probe emitting incidents
//! - Manager: triage, dedupe/cooldown/budget gates, action proposal
//! - Approver: allowlist + digest verification
//! - Executor: digest re-verification, idempotency, side-effect execution
//! - Reaper: inflight recovery with requeue counting and quarantine
//!
//! All cross-worker state lives in the KV store. Queues carry action ids for
//! the action flow and full JSON documents for incidents/triage/decisions.
//! The canonical action record is the single source of truth; each worker
//! only writes the lifecycle fields it owns.

use thiserror::Error;

pub mod approver;
pub mod digest;
pub mod executor;
pub mod manager;
pub mod probe;
pub mod queues;
pub mod reaper;
pub mod store;
pub mod types;

pub use approver::{ApproverConfig, ApproverWorker};
pub use executor::{ActionRunner, ComposeRunner, ExecutorConfig, ExecutorWorker, RunOutput};
pub use manager::{incident_fingerprint, ManagerConfig, ManagerWorker};
pub use probe::{ProbeConfig, ProbeWorker};
pub use reaper::{ReaperConfig, ReaperWorker};
pub use store::ActionStore;

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("kv error: {0}")]
    Kv(#[from] sentinel_kv::KvError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] sentinel_common::CanonError),
    #[error("action record {action_id} changed underneath this writer")]
    RevConflict { action_id: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl OpsError {
    /// Short class tag used in `exception:<kind>:<message>` rejection reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            OpsError::Kv(_) => "Kv",
            OpsError::Json(_) => "Json",
            OpsError::Canon(_) => "Canon",
            OpsError::RevConflict { .. } => "RevConflict",
            OpsError::Io(_) => "Io",
            OpsError::Http(_) => "Http",
        }
    }

    /// `exception:<kind>:<message[:300]>`
    pub fn rejection_reason(&self) -> String {
        format!("exception:{}:{}", self.kind(), clip(&self.to_string(), 300))
    }
}

/// First `max` characters, never splitting a code point.
pub(crate) fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Env helpers shared by the worker configs.
pub(crate) mod env {
    pub fn str_or(name: &str, default: &str) -> String {
        std::env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn u64_or(name: &str, default: u64) -> u64 {
        std::env::var(name)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn f64_or(name: &str, default: f64) -> f64 {
        std::env::var(name)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn bool_flag(name: &str) -> bool {
        std::env::var(name)
            .map(|v| v.trim() == "1")
            .unwrap_or(false)
    }

    pub fn bool_or(name: &str, default: bool) -> bool {
        std::env::var(name)
            .ok()
            .map(|v| v.trim() == "1")
            .unwrap_or(default)
    }

    pub fn list(name: &str, default: &str) -> Vec<String> {
        let raw = str_or(name, default);
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn opt(name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}
