//! Incident and canonical action record types.
//!
//! The record status is a tagged lifecycle; the per-state field bundles
//! (`Approval`, `Execution`, `Rejection`, `ReaperInfo`) are optionals owned
//! by exactly one component each. `rev` is bumped on every write and guards
//! read-modify-write cycles against concurrent writers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    pub ts: u64,
    pub service: String,
    pub kind: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub evidence: Evidence,
}

/// What the manager recommends for a triaged incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    pub reason: String,
    pub confidence: f64,
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Proposed,
    Approved,
    Executed,
    Failed,
    Rejected,
    Quarantined,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Executed
                | ActionStatus::Failed
                | ActionStatus::Rejected
                | ActionStatus::Quarantined
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Proposed => "proposed",
            ActionStatus::Approved => "approved",
            ActionStatus::Executed => "executed",
            ActionStatus::Failed => "failed",
            ActionStatus::Rejected => "rejected",
            ActionStatus::Quarantined => "quarantined",
        }
    }
}

/// Immutable intent plus the operator-facing reason. The digest covers only
/// type/target/params; reason never changes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    pub params: Value,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub approved_by: String,
    pub approved_ts: u64,
    pub approved_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub claimed_by: String,
    pub claimed_ts: u64,
    pub executed_ts: u64,
    pub ok: bool,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub cmd: String,
    pub hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub rejected_by: String,
    pub rejected_ts: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReaperInfo {
    pub last_seen_inflight_ts: u64,
    pub last_seen_inflight_iso: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined_at: Option<String>,
}

/// Canonical record, keyed by `ops:action:<action_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: String,
    pub incident_id: String,
    pub created_ts: u64,
    pub expires_ts: u64,
    pub status: ActionStatus,
    pub fingerprint: String,
    pub manager: String,
    pub recommended_confidence: f64,
    pub action: Action,
    pub digest: String,
    #[serde(default)]
    pub rev: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<Execution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaper: Option<ReaperInfo>,
}
