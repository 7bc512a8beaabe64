//! Approval stage: allowlist + digest verification.
//!
//! Claims action ids proposed -> proposed:inflight atomically, verifies the
//! intent against the configured allowlists, recomputes the digest and
//! compares it with the one stored at proposal time. The inflight token is
//! removed on every exit path; the reaper recovers anything left behind.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use sentinel_kv::{now_unix, KvStore};

use crate::digest::digest_action;
use crate::env;
use crate::queues::{APPROVED_Q, PROPOSED_INFLIGHT_Q, PROPOSED_Q, REJECTED_Q};
use crate::store::ActionStore;
use crate::types::{ActionRecord, ActionStatus, Approval, Rejection};
use crate::OpsError;

#[derive(Debug, Clone)]
pub struct ApproverConfig {
    pub poll_sec: f64,
    pub approver_id: String,
    pub allowed_types: Vec<String>,
    pub allowed_targets: Vec<String>,
    pub require_digest_match: bool,
    pub auto_approve: bool,
    pub auto_types: Vec<String>,
    pub auto_targets: Vec<String>,
}

impl ApproverConfig {
    pub fn from_env() -> Self {
        Self {
            poll_sec: env::f64_or("APPROVER_POLL_SEC", 1.0),
            approver_id: env::str_or("APPROVER_ID", "human_approver"),
            allowed_types: env::list("ALLOWED_TYPES", "restart_service"),
            allowed_targets: env::list("ALLOWED_TARGETS", ""),
            require_digest_match: env::bool_or("REQUIRE_DIGEST_MATCH", true),
            auto_approve: env::bool_flag("AUTO_APPROVE"),
            auto_types: env::list("AUTO_TYPES", ""),
            auto_targets: env::list("AUTO_TARGETS", ""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved { action_id: String },
    Rejected { action_id: String, reason: String },
}

pub struct ApproverWorker {
    kv: Arc<dyn KvStore>,
    store: ActionStore,
    cfg: ApproverConfig,
}

impl ApproverWorker {
    pub fn new(kv: Arc<dyn KvStore>, cfg: ApproverConfig) -> Self {
        let store = ActionStore::new(kv.clone());
        Self { kv, store, cfg }
    }

    fn allowed(&self, kind: &str, target: &str) -> Result<(), String> {
        if !self.cfg.allowed_types.is_empty()
            && !self.cfg.allowed_types.iter().any(|t| t == kind)
        {
            return Err(format!("type_not_allowed:{kind}"));
        }
        if !self.cfg.allowed_targets.is_empty()
            && !self.cfg.allowed_targets.iter().any(|t| t == target)
        {
            return Err(format!("target_not_allowed:{target}"));
        }
        Ok(())
    }

    fn should_auto(&self, kind: &str, target: &str) -> bool {
        if !self.cfg.auto_approve {
            return false;
        }
        if !self.cfg.auto_types.is_empty() && !self.cfg.auto_types.iter().any(|t| t == kind) {
            return false;
        }
        if !self.cfg.auto_targets.is_empty()
            && !self.cfg.auto_targets.iter().any(|t| t == target)
        {
            return false;
        }
        true
    }

    fn push_rejected(&self, action_id: &str, reason: &str) -> Result<(), OpsError> {
        let reason = crate::clip(reason, 800);
        let msg = json!({
            "action_id": action_id,
            "error": "rejected",
            "reason": reason,
            "ts": now_unix(),
        });
        self.kv.rpush(REJECTED_Q, &msg.to_string())?;
        Ok(())
    }

    fn reject_record(
        &self,
        record: &mut ActionRecord,
        base_raw: &str,
        reason: &str,
    ) -> Result<(), OpsError> {
        let short = crate::clip(reason, 500);
        record.status = ActionStatus::Rejected;
        record.rejection = Some(Rejection {
            rejected_by: self.cfg.approver_id.clone(),
            rejected_ts: now_unix(),
            reason: short,
        });
        self.store.save(record, base_raw)?;
        self.push_rejected(&record.action_id, reason)
    }

    /// Best-effort rejection when the record is missing or unreadable.
    fn reject_orphan(&self, action_id: &str, reason: &str) {
        let short = crate::clip(reason, 500);
        let minimal = json!({
            "action_id": action_id,
            "status": "rejected",
            "rejection": {
                "rejected_by": self.cfg.approver_id,
                "rejected_ts": now_unix(),
                "reason": short,
            },
        });
        let _ = self.kv.set(&ActionStore::key(action_id), &minimal.to_string());
        let _ = self.push_rejected(action_id, reason);
    }

    fn approve(
        &self,
        record: &mut ActionRecord,
        base_raw: &str,
        computed_digest: &str,
    ) -> Result<(), OpsError> {
        record.status = ActionStatus::Approved;
        record.approval = Some(Approval {
            approved_by: self.cfg.approver_id.clone(),
            approved_ts: now_unix(),
            approved_digest: computed_digest.to_string(),
        });
        self.store.save(record, base_raw)?;

        let msg = json!({
            "action_id": record.action_id,
            "approved_msg": record,
            "ts": now_unix(),
        });
        self.kv.rpush(APPROVED_Q, &msg.to_string())?;
        info!(action_id = %record.action_id, target = %record.action.target, "approved");
        Ok(())
    }

    fn handle_claimed(&self, action_id: &str) -> Result<ApprovalOutcome, OpsError> {
        let Some((mut record, raw)) = self.store.load(action_id)? else {
            self.reject_orphan(action_id, "missing_action_record");
            return Ok(ApprovalOutcome::Rejected {
                action_id: action_id.to_string(),
                reason: "missing_action_record".to_string(),
            });
        };

        let kind = record.action.kind.trim().to_string();
        let target = record.action.target.trim().to_string();

        if let Err(why) = self.allowed(&kind, &target) {
            self.reject_record(&mut record, &raw, &why)?;
            return Ok(ApprovalOutcome::Rejected {
                action_id: action_id.to_string(),
                reason: why,
            });
        }

        let computed = digest_action(&record.action)?;
        if self.cfg.require_digest_match {
            let existing = record.digest.trim().to_string();
            if existing.is_empty() {
                self.reject_record(&mut record, &raw, "missing_digest")?;
                return Ok(ApprovalOutcome::Rejected {
                    action_id: action_id.to_string(),
                    reason: "missing_digest".to_string(),
                });
            }
            if existing != computed {
                let why = format!("digest_mismatch existing={existing} computed={computed}");
                warn!(action_id, "rejected: digest mismatch");
                self.reject_record(&mut record, &raw, &why)?;
                return Ok(ApprovalOutcome::Rejected {
                    action_id: action_id.to_string(),
                    reason: why,
                });
            }
        }

        // manual vs auto: both paths currently approve; the knobs narrow which
        // (type, target) pairs would bypass a human queue if one is added
        let _auto = self.should_auto(&kind, &target);
        self.approve(&mut record, &raw, &computed)?;
        Ok(ApprovalOutcome::Approved { action_id: action_id.to_string() })
    }

    /// Claim and process one proposed action. Returns None when the queue is
    /// empty. The inflight token is removed on every path.
    pub fn process_one(&self) -> Result<Option<ApprovalOutcome>, OpsError> {
        let Some(item) = self.kv.pop_push(PROPOSED_Q, PROPOSED_INFLIGHT_Q)? else {
            return Ok(None);
        };
        let action_id = item.trim().to_string();

        let result = self.handle_claimed(&action_id);
        let _ = self.kv.lrem(PROPOSED_INFLIGHT_Q, &item);

        match result {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                let reason = e.rejection_reason();
                warn!(action_id = %action_id, error = %e, "approval failed");
                self.reject_orphan(&action_id, &reason);
                Ok(Some(ApprovalOutcome::Rejected { action_id, reason }))
            }
        }
    }

    pub async fn run(self) {
        info!(
            approver_id = %self.cfg.approver_id,
            allowed_types = ?self.cfg.allowed_types,
            allowed_targets = ?self.cfg.allowed_targets,
            require_digest_match = self.cfg.require_digest_match,
            auto_approve = self.cfg.auto_approve,
            "approver worker started"
        );
        loop {
            match self.process_one() {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    tokio::time::sleep(Duration::from_secs_f64(self.cfg.poll_sec)).await
                }
                Err(e) => {
                    warn!(error = %e, "approver loop error");
                    tokio::time::sleep(Duration::from_secs_f64(self.cfg.poll_sec)).await
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;
    use sentinel_kv::MemoryKv;

    fn cfg() -> ApproverConfig {
        ApproverConfig {
            poll_sec: 1.0,
            approver_id: "human_approver".into(),
            allowed_types: vec!["restart_service".into()],
            allowed_targets: vec![],
            require_digest_match: true,
            auto_approve: false,
            auto_types: vec![],
            auto_targets: vec![],
        }
    }

    fn seed(kv: &Arc<MemoryKv>, id: &str, kind: &str, target: &str) -> ActionRecord {
        let action = Action {
            kind: kind.into(),
            target: target.into(),
            params: json!({}),
            reason: "recommended by manager (critical)".into(),
        };
        let digest = digest_action(&action).unwrap();
        let record = ActionRecord {
            action_id: id.into(),
            incident_id: "inc_1".into(),
            created_ts: 1000,
            expires_ts: 1900,
            status: ActionStatus::Proposed,
            fingerprint: "fp".into(),
            manager: "agent_manager".into(),
            recommended_confidence: 0.85,
            action,
            digest,
            rev: 0,
            approval: None,
            execution: None,
            rejection: None,
            reaper: None,
        };
        ActionStore::new(kv.clone()).create(&record).unwrap();
        kv.rpush(PROPOSED_Q, id).unwrap();
        record
    }

    #[test]
    fn empty_queue_yields_none() {
        let kv = Arc::new(MemoryKv::new());
        let w = ApproverWorker::new(kv, cfg());
        assert!(w.process_one().unwrap().is_none());
    }

    #[test]
    fn happy_path_approves_and_clears_inflight() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, "act_1", "restart_service", "sentinel-api");
        let w = ApproverWorker::new(kv.clone(), cfg());

        let outcome = w.process_one().unwrap().unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved { action_id: "act_1".into() });

        let raw = kv.get("ops:action:act_1").unwrap().unwrap();
        let rec: ActionRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(rec.status, ActionStatus::Approved);
        let approval = rec.approval.unwrap();
        assert_eq!(approval.approved_by, "human_approver");
        assert_eq!(approval.approved_digest, rec.digest);

        assert_eq!(kv.llen(APPROVED_Q).unwrap(), 1);
        assert_eq!(kv.llen(PROPOSED_INFLIGHT_Q).unwrap(), 0);

        // approved message carries the action id and the full record
        let msg: serde_json::Value =
            serde_json::from_str(&kv.lrange(APPROVED_Q, 0, 1).unwrap()[0]).unwrap();
        assert_eq!(msg["action_id"], "act_1");
        assert_eq!(msg["approved_msg"]["status"], "approved");
    }

    #[test]
    fn type_outside_allowlist_is_rejected() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, "act_1", "drop_database", "sentinel-api");
        let w = ApproverWorker::new(kv.clone(), cfg());

        match w.process_one().unwrap().unwrap() {
            ApprovalOutcome::Rejected { reason, .. } => {
                assert_eq!(reason, "type_not_allowed:drop_database")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(kv.llen(REJECTED_Q).unwrap(), 1);
        assert_eq!(kv.llen(APPROVED_Q).unwrap(), 0);
    }

    #[test]
    fn target_allowlist_is_enforced_when_set() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, "act_1", "restart_service", "rogue-svc");
        let mut c = cfg();
        c.allowed_targets = vec!["sentinel-api".into()];
        let w = ApproverWorker::new(kv, c);

        match w.process_one().unwrap().unwrap() {
            ApprovalOutcome::Rejected { reason, .. } => {
                assert_eq!(reason, "target_not_allowed:rogue-svc")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn tampered_digest_is_rejected() {
        let kv = Arc::new(MemoryKv::new());
        let rec = seed(&kv, "act_1", "restart_service", "sentinel-api");
        // intent mutated after proposal: stored digest no longer matches
        let mut tampered = rec.clone();
        tampered.action.target = "other-svc".into();
        let raw = kv.get("ops:action:act_1").unwrap().unwrap();
        let mut t = tampered;
        ActionStore::new(kv.clone()).save(&mut t, &raw).unwrap();

        let w = ApproverWorker::new(kv.clone(), cfg());
        match w.process_one().unwrap().unwrap() {
            ApprovalOutcome::Rejected { reason, .. } => {
                assert!(reason.starts_with("digest_mismatch"), "{reason}")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        let rec: ActionRecord =
            serde_json::from_str(&kv.get("ops:action:act_1").unwrap().unwrap()).unwrap();
        assert_eq!(rec.status, ActionStatus::Rejected);
    }

    #[test]
    fn missing_digest_is_rejected() {
        let kv = Arc::new(MemoryKv::new());
        let rec = seed(&kv, "act_1", "restart_service", "sentinel-api");
        let raw = kv.get("ops:action:act_1").unwrap().unwrap();
        let mut blank = rec;
        blank.digest = String::new();
        ActionStore::new(kv.clone()).save(&mut blank, &raw).unwrap();

        let w = ApproverWorker::new(kv, cfg());
        match w.process_one().unwrap().unwrap() {
            ApprovalOutcome::Rejected { reason, .. } => assert_eq!(reason, "missing_digest"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn missing_record_is_rejected_and_inflight_cleared() {
        let kv = Arc::new(MemoryKv::new());
        kv.rpush(PROPOSED_Q, "act_ghost").unwrap();
        let w = ApproverWorker::new(kv.clone(), cfg());

        match w.process_one().unwrap().unwrap() {
            ApprovalOutcome::Rejected { reason, .. } => {
                assert_eq!(reason, "missing_action_record")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(kv.llen(PROPOSED_INFLIGHT_Q).unwrap(), 0);
        assert_eq!(kv.llen(REJECTED_Q).unwrap(), 1);
    }
}
