//! Incident triage + action proposal.
//!
//! Every incident gets a decision record for audit, suppressed or not.
//! Proposal is additionally gated by: global freeze, per-fingerprint
//! proposal key, the rolling action budget, and per-(type,target) cooldown.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use sentinel_common::sha256_hex;
use sentinel_kv::{now_unix, KvStore, SignedQueue};

use crate::digest::digest_action;
use crate::env;
use crate::queues::{
    BUDGET_ZSET, COOLDOWN_KEY_PREFIX, DECISIONS_Q, DEDUPE_KEY_PREFIX, INCIDENTS_Q,
    PROPOSED_FP_KEY_PREFIX, PROPOSED_Q, RATELIMIT_KEY_PREFIX, TRIAGED_Q,
};
use crate::store::ActionStore;
use crate::types::{Action, ActionRecord, ActionStatus, Incident, Recommendation};
use crate::OpsError;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub poll_sec: f64,
    pub dedupe_sec: u64,
    pub rate_limit_sec: u64,
    /// 0 disables the per-(type,target) cooldown.
    pub target_cooldown_sec: u64,
    pub enable_propose: bool,
    pub propose_ttl_sec: u64,
    /// 0 disables the budget gate.
    pub budget_max: u64,
    pub budget_window_sec: u64,
    pub global_freeze_key: Option<String>,
    pub manager_id: String,
    pub queue_secret: Option<String>,
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        Self {
            poll_sec: env::f64_or("MANAGER_POLL_SEC", 2.0),
            dedupe_sec: env::u64_or("DEDUPE_SEC", 300),
            rate_limit_sec: env::u64_or("RATE_LIMIT_SEC", 30),
            target_cooldown_sec: env::u64_or("TARGET_COOLDOWN_SEC", 0),
            enable_propose: env::bool_or("MANAGER_ENABLE_PROPOSE", true),
            propose_ttl_sec: env::u64_or("PROPOSE_TTL_SEC", 900),
            budget_max: env::u64_or("ACTION_BUDGET_MAX", 0),
            budget_window_sec: env::u64_or("ACTION_BUDGET_WINDOW_SEC", 3600),
            global_freeze_key: env::opt("OPS_GLOBAL_FREEZE_KEY"),
            manager_id: env::str_or("MANAGER_ID", "agent_manager"),
            queue_secret: env::opt("QUEUE_SIGNING_SECRET"),
        }
    }
}

/// Stable identity of an incident for dedupe/rate-limit/proposal gating.
pub fn incident_fingerprint(inc: &Incident) -> String {
    let err = crate::clip(&inc.evidence.error, 120);
    let base = format!(
        "{}|{}|{}|{}|{}|{}",
        inc.service.trim(),
        inc.kind.trim(),
        inc.severity.trim(),
        inc.evidence.url.trim(),
        inc.evidence.status.trim(),
        err
    );
    sha256_hex(base.as_bytes())
}

pub fn classify_severity(inc: &Incident) -> String {
    let kind = inc.kind.to_lowercase();
    if kind.contains("unreachable") {
        return "critical".to_string();
    }
    if kind.contains("http_error") || kind.contains("unhealthy") {
        return "high".to_string();
    }
    if kind.contains("exception") {
        return "medium".to_string();
    }
    let sev = inc.severity.trim().to_lowercase();
    if sev.is_empty() {
        "low".to_string()
    } else {
        sev
    }
}

pub fn recommend_action(inc: &Incident) -> Recommendation {
    let sev = classify_severity(inc);
    let svc = inc.service.trim();
    if sev == "critical" || sev == "high" {
        return Recommendation {
            kind: "restart_service".to_string(),
            target: svc.to_string(),
            reason: format!("recommended by manager ({sev})"),
            confidence: if sev == "critical" { 0.85 } else { 0.70 },
            params: json!({}),
        };
    }
    Recommendation {
        kind: "none".to_string(),
        target: String::new(),
        reason: "no action recommended".to_string(),
        confidence: 0.40,
        params: json!({}),
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOutcome {
    pub fingerprint: String,
    pub suppressed: bool,
    pub suppress_reason: String,
    pub severity: String,
    pub recommendation: Recommendation,
    pub proposed_action_id: Option<String>,
}

pub struct ManagerWorker {
    kv: Arc<dyn KvStore>,
    store: ActionStore,
    cfg: ManagerConfig,
}

impl ManagerWorker {
    pub fn new(kv: Arc<dyn KvStore>, cfg: ManagerConfig) -> Self {
        let store = ActionStore::new(kv.clone());
        Self { kv, store, cfg }
    }

    fn queue(&self) -> SignedQueue<'_> {
        SignedQueue::new(self.kv.as_ref(), self.cfg.queue_secret.clone())
    }

    fn global_freeze_active(&self) -> Result<bool, OpsError> {
        match &self.cfg.global_freeze_key {
            Some(key) => Ok(self.kv.exists(key)?),
            None => Ok(false),
        }
    }

    fn should_suppress(&self, fp: &str) -> Result<(bool, &'static str), OpsError> {
        let dedupe_key = format!("{DEDUPE_KEY_PREFIX}{fp}");
        let rl_key = format!("{RATELIMIT_KEY_PREFIX}{fp}");

        if self.kv.exists(&dedupe_key)? {
            return Ok((true, "dedupe"));
        }
        self.kv
            .set_ex(&dedupe_key, "1", Duration::from_secs(self.cfg.dedupe_sec))?;

        if self.kv.exists(&rl_key)? {
            return Ok((true, "rate_limit"));
        }
        self.kv
            .set_ex(&rl_key, "1", Duration::from_secs(self.cfg.rate_limit_sec))?;

        Ok((false, "emit"))
    }

    fn budget_allows(&self) -> Result<bool, OpsError> {
        if self.cfg.budget_max == 0 {
            return Ok(true);
        }
        let ts = now_unix() as i64;
        let cutoff = ts - self.cfg.budget_window_sec as i64;
        self.kv.zremrangebyscore(BUDGET_ZSET, 0, cutoff)?;
        let count = self.kv.zcard(BUDGET_ZSET)?;
        if count as u64 >= self.cfg.budget_max {
            warn!(
                count,
                max = self.cfg.budget_max,
                window_sec = self.cfg.budget_window_sec,
                "action budget exceeded"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn budget_record_event(&self) -> Result<(), OpsError> {
        if self.cfg.budget_max == 0 {
            return Ok(());
        }
        let ts = now_unix() as i64;
        let member = format!("{ts}:{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.kv.zadd(BUDGET_ZSET, &member, ts)?;
        Ok(())
    }

    fn propose(
        &self,
        inc: &Incident,
        rec: &Recommendation,
        fp: &str,
    ) -> Result<Option<String>, OpsError> {
        if rec.kind == "none" {
            return Ok(None);
        }
        if self.global_freeze_active()? {
            return Ok(None);
        }
        if !self.budget_allows()? {
            return Ok(None);
        }

        // prevent repeated proposals for the same fingerprint during the TTL
        let fp_key = format!("{PROPOSED_FP_KEY_PREFIX}{fp}");
        if self.kv.exists(&fp_key)? {
            info!(fingerprint = &fp[..fp.len().min(12)], "propose suppressed: already proposed");
            return Ok(None);
        }

        if self.cfg.target_cooldown_sec > 0 {
            let cd_key = format!("{COOLDOWN_KEY_PREFIX}{}:{}", rec.kind, rec.target);
            if self.kv.exists(&cd_key)? {
                info!(kind = %rec.kind, target = %rec.target, "propose suppressed: cooldown active");
                return Ok(None);
            }
            self.kv
                .set_ex(&cd_key, "1", Duration::from_secs(self.cfg.target_cooldown_sec))?;
        }

        let ts = now_unix();
        let action_id = format!("act_{ts}_{}", &Uuid::new_v4().simple().to_string()[..6]);
        let action = Action {
            kind: rec.kind.trim().to_string(),
            target: rec.target.trim().to_string(),
            params: rec.params.clone(),
            reason: rec.reason.trim().to_string(),
        };
        let digest = digest_action(&action)?;

        let record = ActionRecord {
            action_id: action_id.clone(),
            incident_id: inc.incident_id.clone(),
            created_ts: ts,
            expires_ts: ts + self.cfg.propose_ttl_sec,
            status: ActionStatus::Proposed,
            fingerprint: fp.to_string(),
            manager: self.cfg.manager_id.clone(),
            recommended_confidence: rec.confidence,
            action,
            digest,
            rev: 0,
            approval: None,
            execution: None,
            rejection: None,
            reaper: None,
        };

        self.store.create(&record)?;
        self.kv.rpush(PROPOSED_Q, &action_id)?;
        self.kv.set_ex(
            &fp_key,
            &action_id,
            Duration::from_secs(self.cfg.propose_ttl_sec),
        )?;
        self.budget_record_event()?;

        Ok(Some(action_id))
    }

    /// Triage one popped incident payload. Returns None when the payload was
    /// not a valid incident (an invalid-json decision record is still pushed).
    pub fn handle_incident(&self, payload: Value) -> Result<Option<ManagerOutcome>, OpsError> {
        let ts = now_unix();
        let inc: Incident = match serde_json::from_value(payload.clone()) {
            Ok(inc) => inc,
            Err(_) => {
                let raw = crate::clip(&payload.to_string(), 300);
                self.queue().push(
                    DECISIONS_Q,
                    &json!({
                        "ts": ts,
                        "manager": self.cfg.manager_id,
                        "ok": false,
                        "error": "invalid_json",
                        "raw": raw,
                    }),
                )?;
                return Ok(None);
            }
        };

        let fp = incident_fingerprint(&inc);
        let (suppressed, why) = self.should_suppress(&fp)?;
        let severity = classify_severity(&inc);
        let rec = recommend_action(&inc);

        // decision audit record, suppressed or not
        self.queue().push(
            DECISIONS_Q,
            &json!({
                "ts": ts,
                "manager": self.cfg.manager_id,
                "fingerprint": fp,
                "suppressed": suppressed,
                "suppress_reason": why,
                "severity": severity,
                "recommendation": rec,
                "incident_id": inc.incident_id,
                "kind": inc.kind,
                "service": inc.service,
            }),
        )?;

        let mut proposed_action_id = None;
        if !suppressed {
            self.queue().push(
                TRIAGED_Q,
                &json!({
                    "ts": ts,
                    "manager": self.cfg.manager_id,
                    "fingerprint": fp,
                    "suppressed": suppressed,
                    "suppress_reason": why,
                    "incident": inc,
                    "severity": severity,
                    "recommendation": rec,
                }),
            )?;
            info!(incident_id = %inc.incident_id, kind = %inc.kind, severity = %severity, "triaged");

            if self.cfg.enable_propose {
                proposed_action_id = self.propose(&inc, &rec, &fp)?;
                if let Some(aid) = &proposed_action_id {
                    info!(action_id = %aid, kind = %rec.kind, target = %rec.target, "proposed");
                }
            }
        }

        Ok(Some(ManagerOutcome {
            fingerprint: fp,
            suppressed,
            suppress_reason: why.to_string(),
            severity,
            recommendation: rec,
            proposed_action_id,
        }))
    }

    pub async fn run(self) {
        info!(
            dedupe_sec = self.cfg.dedupe_sec,
            rate_limit_sec = self.cfg.rate_limit_sec,
            target_cooldown_sec = self.cfg.target_cooldown_sec,
            enable_propose = self.cfg.enable_propose,
            propose_ttl_sec = self.cfg.propose_ttl_sec,
            budget_max = self.cfg.budget_max,
            budget_window_sec = self.cfg.budget_window_sec,
            "manager worker started"
        );

        loop {
            let popped = self.queue().pop(INCIDENTS_Q);
            match popped {
                Ok(Some(payload)) => {
                    if let Err(e) = self.handle_incident(payload) {
                        warn!(error = %e, "incident triage failed");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "incident queue pop failed"),
            }
            tokio::time::sleep(Duration::from_secs_f64(self.cfg.poll_sec)).await;
        }
    }
}
