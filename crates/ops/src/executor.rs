//! Execution stage: digest re-verification, idempotency, side effects.
//!
//! The side effect itself sits behind `ActionRunner` so the pipeline logic is
//! testable; the production runner shells out to the process manager
//! (`docker compose ... restart <target>`) with a wall-clock timeout.
//!
//! Idempotency: `ops:exec:done:<action_id>` is set NX before dispatch. A
//! second delivery of the same approved action drops silently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use sentinel_kv::{now_unix, KvStore};

use crate::digest::digest_action;
use crate::env;
use crate::queues::{
    APPROVED_INFLIGHT_Q, APPROVED_Q, EXEC_DONE_KEY_PREFIX, EXECUTED_Q, REJECTED_Q,
};
use crate::store::ActionStore;
use crate::types::{ActionRecord, ActionStatus, Execution};
use crate::OpsError;

const SUBPROCESS_TIMEOUT_SEC: u64 = 60;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub poll_sec: f64,
    pub executor_id: String,
    pub allowed_types: Vec<String>,
    pub allowed_targets: Vec<String>,
    pub require_digest_match: bool,
    pub idempotency_ttl_sec: u64,
    pub global_freeze_key: Option<String>,
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        Self {
            poll_sec: env::f64_or("EXECUTOR_POLL_SEC", 1.0),
            executor_id: env::str_or("EXECUTOR_ID", "agent_executor"),
            allowed_types: env::list("ALLOWED_TYPES", "restart_service"),
            allowed_targets: env::list("ALLOWED_TARGETS", ""),
            require_digest_match: env::bool_or("REQUIRE_DIGEST_MATCH", true),
            idempotency_ttl_sec: env::u64_or("IDEMPOTENCY_TTL_SEC", 86400),
            global_freeze_key: env::opt("OPS_GLOBAL_FREEZE_KEY"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub cmd: String,
    pub hint: String,
}

/// Side-effect seam. Transport only; no policy, no record writes.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn restart_service(&self, target: &str) -> RunOutput;
}

/// Restarts services through `docker compose`.
pub struct ComposeRunner {
    pub project_dir: String,
    pub compose_file: String,
    pub env_file: String,
}

impl ComposeRunner {
    pub fn from_env() -> Self {
        Self {
            project_dir: env::str_or("COMPOSE_PROJECT_DIR", "/app"),
            compose_file: env::str_or("COMPOSE_FILE", "/app/docker-compose.yml"),
            env_file: env::str_or("COMPOSE_ENV_FILE", "/app/.env"),
        }
    }
}

#[async_trait]
impl ActionRunner for ComposeRunner {
    async fn restart_service(&self, target: &str) -> RunOutput {
        let cmd = format!(
            "docker compose -f {} --env-file {} restart {}",
            self.compose_file, self.env_file, target
        );
        let child = tokio::process::Command::new("docker")
            .args([
                "compose",
                "-f",
                &self.compose_file,
                "--env-file",
                &self.env_file,
                "restart",
                target,
            ])
            .current_dir(&self.project_dir)
            .output();

        match tokio::time::timeout(Duration::from_secs(SUBPROCESS_TIMEOUT_SEC), child).await {
            Ok(Ok(output)) => {
                let hint = if std::path::Path::new(&self.env_file).exists() {
                    "env file present"
                } else {
                    "env file missing"
                };
                RunOutput {
                    returncode: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    cmd,
                    hint: hint.to_string(),
                }
            }
            Ok(Err(e)) => RunOutput {
                returncode: 125,
                stdout: String::new(),
                stderr: format!("exception:Io:{e}"),
                cmd,
                hint: "exception".to_string(),
            },
            Err(_) => RunOutput {
                returncode: 124,
                stdout: String::new(),
                stderr: "timeout executing docker compose".to_string(),
                cmd,
                hint: "timeout".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Executed { action_id: String, ok: bool },
    Rejected { action_id: String, reason: String },
    DroppedDuplicate { action_id: String },
    Frozen,
}

/// Queue items are `{action_id, approved_msg, ts}` messages from the
/// approver, or bare action ids after a reaper requeue.
pub(crate) fn action_id_of(item: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(item) {
        if let Some(id) = v.get("action_id").and_then(|x| x.as_str()) {
            return id.to_string();
        }
    }
    item.trim().to_string()
}

pub struct ExecutorWorker {
    kv: Arc<dyn KvStore>,
    store: ActionStore,
    cfg: ExecutorConfig,
    runner: Arc<dyn ActionRunner>,
}

impl ExecutorWorker {
    pub fn new(kv: Arc<dyn KvStore>, cfg: ExecutorConfig, runner: Arc<dyn ActionRunner>) -> Self {
        let store = ActionStore::new(kv.clone());
        Self { kv, store, cfg, runner }
    }

    fn freeze_active(&self) -> Result<bool, OpsError> {
        match &self.cfg.global_freeze_key {
            Some(key) => Ok(self.kv.exists(key)?),
            None => Ok(false),
        }
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

    /// Returns true the first time; false when this action already ran.
    fn mark_done_once(&self, action_id: &str) -> Result<bool, OpsError> {
        let key = format!("{EXEC_DONE_KEY_PREFIX}{action_id}");
        Ok(self.kv.set_nx_ex(
            &key,
            "1",
            Duration::from_secs(self.cfg.idempotency_ttl_sec),
        )?)
    }

    fn push_rejected(&self, action_id: &str, error: &str, reason: &str) -> Result<(), OpsError> {
        let reason = crate::clip(reason, 800);
        let msg = json!({
            "action_id": action_id,
            "error": error,
            "reason": reason,
            "ts": now_unix(),
        });
        self.kv.rpush(REJECTED_Q, &msg.to_string())?;
        Ok(())
    }

    fn reject(
        &self,
        record: &mut ActionRecord,
        base_raw: &str,
        reason: &str,
    ) -> Result<(), OpsError> {
        let ts = now_unix();
        let short = crate::clip(reason, 300);
        record.status = ActionStatus::Rejected;
        record.execution = Some(Execution {
            claimed_by: self.cfg.executor_id.clone(),
            claimed_ts: ts,
            executed_ts: ts,
            ok: false,
            returncode: 1,
            stdout: String::new(),
            stderr: String::new(),
            cmd: String::new(),
            hint: String::new(),
            reason: Some(short),
        });
        self.store.save(record, base_raw)?;
        self.push_rejected(&record.action_id, "execution_rejected", reason)
    }

    fn reject_orphan(&self, action_id: &str, reason: &str) {
        let _ = self.push_rejected(action_id, "execution_rejected", reason);
    }

    async fn handle_claimed(&self, action_id: &str) -> Result<ExecOutcome, OpsError> {
        let Some((mut record, raw)) = self.store.load(action_id)? else {
            self.reject_orphan(action_id, "missing_action_record");
            return Ok(ExecOutcome::Rejected {
                action_id: action_id.to_string(),
                reason: "missing_action_record".to_string(),
            });
        };

        let kind = record.action.kind.trim().to_string();
        let target = record.action.target.trim().to_string();

        if let Err(why) = self.allowed(&kind, &target) {
            self.reject(&mut record, &raw, &why)?;
            return Ok(ExecOutcome::Rejected { action_id: action_id.to_string(), reason: why });
        }

        // re-verify intent against the digest fixed at approval time
        let computed = digest_action(&record.action)?;
        if self.cfg.require_digest_match {
            let approved = record
                .approval
                .as_ref()
                .map(|a| a.approved_digest.trim().to_string())
                .unwrap_or_default();
            if approved.is_empty() {
                self.reject(&mut record, &raw, "missing_approved_digest")?;
                return Ok(ExecOutcome::Rejected {
                    action_id: action_id.to_string(),
                    reason: "missing_approved_digest".to_string(),
                });
            }
            if approved != computed {
                let why = format!("digest_mismatch approved={approved} computed={computed}");
                self.reject(&mut record, &raw, &why)?;
                return Ok(ExecOutcome::Rejected {
                    action_id: action_id.to_string(),
                    reason: why,
                });
            }
        }

        if !self.mark_done_once(action_id)? {
            // already executed recently
            info!(action_id, "duplicate delivery dropped");
            return Ok(ExecOutcome::DroppedDuplicate { action_id: action_id.to_string() });
        }

        if kind != "restart_service" {
            self.reject(&mut record, &raw, &format!("unsupported_action_type:{kind}"))?;
            return Ok(ExecOutcome::Rejected {
                action_id: action_id.to_string(),
                reason: format!("unsupported_action_type:{kind}"),
            });
        }

        let ts = now_unix();
        let out = self.runner.restart_service(&target).await;
        let ok = out.returncode == 0;
        let stdout = crate::clip(&out.stdout, 4000);
        let stderr = crate::clip(&out.stderr, 4000);

        let execution = Execution {
            claimed_by: self.cfg.executor_id.clone(),
            claimed_ts: ts,
            executed_ts: now_unix(),
            ok,
            returncode: out.returncode,
            stdout,
            stderr,
            cmd: out.cmd.clone(),
            hint: out.hint,
            reason: None,
        };

        record.status = if ok { ActionStatus::Executed } else { ActionStatus::Failed };
        record.execution = Some(execution.clone());
        self.store.save(&mut record, &raw)?;

        if ok {
            let msg = json!({
                "action_id": action_id,
                "approved_msg": record,
                "execution": execution,
                "ts": now_unix(),
            });
            self.kv.rpush(EXECUTED_Q, &msg.to_string())?;
        } else {
            let msg = json!({
                "action_id": action_id,
                "error": "execution_failed",
                "extra": execution,
                "ts": now_unix(),
            });
            self.kv.rpush(REJECTED_Q, &msg.to_string())?;
        }

        info!(action_id, cmd = %out.cmd, rc = out.returncode, "executed");
        Ok(ExecOutcome::Executed { action_id: action_id.to_string(), ok })
    }

    /// Claim and process one approved action. Returns None when the queue is
    /// empty, `Frozen` when the global freeze is active.
    pub async fn process_one(&self) -> Result<Option<ExecOutcome>, OpsError> {
        if self.freeze_active()? {
            return Ok(Some(ExecOutcome::Frozen));
        }
        let Some(item) = self.kv.pop_push(APPROVED_Q, APPROVED_INFLIGHT_Q)? else {
            return Ok(None);
        };
        let action_id = action_id_of(&item);

        let result = self.handle_claimed(&action_id).await;
        let _ = self.kv.lrem(APPROVED_INFLIGHT_Q, &item);

        match result {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                let reason = e.rejection_reason();
                warn!(action_id = %action_id, error = %e, "execution failed");
                self.reject_orphan(&action_id, &reason);
                Ok(Some(ExecOutcome::Rejected { action_id, reason }))
            }
        }
    }

    pub async fn run(self) {
        info!(
            executor_id = %self.cfg.executor_id,
            allowed_types = ?self.cfg.allowed_types,
            allowed_targets = ?self.cfg.allowed_targets,
            require_digest_match = self.cfg.require_digest_match,
            idempotency_ttl_sec = self.cfg.idempotency_ttl_sec,
            "executor worker started"
        );

        let mut last_freeze_state: Option<bool> = None;
        loop {
            let frozen = self.freeze_active().unwrap_or(false);
            if last_freeze_state != Some(frozen) {
                if frozen {
                    info!("execution suppressed: global freeze active");
                } else if last_freeze_state.is_some() {
                    info!("execution resumed: global freeze cleared");
                }
                last_freeze_state = Some(frozen);
            }
            if frozen {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            match self.process_one().await {
                Ok(Some(ExecOutcome::Frozen)) | Ok(None) => {
                    tokio::time::sleep(Duration::from_secs_f64(self.cfg.poll_sec)).await
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    warn!(error = %e, "executor loop error");
                    tokio::time::sleep(Duration::from_secs_f64(self.cfg.poll_sec)).await
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Approval};
    use sentinel_kv::MemoryKv;
    use std::sync::Mutex;

    struct MockRunner {
        calls: Mutex<Vec<String>>,
        rc: i32,
    }

    impl MockRunner {
        fn new(rc: i32) -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(vec![]), rc })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionRunner for MockRunner {
        async fn restart_service(&self, target: &str) -> RunOutput {
            self.calls.lock().unwrap().push(target.to_string());
            RunOutput {
                returncode: self.rc,
                stdout: "restarted".into(),
                stderr: String::new(),
                cmd: format!("docker compose restart {target}"),
                hint: "env file present".into(),
            }
        }
    }

    fn cfg() -> ExecutorConfig {
        ExecutorConfig {
            poll_sec: 1.0,
            executor_id: "agent_executor".into(),
            allowed_types: vec!["restart_service".into()],
            allowed_targets: vec![],
            require_digest_match: true,
            idempotency_ttl_sec: 86400,
            global_freeze_key: Some("ops:freeze".into()),
        }
    }

    fn seed_approved(kv: &Arc<MemoryKv>, id: &str, kind: &str, target: &str) -> ActionRecord {
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
            status: ActionStatus::Approved,
            fingerprint: "fp".into(),
            manager: "agent_manager".into(),
            recommended_confidence: 0.85,
            action,
            digest: digest.clone(),
            rev: 1,
            approval: Some(Approval {
                approved_by: "human_approver".into(),
                approved_ts: 1001,
                approved_digest: digest,
            }),
            execution: None,
            rejection: None,
            reaper: None,
        };
        ActionStore::new(kv.clone()).create(&record).unwrap();
        let msg = json!({"action_id": id, "approved_msg": record, "ts": 1001});
        kv.rpush(APPROVED_Q, &msg.to_string()).unwrap();
        record
    }

    #[tokio::test]
    async fn happy_path_executes_once() {
        let kv = Arc::new(MemoryKv::new());
        seed_approved(&kv, "act_1", "restart_service", "sentinel-api");
        let runner = MockRunner::new(0);
        let w = ExecutorWorker::new(kv.clone(), cfg(), runner.clone());

        let outcome = w.process_one().await.unwrap().unwrap();
        assert_eq!(outcome, ExecOutcome::Executed { action_id: "act_1".into(), ok: true });
        assert_eq!(runner.calls(), vec!["sentinel-api"]);

        let rec: ActionRecord =
            serde_json::from_str(&kv.get("ops:action:act_1").unwrap().unwrap()).unwrap();
        assert_eq!(rec.status, ActionStatus::Executed);
        let exec = rec.execution.unwrap();
        assert!(exec.ok);
        assert_eq!(exec.returncode, 0);
        assert_eq!(exec.claimed_by, "agent_executor");

        assert_eq!(kv.llen(EXECUTED_Q).unwrap(), 1);
        assert_eq!(kv.llen(APPROVED_INFLIGHT_Q).unwrap(), 0);
    }

    #[tokio::test]
    async fn second_delivery_drops_silently() {
        let kv = Arc::new(MemoryKv::new());
        let record = seed_approved(&kv, "act_1", "restart_service", "sentinel-api");
        // duplicate delivery of the same approved action
        let msg = json!({"action_id": "act_1", "approved_msg": record, "ts": 1002});
        kv.rpush(APPROVED_Q, &msg.to_string()).unwrap();

        let runner = MockRunner::new(0);
        let w = ExecutorWorker::new(kv.clone(), cfg(), runner.clone());

        let first = w.process_one().await.unwrap().unwrap();
        assert!(matches!(first, ExecOutcome::Executed { .. }));
        let second = w.process_one().await.unwrap().unwrap();
        assert_eq!(second, ExecOutcome::DroppedDuplicate { action_id: "act_1".into() });

        // exactly one side-effect dispatch, one executed event
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(kv.llen(EXECUTED_Q).unwrap(), 1);
        assert_eq!(kv.llen(REJECTED_Q).unwrap(), 0);
    }

    #[tokio::test]
    async fn reason_mutation_keeps_digest_target_mutation_breaks_it() {
        let kv = Arc::new(MemoryKv::new());
        let rec = seed_approved(&kv, "act_1", "restart_service", "sentinel-api");
        let store = ActionStore::new(kv.clone());

        // mutate the reason: digest over intent is unchanged, execution proceeds
        let raw = kv.get("ops:action:act_1").unwrap().unwrap();
        let mut mutated = rec.clone();
        mutated.action.reason = "someone edited the reason".into();
        store.save(&mut mutated, &raw).unwrap();

        let runner = MockRunner::new(0);
        let w = ExecutorWorker::new(kv.clone(), cfg(), runner.clone());
        let outcome = w.process_one().await.unwrap().unwrap();
        assert_eq!(outcome, ExecOutcome::Executed { action_id: "act_1".into(), ok: true });

        // mutate the target on a second action: digest no longer matches
        let rec2 = seed_approved(&kv, "act_2", "restart_service", "sentinel-api");
        let raw2 = kv.get("ops:action:act_2").unwrap().unwrap();
        let mut evil = rec2;
        evil.action.target = "victim-svc".into();
        store.save(&mut evil, &raw2).unwrap();

        match w.process_one().await.unwrap().unwrap() {
            ExecOutcome::Rejected { reason, .. } => {
                assert!(reason.starts_with("digest_mismatch"), "{reason}")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(runner.calls(), vec!["sentinel-api"]);
    }

    #[tokio::test]
    async fn missing_approved_digest_is_rejected() {
        let kv = Arc::new(MemoryKv::new());
        let rec = seed_approved(&kv, "act_1", "restart_service", "sentinel-api");
        let raw = kv.get("ops:action:act_1").unwrap().unwrap();
        let mut no_approval = rec;
        no_approval.approval = None;
        ActionStore::new(kv.clone()).save(&mut no_approval, &raw).unwrap();

        let w = ExecutorWorker::new(kv.clone(), cfg(), MockRunner::new(0));
        match w.process_one().await.unwrap().unwrap() {
            ExecOutcome::Rejected { reason, .. } => {
                assert_eq!(reason, "missing_approved_digest")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected() {
        let kv = Arc::new(MemoryKv::new());
        seed_approved(&kv, "act_1", "scale_service", "sentinel-api");
        let mut c = cfg();
        c.allowed_types = vec!["scale_service".into()];
        let runner = MockRunner::new(0);
        let w = ExecutorWorker::new(kv.clone(), c, runner.clone());

        match w.process_one().await.unwrap().unwrap() {
            ExecOutcome::Rejected { reason, .. } => {
                assert_eq!(reason, "unsupported_action_type:scale_service")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn nonzero_rc_marks_failed() {
        let kv = Arc::new(MemoryKv::new());
        seed_approved(&kv, "act_1", "restart_service", "sentinel-api");
        let w = ExecutorWorker::new(kv.clone(), cfg(), MockRunner::new(7));

        let outcome = w.process_one().await.unwrap().unwrap();
        assert_eq!(outcome, ExecOutcome::Executed { action_id: "act_1".into(), ok: false });

        let rec: ActionRecord =
            serde_json::from_str(&kv.get("ops:action:act_1").unwrap().unwrap()).unwrap();
        assert_eq!(rec.status, ActionStatus::Failed);
        assert_eq!(kv.llen(REJECTED_Q).unwrap(), 1);
        assert_eq!(kv.llen(EXECUTED_Q).unwrap(), 0);
    }

    #[tokio::test]
    async fn freeze_suspends_dispatch() {
        let kv = Arc::new(MemoryKv::new());
        seed_approved(&kv, "act_1", "restart_service", "sentinel-api");
        kv.set("ops:freeze", "1").unwrap();

        let runner = MockRunner::new(0);
        let w = ExecutorWorker::new(kv.clone(), cfg(), runner.clone());
        assert_eq!(w.process_one().await.unwrap().unwrap(), ExecOutcome::Frozen);
        assert!(runner.calls().is_empty());
        assert_eq!(kv.llen(APPROVED_Q).unwrap(), 1);
    }

    #[test]
    fn queue_item_parsing_handles_both_shapes() {
        assert_eq!(action_id_of("act_plain"), "act_plain");
        assert_eq!(action_id_of(r#"{"action_id":"act_1","ts":1}"#), "act_1");
    }
}
