//! Inflight recovery.
//!
//! Workers claim queue items into companion inflight lists; if a worker dies
//! mid-claim the token stays behind. Every tick the reaper scans both
//! inflight lists in bounded batches, drops tokens for missing or terminal
//! records, and requeues stale claims. An action requeued more than
//! `max_requeues` times is quarantined instead of looping forever.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use sentinel_kv::{now_iso, now_unix, KvStore};

use crate::env;
use crate::executor::action_id_of;
use crate::queues::{
    APPROVED_INFLIGHT_Q, APPROVED_Q, PROPOSED_INFLIGHT_Q, PROPOSED_Q, QUARANTINE_Q,
    REAPER_HEARTBEAT_KEY, REQUEUE_COUNT_KEY_PREFIX,
};
use crate::store::ActionStore;
use crate::types::{ActionRecord, ActionStatus};
use crate::OpsError;

/// Bounded work per inflight list per tick.
const SCAN_BATCH: usize = 50;
const HEARTBEAT_TTL_SEC: u64 = 30;
const REQUEUE_COUNT_TTL_SEC: u64 = 172800; // 2 days

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub poll_sec: f64,
    pub stale_sec: u64,
    pub max_requeues: u64,
}

impl ReaperConfig {
    pub fn from_env() -> Self {
        Self {
            poll_sec: env::f64_or("REAPER_POLL_SEC", 5.0),
            stale_sec: env::u64_or("STALE_SEC", 60),
            max_requeues: env::u64_or("MAX_REQUEUES", 5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Proposed,
    Approved,
}

impl Origin {
    fn main_queue(&self) -> &'static str {
        match self {
            Origin::Proposed => PROPOSED_Q,
            Origin::Approved => APPROVED_Q,
        }
    }

    fn inflight_queue(&self) -> &'static str {
        match self {
            Origin::Proposed => PROPOSED_INFLIGHT_Q,
            Origin::Approved => APPROVED_INFLIGHT_Q,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Origin::Proposed => "proposed",
            Origin::Approved => "approved",
        }
    }
}

pub struct ReaperWorker {
    kv: Arc<dyn KvStore>,
    store: ActionStore,
    cfg: ReaperConfig,
}

impl ReaperWorker {
    pub fn new(kv: Arc<dyn KvStore>, cfg: ReaperConfig) -> Self {
        let store = ActionStore::new(kv.clone());
        Self { kv, store, cfg }
    }

    /// Latest known claim timestamp. No timestamp means stale.
    fn claimed_ts(record: &ActionRecord) -> Option<u64> {
        if let Some(exec) = &record.execution {
            return Some(exec.claimed_ts);
        }
        record.approval.as_ref().map(|a| a.approved_ts)
    }

    fn requeue_or_quarantine(
        &self,
        action_id: &str,
        mut record: ActionRecord,
        base_raw: &str,
        origin: Origin,
    ) -> Result<(), OpsError> {
        let mut reaper = record.reaper.take().unwrap_or_default();
        reaper.last_seen_inflight_ts = now_unix();
        reaper.last_seen_inflight_iso = now_iso();

        let count_key = format!("{REQUEUE_COUNT_KEY_PREFIX}{}:{action_id}", origin.name());
        let count = self.kv.incr(&count_key)?;
        self.kv
            .expire(&count_key, Duration::from_secs(REQUEUE_COUNT_TTL_SEC))?;

        if count as u64 > self.cfg.max_requeues {
            record.status = ActionStatus::Quarantined;
            reaper.quarantined_reason =
                Some(format!("max_requeues_exceeded:{}", self.cfg.max_requeues));
            reaper.quarantined_from = Some(origin.name().to_string());
            reaper.quarantined_at = Some(now_iso());
            record.reaper = Some(reaper);
            self.store.save(&mut record, base_raw)?;
            self.kv.rpush(QUARANTINE_Q, action_id)?;
            warn!(action_id, origin = origin.name(), count, "quarantined");
            return Ok(());
        }

        record.reaper = Some(reaper);
        self.store.save(&mut record, base_raw)?;
        self.kv.rpush(origin.main_queue(), action_id)?;
        info!(action_id, origin = origin.name(), count, "requeued");
        Ok(())
    }

    fn scan_inflight(&self, origin: Origin) -> Result<(), OpsError> {
        let inflight_q = origin.inflight_queue();
        let n = self.kv.llen(inflight_q)?;
        if n == 0 {
            return Ok(());
        }
        let items = self.kv.lrange(inflight_q, 0, n.min(SCAN_BATCH))?;

        for item in items {
            let action_id = action_id_of(&item);
            if action_id.is_empty() {
                continue;
            }

            let Some((record, raw)) = self.store.load(&action_id)? else {
                // nothing to recover; drop the token
                self.kv.lrem(inflight_q, &item)?;
                continue;
            };

            if record.status.is_terminal() {
                self.kv.lrem(inflight_q, &item)?;
                continue;
            }

            let is_stale = match Self::claimed_ts(&record) {
                Some(ts) => now_unix().saturating_sub(ts) >= self.cfg.stale_sec,
                None => true,
            };
            if !is_stale {
                continue;
            }

            self.kv.lrem(inflight_q, &item)?;
            self.requeue_or_quarantine(&action_id, record, &raw, origin)?;
        }
        Ok(())
    }

    /// One recovery pass: heartbeat + both inflight lists.
    pub fn tick(&self) -> Result<(), OpsError> {
        self.kv.set_ex(
            REAPER_HEARTBEAT_KEY,
            &now_iso(),
            Duration::from_secs(HEARTBEAT_TTL_SEC),
        )?;
        self.scan_inflight(Origin::Proposed)?;
        self.scan_inflight(Origin::Approved)?;
        Ok(())
    }

    pub async fn run(self) {
        info!(
            poll_sec = self.cfg.poll_sec,
            stale_sec = self.cfg.stale_sec,
            max_requeues = self.cfg.max_requeues,
            "reaper worker started"
        );
        loop {
            if let Err(e) = self.tick() {
                warn!(error = %e, "reaper tick failed");
            }
            tokio::time::sleep(Duration::from_secs_f64(self.cfg.poll_sec)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Approval};
    use sentinel_kv::MemoryKv;
    use serde_json::json;

    fn cfg() -> ReaperConfig {
        ReaperConfig { poll_sec: 5.0, stale_sec: 60, max_requeues: 2 }
    }

    fn record(id: &str, status: ActionStatus, approved_ts: Option<u64>) -> ActionRecord {
        ActionRecord {
            action_id: id.into(),
            incident_id: "inc_1".into(),
            created_ts: 1000,
            expires_ts: 1900,
            status,
            fingerprint: "fp".into(),
            manager: "agent_manager".into(),
            recommended_confidence: 0.85,
            action: Action {
                kind: "restart_service".into(),
                target: "sentinel-api".into(),
                params: json!({}),
                reason: "r".into(),
            },
            digest: "sha256:x".into(),
            rev: 0,
            approval: approved_ts.map(|ts| Approval {
                approved_by: "human_approver".into(),
                approved_ts: ts,
                approved_digest: "sha256:x".into(),
            }),
            execution: None,
            rejection: None,
            reaper: None,
        }
    }

    fn seed(kv: &Arc<MemoryKv>, rec: &ActionRecord, inflight_q: &str) {
        ActionStore::new(kv.clone()).create(rec).unwrap();
        kv.rpush(inflight_q, &rec.action_id).unwrap();
    }

    #[test]
    fn tick_writes_heartbeat() {
        let kv = Arc::new(MemoryKv::new());
        ReaperWorker::new(kv.clone(), cfg()).tick().unwrap();
        assert!(kv.get(REAPER_HEARTBEAT_KEY).unwrap().is_some());
    }

    #[test]
    fn missing_record_token_is_dropped() {
        let kv = Arc::new(MemoryKv::new());
        kv.rpush(PROPOSED_INFLIGHT_Q, "act_ghost").unwrap();
        ReaperWorker::new(kv.clone(), cfg()).tick().unwrap();
        assert_eq!(kv.llen(PROPOSED_INFLIGHT_Q).unwrap(), 0);
        assert_eq!(kv.llen(PROPOSED_Q).unwrap(), 0);
    }

    #[test]
    fn terminal_status_token_is_dropped() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, &record("act_1", ActionStatus::Executed, None), APPROVED_INFLIGHT_Q);
        ReaperWorker::new(kv.clone(), cfg()).tick().unwrap();
        assert_eq!(kv.llen(APPROVED_INFLIGHT_Q).unwrap(), 0);
        assert_eq!(kv.llen(APPROVED_Q).unwrap(), 0);
    }

    #[test]
    fn no_timestamp_means_stale_and_requeues_to_origin() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, &record("act_1", ActionStatus::Proposed, None), PROPOSED_INFLIGHT_Q);

        let w = ReaperWorker::new(kv.clone(), cfg());
        w.tick().unwrap();

        assert_eq!(kv.llen(PROPOSED_INFLIGHT_Q).unwrap(), 0);
        assert_eq!(kv.lrange(PROPOSED_Q, 0, 10).unwrap(), vec!["act_1".to_string()]);

        let rec: ActionRecord =
            serde_json::from_str(&kv.get("ops:action:act_1").unwrap().unwrap()).unwrap();
        let reaper = rec.reaper.unwrap();
        assert!(reaper.last_seen_inflight_ts > 0);
        assert!(reaper.quarantined_reason.is_none());
    }

    #[test]
    fn fresh_claim_is_left_alone() {
        let kv = Arc::new(MemoryKv::new());
        seed(
            &kv,
            &record("act_1", ActionStatus::Approved, Some(now_unix())),
            APPROVED_INFLIGHT_Q,
        );
        ReaperWorker::new(kv.clone(), cfg()).tick().unwrap();
        assert_eq!(kv.llen(APPROVED_INFLIGHT_Q).unwrap(), 1);
        assert_eq!(kv.llen(APPROVED_Q).unwrap(), 0);
    }

    #[test]
    fn stale_claim_is_requeued() {
        let kv = Arc::new(MemoryKv::new());
        let old = now_unix() - 600;
        seed(
            &kv,
            &record("act_1", ActionStatus::Approved, Some(old)),
            APPROVED_INFLIGHT_Q,
        );
        ReaperWorker::new(kv.clone(), cfg()).tick().unwrap();
        assert_eq!(kv.llen(APPROVED_INFLIGHT_Q).unwrap(), 0);
        assert_eq!(kv.lrange(APPROVED_Q, 0, 10).unwrap(), vec!["act_1".to_string()]);
    }

    #[test]
    fn exceeding_max_requeues_quarantines() {
        let kv = Arc::new(MemoryKv::new());
        seed(&kv, &record("act_1", ActionStatus::Proposed, None), PROPOSED_INFLIGHT_Q);
        let w = ReaperWorker::new(kv.clone(), cfg());

        // each tick: requeue from main back to inflight to simulate a worker
        // that keeps claiming and dying
        for _ in 0..2 {
            w.tick().unwrap();
            let id = kv.pop_push(PROPOSED_Q, PROPOSED_INFLIGHT_Q).unwrap().unwrap();
            assert_eq!(id, "act_1");
        }

        // third stale recovery exceeds max_requeues=2
        w.tick().unwrap();

        assert_eq!(kv.lrange(QUARANTINE_Q, 0, 10).unwrap(), vec!["act_1".to_string()]);
        assert_eq!(kv.llen(PROPOSED_Q).unwrap(), 0);
        assert_eq!(kv.llen(PROPOSED_INFLIGHT_Q).unwrap(), 0);

        let rec: ActionRecord =
            serde_json::from_str(&kv.get("ops:action:act_1").unwrap().unwrap()).unwrap();
        assert_eq!(rec.status, ActionStatus::Quarantined);
        let reaper = rec.reaper.unwrap();
        assert_eq!(reaper.quarantined_reason.as_deref(), Some("max_requeues_exceeded:2"));
        assert_eq!(reaper.quarantined_from.as_deref(), Some("proposed"));
    }

    #[test]
    fn approved_inflight_accepts_message_shaped_tokens() {
        let kv = Arc::new(MemoryKv::new());
        let rec = record("act_1", ActionStatus::Approved, Some(now_unix() - 600));
        ActionStore::new(kv.clone()).create(&rec).unwrap();
        let msg = json!({"action_id": "act_1", "approved_msg": rec, "ts": 1});
        kv.rpush(APPROVED_INFLIGHT_Q, &msg.to_string()).unwrap();

        ReaperWorker::new(kv.clone(), cfg()).tick().unwrap();
        assert_eq!(kv.llen(APPROVED_INFLIGHT_Q).unwrap(), 0);
        assert_eq!(kv.lrange(APPROVED_Q, 0, 10).unwrap(), vec!["act_1".to_string()]);
    }
}
