//! sentinel_reputation
//!
//! Dual-track reputation:
//! - float ORACLE in the shared store: score in [0,1], default 1.0, shifted
//!   per decision outcome
//! - integer LEDGER on disk: counters + reputation with time decay toward 0,
//!   applied on read
//!
//! The ledger file is rewritten with temp-file + rename so a crash mid-write
//! never leaves a torn database.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sentinel_kv::{now_iso, now_unix_f64, KvResult, KvStore};
use sentinel_policy::PolicyDecision;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// ----------------------------
// Integer ledger (file-backed)
// ----------------------------

#[derive(Debug, Clone, Copy)]
pub struct DecayConfig {
    /// Every `period_sec`, reputation moves `step` toward 0.
    pub period_sec: u64,
    pub step: i64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self { period_sec: 3600, step: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerState {
    pub agent_id: String,
    pub reputation: i64,
    pub allowed: u64,
    pub blocked: u64,
    pub reviewed: u64,
    pub last_decision: String,
    pub updated_at: f64,
}

impl LedgerState {
    fn fresh(agent_id: &str, now: f64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            reputation: 0,
            allowed: 0,
            blocked: 0,
            reviewed: 0,
            last_decision: "unknown".to_string(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(rename = "_meta")]
    meta: LedgerMeta,
    #[serde(default)]
    agents: BTreeMap<String, LedgerState>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerMeta {
    version: u32,
}

impl Default for LedgerFile {
    fn default() -> Self {
        Self { meta: LedgerMeta { version: 1 }, agents: BTreeMap::new() }
    }
}

fn decay_value(rep: i64, elapsed_sec: f64, cfg: &DecayConfig) -> i64 {
    if cfg.period_sec == 0 || cfg.step <= 0 {
        return rep;
    }
    let steps = (elapsed_sec / cfg.period_sec as f64).floor() as i64;
    if steps <= 0 {
        return rep;
    }
    if rep > 0 {
        (rep - steps * cfg.step).max(0)
    } else if rep < 0 {
        (rep + steps * cfg.step).min(0)
    } else {
        rep
    }
}

fn apply_decay(state: &mut LedgerState, cfg: &DecayConfig, now: f64) {
    if state.updated_at <= 0.0 {
        return;
    }
    let elapsed = now - state.updated_at;
    if elapsed <= 0.0 {
        return;
    }
    let decayed = decay_value(state.reputation, elapsed, cfg);
    if decayed != state.reputation {
        state.reputation = decayed;
        // bump updated_at so the same elapsed window is not decayed twice
        state.updated_at = now;
    }
}

pub struct ReputationLedger {
    path: PathBuf,
    cfg: DecayConfig,
    lock: Mutex<()>,
}

impl ReputationLedger {
    pub fn new(path: impl Into<PathBuf>, cfg: DecayConfig) -> Self {
        Self { path: path.into(), cfg, lock: Mutex::new(()) }
    }

    fn load(&self) -> LedgerFile {
        match fs::read(&self.path) {
            // a corrupted file fails safe to an empty db
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => LedgerFile::default(),
        }
    }

    fn save(&self, db: &LedgerFile) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(db)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Read a state, applying decay. Decay that moved the value is persisted.
    pub fn get_state(&self, agent_id: &str) -> Result<LedgerState, LedgerError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_unix_f64();
        let mut db = self.load();
        let state = db
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| LedgerState::fresh(agent_id, now));
        let before = state.reputation;
        apply_decay(state, &self.cfg, now);
        let snapshot = state.clone();
        if snapshot.reputation != before {
            self.save(&db)?;
        }
        Ok(snapshot)
    }

    /// Apply decay, then update counters and reputation:
    /// allow -> +1, deny -> -2, review -> -1.
    pub fn update(
        &self,
        agent_id: &str,
        decision: PolicyDecision,
    ) -> Result<LedgerState, LedgerError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_unix_f64();
        let mut db = self.load();
        let state = db
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| LedgerState::fresh(agent_id, now));
        apply_decay(state, &self.cfg, now);

        match decision {
            PolicyDecision::Allow => {
                state.allowed += 1;
                state.reputation += 1;
                state.last_decision = "allow".to_string();
            }
            PolicyDecision::Deny => {
                state.blocked += 1;
                state.reputation -= 2;
                state.last_decision = "deny".to_string();
            }
            PolicyDecision::Review => {
                state.reviewed += 1;
                state.reputation -= 1;
                state.last_decision = "review".to_string();
            }
        }
        state.updated_at = now;
        let snapshot = state.clone();
        self.save(&db)?;
        Ok(snapshot)
    }
}

// ----------------------------
// Float oracle (shared store)
// ----------------------------

fn rep_key(agent_id: &str) -> String {
    format!("rep:{agent_id}")
}

fn repmeta_key(agent_id: &str) -> String {
    format!("repmeta:{agent_id}")
}

#[derive(Debug, Serialize)]
struct RepMeta {
    score: f64,
    updated_at: String,
}

pub struct ScoreOracle {
    kv: Arc<dyn KvStore>,
}

impl ScoreOracle {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Default starting score is 1.0.
    pub fn get(&self, agent_id: &str) -> KvResult<f64> {
        Ok(self
            .kv
            .get(&rep_key(agent_id))?
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(1.0))
    }

    pub fn set(&self, agent_id: &str, score: f64) -> KvResult<f64> {
        let score = score.clamp(0.0, 1.0);
        self.kv.set(&rep_key(agent_id), &score.to_string())?;
        let meta = RepMeta { score, updated_at: now_iso() };
        self.kv
            .set(&repmeta_key(agent_id), &serde_json::to_string(&meta)?)?;
        Ok(score)
    }

    pub fn bump(&self, agent_id: &str, delta: f64) -> KvResult<f64> {
        let current = self.get(agent_id)?;
        self.set(agent_id, current + delta)
    }

    /// Outcome scoring:
    ///   allow  -> +0.01 (cap 1.0)
    ///   review -> -0.03
    ///   deny   -> -0.08 (floor 0.0)
    pub fn apply_outcome(&self, agent_id: &str, decision: PolicyDecision) -> KvResult<f64> {
        match decision {
            PolicyDecision::Allow => self.bump(agent_id, 0.01),
            PolicyDecision::Review => self.bump(agent_id, -0.03),
            PolicyDecision::Deny => self.bump(agent_id, -0.08),
        }
    }
}
