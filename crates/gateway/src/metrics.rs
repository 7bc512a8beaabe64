//! In-process counters behind `/metrics` (Prometheus text format) and
//! `/stats` (JSON, including the per-agent violation maps).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::error::ApiError;

#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_ok: AtomicU64,
    pub http_401_total: AtomicU64,
    pub http_409_total: AtomicU64,
    pub http_429_total: AtomicU64,
    pub http_503_total: AtomicU64,
    pub http_500_total: AtomicU64,
    pub decision_allow_total: AtomicU64,
    pub decision_deny_total: AtomicU64,
    pub decision_review_total: AtomicU64,
    pub replay_detected_total: AtomicU64,
    pub rate_limited_total: AtomicU64,

    agents_seen: Mutex<HashSet<String>>,
    unauthorized_by_agent: Mutex<HashMap<String, u64>>,
    replay_by_agent: Mutex<HashMap<String, u64>>,
    ratelimit_by_agent: Mutex<HashMap<String, u64>>,
    deny_by_agent: Mutex<HashMap<String, u64>>,
    denied_commands: Mutex<HashMap<String, u64>>,
    allowed_commands: Mutex<HashMap<String, u64>>,
}

fn bump(map: &Mutex<HashMap<String, u64>>, key: &str) {
    let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
    *map.entry(key.to_string()).or_insert(0) += 1;
}

fn snapshot_map(map: &Mutex<HashMap<String, u64>>) -> HashMap<String, u64> {
    map.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn see_agent(&self, agent_id: &str) {
        self.agents_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id.to_string());
    }

    pub fn agents_seen_count(&self) -> usize {
        self.agents_seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn record_decision(&self, decision: &str, command: &str, agent_id: &str) {
        match decision {
            "allow" => {
                self.decision_allow_total.fetch_add(1, Ordering::Relaxed);
                bump(&self.allowed_commands, command);
            }
            "deny" => {
                self.decision_deny_total.fetch_add(1, Ordering::Relaxed);
                bump(&self.deny_by_agent, agent_id);
                bump(&self.denied_commands, command);
            }
            _ => {
                self.decision_review_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Count an error on its dedicated counter and per-agent map.
    pub fn record_error(&self, err: &ApiError, agent_id: Option<&str>) {
        match err {
            ApiError::InvalidApiKey
            | ApiError::MissingSignature
            | ApiError::BadSignature
            | ApiError::TimestampOutsideWindow => {
                self.http_401_total.fetch_add(1, Ordering::Relaxed);
                if let Some(agent) = agent_id {
                    bump(&self.unauthorized_by_agent, agent);
                }
            }
            ApiError::ReplayDetected => {
                self.http_409_total.fetch_add(1, Ordering::Relaxed);
                self.replay_detected_total.fetch_add(1, Ordering::Relaxed);
                if let Some(agent) = agent_id {
                    bump(&self.replay_by_agent, agent);
                }
            }
            ApiError::RateLimited => {
                self.http_429_total.fetch_add(1, Ordering::Relaxed);
                self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
                if let Some(agent) = agent_id {
                    bump(&self.ratelimit_by_agent, agent);
                }
            }
            ApiError::GlobalFreeze => {
                self.http_503_total.fetch_add(1, Ordering::Relaxed);
            }
            ApiError::Internal(_) => {
                self.http_500_total.fetch_add(1, Ordering::Relaxed);
            }
            ApiError::BadInput(_) | ApiError::NotFound(_) => {}
        }
    }

    pub fn render_prometheus(&self) -> String {
        let pairs: [(&str, u64); 12] = [
            ("sentinel_requests_total", self.requests_total.load(Ordering::Relaxed)),
            ("sentinel_requests_ok", self.requests_ok.load(Ordering::Relaxed)),
            ("sentinel_http_401_total", self.http_401_total.load(Ordering::Relaxed)),
            ("sentinel_http_409_total", self.http_409_total.load(Ordering::Relaxed)),
            ("sentinel_http_429_total", self.http_429_total.load(Ordering::Relaxed)),
            ("sentinel_http_503_total", self.http_503_total.load(Ordering::Relaxed)),
            ("sentinel_http_500_total", self.http_500_total.load(Ordering::Relaxed)),
            ("sentinel_decision_allow_total", self.decision_allow_total.load(Ordering::Relaxed)),
            ("sentinel_decision_deny_total", self.decision_deny_total.load(Ordering::Relaxed)),
            ("sentinel_decision_review_total", self.decision_review_total.load(Ordering::Relaxed)),
            ("sentinel_replay_detected_total", self.replay_detected_total.load(Ordering::Relaxed)),
            ("sentinel_rate_limited_total", self.rate_limited_total.load(Ordering::Relaxed)),
        ];
        let mut out = String::new();
        for (name, value) in pairs {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        out.push_str(&format!(
            "# TYPE sentinel_agents_seen gauge\nsentinel_agents_seen {}\n",
            self.agents_seen_count()
        ));
        out
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "requests_ok": self.requests_ok.load(Ordering::Relaxed),
            "http_401_total": self.http_401_total.load(Ordering::Relaxed),
            "http_409_total": self.http_409_total.load(Ordering::Relaxed),
            "http_429_total": self.http_429_total.load(Ordering::Relaxed),
            "http_503_total": self.http_503_total.load(Ordering::Relaxed),
            "http_500_total": self.http_500_total.load(Ordering::Relaxed),
            "decision_allow_total": self.decision_allow_total.load(Ordering::Relaxed),
            "decision_deny_total": self.decision_deny_total.load(Ordering::Relaxed),
            "decision_review_total": self.decision_review_total.load(Ordering::Relaxed),
            "replay_detected_total": self.replay_detected_total.load(Ordering::Relaxed),
            "rate_limited_total": self.rate_limited_total.load(Ordering::Relaxed),
            "agents_seen": self.agents_seen_count(),
            "unauthorized_by_agent": snapshot_map(&self.unauthorized_by_agent),
            "replay_by_agent": snapshot_map(&self.replay_by_agent),
            "ratelimit_by_agent": snapshot_map(&self.ratelimit_by_agent),
            "deny_by_agent": snapshot_map(&self.deny_by_agent),
            "denied_commands": snapshot_map(&self.denied_commands),
            "allowed_commands": snapshot_map(&self.allowed_commands),
        })
    }
}
