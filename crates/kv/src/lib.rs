//! sentinel_kv
//!
//! KV-store abstraction the whole pipeline runs on:
//! - strings with TTL + atomic conditional writes (NX / CAS)
//! - lists with an ATOMIC pop-from-source-push-to-inflight claim
//! - a sorted set (action budget window)
//! - signed queue envelopes
//! - replay nonce store with a durable file fallback
//!
//! The durable backend is deployment-provided; `MemoryKv` here covers a
//! single-host deployment and the test suite. Queues carry `action_id`
//! strings for the action flow and full JSON documents for incidents.
//!
//! IMPORTANT: `pop_push` must stay a single atomic step. Splitting it into a
//! pop followed by a push loses items when the claimer dies in between.

use std::time::Duration;
use thiserror::Error;

mod memory;
pub mod queue;
pub mod replay;

pub use memory::MemoryKv;
pub use queue::SignedQueue;
pub use replay::{replay_nonce, FileReplayStore, ReplayBackend, ReplayGuard};

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type KvResult<T> = Result<T, KvError>;

/// Minimal surface the gateway and workers need from the shared store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> KvResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> KvResult<()>;
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;
    /// Atomic set-if-absent with expiry. Returns true iff the key was set.
    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;
    /// Atomic conditional write: succeeds iff the current value equals
    /// `expected` (`None` = key absent). Returns false on conflict.
    fn cas(&self, key: &str, expected: Option<&str>, value: &str) -> KvResult<bool>;
    fn del(&self, key: &str) -> KvResult<()>;
    fn exists(&self, key: &str) -> KvResult<bool>;
    fn incr(&self, key: &str) -> KvResult<i64>;
    fn expire(&self, key: &str, ttl: Duration) -> KvResult<()>;

    fn rpush(&self, key: &str, value: &str) -> KvResult<()>;
    fn lpop(&self, key: &str) -> KvResult<Option<String>>;
    /// Atomic claim: pop the head of `source` and append it to `dest`.
    fn pop_push(&self, source: &str, dest: &str) -> KvResult<Option<String>>;
    /// Remove occurrences of `value`; returns how many were removed.
    fn lrem(&self, key: &str, value: &str) -> KvResult<usize>;
    fn llen(&self, key: &str) -> KvResult<usize>;
    fn lrange(&self, key: &str, start: usize, count: usize) -> KvResult<Vec<String>>;

    fn zadd(&self, key: &str, member: &str, score: i64) -> KvResult<()>;
    fn zcard(&self, key: &str) -> KvResult<usize>;
    fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> KvResult<usize>;
}

/// Wall-clock unix seconds.
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wall-clock unix seconds with sub-second precision.
pub fn now_unix_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// RFC 3339 UTC timestamp (heartbeats, envelopes, quarantine marks).
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
