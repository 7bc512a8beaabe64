//! Replay protection: at-most-once acceptance of request nonces.
//!
//! Primary path is a `set_nx_ex` on the shared store. A durable file-backed
//! fallback serves when the primary errors, and the guard reports which
//! backend handled each check so callers can surface it.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sentinel_common::sha256_hex;

use crate::{now_unix_f64, KvResult, KvStore};

pub const REPLAY_PREFIX: &str = "sentinel:replay";

/// Nonce identifying one signed request.
pub fn replay_nonce(agent_id: &str, command: &str, ts_unix: &str) -> String {
    sha256_hex(format!("{agent_id}|{command}|{ts_unix}").as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayBackend {
    Primary,
    Fallback,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NonceFile {
    #[serde(default)]
    nonces: HashMap<String, f64>,
}

/// Durable nonce store: a JSON map of nonce -> created_at, rewritten with
/// temp-file + rename. Expired entries are swept on every check.
pub struct FileReplayStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileReplayStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    /// Returns true iff the nonce was absent (inserted now).
    pub fn check_and_set(&self, nonce: &str, ttl: Duration) -> KvResult<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut db: NonceFile = match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => NonceFile::default(),
        };

        let now = now_unix_f64();
        let cutoff = now - ttl.as_secs_f64();
        db.nonces.retain(|_, created| *created >= cutoff);

        if db.nonces.contains_key(nonce) {
            // still persist the sweep
            self.write(&db)?;
            return Ok(false);
        }
        db.nonces.insert(nonce.to_string(), now);
        self.write(&db)?;
        Ok(true)
    }

    fn write(&self, db: &NonceFile) -> KvResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(db)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Primary (shared store) with automatic durable fallback.
pub struct ReplayGuard {
    kv: Arc<dyn KvStore>,
    fallback: FileReplayStore,
    prefix: String,
}

impl ReplayGuard {
    pub fn new(kv: Arc<dyn KvStore>, fallback_path: impl Into<PathBuf>) -> Self {
        Self {
            kv,
            fallback: FileReplayStore::new(fallback_path),
            prefix: REPLAY_PREFIX.to_string(),
        }
    }

    /// Returns (fresh, backend). `fresh` is true iff this nonce has not been
    /// seen within the ttl window.
    pub fn check_and_set(&self, nonce: &str, ttl: Duration) -> KvResult<(bool, ReplayBackend)> {
        let key = format!("{}:{}", self.prefix, nonce);
        match self.kv.set_nx_ex(&key, "1", ttl) {
            Ok(fresh) => Ok((fresh, ReplayBackend::Primary)),
            Err(_) => {
                let fresh = self.fallback.check_and_set(nonce, ttl)?;
                Ok((fresh, ReplayBackend::Fallback))
            }
        }
    }
}
