//! sentinel_audit
//!
//! Append-only JSONL audit log with hash chaining and a signed head.
//! - Each record includes: decision fields, prev_hash, hash, sig
//! - hash = SHA256(prev_hash || "|" || canonical(record minus hash/sig))
//! - The head is mirrored into audit.state + audit_head.txt atomically
//! - Verifier replays from GENESIS and reports the first bad line
//!
//! One writer per process, one writer process per file. The chain stays
//! verifiable on the written subset even when an append fails mid-run.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use sentinel_common::{canonical_json_bytes, hmac_sha256_hex, sha256_hex, CanonError};

pub const GENESIS: &str = "GENESIS";

pub const AUDIT_LOG_FILE: &str = "audit.jsonl";
pub const AUDIT_STATE_FILE: &str = "audit.state";
pub const AUDIT_HEAD_FILE: &str = "audit_head.txt";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] CanonError),
    #[error("signing error: {0}")]
    Sign(#[from] sentinel_common::SignError),
    #[error("chain broken at line {line}: expected prev {expected}, got {got}")]
    ChainBroken { line: usize, expected: String, got: String },
    #[error("hash mismatch at line {line}: expected {expected}, got {got}")]
    HashMismatch { line: usize, expected: String, got: String },
    #[error("signature mismatch at line {line}")]
    SigMismatch { line: usize },
}

/// What the gateway records per decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub client_ip: String,
    pub agent_id: String,
    pub command: String,
    pub decision: String,
    pub risk: String,
    pub risk_score: f64,
    pub reason: String,
    pub policy_version: String,
    pub vt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(flatten)]
    pub entry: AuditEntry,
    pub prev_hash: String,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub ok: bool,
    pub lines: usize,
    pub head: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeadInfo {
    pub audit_head: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_head_sig: Option<String>,
}

fn record_hash(prev_hash: &str, unsigned: &Value) -> Result<String, AuditError> {
    let canon = canonical_json_bytes(unsigned)?;
    let mut material = Vec::with_capacity(prev_hash.len() + 1 + canon.len());
    material.extend_from_slice(prev_hash.as_bytes());
    material.push(b'|');
    material.extend_from_slice(&canon);
    Ok(sha256_hex(&material))
}

fn strip_sig_fields(mut v: Value) -> Value {
    if let Some(map) = v.as_object_mut() {
        map.remove("hash");
        map.remove("sig");
    }
    v
}

pub struct AuditChain {
    log_path: PathBuf,
    state_path: PathBuf,
    head_path: PathBuf,
    secret: Option<String>,
    head: Mutex<String>,
}

impl AuditChain {
    /// Open (or create) the chain rooted at `dir`. The head resumes from
    /// `audit.state`, or from the last log line when the state file is gone.
    pub fn open(dir: impl AsRef<Path>, secret: Option<String>) -> Result<Self, AuditError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let log_path = dir.join(AUDIT_LOG_FILE);
        let state_path = dir.join(AUDIT_STATE_FILE);
        let head_path = dir.join(AUDIT_HEAD_FILE);

        let head = Self::recover_head(&log_path, &state_path)?;
        Ok(Self {
            log_path,
            state_path,
            head_path,
            secret: secret.filter(|s| !s.is_empty()),
            head: Mutex::new(head),
        })
    }

    fn recover_head(log_path: &Path, state_path: &Path) -> Result<String, AuditError> {
        if let Ok(state) = fs::read_to_string(state_path) {
            let state = state.trim().to_string();
            if !state.is_empty() {
                return Ok(state);
            }
        }
        // state file missing: fall back to the last written record
        if log_path.exists() {
            let f = File::open(log_path)?;
            let mut last = None;
            for line in BufReader::new(f).lines() {
                let line = line?;
                if !line.trim().is_empty() {
                    last = Some(line);
                }
            }
            if let Some(line) = last {
                let rec: AuditRecord = serde_json::from_str(&line)?;
                return Ok(rec.hash);
            }
        }
        Ok(GENESIS.to_string())
    }

    pub fn append(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let mut head = self.head.lock().unwrap_or_else(|e| e.into_inner());
        let prev_hash = head.clone();

        let mut unsigned = serde_json::to_value(&entry)?;
        if let Some(map) = unsigned.as_object_mut() {
            map.insert("prev_hash".to_string(), Value::String(prev_hash.clone()));
        }
        let hash = record_hash(&prev_hash, &unsigned)?;
        let sig = match &self.secret {
            Some(secret) => Some(hmac_sha256_hex(secret, hash.as_bytes())?),
            None => None,
        };

        let record = AuditRecord { entry, prev_hash, hash: hash.clone(), sig };
        let line = serde_json::to_string(&record)?;

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
        f.flush()?;

        self.write_head_files(&hash)?;
        *head = hash;
        Ok(record)
    }

    fn write_head_files(&self, head: &str) -> Result<(), AuditError> {
        for path in [&self.state_path, &self.head_path] {
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, head)?;
            fs::rename(&tmp, path)?;
        }
        Ok(())
    }

    /// Replay the whole chain, checking continuity, recomputed hashes, and
    /// signatures when a secret is configured.
    pub fn verify(&self) -> Result<VerifyReport, AuditError> {
        if !self.log_path.exists() {
            return Ok(VerifyReport { ok: true, lines: 0, head: GENESIS.to_string() });
        }
        let f = File::open(&self.log_path)?;
        let reader = BufReader::new(f);

        let mut expected_prev = GENESIS.to_string();
        let mut lines = 0usize;

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let raw: Value = serde_json::from_str(&line)?;
            let prev = raw.get("prev_hash").and_then(|v| v.as_str()).unwrap_or("");
            let hash = raw.get("hash").and_then(|v| v.as_str()).unwrap_or("");
            let sig = raw.get("sig").and_then(|v| v.as_str());

            if prev != expected_prev {
                return Err(AuditError::ChainBroken {
                    line: line_no,
                    expected: expected_prev,
                    got: prev.to_string(),
                });
            }

            let unsigned = strip_sig_fields(raw.clone());
            let computed = record_hash(prev, &unsigned)?;
            if computed != hash {
                return Err(AuditError::HashMismatch {
                    line: line_no,
                    expected: computed,
                    got: hash.to_string(),
                });
            }

            if let Some(secret) = &self.secret {
                let expected_sig = hmac_sha256_hex(secret, hash.as_bytes())?;
                if sig != Some(expected_sig.as_str()) {
                    return Err(AuditError::SigMismatch { line: line_no });
                }
            }

            expected_prev = hash.to_string();
            lines += 1;
        }

        Ok(VerifyReport { ok: true, lines, head: expected_prev })
    }

    /// Current head plus its HMAC for external attestation.
    pub fn head(&self) -> Result<HeadInfo, AuditError> {
        let head = self.head.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let audit_head_sig = match &self.secret {
            Some(secret) => Some(hmac_sha256_hex(secret, head.as_bytes())?),
            None => None,
        };
        Ok(HeadInfo { audit_head: head, audit_head_sig })
    }
}
