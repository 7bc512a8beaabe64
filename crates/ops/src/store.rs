//! Canonical action record store.
//!
//! Records live at `ops:action:<action_id>` as canonical JSON. Every write
//! bumps `rev` and goes through a CAS against the raw value the writer read,
//! so a concurrent writer surfaces as `RevConflict` instead of a lost update.

use std::sync::Arc;

use sentinel_common::canonical_json_string;
use sentinel_kv::KvStore;

use crate::queues::ACTION_KEY_PREFIX;
use crate::types::ActionRecord;
use crate::OpsError;

#[derive(Clone)]
pub struct ActionStore {
    kv: Arc<dyn KvStore>,
}

impl ActionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn key(action_id: &str) -> String {
        format!("{ACTION_KEY_PREFIX}{action_id}")
    }

    /// Load a record plus the raw string it was parsed from (the CAS base).
    pub fn load(&self, action_id: &str) -> Result<Option<(ActionRecord, String)>, OpsError> {
        let raw = match self.kv.get(&Self::key(action_id))? {
            Some(r) => r,
            None => return Ok(None),
        };
        let record: ActionRecord = serde_json::from_str(&raw)?;
        Ok(Some((record, raw)))
    }

    /// First write of a fresh record. Fails on an id collision.
    pub fn create(&self, record: &ActionRecord) -> Result<(), OpsError> {
        let line = canonical_json_string(record)?;
        if !self.kv.cas(&Self::key(&record.action_id), None, &line)? {
            return Err(OpsError::RevConflict { action_id: record.action_id.clone() });
        }
        Ok(())
    }

    /// Read-modify-write completion: bumps `rev` and writes iff the stored
    /// value still equals `base_raw`.
    pub fn save(&self, record: &mut ActionRecord, base_raw: &str) -> Result<(), OpsError> {
        record.rev += 1;
        let line = canonical_json_string(record)?;
        if !self.kv.cas(&Self::key(&record.action_id), Some(base_raw), &line)? {
            return Err(OpsError::RevConflict { action_id: record.action_id.clone() });
        }
        Ok(())
    }
}
