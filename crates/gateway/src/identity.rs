//! Agent identity registry.
//!
//! Agents register an Ed25519 public key (base64). The id is derived from the
//! key string, so the same key always maps to the same agent. Records live in
//! the shared store under `agent:<id>`, with `agents:set` as the roster.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sentinel_common::agent_id_from_pub;
use sentinel_kv::{now_iso, now_unix, KvStore};

use crate::error::ApiError;

const AGENT_KEY_PREFIX: &str = "agent:";
const AGENTS_SET: &str = "agents:set";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub pub_b64: String,
    pub display_name: String,
    pub metadata: Value,
    pub revoked: bool,
    pub created_at: String,
}

pub struct IdentityRegistry {
    kv: Arc<dyn KvStore>,
}

impl IdentityRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(agent_id: &str) -> String {
        format!("{AGENT_KEY_PREFIX}{agent_id}")
    }

    fn validate_pub(pub_b64: &str) -> Result<String, ApiError> {
        let pub_b64 = pub_b64.trim();
        if pub_b64.is_empty() {
            return Err(ApiError::BadInput("pub_b64 is required".into()));
        }
        let raw = BASE64
            .decode(pub_b64)
            .map_err(|e| ApiError::BadInput(format!("pub_b64 is not valid base64: {e}")))?;
        if raw.len() < 16 {
            return Err(ApiError::BadInput("pub_b64 decoded too short (invalid key?)".into()));
        }
        Ok(pub_b64.to_string())
    }

    pub fn register(
        &self,
        pub_b64: &str,
        display_name: &str,
        metadata: Value,
    ) -> Result<AgentRecord, ApiError> {
        let pub_b64 = Self::validate_pub(pub_b64)?;
        let agent_id = agent_id_from_pub(&pub_b64);

        // re-registration keeps the original created_at
        let created_at = match self.get(&agent_id) {
            Ok(existing) => existing.created_at,
            Err(_) => now_iso(),
        };

        let record = AgentRecord {
            agent_id: agent_id.clone(),
            pub_b64,
            display_name: display_name.trim().to_string(),
            metadata: if metadata.is_null() { Value::Object(Default::default()) } else { metadata },
            revoked: false,
            created_at,
        };

        let line = serde_json::to_string(&record)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        self.kv
            .set(&Self::key(&agent_id), &line)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        self.kv
            .zadd(AGENTS_SET, &agent_id, now_unix() as i64)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(record)
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentRecord, ApiError> {
        let raw = self
            .kv
            .get(&Self::key(agent_id))
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .ok_or_else(|| ApiError::NotFound(format!("agent {agent_id}")))?;
        serde_json::from_str(&raw).map_err(|e| ApiError::Internal(e.to_string()))
    }

    pub fn revoke(&self, agent_id: &str) -> Result<AgentRecord, ApiError> {
        let mut record = self.get(agent_id)?;
        record.revoked = true;
        let line = serde_json::to_string(&record)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        self.kv
            .set(&Self::key(agent_id), &line)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(record)
    }
}
