//! Signed queue envelopes.
//!
//! Envelope format:
//!   { "v":1, "ts":"...", "payload":{...}, "sig":"..." }
//!
//! `sig` is HMAC-SHA256 over the canonical JSON of {v, ts, payload}. When no
//! secret is configured, payloads travel raw (signing disabled). Consumers
//! reject envelopes with a wrong or missing signature when signing is enabled.

use serde::Serialize;
use serde_json::{json, Value};

use sentinel_common::{canonical_json_string, sign_canonical, verify_canonical};

use crate::{now_iso, KvResult, KvStore};

pub struct SignedQueue<'a> {
    kv: &'a dyn KvStore,
    secret: Option<String>,
}

impl<'a> SignedQueue<'a> {
    pub fn new(kv: &'a dyn KvStore, secret: Option<String>) -> Self {
        let secret = secret.filter(|s| !s.is_empty());
        Self { kv, secret }
    }

    pub fn push<T: Serialize>(&self, queue: &str, payload: &T) -> KvResult<()> {
        let payload = serde_json::to_value(payload)?;
        let wrapped = match &self.secret {
            None => payload,
            Some(secret) => {
                let ts = now_iso();
                let body = json!({"v": 1, "ts": ts, "payload": payload});
                let sig = sign_canonical(secret, &body)
                    .map_err(|e| crate::KvError::Backend(e.to_string()))?;
                let mut body = body;
                body["sig"] = Value::String(sig);
                body
            }
        };
        let line = canonical_json_string(&wrapped)
            .map_err(|e| crate::KvError::Backend(e.to_string()))?;
        self.kv.rpush(queue, &line)
    }

    /// Pop one message. Returns the payload, or None when the queue is empty
    /// or the envelope is missing/invalid/tampered.
    pub fn pop(&self, queue: &str) -> KvResult<Option<Value>> {
        let raw = match self.kv.lpop(queue)? {
            Some(r) => r,
            None => return Ok(None),
        };
        let obj: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        Ok(self.unwrap_envelope(obj))
    }

    fn unwrap_envelope(&self, obj: Value) -> Option<Value> {
        let Some(secret) = &self.secret else {
            return Some(obj);
        };

        let map = obj.as_object()?;
        if !map.contains_key("payload") || !map.contains_key("sig") || !map.contains_key("ts") {
            return None;
        }
        let sig = map.get("sig").and_then(|v| v.as_str()).unwrap_or("");
        let unsigned = json!({
            "v": map.get("v").cloned().unwrap_or(json!(1)),
            "ts": map.get("ts").cloned().unwrap_or(Value::Null),
            "payload": map.get("payload").cloned().unwrap_or(Value::Null),
        });
        if verify_canonical(secret, &unsigned, sig).is_err() {
            return None;
        }
        map.get("payload").filter(|p| p.is_object()).cloned()
    }
}
