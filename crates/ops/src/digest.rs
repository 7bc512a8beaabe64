//! Action intent digest, shared across manager/approver/executor.

use serde::Serialize;
use serde_json::Value;

use sentinel_common::{canonical_json_bytes, sha256_tagged, CanonError};

use crate::types::Action;

#[derive(Serialize)]
struct IntentPayload<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    target: &'a str,
    params: &'a Value,
}

/// Digest ONLY immutable intent:
///   - type
///   - target
///   - params
/// Never include: reason, timestamps, manager, fingerprint, incident_id.
pub fn digest_action(action: &Action) -> Result<String, CanonError> {
    let payload = IntentPayload {
        kind: action.kind.trim(),
        target: action.target.trim(),
        params: &action.params,
    };
    let bytes = canonical_json_bytes(&payload)?;
    Ok(sha256_tagged(&bytes))
}
