//! Canonical queue names and key prefixes. Item format is `action_id` for
//! the action flow, full JSON for incidents/triaged/decisions.

pub const INCIDENTS_Q: &str = "ops:incidents";
pub const TRIAGED_Q: &str = "ops:incidents:triaged";
pub const DECISIONS_Q: &str = "ops:manager:decisions";

pub const PROPOSED_Q: &str = "ops:actions:proposed";
pub const PROPOSED_INFLIGHT_Q: &str = "ops:actions:proposed:inflight";
pub const APPROVED_Q: &str = "ops:actions:approved";
pub const APPROVED_INFLIGHT_Q: &str = "ops:actions:approved:inflight";
pub const EXECUTED_Q: &str = "ops:actions:executed";
pub const REJECTED_Q: &str = "ops:actions:rejected";
pub const QUARANTINE_Q: &str = "ops:actions:quarantine";

pub const ACTION_KEY_PREFIX: &str = "ops:action:";
pub const DEDUPE_KEY_PREFIX: &str = "ops:dedupe:";
pub const RATELIMIT_KEY_PREFIX: &str = "ops:ratelimit:";
pub const COOLDOWN_KEY_PREFIX: &str = "ops:cooldown:";
pub const PROPOSED_FP_KEY_PREFIX: &str = "ops:proposed:fp:";
pub const EXEC_DONE_KEY_PREFIX: &str = "ops:exec:done:";
pub const REQUEUE_COUNT_KEY_PREFIX: &str = "ops:requeue_count:";
pub const BUDGET_ZSET: &str = "ops:budget:actions";
pub const REAPER_HEARTBEAT_KEY: &str = "ops:reaper:heartbeat";
pub const PROBE_STATE_PREFIX: &str = "ops:probe:state:";
pub const PROBE_FAILCOUNT_PREFIX: &str = "ops:probe:failcount:";
