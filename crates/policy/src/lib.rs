//! sentinel_policy
//!
//! Pattern + reputation command classifier. Output is one of
//! {allow, review, deny} with a risk band and score.
//!
//! Evaluation order (first match wins):
//! 1. integer reputation gate (deny / review thresholds)
//! 2. hard deny patterns (case-insensitive, word-boundary aware)
//! 3. default allow
//!
//! A secondary float-score gate is applied by the caller AFTER pattern
//! evaluation; it can only tighten an allow, never upgrade a hard deny.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const POLICY_VERSION: &str = "v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    Allow,
    Deny,
    Review,
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyDecision::Allow => "allow",
            PolicyDecision::Deny => "deny",
            PolicyDecision::Review => "review",
        }
    }
}

impl std::fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: PolicyDecision,
    pub risk: Risk,
    pub risk_score: f64,
    pub reason: String,
    pub policy_version: String,
}

impl Verdict {
    fn new(decision: PolicyDecision, risk: Risk, risk_score: f64, reason: String) -> Self {
        Self {
            decision,
            risk,
            risk_score,
            reason,
            policy_version: POLICY_VERSION.to_string(),
        }
    }
}

/// Integer-ledger gate thresholds.
#[derive(Debug, Clone, Copy)]
pub struct ReputationThresholds {
    pub deny_at: i64,
    pub review_at: i64,
}

impl Default for ReputationThresholds {
    fn default() -> Self {
        Self { deny_at: -10, review_at: -5 }
    }
}

/// Float-oracle gate thresholds.
#[derive(Debug, Clone, Copy)]
pub struct ScoreThresholds {
    pub auto_deny: f64,
    pub auto_review: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self { auto_deny: 0.20, auto_review: 0.40 }
    }
}

// Hard denies: destructive disk writes, filesystem creation/wipes,
// recursive root deletes, root-level chmod/chown bombs.
static DENY_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    let table: &[(&str, &str)] = &[
        (
            r"(?i)\bdd\b.*\bif=/dev/zero\b.*\bof=/dev/\S+",
            r"Matched high-risk pattern: 'dd if=/dev/zero of=/dev/*'",
        ),
        (r"(?i)\bmkfs(\.\w+)?\b", "Matched high-risk pattern: 'mkfs'"),
        (r"(?i)\bwipefs\b", "Matched high-risk pattern: 'wipefs'"),
        (r"(?i)\brm\s+-rf\b", "Matched high-risk pattern: 'rm -rf'"),
        (
            r"(?i)\brm\s+-f\s+/\s*$",
            r"Matched high-risk pattern: '\brm\s+-f\s+/\s*$'",
        ),
        (
            r"(?i)\brm\s+-f\s+/\*\s*$",
            r"Matched high-risk pattern: '\brm\s+-f\s+/\*\s*$'",
        ),
        (
            r"(?i)\brm\s+-rf\b.*--no-preserve-root\b",
            "Matched high-risk pattern: 'rm -rf --no-preserve-root'",
        ),
        (
            r"(?i)\bchmod\b.*\s-R\s+777\s+/\s*$",
            "Matched high-risk pattern: 'chmod -R 777 /'",
        ),
        (
            r"(?i)\bchown\b.*\s-R\s+\S+\s+/\s*$",
            "Matched high-risk pattern: 'chown -R * /'",
        ),
    ];
    table
        .iter()
        .map(|(pat, reason)| {
            // patterns are static and known-good
            (Regex::new(pat).expect("deny pattern"), *reason)
        })
        .collect()
});

/// Classify a command under the integer reputation and the deny patterns.
pub fn evaluate(command: &str, reputation: i64, gates: &ReputationThresholds) -> Verdict {
    let cmd = command.trim();

    // 1) Reputation gate first (overrides everything)
    if reputation <= gates.deny_at {
        return Verdict::new(
            PolicyDecision::Deny,
            Risk::High,
            0.99,
            format!("Reputation too low (<= {})", gates.deny_at),
        );
    }
    if reputation <= gates.review_at {
        return Verdict::new(
            PolicyDecision::Review,
            Risk::Medium,
            0.60,
            format!("Reputation low (<= {})", gates.review_at),
        );
    }

    // 2) Pattern-based hard denies
    for (rx, reason) in DENY_PATTERNS.iter() {
        if rx.is_match(cmd) {
            return Verdict::new(PolicyDecision::Deny, Risk::High, 0.95, (*reason).to_string());
        }
    }

    // 3) Default allow
    Verdict::new(
        PolicyDecision::Allow,
        Risk::Low,
        0.05,
        "No policy violations detected".to_string(),
    )
}

/// Tighten an allow using the float reputation score. Hard denies are never
/// upgraded by any score.
pub fn apply_score_gate(verdict: Verdict, score: f64, gates: &ScoreThresholds) -> Verdict {
    if verdict.decision != PolicyDecision::Allow {
        return verdict;
    }
    if score < gates.auto_deny {
        return Verdict::new(
            PolicyDecision::Deny,
            Risk::High,
            0.90,
            format!("Reputation score gate: {:.2} < auto-deny {:.2}", score, gates.auto_deny),
        );
    }
    if score < gates.auto_review {
        return Verdict::new(
            PolicyDecision::Review,
            Risk::Medium,
            0.60,
            format!("Reputation score gate: {:.2} < auto-review {:.2}", score, gates.auto_review),
        );
    }
    verdict
}
