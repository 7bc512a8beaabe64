//! Gateway configuration from environment.
//!
//! Strict mode is a startup-time assertion: with it on, the process refuses
//! to serve unless both the API key and the signing secret are present.

use std::path::PathBuf;

use thiserror::Error;

use sentinel_policy::{ReputationThresholds, ScoreThresholds};
use sentinel_reputation::DecayConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("STRICT_MODE=1 but API_KEY is missing")]
    MissingApiKey,
    #[error("STRICT_MODE=1 but SIGNING_SECRET is missing")]
    MissingSigningSecret,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,

    pub strict_mode: bool,
    pub global_freeze: bool,
    pub api_key: String,
    pub signing_secret: String,
    pub audit_secret: String,
    pub vt_salt: String,
    pub time_window_sec: u64,

    pub rate_limit_max: usize,
    pub rate_limit_window_sec: u64,

    pub rep_gates: ReputationThresholds,
    pub score_gates: ScoreThresholds,
    pub decay: DecayConfig,
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v.trim() == "1").unwrap_or(false)
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_str("GATEWAY_BIND", "0.0.0.0:8001"),
            data_dir: PathBuf::from(env_str("SENTINEL_DATA_DIR", "runtime")),
            strict_mode: env_flag("STRICT_MODE"),
            global_freeze: env_flag("GLOBAL_FREEZE"),
            api_key: env_str("API_KEY", ""),
            signing_secret: env_str("SIGNING_SECRET", ""),
            audit_secret: env_str("AUDIT_SECRET", ""),
            vt_salt: env_str("VT_SALT", "sentinel-vt-default-salt"),
            time_window_sec: env_u64("TIME_WINDOW_SEC", 120),
            rate_limit_max: env_u64("RATE_LIMIT_MAX", 30) as usize,
            rate_limit_window_sec: env_u64("RATE_LIMIT_WINDOW_SEC", 60),
            rep_gates: ReputationThresholds {
                deny_at: env_i64("REP_DENY_AT", -10),
                review_at: env_i64("REP_REVIEW_AT", -5),
            },
            score_gates: ScoreThresholds {
                auto_deny: env_f64("REP_AUTO_DENY", 0.20),
                auto_review: env_f64("REP_AUTO_REVIEW", 0.40),
            },
            decay: DecayConfig {
                period_sec: env_u64("REP_DECAY_PERIOD_SEC", 3600),
                step: env_i64("REP_DECAY_STEP", 1),
            },
        }
    }

    pub fn signing_enabled(&self) -> bool {
        !self.signing_secret.is_empty()
    }

    /// Strict-mode startup check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strict_mode {
            if self.api_key.is_empty() {
                return Err(ConfigError::MissingApiKey);
            }
            if self.signing_secret.is_empty() {
                return Err(ConfigError::MissingSigningSecret);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_mode_requires_secrets() {
        let mut cfg = GatewayConfig::from_env();
        cfg.strict_mode = true;
        cfg.api_key = String::new();
        cfg.signing_secret = "s".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingApiKey)));

        cfg.api_key = "k".into();
        cfg.signing_secret = String::new();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingSigningSecret)));

        cfg.signing_secret = "s".into();
        assert!(cfg.validate().is_ok());
    }
}
