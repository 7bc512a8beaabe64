//! Edge-triggered health probe.
//!
//! Per-service state machine: unknown -> ok <-> fail. A service flips to
//! `fail` only after `fail_threshold` consecutive failures (debouncing), and
//! exactly one incident is emitted on the {unknown,ok} -> fail transition.
//! Recovery logs but emits nothing; success resets the counter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use sentinel_kv::{now_unix, KvStore, SignedQueue};

use crate::env;
use crate::queues::{INCIDENTS_Q, PROBE_FAILCOUNT_PREFIX, PROBE_STATE_PREFIX};
use crate::types::{Evidence, Incident};
use crate::OpsError;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// (service, url) pairs.
    pub targets: Vec<(String, String)>,
    pub poll_sec: f64,
    pub timeout_sec: f64,
    /// Consecutive failures required to flip to fail.
    pub fail_threshold: u32,
    pub queue_secret: Option<String>,
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        Self {
            targets: parse_targets(&env::str_or(
                "PROBE_TARGETS",
                "sentinel-api=http://sentinel-api:8001/health",
            )),
            poll_sec: env::f64_or("PROBE_POLL_SEC", 15.0),
            timeout_sec: env::f64_or("PROBE_TIMEOUT_SEC", 3.0),
            fail_threshold: env::u64_or("FAIL_THRESHOLD", 2) as u32,
            queue_secret: env::opt("QUEUE_SIGNING_SECRET"),
        }
    }
}

/// Comma-separated `name=url` pairs; malformed parts are dropped.
pub fn parse_targets(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .filter_map(|part| {
            let part = part.trim();
            let (name, url) = part.split_once('=')?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() || url.is_empty() {
                return None;
            }
            Some((name.to_string(), url.to_string()))
        })
        .collect()
}

pub struct ProbeWorker {
    kv: Arc<dyn KvStore>,
    cfg: ProbeConfig,
    client: reqwest::Client,
}

impl ProbeWorker {
    pub fn new(kv: Arc<dyn KvStore>, cfg: ProbeConfig) -> Result<Self, OpsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout_sec))
            .build()?;
        Ok(Self { kv, cfg, client })
    }

    /// GET the target. Returns (ok, status, error); ok means HTTP 2xx.
    async fn check(&self, url: &str) -> (bool, String, String) {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let code = resp.status();
                (code.is_success(), code.as_u16().to_string(), String::new())
            }
            Err(e) => (false, String::new(), format!("reqwest: {e}")),
        }
    }

    /// Feed one observed outcome through the state machine. Returns the
    /// incident to emit, if this observation is the failing edge.
    pub fn record_outcome(
        &self,
        service: &str,
        url: &str,
        ok: bool,
        status: &str,
        error: &str,
    ) -> Result<Option<Incident>, OpsError> {
        let state_key = format!("{PROBE_STATE_PREFIX}{service}");
        let fc_key = format!("{PROBE_FAILCOUNT_PREFIX}{service}");

        let prev_state = self.kv.get(&state_key)?.unwrap_or_else(|| "unknown".to_string());

        let now_state = if ok {
            self.kv.set(&fc_key, "0")?;
            "ok"
        } else {
            let failcount = self
                .kv
                .get(&fc_key)?
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
                + 1;
            self.kv.set(&fc_key, &failcount.to_string())?;
            warn!(service, failcount, threshold = self.cfg.fail_threshold, "fail detected");
            // still considered ok until the threshold is reached
            if failcount >= self.cfg.fail_threshold {
                "fail"
            } else {
                "ok"
            }
        };

        let mut incident = None;
        if now_state == "fail" && prev_state != "fail" {
            let ts = now_unix();
            let error = crate::clip(error, 300);
            incident = Some(Incident {
                incident_id: format!("inc_{ts}_{service}"),
                ts,
                service: service.to_string(),
                kind: "api_unreachable".to_string(),
                severity: "high".to_string(),
                evidence: Evidence {
                    url: url.to_string(),
                    status: status.to_string(),
                    error,
                    extra: Default::default(),
                },
            });
        }

        if prev_state == "fail" && now_state == "ok" {
            info!(service, "state -> ok");
        }

        self.kv.set(&state_key, now_state)?;
        Ok(incident)
    }

    fn emit(&self, incident: &Incident) -> Result<(), OpsError> {
        let q = SignedQueue::new(self.kv.as_ref(), self.cfg.queue_secret.clone());
        q.push(INCIDENTS_Q, incident)?;
        info!(incident_id = %incident.incident_id, service = %incident.service, "incident emitted");
        Ok(())
    }

    pub async fn run(self) {
        info!(
            targets = ?self.cfg.targets,
            poll_sec = self.cfg.poll_sec,
            timeout_sec = self.cfg.timeout_sec,
            fail_threshold = self.cfg.fail_threshold,
            "probe worker started"
        );
        if self.cfg.targets.is_empty() {
            warn!("no probe targets configured; set PROBE_TARGETS");
        }

        loop {
            for (service, url) in self.cfg.targets.clone() {
                let (ok, status, error) = self.check(&url).await;
                match self.record_outcome(&service, &url, ok, &status, &error) {
                    Ok(Some(incident)) => {
                        if let Err(e) = self.emit(&incident) {
                            warn!(error = %e, "failed to emit incident");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, service, "probe bookkeeping failed"),
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(self.cfg.poll_sec)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_kv::MemoryKv;

    fn worker(threshold: u32) -> ProbeWorker {
        let cfg = ProbeConfig {
            targets: vec![],
            poll_sec: 1.0,
            timeout_sec: 1.0,
            fail_threshold: threshold,
            queue_secret: None,
        };
        ProbeWorker::new(Arc::new(MemoryKv::new()), cfg).unwrap()
    }

    fn feed(w: &ProbeWorker, outcomes: &[bool]) -> usize {
        outcomes
            .iter()
            .filter(|ok| {
                w.record_outcome("svc", "http://svc/health", **ok, if **ok { "200" } else { "500" }, "")
                    .unwrap()
                    .is_some()
            })
            .count()
    }

    #[test]
    fn incident_only_after_threshold() {
        let w = worker(2);
        assert_eq!(feed(&w, &[false]), 0);
        assert_eq!(feed(&w, &[false]), 1);
    }

    #[test]
    fn sustained_failure_emits_once() {
        let w = worker(2);
        assert_eq!(feed(&w, &[false, false, false, false, false]), 1);
    }

    #[test]
    fn recovery_resets_and_retriggers() {
        let w = worker(2);
        // fail edge, recovery, fail edge again
        assert_eq!(feed(&w, &[false, false, true, false, false]), 2);
    }

    #[test]
    fn success_resets_the_debounce_counter() {
        let w = worker(3);
        // never three consecutive failures
        assert_eq!(feed(&w, &[false, false, true, false, false, true]), 0);
    }

    #[test]
    fn incident_shape() {
        let w = worker(1);
        let inc = w
            .record_outcome("api", "http://api/health", false, "503", "HTTPError: 503")
            .unwrap()
            .unwrap();
        assert!(inc.incident_id.starts_with("inc_"));
        assert!(inc.incident_id.ends_with("_api"));
        assert_eq!(inc.kind, "api_unreachable");
        assert_eq!(inc.severity, "high");
        assert_eq!(inc.evidence.status, "503");
    }

    #[test]
    fn target_parsing_drops_malformed() {
        let targets = parse_targets("a=http://a/health, b=http://b , junk, =x, c=");
        assert_eq!(
            targets,
            vec![
                ("a".to_string(), "http://a/health".to_string()),
                ("b".to_string(), "http://b".to_string()),
            ]
        );
    }
}
