//! Per-agent sliding-window admission. Process-local: one gateway instance
//! owns its own window; multi-instance deployments need a shared counter.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    max: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self { max, window, buckets: Mutex::new(HashMap::new()) }
    }

    /// Admit iff fewer than `max` events in the window. A rejected attempt
    /// does not consume quota.
    pub fn try_admit(&self, agent_id: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(agent_id.to_string()).or_default();

        while let Some(front) = bucket.front() {
            if now.duration_since(*front) >= self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.max {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// (used, max) for the status endpoint.
    pub fn usage(&self, agent_id: &str) -> (usize, usize) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(agent_id.to_string()).or_default();
        while let Some(front) = bucket.front() {
            if now.duration_since(*front) >= self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }
        (bucket.len(), self.max)
    }
}
