//! In-process KV backend. One mutex over the whole map keeps every compound
//! operation (NX set, CAS, pop_push) atomic without further ceremony.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{KvResult, KvStore};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        match self.expires_at {
            Some(t) => Instant::now() < t,
            None => true,
        }
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, BTreeMap<String, i64>>,
}

impl Inner {
    fn purge(&mut self, key: &str) {
        if let Some(e) = self.strings.get(key) {
            if !e.live() {
                self.strings.remove(key);
            }
        }
    }
}

/// Process-local store. Suitable for a single gateway instance plus its
/// co-located workers, and for tests.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned lock only happens after a panic in another holder;
        // the data is plain maps, safe to keep using
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner.strings.get(key).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str) -> KvResult<()> {
        let mut inner = self.lock();
        inner.strings.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: None },
        );
        Ok(())
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut inner = self.lock();
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let mut inner = self.lock();
        inner.purge(key);
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    fn cas(&self, key: &str, expected: Option<&str>, value: &str) -> KvResult<bool> {
        let mut inner = self.lock();
        inner.purge(key);
        let current = inner.strings.get(key).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        let expires_at = inner.strings.get(key).and_then(|e| e.expires_at);
        inner.strings.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at },
        );
        Ok(true)
    }

    fn del(&self, key: &str) -> KvResult<()> {
        let mut inner = self.lock();
        inner.strings.remove(key);
        inner.lists.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> KvResult<bool> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner.strings.contains_key(key))
    }

    fn incr(&self, key: &str) -> KvResult<i64> {
        let mut inner = self.lock();
        inner.purge(key);
        let next = match inner.strings.get(key) {
            Some(e) => e.value.parse::<i64>().unwrap_or(0) + 1,
            None => 1,
        };
        let expires_at = inner.strings.get(key).and_then(|e| e.expires_at);
        inner.strings.insert(
            key.to_string(),
            Entry { value: next.to_string(), expires_at },
        );
        Ok(next)
    }

    fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        let mut inner = self.lock();
        if let Some(e) = inner.strings.get_mut(key) {
            e.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    fn rpush(&self, key: &str, value: &str) -> KvResult<()> {
        let mut inner = self.lock();
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    fn lpop(&self, key: &str) -> KvResult<Option<String>> {
        let mut inner = self.lock();
        Ok(inner.lists.get_mut(key).and_then(|l| l.pop_front()))
    }

    fn pop_push(&self, source: &str, dest: &str) -> KvResult<Option<String>> {
        let mut inner = self.lock();
        let item = match inner.lists.get_mut(source).and_then(|l| l.pop_front()) {
            Some(v) => v,
            None => return Ok(None),
        };
        inner
            .lists
            .entry(dest.to_string())
            .or_default()
            .push_back(item.clone());
        Ok(Some(item))
    }

    fn lrem(&self, key: &str, value: &str) -> KvResult<usize> {
        let mut inner = self.lock();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok(before - list.len())
    }

    fn llen(&self, key: &str) -> KvResult<usize> {
        let inner = self.lock();
        Ok(inner.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    fn lrange(&self, key: &str, start: usize, count: usize) -> KvResult<Vec<String>> {
        let inner = self.lock();
        Ok(inner
            .lists
            .get(key)
            .map(|l| l.iter().skip(start).take(count).cloned().collect())
            .unwrap_or_default())
    }

    fn zadd(&self, key: &str, member: &str, score: i64) -> KvResult<()> {
        let mut inner = self.lock();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    fn zcard(&self, key: &str) -> KvResult<usize> {
        let inner = self.lock();
        Ok(inner.zsets.get(key).map(|z| z.len()).unwrap_or(0))
    }

    fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> KvResult<usize> {
        let mut inner = self.lock();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = zset.len();
        zset.retain(|_, score| *score < min || *score > max);
        Ok(before - zset.len())
    }
}
