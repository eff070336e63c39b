//! In-process store with the same semantics as the Redis backend.

use super::{ClaimOutcome, Store, StoreError, TickCommit};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Value {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Value {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    sorted_sets: HashMap<String, HashMap<String, i64>>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    values: HashMap<String, Value>,
    channels: HashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl Inner {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&Value> {
        if self.values.get(key).is_some_and(|v| !v.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    /// Entries ordered by score, then member, like a Redis sorted set.
    fn ordered_members(&self, key: &str) -> Vec<(String, i64)> {
        let mut members: Vec<(String, i64)> = self
            .sorted_sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }
}

/// Store kept entirely in memory.
///
/// All operations take one short lock, which makes each of them atomic in
/// the same way a single Redis command or script is. Lease expiry follows
/// the tokio clock so paused-time tests can advance it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a subscriber on a pub/sub channel.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        let mut inner = self.lock();
        inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Whether `key` currently holds an unexpired value.
    pub fn contains_value(&self, key: &str) -> bool {
        let mut inner = self.lock();
        inner.live_value(key, Instant::now()).is_some()
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.lock().lists.get(key).map_or(0, VecDeque::len)
    }

    /// Drops a hash entirely, as external deprovisioning would.
    pub fn delete_hash(&self, key: &str) -> bool {
        self.lock().hashes.remove(key).is_some()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn claim_oldest(
        &self,
        schedule_key: &str,
        lease_prefix: &str,
        ttl: Duration,
        window: usize,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let candidates: Vec<String> = inner
            .ordered_members(schedule_key)
            .into_iter()
            .take(window.max(1))
            .map(|(member, _)| member)
            .collect();

        let Some(head) = candidates.first().cloned() else {
            return Ok(ClaimOutcome::Empty);
        };

        for id in candidates {
            let lease_key = format!("{}{}", lease_prefix, id);
            if inner.live_value(&lease_key, now).is_none() {
                inner.values.insert(
                    lease_key,
                    Value {
                        bytes: b"locked".to_vec(),
                        expires_at: Some(now + ttl),
                    },
                );
                return Ok(ClaimOutcome::Claimed(id));
            }
        }

        Ok(ClaimOutcome::Leased(head))
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.lock()
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let removed = inner
            .sorted_sets
            .get_mut(key)
            .map_or(false, |set| set.remove(member).is_some());
        if inner.sorted_sets.get(key).is_some_and(HashMap::is_empty) {
            inner.sorted_sets.remove(key);
        }
        Ok(removed)
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .lock()
            .sorted_sets
            .get(key)
            .and_then(|set| set.get(member).copied()))
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock().sorted_sets.get(key).map_or(0, HashMap::len))
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_push(&self, key: &str, value: &[u8]) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_vec());
        Ok(list.len())
    }

    async fn commit(&self, commit: &TickCommit) -> Result<bool, StoreError> {
        let mut inner = self.lock();

        let Some(hash) = inner.hashes.get_mut(&commit.record_key) else {
            return Ok(false);
        };
        for (field, value) in &commit.fields {
            hash.insert(field.clone(), value.clone());
        }

        if commit.consumed > 0 {
            if let Some(list) = inner.lists.get_mut(&commit.queue_key) {
                let consumed = commit.consumed.min(list.len());
                list.drain(..consumed);
                if list.is_empty() {
                    inner.lists.remove(&commit.queue_key);
                }
            }
        }

        if !commit.quarantined.is_empty() {
            inner
                .lists
                .entry(commit.quarantine_key.clone())
                .or_default()
                .extend(commit.quarantined.iter().cloned());
        }

        Ok(true)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock();
        Ok(keys
            .iter()
            .map(|key| inner.live_value(key, now).map(|v| v.bytes.clone()))
            .collect())
    }

    async fn set_value(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.lock().values.insert(
            key.to_string(),
            Value {
                bytes: value.to_vec(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, StoreError> {
        let inner = self.lock();
        Ok(inner
            .channels
            .get(channel)
            .and_then(|sender| sender.send(payload.to_vec()).ok())
            .unwrap_or(0))
    }
}
