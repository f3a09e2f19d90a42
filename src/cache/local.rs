use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::{CacheKey, LocalCacheStats, fnv1a};
use crate::dns::DnsMessage;

/// Grace period past soft expiry during which an entry stays servable as
/// stale: min(original ttl, 1 hour).
pub const MAX_GRACE: Duration = Duration::from_secs(3600);

const DEFAULT_SHARDS: usize = 32;

#[derive(Debug, Clone)]
struct LocalEntry {
    answer: DnsMessage,
    soft_expiry: Instant,
    hard_expiry: Instant,
}

/// A cache hit with the remaining soft TTL; `stale_for` is how far past
/// soft expiry the entry is (0 while fresh).
#[derive(Debug, Clone)]
pub struct LocalHit {
    pub answer: DnsMessage,
    pub remaining: u32,
    pub stale_for: u64,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, LocalEntry>,
    // Insertion order; set() moves a replaced key to the back.
    order: Vec<String>,
}

impl Shard {
    fn evict_oldest(&mut self) {
        if let Some(key) = self.order.first().cloned() {
            self.order.retain(|k| k != &key);
            self.entries.remove(&key);
        }
    }
}

/// L0: sharded in-process cache of parsed answers. Shards are selected by
/// FNV-1a of the key string; the get path takes only a shard read lock.
pub struct LocalCache {
    shards: Vec<RwLock<Shard>>,
    shard_capacity: usize,
    max_entries: usize,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self::with_shards(max_entries, DEFAULT_SHARDS)
    }

    pub fn with_shards(max_entries: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        // A cache smaller than the shard count collapses to one shard so the
        // configured capacity stays exact.
        let (shard_count, shard_capacity) = if max_entries < shards {
            (1, max_entries.max(1))
        } else {
            (shards, max_entries.div_ceil(shards))
        };

        Self {
            shards: (0..shard_count).map(|_| RwLock::new(Shard::default())).collect(),
            shard_capacity,
            max_entries: max_entries.max(1),
        }
    }

    fn shard_for(&self, key: &str) -> &RwLock<Shard> {
        let idx = (fnv1a(key.as_bytes()) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Fetch a defensive copy. Entries past hard expiry read as absent and
    /// are removed in place.
    pub fn get(&self, key: &CacheKey) -> Option<LocalHit> {
        let redis_key = key.redis_key();
        let shard = self.shard_for(&redis_key);
        let now = Instant::now();

        {
            let guard = shard.read();
            if let Some(entry) = guard.entries.get(&redis_key) {
                if now <= entry.hard_expiry {
                    let remaining = entry
                        .soft_expiry
                        .saturating_duration_since(now)
                        .as_secs() as u32;
                    let stale_for = now
                        .saturating_duration_since(entry.soft_expiry)
                        .as_secs();
                    return Some(LocalHit {
                        answer: entry.answer.clone(),
                        remaining,
                        stale_for,
                    });
                }
            } else {
                return None;
            }
        }

        // Past hard expiry: purge under the write lock.
        let mut guard = shard.write();
        if let Some(entry) = guard.entries.get(&redis_key) {
            if now > entry.hard_expiry {
                guard.entries.remove(&redis_key);
                guard.order.retain(|k| k != &redis_key);
            }
        }
        None
    }

    /// Insert or replace. Soft expiry = now + ttl, hard expiry adds
    /// min(ttl, 1 h) of grace.
    pub fn set(&self, key: &CacheKey, answer: DnsMessage, ttl: u32) {
        if ttl == 0 {
            return;
        }
        let redis_key = key.redis_key();
        let now = Instant::now();
        let soft = now + Duration::from_secs(ttl as u64);
        let grace = Duration::from_secs(ttl as u64).min(MAX_GRACE);
        let entry = LocalEntry {
            answer,
            soft_expiry: soft,
            hard_expiry: soft + grace,
        };

        let shard = self.shard_for(&redis_key);
        let mut guard = shard.write();
        let replacing = guard.entries.insert(redis_key.clone(), entry).is_some();
        if replacing {
            guard.order.retain(|k| k != &redis_key);
        } else if guard.entries.len() > self.shard_capacity {
            guard.evict_oldest();
        }
        guard.order.push(redis_key);
    }

    pub fn delete(&self, key: &CacheKey) {
        let redis_key = key.redis_key();
        let shard = self.shard_for(&redis_key);
        let mut guard = shard.write();
        guard.entries.remove(&redis_key);
        guard.order.retain(|k| k != &redis_key);
    }

    /// Drop everything past hard expiry; returns the number removed.
    pub fn clean_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.write();
            let before = guard.entries.len();
            guard.entries.retain(|_, entry| now <= entry.hard_expiry);
            removed += before - guard.entries.len();
            let entries = std::mem::take(&mut guard.entries);
            guard.order.retain(|k| entries.contains_key(k));
            guard.entries = entries;
        }
        removed
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut guard = shard.write();
            guard.entries.clear();
            guard.order.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The caller-requested capacity, independent of shard layout.
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn occupancy(&self) -> LocalCacheStats {
        let now = Instant::now();
        let mut fresh = 0;
        let mut stale = 0;
        let mut expired = 0;
        for shard in &self.shards {
            let guard = shard.read();
            for entry in guard.entries.values() {
                if now < entry.soft_expiry {
                    fresh += 1;
                } else if now <= entry.hard_expiry {
                    stale += 1;
                } else {
                    expired += 1;
                }
            }
        }
        LocalCacheStats {
            entries: fresh + stale + expired,
            max: self.max_entries,
            fresh,
            stale,
            expired,
        }
    }
}
