use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::local::LocalCache;
use super::remote::MetaStore;
use super::{CacheKey, CacheStats, LocalCacheStats};
use crate::dns::DnsMessage;
use crate::error::Result;

/// Outcome of a two-tier lookup.
#[derive(Debug)]
pub enum CacheLookup {
    Fresh { answer: DnsMessage, remaining: u32 },
    Stale { answer: DnsMessage, stale_for: u64 },
    Miss,
}

/// `cache_stats()` payload.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub l0: LocalCacheStats,
    pub l1_key_count: Option<usize>,
}

/// The two-tier answer cache: sharded in-process L0 in front of the shared
/// store. L0 is populated from L1 hits, so it stays a subset of L1.
pub struct CacheLayer {
    l0: LocalCache,
    l1: Option<Arc<dyn MetaStore>>,
    stats: CacheStats,
    serve_stale: bool,
    stale_ttl: Duration,
}

impl CacheLayer {
    pub fn new(
        l0: LocalCache,
        l1: Option<Arc<dyn MetaStore>>,
        serve_stale: bool,
        stale_ttl: Duration,
    ) -> Self {
        Self {
            l0,
            l1,
            stats: CacheStats::new(),
            serve_stale,
            stale_ttl,
        }
    }

    pub fn local(&self) -> &LocalCache {
        &self.l0
    }

    pub fn remote(&self) -> Option<&Arc<dyn MetaStore>> {
        self.l1.as_ref()
    }

    /// L0 → L1. Remote read failures degrade to a miss without touching the
    /// miss counter; only explicit misses count toward the hit rate.
    pub async fn lookup(&self, key: &CacheKey) -> CacheLookup {
        if let Some(hit) = self.l0.get(key) {
            if hit.remaining > 0 {
                self.stats.record_hit();
                return CacheLookup::Fresh {
                    answer: hit.answer,
                    remaining: hit.remaining,
                };
            }
            if self.serve_stale && hit.stale_for <= self.stale_ttl.as_secs() {
                self.stats.record_stale_hit();
                return CacheLookup::Stale {
                    answer: hit.answer,
                    stale_for: hit.stale_for,
                };
            }
            self.stats.record_miss();
            return CacheLookup::Miss;
        }

        let Some(l1) = &self.l1 else {
            self.stats.record_miss();
            return CacheLookup::Miss;
        };

        match l1.get_with_ttl(key).await {
            Ok(Some((bytes, remaining))) => {
                let answer = match DnsMessage::parse(&bytes) {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!("Undecodable cache entry for {}: {}", key, err);
                        self.stats.record_miss();
                        return CacheLookup::Miss;
                    }
                };

                if remaining > 0 {
                    // Promote so the next lookup stays in-process.
                    self.l0.set(key, answer.clone(), remaining as u32);
                    self.stats.record_hit();
                    return CacheLookup::Fresh {
                        answer,
                        remaining: remaining as u32,
                    };
                }

                let stale_for = remaining.unsigned_abs();
                if self.serve_stale && stale_for <= self.stale_ttl.as_secs() {
                    self.stats.record_stale_hit();
                    return CacheLookup::Stale { answer, stale_for };
                }

                self.stats.record_miss();
                CacheLookup::Miss
            }
            Ok(None) => {
                self.stats.record_miss();
                CacheLookup::Miss
            }
            Err(err) => {
                // Degraded, not a miss: the next stage goes to upstream.
                warn!("Cache read failure for {}: {}", key, err);
                CacheLookup::Miss
            }
        }
    }

    /// Write both tiers. L1 failures are logged and swallowed; the next
    /// query will simply miss again.
    pub async fn store(&self, key: &CacheKey, answer: &DnsMessage, ttl: u32) {
        if ttl == 0 {
            debug!("Not caching zero-TTL answer for {}", key);
            return;
        }
        self.l0.set(key, answer.clone(), ttl);

        if let Some(l1) = &self.l1 {
            match answer.to_bytes() {
                Ok(bytes) => {
                    if let Err(err) = l1.set_with_index(key, &bytes, ttl).await {
                        warn!("Cache write failure for {}: {}", key, err);
                    }
                }
                Err(err) => warn!("Failed to encode answer for {}: {}", key, err),
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey) {
        self.l0.delete(key);
        if let Some(l1) = &self.l1 {
            if let Err(err) = l1.remove_entry(&key.redis_key()).await {
                warn!("Cache delete failure for {}: {}", key, err);
            }
        }
    }

    pub async fn clear(&self) -> Result<()> {
        self.l0.clear();
        if let Some(l1) = &self.l1 {
            l1.clear().await?;
        }
        Ok(())
    }

    pub async fn cache_stats(&self) -> CacheStatsSnapshot {
        use std::sync::atomic::Ordering;

        let l1_key_count = match &self.l1 {
            Some(l1) => l1.key_count().await.ok(),
            None => None,
        };

        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            hit_rate: self.stats.hit_rate(),
            l0: self.l0.occupancy(),
            l1_key_count,
        }
    }
}
