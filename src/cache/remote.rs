//! L1: the shared Redis store holding wire-format answers, the expiry
//! index, hit counters, and refresh locks.
//!
//! Keyspace: `dns:*` answers (hash: `data`, `exp`, `at`), `<meta>:expiry:index`
//! sorted set scored by soft-expiry epoch, `<meta>:hit:<key>` /
//! `<meta>:hit:sweep:<key>` counters, `<meta>:refresh:<key>` locks. `<meta>`
//! is `dnsmeta`, or `{dnsmeta}` when hash-tag co-location is enabled for
//! cluster/sentinel topologies.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tracing::{debug, info, warn};

use super::CacheKey;
use crate::error::{Result, WardenError};

/// Grace added on top of the soft TTL for the store-level expiry safety net.
const MAX_GRACE_SECS: u64 = 3600;

/// One pending counter flush.
#[derive(Debug, Clone)]
pub struct HitFlush {
    pub key: String,
    pub count: u64,
    pub window: Duration,
}

/// Result of a sweeper candidate check.
#[derive(Debug, Clone)]
pub struct CandidateCheck {
    pub key: String,
    pub exists: bool,
    pub sweep_hits: u64,
    pub created_at: u64,
}

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The seam between the resolver core and the shared store. The production
/// implementation is [`RedisStore`]; tests drive the core against an
/// in-memory double.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Fetch answer bytes plus remaining soft TTL in one round trip.
    /// Remaining is negative once the entry is past soft expiry.
    async fn get_with_ttl(&self, key: &CacheKey) -> Result<Option<(Vec<u8>, i64)>>;

    /// Atomically write answer + soft expiry, insert the expiry-index entry,
    /// and attach a store-level TTL of `ttl + min(ttl, 1 h)`.
    async fn set_with_index(&self, key: &CacheKey, answer: &[u8], ttl: u32) -> Result<()>;

    /// Delete the answer and its expiry-index entry.
    async fn remove_entry(&self, key: &str) -> Result<()>;

    /// Pipelined counter increments; returns the new counts for `hits`
    /// (sweep increments are fire-and-forget).
    async fn flush_hits(&self, hits: &[HitFlush], sweeps: &[HitFlush]) -> Result<Vec<u64>>;

    /// Conditional set-if-absent with TTL; contention returns false.
    async fn try_acquire_refresh(&self, key: &CacheKey, ttl: Duration) -> Result<bool>;

    async fn release_refresh(&self, key: &CacheKey) -> Result<()>;

    /// Index entries with soft-expiry ≤ `until`, ascending, up to `limit`.
    async fn expiry_candidates(&self, until: u64, limit: usize) -> Result<Vec<(String, u64)>>;

    /// Existence, sweep-hit count, and creation epoch for each candidate in
    /// a few pipelined round trips.
    async fn batch_candidate_checks(&self, keys: &[String]) -> Result<Vec<CandidateCheck>>;

    async fn remove_index_entries(&self, keys: &[String]) -> Result<usize>;

    /// Sample the expiry index and drop entries whose key no longer exists.
    async fn reconcile_expiry_index(&self, sample_size: usize) -> Result<usize>;

    /// Evict down to `max_keys`, lowest sweep-hit count first, then earliest
    /// creation. Only indexed entries are candidates.
    async fn evict_to_cap(&self, max_keys: usize) -> Result<usize>;

    /// Count of `dns:*` answer keys.
    async fn key_count(&self) -> Result<usize>;

    /// Count indexed entries whose sweep hits are below `min_hits`
    /// (bounded scan, reporting only).
    async fn count_below_threshold(&self, min_hits: u64) -> Result<usize>;

    /// Delete all `dns:*` and meta keys.
    async fn clear(&self) -> Result<()>;
}

/// Redis-backed [`MetaStore`] over an auto-reconnecting connection manager.
pub struct RedisStore {
    conn: ConnectionManager,
    meta_prefix: String,
}

impl RedisStore {
    pub async fn connect(url: &str, cluster_mode: bool) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| WardenError::Redis(format!("invalid redis url: {}", e)))?;

        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(2))
            .set_response_timeout(Duration::from_secs(2));

        let conn = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(|e| WardenError::Redis(format!("failed to connect to {}: {}", url, e)))?;

        info!("Connected to Redis at {}", url);

        // Hash-tag the meta keyspace so the index and counters co-reside on
        // one shard under cluster/sentinel.
        let meta_prefix = if cluster_mode { "{dnsmeta}" } else { "dnsmeta" };

        Ok(Self {
            conn,
            meta_prefix: meta_prefix.to_string(),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::Redis(format!("ping failed: {}", e)))?;
        Ok(())
    }

    fn index_key(&self) -> String {
        format!("{}:expiry:index", self.meta_prefix)
    }

    fn hit_key(&self, key: &str) -> String {
        format!("{}:hit:{}", self.meta_prefix, key)
    }

    fn sweep_hit_key(&self, key: &str) -> String {
        format!("{}:hit:sweep:{}", self.meta_prefix, key)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:refresh:{}", self.meta_prefix, key)
    }

    fn is_wrong_type(err: &redis::RedisError) -> bool {
        matches!(err.kind(), redis::ErrorKind::TypeError)
            || err.to_string().contains("WRONGTYPE")
    }

    /// Legacy plain-string entries carry no expiry field; upgrade them in
    /// place using the key's remaining store TTL as the soft TTL.
    async fn upgrade_legacy(&self, key: &CacheKey) -> Result<Option<(Vec<u8>, i64)>> {
        let rkey = key.redis_key();
        let mut conn = self.conn.clone();

        let data: Option<Vec<u8>> = redis::cmd("GET")
            .arg(&rkey)
            .query_async(&mut conn)
            .await
            .map_err(WardenError::from)?;
        let Some(data) = data else {
            return Ok(None);
        };

        let pttl: i64 = redis::cmd("PTTL")
            .arg(&rkey)
            .query_async(&mut conn)
            .await
            .map_err(WardenError::from)?;
        let remaining = (pttl / 1000).max(0);
        if remaining == 0 {
            return Ok(None);
        }

        debug!("Upgrading legacy cache entry {}", rkey);
        // Rewrite as the two-field record; drop the legacy value first so
        // HSET does not collide with the string type.
        let _: std::result::Result<(), redis::RedisError> =
            redis::cmd("DEL").arg(&rkey).query_async(&mut conn).await;
        self.set_with_index(key, &data, remaining as u32).await?;
        Ok(Some((data, remaining)))
    }

    async fn scan_delete(&self, pattern: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await
                .map_err(WardenError::from)?;

            if !keys.is_empty() {
                deleted += keys.len();
                let _: () = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .unwrap_or(());
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl MetaStore for RedisStore {
    async fn get_with_ttl(&self, key: &CacheKey) -> Result<Option<(Vec<u8>, i64)>> {
        let rkey = key.redis_key();
        let mut conn = self.conn.clone();

        // One HMGET covers both the value fetch and the soft-expiry fetch.
        let result: std::result::Result<(Option<Vec<u8>>, Option<u64>), redis::RedisError> =
            redis::cmd("HMGET")
                .arg(&rkey)
                .arg("data")
                .arg("exp")
                .query_async(&mut conn)
                .await;

        match result {
            Ok((Some(data), Some(exp))) => {
                let remaining = exp as i64 - now_epoch() as i64;
                Ok(Some((data, remaining)))
            }
            Ok((Some(data), None)) => {
                // Hash written without an expiry field; treat as stale-now.
                Ok(Some((data, 0)))
            }
            Ok((None, _)) => Ok(None),
            Err(err) if Self::is_wrong_type(&err) => self.upgrade_legacy(key).await,
            Err(err) => Err(WardenError::CacheRead(err.to_string())),
        }
    }

    async fn set_with_index(&self, key: &CacheKey, answer: &[u8], ttl: u32) -> Result<()> {
        if ttl == 0 {
            return Ok(());
        }
        let rkey = key.redis_key();
        let mut conn = self.conn.clone();
        let now = now_epoch();
        let soft = now + ttl as u64;
        let store_ttl = ttl as u64 + (ttl as u64).min(MAX_GRACE_SECS);

        for attempt in 0..2 {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("HSET")
                .arg(&rkey)
                .arg("data")
                .arg(answer)
                .arg("exp")
                .arg(soft)
                .arg("at")
                .arg(now)
                .ignore()
                .cmd("EXPIRE")
                .arg(&rkey)
                .arg(store_ttl)
                .ignore()
                .cmd("ZADD")
                .arg(self.index_key())
                .arg(soft)
                .arg(&rkey)
                .ignore();

            let result: std::result::Result<(), redis::RedisError> =
                pipe.query_async(&mut conn).await;

            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempt == 0 && Self::is_wrong_type(&err) => {
                    warn!("Wrong-type collision on {}, deleting and retrying", rkey);
                    let _: std::result::Result<(), redis::RedisError> =
                        redis::cmd("DEL").arg(&rkey).query_async(&mut conn).await;
                }
                Err(err) => return Err(WardenError::CacheWrite(err.to_string())),
            }
        }
        Ok(())
    }

    async fn remove_entry(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("DEL")
            .arg(key)
            .ignore()
            .cmd("ZREM")
            .arg(self.index_key())
            .arg(key)
            .ignore();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::CacheWrite(e.to_string()))?;
        Ok(())
    }

    async fn flush_hits(&self, hits: &[HitFlush], sweeps: &[HitFlush]) -> Result<Vec<u64>> {
        if hits.is_empty() && sweeps.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();

        for flush in hits {
            pipe.cmd("INCRBY")
                .arg(self.hit_key(&flush.key))
                .arg(flush.count)
                .cmd("PEXPIRE")
                .arg(self.hit_key(&flush.key))
                .arg(flush.window.as_millis() as u64)
                .ignore();
        }
        for flush in sweeps {
            pipe.cmd("INCRBY")
                .arg(self.sweep_hit_key(&flush.key))
                .arg(flush.count)
                .ignore()
                .cmd("PEXPIRE")
                .arg(self.sweep_hit_key(&flush.key))
                .arg(flush.window.as_millis() as u64)
                .ignore();
        }

        let counts: Vec<u64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::Counter(e.to_string()))?;
        Ok(counts)
    }

    async fn try_acquire_refresh(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(&key.redis_key()))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::Lock(e.to_string()))?;
        Ok(acquired.is_some())
    }

    async fn release_refresh(&self, key: &CacheKey) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.lock_key(&key.redis_key()))
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::Lock(e.to_string()))?;
        Ok(())
    }

    async fn expiry_candidates(&self, until: u64, limit: usize) -> Result<Vec<(String, u64)>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, u64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.index_key())
            .arg("-inf")
            .arg(until)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::Sweep(e.to_string()))?;
        Ok(entries)
    }

    async fn batch_candidate_checks(&self, keys: &[String]) -> Result<Vec<CandidateCheck>> {
        let mut conn = self.conn.clone();
        let mut checks = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(100) {
            let mut pipe = redis::pipe();
            for key in chunk {
                pipe.cmd("EXISTS").arg(key);
                pipe.cmd("GET").arg(self.sweep_hit_key(key));
                pipe.cmd("HGET").arg(key).arg("at");
            }

            let values: Vec<redis::Value> = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| WardenError::Sweep(e.to_string()))?;

            for (i, key) in chunk.iter().enumerate() {
                let exists: bool =
                    redis::from_redis_value(&values[i * 3]).unwrap_or(false);
                let sweep_hits: u64 = redis::from_redis_value::<Option<u64>>(&values[i * 3 + 1])
                    .unwrap_or(None)
                    .unwrap_or(0);
                let created_at: u64 = redis::from_redis_value::<Option<u64>>(&values[i * 3 + 2])
                    .unwrap_or(None)
                    .unwrap_or(0);
                checks.push(CandidateCheck {
                    key: key.clone(),
                    exists,
                    sweep_hits,
                    created_at,
                });
            }
        }

        Ok(checks)
    }

    async fn remove_index_entries(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: usize = redis::cmd("ZREM")
            .arg(self.index_key())
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::IndexReconcile(e.to_string()))?;
        Ok(removed)
    }

    async fn reconcile_expiry_index(&self, sample_size: usize) -> Result<usize> {
        let mut conn = self.conn.clone();
        let sampled: Vec<String> = redis::cmd("ZRANDMEMBER")
            .arg(self.index_key())
            .arg(sample_size as i64)
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::IndexReconcile(e.to_string()))?;
        if sampled.is_empty() {
            return Ok(0);
        }

        let checks = self.batch_candidate_checks(&sampled).await?;
        let orphans: Vec<String> = checks
            .into_iter()
            .filter(|c| !c.exists)
            .map(|c| c.key)
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }

        debug!("Removing {} orphaned expiry-index entries", orphans.len());
        self.remove_index_entries(&orphans).await
    }

    async fn evict_to_cap(&self, max_keys: usize) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = redis::cmd("ZCARD")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::Sweep(e.to_string()))?;
        if count <= max_keys {
            return Ok(0);
        }
        let overage = count - max_keys;

        // Pull a window of oldest-expiring candidates, then rank by
        // (sweep hits, creation time).
        let window = (overage * 4).min(count);
        let candidates: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.index_key())
            .arg(0)
            .arg(window as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::Sweep(e.to_string()))?;

        let mut checks = self.batch_candidate_checks(&candidates).await?;
        checks.sort_by(|a, b| {
            a.sweep_hits
                .cmp(&b.sweep_hits)
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut evicted = 0;
        for check in checks.into_iter().take(overage) {
            self.remove_entry(&check.key).await?;
            evicted += 1;
        }
        debug!("Evicted {} entries to stay under {} keys", evicted, max_keys);
        Ok(evicted)
    }

    async fn key_count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut count = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("dns:*")
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await
                .map_err(|e| WardenError::CacheRead(e.to_string()))?;
            count += keys.len();
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(count)
    }

    async fn count_below_threshold(&self, min_hits: u64) -> Result<usize> {
        // Bounded scan: reporting, not accounting.
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.index_key())
            .arg(0)
            .arg(9999)
            .query_async(&mut conn)
            .await
            .map_err(|e| WardenError::Sweep(e.to_string()))?;
        let checks = self.batch_candidate_checks(&keys).await?;
        Ok(checks
            .iter()
            .filter(|c| c.exists && c.sweep_hits < min_hits)
            .count())
    }

    async fn clear(&self) -> Result<()> {
        let answers = self.scan_delete("dns:*").await?;
        let meta = self
            .scan_delete(&format!("{}:*", self.meta_prefix))
            .await?;
        info!("Cleared {} answer keys and {} meta keys", answers, meta);
        Ok(())
    }
}
