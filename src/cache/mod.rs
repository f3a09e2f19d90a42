pub mod batcher;
pub mod layer;
pub mod local;
pub mod remote;

pub use batcher::HitBatcher;
pub use layer::{CacheLayer, CacheLookup, CacheStatsSnapshot};
pub use local::LocalCache;
pub use remote::{CandidateCheck, HitFlush, MetaStore, RedisStore};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::dns::{DnsQuestion, RecordClass, RecordType, name};

/// Answer-cache key: `dns:<lowercased-qname>:<qtype>:<qclass>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl CacheKey {
    pub fn new(name: &str, qtype: RecordType, qclass: RecordClass) -> Self {
        Self {
            name: name::normalize(name),
            qtype: qtype.into(),
            qclass: qclass.into(),
        }
    }

    pub fn from_question(question: &DnsQuestion) -> Self {
        Self::new(&question.name, question.qtype, question.qclass)
    }

    /// The `dns:` keyspace form used in the remote store.
    pub fn redis_key(&self) -> String {
        format!("dns:{}:{}:{}", self.name, self.qtype, self.qclass)
    }

    /// Parse a `dns:...` key back into its parts. Names may themselves
    /// contain colons; the inner segments are re-joined.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("dns:")?;
        let mut parts: Vec<&str> = rest.split(':').collect();
        if parts.len() < 3 {
            return None;
        }
        let qclass = parts.pop()?.parse::<u16>().ok()?;
        let qtype = parts.pop()?.parse::<u16>().ok()?;
        Some(Self {
            name: parts.join(":"),
            qtype,
            qclass,
        })
    }

    /// Reconstruct the question this key was derived from.
    pub fn to_question(&self) -> DnsQuestion {
        DnsQuestion::new(
            self.name.clone(),
            RecordType::from(self.qtype),
            RecordClass::from(self.qclass),
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dns:{}:{}:{}", self.name, self.qtype, self.qclass)
    }
}

/// FNV-1a over the key string; used for L0 shard selection.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Hit/miss counters for the layered cache. Only explicit hits and misses
/// are counted; remote read failures degrade to upstream without touching
/// the miss counter.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stale_hits: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// L0 occupancy breakdown reported by `cache_stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct LocalCacheStats {
    pub entries: usize,
    pub max: usize,
    pub fresh: usize,
    pub stale: usize,
    pub expired: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_grammar() {
        let key = CacheKey::new("WWW.Example.COM.", RecordType::A, RecordClass::IN);
        assert_eq!(key.redis_key(), "dns:www.example.com:1:1");
    }

    #[test]
    fn cache_key_parse_round_trip() {
        let key = CacheKey::new("example.com", RecordType::AAAA, RecordClass::IN);
        let parsed = CacheKey::parse(&key.redis_key()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn cache_key_parse_joins_inner_colons() {
        let parsed = CacheKey::parse("dns:weird:name:28:1").unwrap();
        assert_eq!(parsed.name, "weird:name");
        assert_eq!(parsed.qtype, 28);
        assert_eq!(parsed.qclass, 1);
    }

    #[test]
    fn cache_key_parse_rejects_garbage() {
        assert!(CacheKey::parse("dnsmeta:hit:dns:a:1:1").is_none());
        assert!(CacheKey::parse("dns:short").is_none());
        assert!(CacheKey::parse("dns:name:x:1").is_none());
    }

    #[test]
    fn fnv1a_is_stable() {
        // Reference vector for the 64-bit FNV-1a parameters.
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_ne!(fnv1a(b"dns:a:1:1"), fnv1a(b"dns:b:1:1"));
    }

    #[test]
    fn hit_rate_math() {
        let stats = CacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
