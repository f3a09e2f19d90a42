//! Per-key SERVFAIL backoff tracker.
//!
//! A key that just produced a SERVFAIL is backed off: queries during the
//! window short-circuit to SERVFAIL without touching upstream, and refresh
//! scheduling is refused. The consecutive count survives backoff expiry so
//! chronically failing keys eventually stop being refresh candidates; an
//! upstream success clears the key entirely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::fnv1a;

const SHARDS: usize = 16;
/// Hard cap on tracked keys across all shards.
const MAX_ENTRIES: usize = 10_000;
/// Expired entries below the refresh threshold age out after this many
/// backoff windows without a new SERVFAIL.
const RETENTION_WINDOWS: u32 = 10;

#[derive(Debug, Clone)]
struct ServfailEntry {
    until: Option<Instant>,
    count: u32,
    last_seen: Instant,
    last_log: Option<Instant>,
}

/// Outcome of recording one SERVFAIL.
#[derive(Debug, Clone, Copy)]
pub struct RecordOutcome {
    pub count: u32,
    /// Rate-limited: true at most once per `log_interval` per key.
    pub should_log: bool,
}

pub struct ServfailTracker {
    shards: Vec<Mutex<HashMap<String, ServfailEntry>>>,
    shard_capacity: usize,
    backoff: Duration,
    threshold: u32,
    log_interval: Duration,
}

impl ServfailTracker {
    pub fn new(backoff: Duration, threshold: u32, log_interval: Duration) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            shard_capacity: MAX_ENTRIES.div_ceil(SHARDS),
            backoff,
            threshold,
            log_interval,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, ServfailEntry>> {
        let idx = (fnv1a(key.as_bytes()) % SHARDS as u64) as usize;
        &self.shards[idx]
    }

    pub fn record(&self, key: &str) -> RecordOutcome {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();

        if !shard.contains_key(key) && shard.len() >= self.shard_capacity {
            evict_oldest(&mut shard);
        }

        let entry = shard.entry(key.to_string()).or_insert(ServfailEntry {
            until: None,
            count: 0,
            last_seen: now,
            last_log: None,
        });
        entry.until = Some(now + self.backoff);
        entry.count += 1;
        entry.last_seen = now;

        let should_log = match entry.last_log {
            Some(last) => now.duration_since(last) >= self.log_interval,
            None => true,
        };
        if should_log {
            entry.last_log = Some(now);
        }

        RecordOutcome {
            count: entry.count,
            should_log,
        }
    }

    pub fn in_backoff(&self, key: &str) -> bool {
        let shard = self.shard(key).lock();
        match shard.get(key).and_then(|e| e.until) {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    pub fn count(&self, key: &str) -> u32 {
        self.shard(key).lock().get(key).map_or(0, |e| e.count)
    }

    /// Refresh admission: refuse while in backoff, or once the consecutive
    /// count has hit the threshold (threshold 0 disables the latter).
    pub fn refresh_inhibited(&self, key: &str) -> bool {
        let shard = self.shard(key).lock();
        let Some(entry) = shard.get(key) else {
            return false;
        };
        if self.threshold > 0 && entry.count >= self.threshold {
            return true;
        }
        match entry.until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Called on upstream success; the key becomes a clean slate.
    pub fn clear(&self, key: &str) {
        self.shard(key).lock().remove(key);
    }

    /// Sweep pass: expire stale backoff windows and drop long-idle entries
    /// that never reached the threshold.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let retention = (self.backoff * RETENTION_WINDOWS).max(Duration::from_secs(60));
        let mut removed = 0;

        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.retain(|_, entry| {
                if let Some(until) = entry.until {
                    if now >= until {
                        entry.until = None;
                    }
                }
                let keep = entry.until.is_some()
                    || (self.threshold > 0 && entry.count >= self.threshold)
                    || now.duration_since(entry.last_seen) < retention;
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_oldest(shard: &mut HashMap<String, ServfailEntry>) {
    if let Some(key) = shard
        .iter()
        .min_by_key(|(_, e)| e.last_seen)
        .map(|(k, _)| k.clone())
    {
        shard.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ServfailTracker {
        ServfailTracker::new(Duration::from_secs(60), 10, Duration::from_secs(60))
    }

    #[test]
    fn record_enters_backoff() {
        let tracker = tracker();
        assert!(!tracker.in_backoff("dns:a.test:1:1"));
        let outcome = tracker.record("dns:a.test:1:1");
        assert_eq!(outcome.count, 1);
        assert!(outcome.should_log);
        assert!(tracker.in_backoff("dns:a.test:1:1"));
        assert!(tracker.refresh_inhibited("dns:a.test:1:1"));
    }

    #[test]
    fn log_is_rate_limited() {
        let tracker = tracker();
        assert!(tracker.record("dns:a.test:1:1").should_log);
        assert!(!tracker.record("dns:a.test:1:1").should_log);
        assert!(!tracker.record("dns:a.test:1:1").should_log);
    }

    #[test]
    fn count_accumulates_and_clears() {
        let tracker = tracker();
        for _ in 0..3 {
            tracker.record("dns:a.test:1:1");
        }
        assert_eq!(tracker.count("dns:a.test:1:1"), 3);
        tracker.clear("dns:a.test:1:1");
        assert_eq!(tracker.count("dns:a.test:1:1"), 0);
        assert!(!tracker.in_backoff("dns:a.test:1:1"));
    }

    #[test]
    fn threshold_inhibits_refresh() {
        let tracker = ServfailTracker::new(
            Duration::from_millis(0),
            3,
            Duration::from_secs(60),
        );
        for _ in 0..3 {
            tracker.record("dns:a.test:1:1");
        }
        // Backoff window is zero, but the count keeps refresh inhibited.
        assert!(!tracker.in_backoff("dns:a.test:1:1"));
        assert!(tracker.refresh_inhibited("dns:a.test:1:1"));
    }

    #[test]
    fn prune_expires_backoff_but_keeps_count() {
        let tracker = ServfailTracker::new(
            Duration::from_millis(0),
            10,
            Duration::from_secs(60),
        );
        tracker.record("dns:a.test:1:1");
        tracker.prune();
        assert!(!tracker.in_backoff("dns:a.test:1:1"));
        assert_eq!(tracker.count("dns:a.test:1:1"), 1);
    }

    #[test]
    fn bounded_by_cap() {
        let tracker = tracker();
        for i in 0..(MAX_ENTRIES + 500) {
            tracker.record(&format!("dns:h{}.test:1:1", i));
        }
        assert!(tracker.len() <= MAX_ENTRIES);
    }
}
