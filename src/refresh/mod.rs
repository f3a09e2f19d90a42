//! Refresh-ahead: proactively re-resolving entries before their TTL runs
//! out, bounded locally by a semaphore and across the fleet by a per-key
//! distributed lock.

pub mod sweeper;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheLayer, HitBatcher, MetaStore};
use crate::dns::{DnsMessage, DnsQuestion, TtlPolicy};
use crate::servfail::ServfailTracker;
use crate::upstream::UpstreamManager;

/// Deadline on each counter touch in the hot path's background work.
const COUNTER_DEADLINE: Duration = Duration::from_millis(100);
/// Deadline on lock acquisition/release against the shared store.
const LOCK_DEADLINE: Duration = Duration::from_secs(2);

/// Refresh-ahead tuning, distilled from the resolver config.
#[derive(Debug, Clone)]
pub struct RefreshTuning {
    pub hot_ttl: Duration,
    pub hot_threshold: u64,
    /// Remaining-TTL trigger for keys that are not hot.
    pub min_ttl: u32,
    pub hit_window: Duration,
    pub sweep_hit_window: Duration,
    pub sample_rate: f64,
    pub lock_ttl: Duration,
    pub fail_log_interval: Duration,
}

pub struct RefreshEngine {
    cache: Arc<CacheLayer>,
    store: Option<Arc<dyn MetaStore>>,
    upstreams: Arc<UpstreamManager>,
    servfail: Arc<ServfailTracker>,
    batcher: Option<HitBatcher>,
    semaphore: Arc<Semaphore>,
    ttl_policy: TtlPolicy,
    tuning: RefreshTuning,
    // Refresh failures log at most once per interval, globally; an outage
    // upstream would otherwise flood the log every lock_ttl.
    last_fail_log: Mutex<Option<Instant>>,
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl RefreshEngine {
    pub fn new(
        cache: Arc<CacheLayer>,
        store: Option<Arc<dyn MetaStore>>,
        upstreams: Arc<UpstreamManager>,
        servfail: Arc<ServfailTracker>,
        batcher: Option<HitBatcher>,
        max_inflight: usize,
        ttl_policy: TtlPolicy,
        tuning: RefreshTuning,
    ) -> Self {
        Self {
            cache,
            store,
            upstreams,
            servfail,
            batcher,
            semaphore: Arc::new(Semaphore::new(max_inflight)),
            ttl_policy,
            tuning,
            last_fail_log: Mutex::new(None),
            scheduled: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.scheduled.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    /// Post-serve hook for cache hits: sample counters, classify hot/cold,
    /// and schedule a refresh when the entry is close enough to expiry.
    /// Runs after the client write; must never block the request path.
    pub async fn after_hit(
        self: Arc<Self>,
        question: DnsQuestion,
        key: CacheKey,
        remaining: u32,
        was_stale: bool,
    ) {
        let mut effective_hits = 0u64;

        if self.tuning.sample_rate > 0.0
            && (self.tuning.sample_rate >= 1.0
                || rand::random::<f64>() < self.tuning.sample_rate)
        {
            if let Some(batcher) = &self.batcher {
                let redis_key = key.redis_key();
                let handle =
                    batcher.increment_hit(redis_key.clone(), self.tuning.hit_window);
                batcher.increment_sweep_hit(redis_key, self.tuning.sweep_hit_window);

                let sampled = match tokio::time::timeout(COUNTER_DEADLINE, handle).await {
                    Ok(Ok(count)) => count,
                    _ => 0,
                };
                // Scale the sampled count back to an effective rate.
                effective_hits = (sampled as f64 / self.tuning.sample_rate) as u64;
            }
        }

        if was_stale {
            // The stale reply is already on the wire; refresh regardless.
            self.schedule_refresh(question, key);
            return;
        }

        if remaining == 0 {
            return;
        }
        let is_hot = effective_hits >= self.tuning.hot_threshold;
        let due = if is_hot {
            remaining as u64 <= self.tuning.hot_ttl.as_secs()
        } else {
            remaining <= self.tuning.min_ttl
        };
        if due {
            self.schedule_refresh(question, key);
        }
    }

    /// Admission-checked, bounded, lock-guarded refresh. Returns whether a
    /// refresh task was actually spawned.
    pub fn schedule_refresh(self: Arc<Self>, question: DnsQuestion, key: CacheKey) -> bool {
        let redis_key = key.redis_key();

        if self.servfail.refresh_inhibited(&redis_key) {
            debug!("Refresh refused for {} (SERVFAIL state)", redis_key);
            return false;
        }

        // Local admission first; contention means we are already saturated
        // and this key can wait for the sweeper.
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            debug!("Refresh dropped for {} (in-flight limit)", redis_key);
            return false;
        };

        let engine = self;
        tokio::spawn(async move {
            let _permit = permit;

            let lock_held = match &engine.store {
                Some(store) => {
                    match tokio::time::timeout(
                        LOCK_DEADLINE,
                        store.try_acquire_refresh(&key, engine.tuning.lock_ttl),
                    )
                    .await
                    {
                        Ok(Ok(true)) => true,
                        Ok(Ok(false)) => {
                            debug!("Refresh lock contended for {}", key);
                            return;
                        }
                        Ok(Err(err)) => {
                            warn!("Refresh lock failure for {}: {}", key, err);
                            return;
                        }
                        Err(_) => {
                            warn!("Refresh lock timeout for {}", key);
                            return;
                        }
                    }
                }
                None => false,
            };

            engine.scheduled.fetch_add(1, Ordering::Relaxed);
            engine.perform_refresh(&question, &key).await;

            if lock_held {
                if let Some(store) = &engine.store {
                    let release =
                        tokio::time::timeout(LOCK_DEADLINE, store.release_refresh(&key)).await;
                    if !matches!(release, Ok(Ok(()))) {
                        // The lock TTL is the backstop.
                        debug!("Refresh lock release failed for {}", key);
                    }
                }
            }
        });
        true
    }

    async fn perform_refresh(&self, question: &DnsQuestion, key: &CacheKey) {
        let query = DnsMessage::query(rand::random::<u16>(), question.clone());
        let redis_key = key.redis_key();

        match self.upstreams.exchange(&query).await {
            Ok(outcome) if outcome.response.is_servfail() => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let record = self.servfail.record(&redis_key);
                if record.should_log {
                    warn!(
                        "Refresh got SERVFAIL for {} (consecutive: {})",
                        redis_key, record.count
                    );
                }
            }
            Ok(outcome) => {
                self.servfail.clear(&redis_key);
                let ttl = self.ttl_policy.effective_ttl(&outcome.response);
                if ttl > 0 {
                    self.cache.store(key, &outcome.response, ttl).await;
                }
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!("Refreshed {} via {} (ttl {})", redis_key, outcome.upstream, ttl);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.log_refresh_failure(&redis_key, &err.to_string());
            }
        }
    }

    fn log_refresh_failure(&self, key: &str, message: &str) {
        let mut last = self.last_fail_log.lock();
        let now = Instant::now();
        let due = match *last {
            Some(at) => now.duration_since(at) >= self.tuning.fail_log_interval,
            None => true,
        };
        if due {
            *last = Some(now);
            warn!("Refresh upstream failure for {}: {}", key, message);
        }
    }
}
