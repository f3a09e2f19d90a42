//! The periodic sweep over the expiry index: refresh what is worth keeping,
//! delete what went cold, and tidy the bookkeeping around both.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::RefreshEngine;
use crate::cache::remote::now_epoch;
use crate::cache::{CacheKey, CacheLayer, HitBatcher, MetaStore};
use crate::servfail::ServfailTracker;

/// Candidates expiring within this many seconds are handled first.
const URGENT_WINDOW_SECS: u64 = 30;
const RECONCILE_SAMPLE: usize = 1000;
const HISTORY_RETENTION: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    pub window: Duration,
    pub min_hits: u64,
    pub max_batch_size: usize,
    /// Sweeps between expiry-index reconciliation passes.
    pub reconcile_interval: u64,
    /// Sweeps between deletion-candidate recounts.
    pub deletion_candidates_interval: u64,
    pub max_keys: usize,
}

/// `refresh_stats()` payload.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshStatsSnapshot {
    pub last_sweep: u64,
    pub last_candidates: usize,
    pub last_refreshed: usize,
    pub last_removed: usize,
    pub last_servfail_skipped: usize,
    pub candidates_24h: u64,
    pub refreshed_24h: u64,
    pub removed_24h: u64,
    pub candidates_stddev: f64,
    pub deletion_candidates: usize,
    pub batch_size: usize,
    pub window_sec: u64,
    pub estimated_daily: u64,
}

struct SweepRecord {
    at: Instant,
    candidates: usize,
    refreshed: usize,
    removed: usize,
}

#[derive(Default)]
struct SweepState {
    last_sweep: u64,
    last_candidates: usize,
    last_refreshed: usize,
    last_removed: usize,
    last_servfail_skipped: usize,
    deletion_candidates: usize,
    history: VecDeque<SweepRecord>,
}

pub struct Sweeper {
    engine: Arc<RefreshEngine>,
    store: Arc<dyn MetaStore>,
    cache: Arc<CacheLayer>,
    servfail: Arc<ServfailTracker>,
    batcher: HitBatcher,
    config: SweepConfig,
    state: Mutex<SweepState>,
    sweep_count: Mutex<u64>,
}

impl Sweeper {
    pub fn new(
        engine: Arc<RefreshEngine>,
        store: Arc<dyn MetaStore>,
        cache: Arc<CacheLayer>,
        servfail: Arc<ServfailTracker>,
        batcher: HitBatcher,
        config: SweepConfig,
    ) -> Self {
        Self {
            engine,
            store,
            cache,
            servfail,
            batcher,
            config,
            state: Mutex::new(SweepState::default()),
            sweep_count: Mutex::new(0),
        }
    }

    /// Ticker loop. The first tick is delayed by an instance-specific
    /// jitter (hostname hash plus up to 5 s of randomness) so replicas
    /// sharing one store do not sweep in lockstep.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let jitter = instance_jitter();
        info!(
            "Sweeper starting: interval {:?}, jitter {:?}",
            self.config.interval, jitter
        );

        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = shutdown.recv() => return,
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!("Sweep failed: {}", err);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Sweeper stopped");
                    return;
                }
            }
        }
    }

    /// One full sweep pass. Public so tests can drive it without the ticker.
    pub async fn sweep(&self) -> crate::error::Result<()> {
        let sweep_number = {
            let mut count = self.sweep_count.lock();
            *count += 1;
            *count
        };

        let pruned = self.servfail.prune();
        if pruned > 0 {
            debug!("Pruned {} expired SERVFAIL entries", pruned);
        }

        // Flush so sweep-hit counts include everything served up to now.
        self.batcher.flush().await;

        let cleaned_l0 = self.cache.local().clean_expired();
        if cleaned_l0 > 0 {
            debug!("Cleaned {} expired L0 entries", cleaned_l0);
        }

        if self.config.reconcile_interval > 0
            && sweep_number % self.config.reconcile_interval == 0
        {
            match self.store.reconcile_expiry_index(RECONCILE_SAMPLE).await {
                Ok(removed) if removed > 0 => {
                    info!("Reconciled expiry index: removed {} orphans", removed)
                }
                Ok(_) => {}
                Err(err) => warn!("Expiry index reconcile failed: {}", err),
            }
        }

        if self.config.deletion_candidates_interval > 0
            && sweep_number % self.config.deletion_candidates_interval == 0
        {
            match self.store.count_below_threshold(self.config.min_hits).await {
                Ok(count) => self.state.lock().deletion_candidates = count,
                Err(err) => warn!("Deletion-candidate recount failed: {}", err),
            }
        }

        let now = now_epoch();
        let until = now + self.config.window.as_secs();
        let candidates = self
            .store
            .expiry_candidates(until, self.config.max_batch_size)
            .await?;
        let total_candidates = candidates.len();

        // Urgent entries first, each partition shuffled to spread upstream
        // load across replicas.
        let (mut urgent, mut rest): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|(_, soft)| *soft <= now + URGENT_WINDOW_SECS);
        {
            let mut rng = rand::rng();
            urgent.shuffle(&mut rng);
            rest.shuffle(&mut rng);
        }
        urgent.extend(rest);

        let keys: Vec<String> = urgent.into_iter().map(|(key, _)| key).collect();
        let checks = self.store.batch_candidate_checks(&keys).await?;

        let mut refreshed = 0;
        let mut removed = 0;
        let mut servfail_skipped = 0;
        let mut orphans = Vec::new();

        for check in checks {
            if !check.exists {
                orphans.push(check.key);
                continue;
            }
            if check.sweep_hits < self.config.min_hits {
                // Cold key: nobody asked for it this window, stop paying
                // for its refreshes.
                if let Err(err) = self.store.remove_entry(&check.key).await {
                    warn!("Cold-key delete failed for {}: {}", check.key, err);
                    continue;
                }
                if let Some(parsed) = CacheKey::parse(&check.key) {
                    self.cache.local().delete(&parsed);
                }
                removed += 1;
                continue;
            }
            if self.servfail.refresh_inhibited(&check.key) {
                servfail_skipped += 1;
                continue;
            }
            if let Some(parsed) = CacheKey::parse(&check.key) {
                let question = parsed.to_question();
                if Arc::clone(&self.engine).schedule_refresh(question, parsed) {
                    refreshed += 1;
                }
            }
        }

        if !orphans.is_empty() {
            debug!("Dropping {} orphaned index entries", orphans.len());
            let _ = self.store.remove_index_entries(&orphans).await;
        }

        {
            let mut state = self.state.lock();
            state.last_sweep = now;
            state.last_candidates = total_candidates;
            state.last_refreshed = refreshed;
            state.last_removed = removed;
            state.last_servfail_skipped = servfail_skipped;
            state.history.push_back(SweepRecord {
                at: Instant::now(),
                candidates: total_candidates,
                refreshed,
                removed,
            });
            while let Some(front) = state.history.front() {
                if front.at.elapsed() > HISTORY_RETENTION {
                    state.history.pop_front();
                } else {
                    break;
                }
            }
        }

        debug!(
            "Sweep #{}: {} candidates, {} refreshed, {} removed, {} servfail-skipped",
            sweep_number, total_candidates, refreshed, removed, servfail_skipped
        );

        if self.config.max_keys > 0 {
            match self.store.evict_to_cap(self.config.max_keys).await {
                Ok(evicted) if evicted > 0 => {
                    info!("Capacity eviction removed {} entries", evicted)
                }
                Ok(_) => {}
                Err(err) => warn!("Capacity eviction failed: {}", err),
            }
        }

        Ok(())
    }

    pub fn refresh_stats(&self) -> RefreshStatsSnapshot {
        let state = self.state.lock();

        let candidates_24h: u64 = state.history.iter().map(|r| r.candidates as u64).sum();
        let refreshed_24h: u64 = state.history.iter().map(|r| r.refreshed as u64).sum();
        let removed_24h: u64 = state.history.iter().map(|r| r.removed as u64).sum();

        let stddev = {
            let n = state.history.len();
            if n < 2 {
                0.0
            } else {
                let mean = candidates_24h as f64 / n as f64;
                let variance = state
                    .history
                    .iter()
                    .map(|r| {
                        let d = r.candidates as f64 - mean;
                        d * d
                    })
                    .sum::<f64>()
                    / (n - 1) as f64;
                variance.sqrt()
            }
        };

        let estimated_daily = match state.history.front() {
            Some(front) => {
                let span = front.at.elapsed().as_secs().max(1);
                refreshed_24h * 86_400 / span
            }
            None => 0,
        };

        RefreshStatsSnapshot {
            last_sweep: state.last_sweep,
            last_candidates: state.last_candidates,
            last_refreshed: state.last_refreshed,
            last_removed: state.last_removed,
            last_servfail_skipped: state.last_servfail_skipped,
            candidates_24h,
            refreshed_24h,
            removed_24h,
            candidates_stddev: stddev,
            deletion_candidates: state.deletion_candidates,
            batch_size: self.config.max_batch_size,
            window_sec: self.config.window.as_secs(),
            estimated_daily,
        }
    }
}

/// Hostname-derived spread plus up to 5 s of randomness.
fn instance_jitter() -> Duration {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let host_ms = crate::cache::fnv1a(host.as_bytes()) % 5000;
    let random_ms = rand::random::<u64>() % 5000;
    Duration::from_millis(host_ms + random_ms)
}
