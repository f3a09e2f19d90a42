//! Coalesces per-key hit-counter increments into pipelined writes.
//!
//! Flush policy: every 50 ms, or as soon as 100 distinct keys are pending,
//! whichever comes first. Hit increments resolve a handle with the new
//! count; sweep-hit increments are fire-and-forget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use super::remote::{HitFlush, MetaStore};

const FLUSH_INTERVAL: Duration = Duration::from_millis(50);
const FLUSH_KEY_THRESHOLD: usize = 100;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const QUEUE_DEPTH: usize = 4096;

enum BatchMsg {
    Hit {
        key: String,
        window: Duration,
        reply: oneshot::Sender<u64>,
    },
    SweepHit {
        key: String,
        window: Duration,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
}

/// Handle resolving to the post-increment count; resolves to 0 on flush
/// failure. Callers pair it with their own deadline.
pub type HitCountHandle = oneshot::Receiver<u64>;

#[derive(Clone)]
pub struct HitBatcher {
    tx: mpsc::Sender<BatchMsg>,
}

impl HitBatcher {
    pub fn spawn(store: Arc<dyn MetaStore>, shutdown: broadcast::Receiver<()>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(worker(store, rx, shutdown));
        Self { tx }
    }

    /// Queue a hit increment. The handle resolves once the batch flushes.
    pub fn increment_hit(&self, key: String, window: Duration) -> HitCountHandle {
        let (reply, handle) = oneshot::channel();
        if self
            .tx
            .try_send(BatchMsg::Hit { key, window, reply })
            .is_err()
        {
            debug!("Hit batcher queue full, dropping increment");
        }
        handle
    }

    pub fn increment_sweep_hit(&self, key: String, window: Duration) {
        if self
            .tx
            .try_send(BatchMsg::SweepHit { key, window })
            .is_err()
        {
            debug!("Hit batcher queue full, dropping sweep increment");
        }
    }

    /// Force a flush and wait for it; used by the sweeper so sweep-hit
    /// counts reflect just-served queries.
    pub async fn flush(&self) {
        let (done, ack) = oneshot::channel();
        if self.tx.send(BatchMsg::Flush { done }).await.is_ok() {
            let _ = ack.await;
        }
    }
}

struct PendingHit {
    count: u64,
    window: Duration,
    replies: Vec<oneshot::Sender<u64>>,
}

async fn worker(
    store: Arc<dyn MetaStore>,
    mut rx: mpsc::Receiver<BatchMsg>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut hits: HashMap<String, PendingHit> = HashMap::new();
    let mut sweeps: HashMap<String, (u64, Duration)> = HashMap::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(BatchMsg::Hit { key, window, reply }) => {
                        let pending = hits.entry(key).or_insert_with(|| PendingHit {
                            count: 0,
                            window,
                            replies: Vec::new(),
                        });
                        pending.count += 1;
                        pending.window = window;
                        pending.replies.push(reply);
                    }
                    Some(BatchMsg::SweepHit { key, window }) => {
                        let pending = sweeps.entry(key).or_insert((0, window));
                        pending.0 += 1;
                        pending.1 = window;
                    }
                    Some(BatchMsg::Flush { done }) => {
                        flush(&store, &mut hits, &mut sweeps).await;
                        let _ = done.send(());
                        continue;
                    }
                    None => {
                        flush(&store, &mut hits, &mut sweeps).await;
                        break;
                    }
                }
                if hits.len() + sweeps.len() >= FLUSH_KEY_THRESHOLD {
                    flush(&store, &mut hits, &mut sweeps).await;
                }
            }
            _ = ticker.tick() => {
                flush(&store, &mut hits, &mut sweeps).await;
            }
            _ = shutdown.recv() => {
                flush(&store, &mut hits, &mut sweeps).await;
                debug!("Hit batcher stopped");
                break;
            }
        }
    }
}

async fn flush(
    store: &Arc<dyn MetaStore>,
    hits: &mut HashMap<String, PendingHit>,
    sweeps: &mut HashMap<String, (u64, Duration)>,
) {
    if hits.is_empty() && sweeps.is_empty() {
        return;
    }

    let mut hit_entries: Vec<(HitFlush, Vec<oneshot::Sender<u64>>)> = hits
        .drain()
        .map(|(key, pending)| {
            (
                HitFlush {
                    key,
                    count: pending.count,
                    window: pending.window,
                },
                pending.replies,
            )
        })
        .collect();
    let sweep_entries: Vec<HitFlush> = sweeps
        .drain()
        .map(|(key, (count, window))| HitFlush { key, count, window })
        .collect();

    let flushes: Vec<HitFlush> = hit_entries.iter().map(|(f, _)| f.clone()).collect();

    let result = tokio::time::timeout(
        FLUSH_TIMEOUT,
        store.flush_hits(&flushes, &sweep_entries),
    )
    .await;

    match result {
        Ok(Ok(counts)) => {
            for (i, (_, replies)) in hit_entries.iter_mut().enumerate() {
                let count = counts.get(i).copied().unwrap_or(0);
                for reply in replies.drain(..) {
                    let _ = reply.send(count);
                }
            }
        }
        Ok(Err(err)) => {
            warn!("Hit batch flush failed: {}", err);
            close_with_zero(hit_entries);
        }
        Err(_) => {
            warn!("Hit batch flush timed out");
            close_with_zero(hit_entries);
        }
    }
}

fn close_with_zero(entries: Vec<(HitFlush, Vec<oneshot::Sender<u64>>)>) {
    for (_, replies) in entries {
        for reply in replies {
            let _ = reply.send(0);
        }
    }
}
