use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warden::blocking::{self, BlockFilter};
use warden::cache::{CacheLayer, HitBatcher, LocalCache, MetaStore, RedisStore};
use warden::clients::ClientDirectory;
use warden::config::Config;
use warden::dns::TtlPolicy;
use warden::events::{EventSink, TracingEventStore};
use warden::local_records::LocalRecords;
use warden::refresh::sweeper::{SweepConfig, Sweeper};
use warden::refresh::{RefreshEngine, RefreshTuning};
use warden::resolver::Resolver;
use warden::safe_search::SafeSearch;
use warden::server::Server;
use warden::servfail::ServfailTracker;
use warden::upstream::UpstreamManager;
use warden::webhook::WebhookNotifier;

/// Ad-blocking forwarding DNS resolver with a two-tier answer cache.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Args {
    /// Validate configuration and exit
    #[arg(long)]
    config_check: bool,

    /// Log filter override (e.g. "warden=debug")
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(override_level: Option<&str>) {
    let filter = match override_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Configuration error: {}", err);
            std::process::exit(1);
        }
    };

    if args.config_check {
        info!("Configuration OK");
        return;
    }

    if let Err(err) = run(config).await {
        error!("Fatal: {}", err);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> warden::Result<()> {
    let (shutdown_tx, _) = broadcast::channel(8);

    // L1 is optional; when configured, an unreachable endpoint at boot is
    // fatal. Runtime failures degrade to upstream instead.
    let store: Option<Arc<dyn MetaStore>> = match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url, config.redis_cluster_mode).await?;
            store.ping().await?;
            Some(Arc::new(store))
        }
        None => {
            warn!("No Redis endpoint configured; running with the in-process cache only");
            None
        }
    };

    let local = LocalCache::with_shards(config.l0_max_entries, config.l0_shards);
    let cache = Arc::new(CacheLayer::new(
        local,
        store.clone(),
        config.serve_stale,
        config.stale_ttl,
    ));

    let batcher = store
        .as_ref()
        .map(|store| HitBatcher::spawn(Arc::clone(store), shutdown_tx.subscribe()));

    let servfail = Arc::new(ServfailTracker::new(
        config.servfail_backoff,
        config.servfail_refresh_threshold,
        config.servfail_log_interval,
    ));

    let upstreams = Arc::new(UpstreamManager::new(
        config.upstreams.clone(),
        config.upstream_strategy,
        config.upstream_timeout,
        config.upstream_backoff,
        config.probe_pooled_connections,
    )?);

    let ttl_policy = TtlPolicy {
        respect_source_ttl: config.respect_source_ttl,
        min_ttl: config.min_ttl,
        max_ttl: config.max_ttl,
        negative_ttl: config.negative_ttl,
    };

    let refresh = Arc::new(RefreshEngine::new(
        Arc::clone(&cache),
        store.clone(),
        Arc::clone(&upstreams),
        Arc::clone(&servfail),
        batcher.clone(),
        config.max_inflight,
        ttl_policy,
        RefreshTuning {
            hot_ttl: config.hot_ttl,
            hot_threshold: config.hot_threshold,
            min_ttl: config.min_ttl,
            hit_window: config.hit_window,
            sweep_hit_window: config.sweep_hit_window,
            sample_rate: config.hit_count_sample_rate,
            lock_ttl: config.lock_ttl,
            fail_log_interval: config.refresh_fail_log_interval,
        },
    ));

    let events = Arc::new(EventSink::new(
        Arc::new(TracingEventStore),
        config.event_buffer,
        config.event_sample_rate,
        config.event_exclude_domains.clone(),
        config.event_exclude_clients.clone(),
        config.event_anonymize,
    ));

    let rules = blocking::collect_rules(&config.block_rules, &config.blocklist_files);
    let block_filter =
        BlockFilter::from_rules(rules, config.allowlist.clone(), config.denylist.clone());

    let resolver = Arc::new(Resolver::new(
        Arc::clone(&cache),
        Arc::clone(&refresh),
        Arc::clone(&servfail),
        Arc::clone(&upstreams),
        events,
        ttl_policy,
        config.expired_entry_ttl,
        block_filter,
        config.blocked_response,
        config.blocked_ttl,
        LocalRecords::from_entries(&config.local_records),
        SafeSearch::new(config.safe_search_enabled),
        ClientDirectory::from_entries(&config.clients, &config.groups),
        config
            .block_webhook_url
            .clone()
            .and_then(WebhookNotifier::new),
    ));

    // The sweeper only makes sense against the shared store.
    if let (Some(store), Some(batcher)) = (store.clone(), batcher.clone()) {
        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&refresh),
            store,
            Arc::clone(&cache),
            Arc::clone(&servfail),
            batcher,
            SweepConfig {
                interval: config.sweep_interval,
                window: config.sweep_window,
                min_hits: config.sweep_min_hits,
                max_batch_size: config.max_batch_size,
                reconcile_interval: config.reconcile_interval,
                deletion_candidates_interval: config.deletion_candidates_interval,
                max_keys: config.max_keys,
            },
        ));
        tokio::spawn(Arc::clone(&sweeper).run(shutdown_tx.subscribe()));
    }

    let server = Server::new(
        Arc::clone(&resolver),
        config.bind_addr,
        config.udp_listeners,
        config.tcp_idle_timeout,
        shutdown_tx.clone(),
    );

    let shutdown_trigger = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_trigger.send(());
        }
    });

    server.run().await?;

    // Teardown in reverse order: listeners are done, background workers saw
    // the broadcast, connection pools drain last.
    upstreams.drain().await;
    info!("Shutdown complete");
    Ok(())
}
