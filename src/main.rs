use std::sync::Arc;

use scrape_pool::config::AppConfig;
use scrape_pool::proxy::ProxyPool;
use scrape_pool::queue::RedisQueue;
use scrape_pool::session::{
    CommandMinter, LibSqlSessionStore, SessionPool, SessionProducer, SessionStore, spawn_janitor,
};
use scrape_pool::session::producer::spawn_refill_listener;
use scrape_pool::worker::{DispatchWorker, HttpEngineFactory, WorkerDeps};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("scrape-pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Redis: {}", config.redis_url);
    eprintln!("   Queue: {}", config.worker.queue_name);
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Regions: {}", config.producer.regions.join(", "));
    eprintln!(
        "   Engine restart policy: {} jobs OR {} minutes",
        config.worker.max_jobs_per_engine,
        config.worker.max_engine_age.as_secs() / 60
    );

    // ── Storage ─────────────────────────────────────────────────────────
    let store: Arc<dyn SessionStore> = Arc::new(
        LibSqlSessionStore::new_local(std::path::Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );

    // ── Proxy pool ──────────────────────────────────────────────────────
    let proxies = Arc::new(ProxyPool::from_list(&config.proxies, config.proxy.clone()));
    if proxies.is_empty() {
        eprintln!("   Proxies: none (direct egress)");
    } else {
        eprintln!("   Proxies: {} configured", proxies.len());
    }

    // ── Session pool ────────────────────────────────────────────────────
    let pool = Arc::new(SessionPool::new(Arc::clone(&store), config.pool.clone()));

    // ── Session producer ────────────────────────────────────────────────
    if let Some(ref minter_cmd) = config.minter_cmd {
        eprintln!("   Minter: {minter_cmd}");

        let minter = Arc::new(CommandMinter::new(minter_cmd.clone()));
        let producer = Arc::new(SessionProducer::new(
            Arc::clone(&store),
            minter,
            Some(Arc::clone(&proxies)),
            config.producer.clone(),
        ));

        // Low-watermark refill signals flow through a bounded channel so the
        // request path never blocks on minting; a saturated channel is logged
        // by the pool and the signal dropped.
        let (refill_tx, refill_rx) = tokio::sync::mpsc::channel::<Option<String>>(16);
        pool.register_refill_callback(Box::new(move |region| {
            refill_tx
                .try_send(region.map(str::to_string))
                .map_err(|e| anyhow::anyhow!("refill channel: {e}"))
        }));
        let _refill_handle = spawn_refill_listener(Arc::clone(&producer), refill_rx);

        // Periodic full refill, independent of the worker's lifecycle
        let periodic = Arc::clone(&producer);
        tokio::spawn(async move { periodic.run_forever().await });
    } else {
        eprintln!("   Minter: disabled (set SCRAPE_MINTER_CMD to enable refills)");
    }

    // ── Janitor ─────────────────────────────────────────────────────────
    let _janitor_handle = spawn_janitor(
        Arc::clone(&pool),
        Arc::clone(&store),
        config.janitor.interval,
        config.janitor.retention,
    );

    // ── Queue + worker ──────────────────────────────────────────────────
    let queue = Arc::new(
        RedisQueue::connect(&config.redis_url, &config.worker.queue_name)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to connect to Redis at {}: {}", config.redis_url, e);
                std::process::exit(1);
            }),
    );

    let engines = Arc::new(HttpEngineFactory::new(config.worker.item_timeout));

    let worker = DispatchWorker::new(
        config.worker.clone(),
        WorkerDeps {
            queue,
            sessions: pool,
            proxies,
            engines,
        },
    );

    eprintln!("   Worker: {}\n", worker.worker_id());

    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
