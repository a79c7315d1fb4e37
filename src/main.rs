//! Gateway process entry point. Wires the dispatcher, session buffer/queue, adapters, the
//! llbot registry, and the scheduled-push scheduler from a `GatewayConfig` loaded entirely
//! from the environment (spec §6: no CLI flags are part of the core). Daemonization, PID
//! files, and an OpenTelemetry exporter are deliberately not part of this binary (spec §1
//! lists thin CLIs, graceful-shutdown plumbing, and telemetry export as external).

use anyhow::Context as _;
use llbot_gateway::adapter::discord::DiscordAdapter;
use llbot_gateway::adapter::milky::MilkyAdapter;
use llbot_gateway::adapter::{AdapterPool, MultiAdapter};
use llbot_gateway::buffer::SessionBuffer;
use llbot_gateway::config::GatewayConfig;
use llbot_gateway::dedup::BotMessageStore;
use llbot_gateway::dispatcher::MessageDispatcher;
use llbot_gateway::echo::EchoTracker;
use llbot_gateway::kv::{KvStore, MemoryKvStore, RedisKvStore};
use llbot_gateway::queue::SessionQueue;
use llbot_gateway::registry::LlbotRegistry;
use llbot_gateway::scheduler::GroupHotPushScheduler;
use llbot_gateway::session::SessionRepository;
use llbot_gateway::store::{GroupStore, RouterStore};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr as _;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const REGISTRY_PREFIX: &str = "llbot";

#[tokio::main]
async fn main() {
    init_tracing();

    // tokio-tungstenite's rustls backend needs a process-wide crypto provider installed
    // before the first `wss://` connect (milky adapters may point at either scheme).
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal error during startup");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run() -> anyhow::Result<()> {
    let config = Arc::new(GatewayConfig::load().context("failed to load gateway configuration")?);
    tracing::info!(data_dir = %config.data_dir.display(), "starting llbot gateway");

    let kv: Arc<dyn KvStore> = match &config.kv_url {
        Some(url) => {
            tracing::info!("connecting to distributed kv store");
            Arc::new(RedisKvStore::connect(url).await.context("failed to connect to kv store")?)
        }
        None => {
            tracing::warn!("LLBOT_KV_URL not set, using in-process kv store (no cross-replica coordination)");
            MemoryKvStore::new()
        }
    };

    let queue_pool = connect_sqlite(&config.queue_db_path).await?;

    let queue = Arc::new(SessionQueue::new(queue_pool.clone()));
    queue.initialize().await.context("failed to initialize session queue schema")?;

    let session_repo = Arc::new(SessionRepository::new(queue_pool));
    session_repo.initialize().await.context("failed to initialize session schema")?;

    let router_store = Arc::new(RouterStore::new(config.router_dir(), config.snapshot_cache_ttl));
    router_store.ensure_global_config().await.context("failed to initialize router store")?;
    let group_store = Arc::new(GroupStore::new(config.groups_dir(), config.snapshot_cache_ttl));
    let _group_watcher = group_store.watch().context("failed to start group config watcher")?;

    let buffer = Arc::new(SessionBuffer::new(kv.clone(), config.gate_ttl));
    let echo = Arc::new(EchoTracker::new(kv.clone(), config.echo_streak_ttl));
    // Exposed for adapter implementations that want self-message / reply-redelivery
    // dedup (spec §2 `EchoTrackerStore + BotMessageStore`); not required by any adapter
    // shipped here since both already track their own bot user id directly.
    let _dedup = BotMessageStore::new(kv.clone(), config.echo_streak_ttl);

    let adapters = Arc::new(MultiAdapter::new());
    let mut registry_handle = None;

    if let Some(token) = &config.discord_token {
        tracing::info!("registering discord adapter");
        adapters.register_arc(DiscordAdapter::new(token.clone()));
    }

    match &config.milky_ws_url {
        Some(ws_url) => {
            tracing::info!(ws_url, "registering fixed milky adapter");
            adapters.register_arc(MilkyAdapter::new(ws_url.clone()));
        }
        None => {
            tracing::info!("no fixed milky ws url configured, reconciling milky bots from the llbot registry");
            let pool = AdapterPool::new("qq", Arc::new(|entry| MilkyAdapter::new(entry.ws_url.clone()) as _));
            adapters.register_arc(pool.clone());

            let registry = LlbotRegistry::new(kv.clone(), REGISTRY_PREFIX, config.registry_poll_interval);
            let (tx, rx) = watch::channel(std::collections::HashMap::new());
            let registry_task = tokio::spawn(async move {
                if let Err(err) = registry.run(tx).await {
                    tracing::error!(error = %err, "llbot registry polling stopped");
                }
            });
            let pool_for_reconcile = pool.clone();
            let reconcile_task = tokio::spawn(async move { pool_for_reconcile.run(rx).await });
            registry_handle = Some((registry_task, reconcile_task));
        }
    }

    let dispatcher = Arc::new(MessageDispatcher::new(
        config.clone(),
        router_store,
        group_store.clone(),
        session_repo,
        buffer,
        queue,
        echo,
        adapters.clone(),
        kv.clone(),
    ));

    let dispatch_handler: llbot_gateway::adapter::OnEvent = {
        let dispatcher = dispatcher.clone();
        Arc::new(move |event| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(event).await });
        })
    };
    adapters.on_event(dispatch_handler).await;

    adapters.connect_all().await.context("no adapter was able to connect")?;

    let push_scheduler = GroupHotPushScheduler::new(
        group_store,
        kv,
        dispatcher,
        config.push_tick_interval,
        config.default_timezone.clone(),
    );
    let push_task = tokio::spawn(async move { push_scheduler.run().await });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received, disconnecting adapters");

    // Two-phase shutdown (spec §5): stop accepting new events, then close the
    // remaining clients, all under a hard deadline.
    let shutdown = async {
        adapters.disconnect_all().await;
        push_task.abort();
        if let Some((registry_task, reconcile_task)) = registry_handle {
            registry_task.abort();
            reconcile_task.abort();
        }
    };
    if tokio::time::timeout(config.shutdown_grace, shutdown).await.is_err() {
        tracing::warn!("graceful shutdown deadline exceeded, forcing exit");
    }

    Ok(())
}

async fn connect_sqlite(path: &std::path::Path) -> anyhow::Result<sqlx::SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory for {}", path.display()))?;
    }
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .with_context(|| format!("invalid sqlite path {}", path.display()))?
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))
}
