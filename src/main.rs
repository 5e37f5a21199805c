//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This is the main entry point for the order relay.
// It loads configuration, starts the relay pipeline and the API server, and runs until Ctrl-C or
// until the change source fails.
//--------------------------------------------------------------------------------------------------

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};

use order_relay::domain::services::change_source::CheckpointStore;
use order_relay::{
    Api, AppState, Config, FileCheckpointStore, MemoryChangeFeed, MemoryCheckpointStore, Relay,
    StaticTokenAuthenticator,
};

/// Real-time order change relay
#[derive(Debug, Parser)]
#[command(name = "order-relay", version, about)]
struct Cli {
    /// Address to listen on (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Checkpoint file (overrides CHECKPOINT_PATH)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Log level (overrides LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// Commit sample orders to the in-process feed
    #[arg(long)]
    demo: bool,

    /// Milliseconds between demo orders
    #[arg(long, default_value_t = 2000)]
    demo_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::try_from_env().context("invalid configuration")?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(path) = cli.checkpoint {
        config.checkpoint_path = Some(path);
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    // Initialize logging
    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting order relay");

    let tokens = StaticTokenAuthenticator::parse(&config.auth_tokens).context("invalid AUTH_TOKENS")?;
    if tokens.is_empty() {
        warn!("No AUTH_TOKENS configured; every stream request will be rejected");
    }

    let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint_path {
        Some(path) => {
            info!("Checkpoints will be stored in {}", path.display());
            // the in-process feed keeps no history across runs
            warn!(
                "The in-process feed starts empty; a checkpoint saved by an earlier run in {} \
                 will be rejected as not in feed history. Remove it to start over.",
                path.display()
            );
            Arc::new(FileCheckpointStore::new(path))
        }
        None => {
            warn!("No CHECKPOINT_PATH configured; resume points are kept in memory only");
            Arc::new(MemoryCheckpointStore::new())
        }
    };

    let shutdown = CancellationToken::new();
    let feed = MemoryChangeFeed::new();
    let relay = Relay::start(&config, Arc::new(feed.clone()), checkpoints, shutdown.clone())
        .await
        .context("failed to start the relay")?;

    if cli.demo {
        tokio::spawn(run_demo(feed, Duration::from_millis(cli.demo_interval_ms), shutdown.clone()));
    }

    let state = Arc::new(AppState::with_static_tokens(Arc::clone(relay.delivery()), tokens));
    let api = Api::new(config.bind_addr, state);
    let server = tokio::spawn(api.serve(shutdown.clone()));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        ctrl_c.cancel();
    });

    let result = relay.wait().await;
    shutdown.cancel();
    server.await.context("API server task failed")??;

    let checkpoint = result.context("change source failed")?;
    info!("Order relay stopped at event {}", checkpoint.last_event_id);
    Ok(())
}

/// Commits a stream of sample orders to the in-process feed.
async fn run_demo(feed: MemoryChangeFeed, interval: Duration, shutdown: CancellationToken) {
    const RESTAURANTS: [&str; 3] = ["r-1", "r-2", "r-3"];
    const STATUSES: [&str; 3] = ["accepted", "preparing", "ready"];

    info!("Demo mode: committing an order every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    let mut orders: Vec<(String, &str)> = Vec::new();
    let mut next_order = 1u64;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let mut rng = rand::thread_rng();
                if orders.is_empty() || rng.gen_bool(0.5) {
                    let order_id = format!("demo-{}", next_order);
                    next_order += 1;
                    let restaurant = RESTAURANTS[rng.gen_range(0..RESTAURANTS.len())];
                    feed.commit_insert(&order_id, json!({
                        "_id": order_id,
                        "restaurantId": restaurant,
                        "status": "pending",
                        "total": rng.gen_range(500..5000),
                    }));
                    orders.push((order_id, restaurant));
                } else {
                    let (order_id, restaurant) = &orders[rng.gen_range(0..orders.len())];
                    let status = STATUSES[rng.gen_range(0..STATUSES.len())];
                    feed.commit_update(order_id, json!({
                        "_id": order_id,
                        "restaurantId": restaurant,
                        "status": status,
                    }));
                }
            }
        }
    }
}
