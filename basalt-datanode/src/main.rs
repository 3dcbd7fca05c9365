mod agent;
mod block_store;
mod config;
mod service;

use agent::NameNodeHandle;
use basalt_core::settings::load_config;
use block_store::BlockStore;
use clap::Parser;
use config::DataNodeConfig;
use service::DataNodeState;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "basalt-datanode")]
#[command(about = "Basalt storage node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "basalt=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg: DataNodeConfig = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(cfg).await {
        tracing::error!("datanode error: {err}");
        std::process::exit(1);
    }
}

async fn run(cfg: DataNodeConfig) -> basalt_core::Result<()> {
    let store = BlockStore::open(&cfg.storage_root, cfg.reserved_bytes)?;
    tracing::info!(
        "block store at {:?} with {} blocks",
        store.root(),
        store.blocks_stored()
    );

    let namenode = Arc::new(NameNodeHandle::new(
        cfg.namenode_endpoints.clone(),
        Duration::from_secs(cfg.settings.rpc_timeout_secs),
    ));

    // Keep retrying registration until a namenode answers.
    let node_id = loop {
        match agent::register(&cfg, &namenode).await {
            Ok(node_id) => break node_id,
            Err(err) => {
                tracing::warn!("registration failed, retrying: {err}");
                tokio::time::sleep(Duration::from_secs(cfg.settings.heartbeat_interval_secs))
                    .await;
            }
        }
    };

    let state = Arc::new(DataNodeState::new(
        store,
        node_id,
        namenode,
        cfg.settings.clone(),
    ));

    if let Err(err) = agent::send_block_report(&state).await {
        tracing::warn!("initial block report failed: {err}");
    }

    tokio::spawn(agent::heartbeat_loop(state.clone(), cfg.clone()));

    let bind_addr = format!("{}:{}", cfg.hostname, cfg.port);
    let app = service::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("datanode {} listening on {}", node_id, bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
