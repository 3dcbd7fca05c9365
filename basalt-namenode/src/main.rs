mod api;
mod balancer;
mod config;
mod ha;
mod manager;
mod monitor;
mod oplog;
mod replicator;
mod store;

use api::NodeContext;
use balancer::Balancer;
use basalt_core::settings::load_config;
use clap::Parser;
use config::NameNodeConfig;
use ha::HaController;
use manager::Manager;
use monitor::Monitor;
use oplog::OpLog;
use replicator::Replicator;
use std::sync::{Arc, Mutex};
use store::MetadataStore;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "basalt-namenode")]
#[command(about = "Basalt metadata service")]
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
    let cfg: NameNodeConfig = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(cfg).await {
        tracing::error!("namenode error: {err}");
        std::process::exit(1);
    }
}

async fn run(cfg: NameNodeConfig) -> basalt_core::Result<()> {
    let store = MetadataStore::open(&cfg.metadata_db_path)?;
    let manager = Manager::new(store, cfg.settings.clone());
    let oplog = Arc::new(Mutex::new(OpLog::open(&cfg.oplog_path)?));

    let ha = HaController::new(
        cfg.node_id.clone(),
        cfg.effective_endpoint(),
        cfg.peer_endpoint.clone(),
        manager.clone(),
        oplog,
        cfg.settings.clone(),
    )?;

    let (repl_tx, repl_rx) = replicator::queue();

    let replicator = Replicator::new(manager.clone(), ha.clone(), repl_tx.clone());
    tokio::spawn(replicator.run(repl_rx));

    let monitor = Monitor::new(
        manager.clone(),
        ha.clone(),
        repl_tx.clone(),
        cfg.retire_after_secs,
    );
    tokio::spawn(monitor.run());

    let balancer = Balancer::new(
        manager.clone(),
        ha.clone(),
        repl_tx.clone(),
        cfg.balance_threshold,
        cfg.balance_interval_secs,
    );
    tokio::spawn(balancer.run());

    tokio::spawn(ha.clone().election_loop());
    tokio::spawn(ha.clone().leader_loop());

    let ctx = Arc::new(NodeContext {
        manager,
        ha: ha.clone(),
        repl_tx,
        client: reqwest::Client::new(),
    });

    let bind_addr = format!("{}:{}", cfg.host, cfg.port);
    let app = api::router(ctx);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(
        "namenode {} ({}) listening on {}",
        cfg.node_id,
        ha.role().as_str(),
        bind_addr
    );
    axum::serve(listener, app).await?;

    Ok(())
}
