use basalt_client::{
    DataNodeClient, GetFileOperation, GetFileOperationRequest, NameNodeClient, PutFileOperation,
    PutFileOperationRequest,
};
use basalt_core::error::Result;
use basalt_core::settings::Settings;
use basalt_core::types::EntryKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "basalt")]
#[command(about = "Client for the Basalt distributed block file system")]
struct Cli {
    /// Namenode endpoint(s), leader first
    #[arg(short, long, default_value = "http://127.0.0.1:9000")]
    namenode: Vec<String>,

    /// Block size in bytes for uploads
    #[arg(long)]
    block_size: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file
    Put {
        local: PathBuf,
        remote: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Download a file
    Get { remote: String, local: PathBuf },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Remove a directory
    Rmdir {
        path: String,
        #[arg(long)]
        recursive: bool,
    },
    /// Remove a file
    Rm { path: String },
    /// Show file metadata, blocks and replica locations
    Info { path: String },
    /// Show cluster health
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "basalt=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::default();
    if let Some(block_size) = cli.block_size {
        settings.block_size = block_size;
    }

    let namenode = Arc::new(NameNodeClient::new(
        cli.namenode.clone(),
        Duration::from_secs(settings.rpc_timeout_secs),
    ));
    let datanodes = Arc::new(DataNodeClient::new(settings.clone()));

    if let Err(err) = run(cli.command, namenode, datanodes, settings).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(
    command: Commands,
    namenode: Arc<NameNodeClient>,
    datanodes: Arc<DataNodeClient>,
    settings: Settings,
) -> Result<()> {
    match command {
        Commands::Put {
            local,
            remote,
            owner,
        } => {
            let op = PutFileOperation::new(namenode, datanodes, settings);
            let result = op
                .run(PutFileOperationRequest {
                    local_path: local,
                    remote_path: remote,
                    owner,
                })
                .await?;
            println!(
                "stored {} ({} bytes in {} blocks)",
                result.file.path, result.bytes, result.blocks
            );
        }
        Commands::Get { remote, local } => {
            let op = GetFileOperation::new(namenode, datanodes, settings);
            let result = op
                .run(GetFileOperationRequest {
                    remote_path: remote,
                    local_path: local.clone(),
                })
                .await?;
            println!(
                "fetched {} ({} bytes in {} blocks) to {}",
                result.file.path,
                result.bytes,
                result.blocks,
                local.display()
            );
        }
        Commands::Ls { path } => {
            let listing = namenode.list_directory(&path).await?;
            for entry in &listing.entries {
                let kind = match entry.kind {
                    EntryKind::Directory => "d",
                    EntryKind::File => "-",
                };
                println!("{kind} {:>12} {}", entry.size, entry.path);
            }
        }
        Commands::Mkdir { path } => {
            let meta = namenode.create_directory(&path, None).await?;
            println!("created {}", meta.path);
        }
        Commands::Rmdir { path, recursive } => {
            namenode.remove_directory(&path, recursive).await?;
            println!("removed {path}");
        }
        Commands::Rm { path } => {
            let file = namenode.get_file_by_path(&path).await?;
            namenode.delete_file(file.file_id).await?;
            println!("removed {}", file.path);
        }
        Commands::Info { path } => {
            let file = namenode.get_file_by_path(&path).await?;
            println!("path:     {}", file.path);
            println!("id:       {}", file.file_id);
            println!("size:     {} bytes", file.size);
            println!("owner:    {}", file.owner.as_deref().unwrap_or("-"));
            println!("created:  {}", file.created_at.to_rfc3339());
            println!("modified: {}", file.modified_at.to_rfc3339());
            let blocks = namenode.file_blocks(file.file_id).await?;
            println!("blocks:   {}", blocks.len());
            for block in blocks {
                println!(
                    "  {} {:>10} bytes{}",
                    block.block_id,
                    block.size,
                    if block.degraded { " DEGRADED" } else { "" }
                );
                for location in block.locations {
                    println!(
                        "    {} {}:{} {}{}{}",
                        location.node_id,
                        location.hostname,
                        location.port,
                        location.node_status.as_str(),
                        if location.is_leader { " leader" } else { "" },
                        if location.suspect { " suspect" } else { "" },
                    );
                }
            }
        }
        Commands::Status => {
            let status = namenode.status().await?;
            println!(
                "metadata node {} ({}, term {})",
                status.node_id, status.role, status.term
            );
            println!(
                "files: {}  blocks: {}  under-replicated: {}  over-replicated: {}  degraded: {}",
                status.files,
                status.blocks,
                status.under_replicated,
                status.over_replicated,
                status.degraded_blocks.len()
            );
            for node in &status.datanodes {
                println!(
                    "{} {}:{} {} free={}B blocks={}",
                    node.node_id,
                    node.hostname,
                    node.port,
                    node.status.as_str(),
                    node.available_space,
                    node.blocks_stored
                );
            }
            if !status.degraded_blocks.is_empty() {
                let ids: Vec<String> = status
                    .degraded_blocks
                    .iter()
                    .map(Uuid::to_string)
                    .collect();
                println!("degraded blocks: {}", ids.join(", "));
            }
        }
    }
    Ok(())
}
