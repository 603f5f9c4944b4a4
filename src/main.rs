//! rsdc, an autonomous BitTorrent DHT crawler and metadata fetcher.
//!
//! Wires the three subsystems together on a current-thread runtime: the
//! sybil DHT node feeds announcements to the coordinator, which fans out
//! metadata fetchers and commits results to the torrent index.
use anyhow::{Context, Result};
use clap::Parser;
use rs_dht_crawler::coordinator::Coordinator;
use rs_dht_crawler::dht::SybilNode;
use rs_dht_crawler::persistence::TorrentStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "rsdc", version, about = "Autonomous BitTorrent DHT crawler")]
struct Cli {
    /// UDP endpoint the DHT node binds to
    #[arg(long, default_value = "0.0.0.0:0")]
    node_addr: SocketAddr,

    /// Upper bound on accepted metadata, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_METADATA_SIZE)]
    max_metadata_size: usize,

    /// Path of the torrent index [default: under the platform data dir]
    #[arg(long)]
    database_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    debug: bool,
}

fn default_database_file() -> Result<PathBuf> {
    let base = dirs::data_dir().context("no data directory on this platform")?;
    Ok(base.join("rs-dht-crawler").join("torrents.jsonl"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
    info!("rsdc v{} started", env!("CARGO_PKG_VERSION"));

    let database_file = match cli.database_file {
        Some(path) => path,
        None => default_database_file()?,
    };
    let store = TorrentStore::open(&database_file).context("could not open the torrent index")?;

    let (announcement_tx, announcement_rx) = mpsc::channel(1024);
    let node = SybilNode::bind(cli.node_addr, announcement_tx).await?;
    let node_task = tokio::spawn(node.run());

    let coordinator = Coordinator::new(store, cli.max_metadata_size);
    coordinator
        .run(announcement_rx, async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received, exiting gracefully"),
                Err(err) => error!("could not listen for interrupts: {err}"),
            }
        })
        .await
        .context("could not flush the torrent index")?;

    // Either we got here via ctrl-c (abort the node) or the node already
    // died and closed the announcement stream (surface why, nonzero exit).
    node_task.abort();
    match node_task.await {
        Ok(result) => result?,
        Err(err) if err.is_cancelled() => {}
        Err(err) => return Err(err).context("DHT node task panicked"),
    }
    Ok(())
}
