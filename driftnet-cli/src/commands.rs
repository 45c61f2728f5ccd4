//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use driftnet_core::config::DriftnetConfig;
use driftnet_core::storage::FileStorage;
use driftnet_core::torrent::{
    AnnounceEvent, BencodeTorrentParser, PeerId, PieceStore, SwarmCoordinator, TorrentMetadata,
    TorrentParser, TrackerClient, TrackerManager,
};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a torrent into a directory, resuming earlier progress
    Download {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Directory the payload is written to
        output_dir: PathBuf,
        /// Port to accept peer connections on
        #[arg(short, long)]
        port: Option<u16>,
        /// Maximum concurrent peer connections
        #[arg(long)]
        max_peers: Option<usize>,
        /// Maximum peers uploaded to at once
        #[arg(long)]
        max_unchoked: Option<usize>,
        /// Keep serving pieces after the download completes
        #[arg(long)]
        seed: bool,
    },
    /// Show metadata of a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of whichever command failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Download {
            torrent,
            output_dir,
            port,
            max_peers,
            max_unchoked,
            seed,
        } => {
            let mut config = DriftnetConfig::from_env();
            if let Some(port) = port {
                config.network.listen_port = port;
            }
            if let Some(max_peers) = max_peers {
                config.network.max_peer_connections = max_peers;
            }
            if let Some(max_unchoked) = max_unchoked {
                config.network.max_unchoked_peers = max_unchoked;
            }
            download(config, &torrent, &output_dir, seed).await
        }
        Commands::Info { torrent } => show_info(&torrent).await,
    }
}

async fn load_metadata(torrent: &Path) -> anyhow::Result<TorrentMetadata> {
    BencodeTorrentParser::new()
        .parse_torrent_file(torrent)
        .await
        .with_context(|| format!("Failed to read torrent {}", torrent.display()))
}

/// Print torrent metadata
///
/// # Errors
/// - Torrent file missing or malformed
pub async fn show_info(torrent: &Path) -> anyhow::Result<()> {
    let metadata = load_metadata(torrent).await?;

    println!("Name:         {}", metadata.name);
    println!("Info hash:    {}", metadata.info_hash);
    println!("Size:         {} bytes", metadata.total_length);
    println!(
        "Pieces:       {} x {} bytes",
        metadata.piece_count(),
        metadata.piece_length
    );
    println!("Trackers:");
    for url in &metadata.announce_urls {
        println!("  {url}");
    }
    Ok(())
}

/// Download a torrent, optionally seeding afterwards
///
/// Ctrl-C persists progress and tells the tracker we stopped.
///
/// # Errors
/// - Torrent file missing or malformed
/// - Output directory or data file cannot be created
/// - No usable tracker
pub async fn download(
    config: DriftnetConfig,
    torrent: &Path,
    output_dir: &Path,
    seed: bool,
) -> anyhow::Result<()> {
    let metadata = load_metadata(torrent).await?;
    println!(
        "Downloading {} ({} bytes, {} pieces) into {}",
        metadata.name,
        metadata.total_length,
        metadata.piece_count(),
        output_dir.display()
    );

    let storage = FileStorage::open(
        output_dir,
        &metadata.name,
        metadata.layout(),
        metadata.piece_hashes.clone(),
        config.storage.metadata_suffix,
    )
    .await
    .context("Failed to open download storage")?;
    let store = PieceStore::open(
        metadata.layout(),
        Arc::new(storage),
        config.torrent.request_queue_size,
    )
    .await?;

    let tracker: Arc<dyn TrackerClient> = Arc::new(
        TrackerManager::new(&metadata.announce_urls, &config.network)
            .context("Torrent has no usable HTTP tracker")?,
    );
    let peer_id = PeerId::generate_with_prefix(&client_prefix(&config));
    let listen_port = config.network.listen_port;
    let default_interval = config.network.default_announce_interval;
    let swarm = Arc::new(SwarmCoordinator::new(
        config,
        metadata,
        Arc::new(store),
        peer_id,
    ));

    if let Err(e) = swarm.listen(listen_port).await {
        tracing::warn!("Not accepting inbound peers: {}", e);
    }

    let interval = match swarm.announce(tracker.as_ref(), Some(AnnounceEvent::Started)).await {
        Ok(response) => {
            println!(
                "Tracker returned {} peers ({} seeders, {} leechers)",
                response.peers.len(),
                response.complete,
                response.incomplete
            );
            if !swarm.store().is_complete() {
                swarm.start_outgoing(response.peers).await;
            }
            Duration::from_secs(response.interval as u64)
        }
        Err(e) => {
            tracing::warn!("Initial announce failed: {}", e);
            default_interval
        }
    };

    let announcer = {
        let swarm = Arc::clone(&swarm);
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move { swarm.run_announce_loop(tracker, interval).await })
    };

    let mut report = tokio::time::interval(Duration::from_secs(5));
    let mut finished = swarm.store().is_complete();
    if finished {
        println!("All pieces already present");
    }

    while seed || !finished {
        tokio::select! {
            _ = swarm.wait_for_download(), if !finished => {
                finished = true;
                println!("Download complete: {}", swarm.metadata().name);
                if seed {
                    println!("Seeding, press Ctrl-C to stop");
                }
            }
            _ = report.tick() => print_progress(&swarm),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                println!("Stopping download...");
                break;
            }
        }
    }

    swarm.shutdown().await?;
    if let Err(e) = announcer.await {
        tracing::warn!("Announce task failed: {}", e);
    }
    if let Err(e) = swarm
        .announce(tracker.as_ref(), Some(AnnounceEvent::Stopped))
        .await
    {
        tracing::warn!("Stopped announce failed: {}", e);
    }

    print_progress(&swarm);
    Ok(())
}

fn client_prefix(config: &DriftnetConfig) -> [u8; 8] {
    let mut prefix = *b"-DN0001-";
    let id = config.torrent.client_id.as_bytes();
    let len = id.len().min(prefix.len());
    prefix[..len].copy_from_slice(&id[..len]);
    prefix
}

fn print_progress(swarm: &SwarmCoordinator) {
    let progress = swarm.progress();
    let total = swarm.metadata().total_length.max(1);
    println!(
        "{:>5.1}%  {}/{} pieces, {} peers, {} bytes uploaded",
        progress.downloaded as f64 * 100.0 / total as f64,
        swarm.store().local_bitfield().count_ones(),
        swarm.store().piece_count(),
        swarm.store().connection_count(),
        progress.uploaded
    );
}
