//! peershare - Main entry point
//!
//! Loads the torrent metainfo, opens the piece store, then runs the
//! peer wire listener and the DHT node side by side. Discovered peers
//! are dialed as they surface; completion triggers a DHT announce and
//! publishes the file into the shared directory.

use anyhow::{Context, Result};
use peershare::peer::Bitfield;
use peershare::protocol::Handshake;
use peershare::{CliArgs, Config, DhtNode, PieceStore, SessionManager, TorrentMetadata};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("peershare starting");
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Invalid configuration")?;

    // Metadata failure is fatal; everything downstream depends on it
    let metadata = Arc::new(
        TorrentMetadata::load(&config.torrent_file).context("Failed to load torrent file")?,
    );
    println!("{}", metadata.summary());

    let store = Arc::new(
        PieceStore::create(&config.work_dir, metadata.clone())
            .await
            .context("Failed to open piece store")?,
    );

    let our_peer_id = Handshake::generate_peer_id();
    let manager = SessionManager::new(
        store.clone(),
        our_peer_id,
        config.max_connections,
        config.idle_timeout,
    );

    // Socket binds are the other fatal startup errors
    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("Failed to bind peer listener on {}", config.listen_addr()))?;
    tokio::spawn(manager.clone().listen(listener));

    let (discovered_tx, mut discovered_rx) = mpsc::unbounded_channel();
    let dht = DhtNode::bind(
        config.dht_addr().parse().context("Invalid DHT bind address")?,
        metadata.info_hash,
        config.port,
        discovered_tx,
    )
    .await
    .context("Failed to start DHT node")?;
    tokio::spawn(dht.clone().run());

    if !config.bootstrap.is_empty() {
        if let Err(e) = dht.bootstrap(&config.bootstrap).await {
            warn!("DHT bootstrap incomplete: {}", e);
        }
    }

    run_node(&config, store, manager, dht, &mut discovered_rx).await
}

/// Dial discovered peers and watch for completion. The node keeps
/// serving after the file is published.
async fn run_node(
    config: &Config,
    store: Arc<PieceStore>,
    manager: Arc<SessionManager>,
    dht: Arc<DhtNode>,
    discovered_rx: &mut mpsc::UnboundedReceiver<std::net::SocketAddr>,
) -> Result<()> {
    let mut known_pieces = Bitfield::new(store.metadata().num_pieces());
    let mut published = store.is_complete().await;
    let mut progress_tick = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            discovered = discovered_rx.recv() => {
                match discovered {
                    Some(addr) => {
                        debug!("Discovered peer {}", addr);
                        manager.dial(addr).await;
                    }
                    None => {
                        warn!("DHT discovery channel closed");
                        break;
                    }
                }
            }
            _ = progress_tick.tick() => {
                // Relay freshly verified pieces to every session
                let current = store.bitfield().await;
                for piece in 0..current.num_pieces() {
                    if current.has(piece) && !known_pieces.has(piece) {
                        known_pieces.set(piece);
                        manager.broadcast_have(piece as u32);
                    }
                }

                if !published && store.is_complete().await {
                    info!("Download complete ({:.0}%)", store.progress().await * 100.0);
                    if let Err(e) = dht.announce().await {
                        warn!("DHT announce failed: {}", e);
                    }
                    match store.finalize(&config.shared_dir).await {
                        Ok(path) => info!("Published {}", path.display()),
                        Err(e) => error!("Failed to publish file: {}", e),
                    }
                    published = true;
                } else if !published {
                    debug!(
                        "Progress: {:.1}% across {} sessions",
                        store.progress().await * 100.0,
                        manager.session_count().await
                    );
                }
            }
        }
    }

    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}
