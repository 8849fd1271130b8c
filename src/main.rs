use std::path::PathBuf;
use anyhow::Context;
use clap::Parser;
use leech::{CommandToTorrent, Config, MetaInfo, Torrent};

#[derive(Parser)]
#[command(about = "A leech-only BitTorrent client")]
struct Args {

    /// Path to the .torrent file.
    torrent: PathBuf,

    /// Directory to download into.
    #[arg(default_value = "downloads")]
    download_dir: PathBuf,

    /// Port reported to trackers.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Send a literal event=empty on interval announces.
    #[arg(long)]
    announce_empty_event: bool,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,

}

#[tokio::main]
async fn main() -> anyhow::Result<()> {

    let args = Args::parse();

    // Set up logging.
    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let sub = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(sub).context("failed to set up logging")?;

    let metainfo = MetaInfo::new(&args.torrent)
        .with_context(|| format!("failed to parse torrent file {:?}", args.torrent))?;
    println!("name:      {}", metainfo.name());
    println!("size:      {}", metainfo.size_fmt());
    println!("pieces:    {}", metainfo.num_pieces());
    println!("info hash: {}", metainfo.info_hash_hex());
    println!("tracker:   {}", metainfo.announce);
    if let Some(date) = metainfo.creation_date_fmt() {
        println!("created:   {}", date);
    }

    let config = Config {
        port: args.port,
        output_dir: args.download_dir,
        announce_empty_event: args.announce_empty_event,
        ..Config::default()
    };
    let mut torrent = Torrent::new(metainfo, config).context("failed to start torrent")?;

    // SIGINT and SIGTERM trigger a graceful shutdown.
    let torrent_tx = torrent.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        eprintln!("shutdown signal received, stopping...");
        torrent_tx.send(CommandToTorrent::Shutdown).ok();
    });

    torrent.start().await?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!("failed to install SIGTERM handler: {}", e);
            tokio::signal::ctrl_c().await.ok();
            return;
        },
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
