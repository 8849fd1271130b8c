use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use rand::{distributions::Alphanumeric, Rng};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::Instrument;
use url::Url;
use crate::{
    fs::{self, CommandToDisk, DiskTx},
    metainfo::MetaInfo,
    p2p::{PeerCommand, PeerHandle},
    pieces::PieceStore,
    stats::{format_bytes, format_speed},
    store::StoreInfo,
    tracker::{AnnounceParams, AnnounceTx, Announcer, Event},
    ID,
};

// Fallback when the tracker does not suggest an announce interval.
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

// Floor for supplementary announces when the peer set runs low.
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

// How long the final stopped announce may hold up shutdown.
const STOPPED_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

const STATS_INTERVAL: Duration = Duration::from_secs(5);

// Peers asked of the tracker per announce.
const NUM_WANT: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("disk error: {0}")]
    Disk(#[from] fs::DiskError),

    #[error("download interrupted")]
    Interrupted,

    #[error("downloaded files failed size verification")]
    VerificationFailed,

}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Commands that can be sent to the torrent task from other tasks.
pub enum CommandToTorrent {

    // Sent by a peer task when its session reaches the active state.
    PeerConnected { address: SocketAddr },

    // Sent by a peer task when its session ends, however it ends.
    PeerDisconnected { address: SocketAddr },

    // Outcome of an announce round, possibly empty on failure.
    Announced { peers: Vec<SocketAddr>, interval: Option<Duration> },

    // Sent by the piece store when a piece is verified.
    PieceCompleted { idx: usize },

    // Sent by the disk task when a verified piece has been written out.
    PieceWritten { idx: usize },

    // Request a graceful shutdown.
    Shutdown,

}

#[derive(Debug, Clone)]
pub struct Config {

    // Unique 20-byte identifier for this client instance.
    pub client_id: ID,

    // Port reported to trackers.
    pub port: u16,

    // Directory the torrent is downloaded into.
    pub output_dir: PathBuf,

    // Cap on concurrent peer sessions.
    pub max_peers: usize,

    // Below this many active sessions a supplementary announce is triggered.
    pub min_active_peers: usize,

    // Send a literal event=empty on interval announces instead of omitting
    // the key; some trackers insist on one or the other.
    pub announce_empty_event: bool,

}

impl Default for Config {
    fn default() -> Config {
        Config {
            client_id: gen_client_id(),
            port: 6881,
            output_dir: "downloads".into(),
            max_peers: 30,
            min_active_peers: 5,
            announce_empty_event: false,
        }
    }
}

// Azureus-style peer id: client prefix plus random alphanumeric tail.
fn gen_client_id() -> ID {
    let mut id = *b"-LE0001-????????????";
    for b in id[8..].iter_mut() {
        *b = rand::thread_rng().sample(Alphanumeric);
    }
    id
}

// Read-only state shared with every peer session.
#[derive(Debug)]
pub struct TorrentContext {

    // The info hash for this torrent.
    pub info_hash: ID,

    // The id this client presents in handshakes and announces.
    pub client_id: ID,

    // Block accounting and verification.
    pub pieces: PieceStore,

    // Commands to the torrent task.
    pub torrent_tx: TorrentTx,

    // Raw bytes of block data accepted across all sessions.
    pub downloaded: AtomicU64,

    // Torrent storage information.
    pub info: StoreInfo,

}

// The engine: owns the peer set, schedules announces, reaps dead sessions
// and shuts everything down when the last piece hits the disk.
#[derive(Debug)]
pub struct Torrent {

    ctx: Arc<TorrentContext>,

    // Peers we have sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Peers we know about but have no session with.
    available: Vec<SocketAddr>,

    // Tracker URLs by tier, handed to the announcer on start.
    trackers: Vec<Vec<Url>>,

    torrent_rx: TorrentRx,

    disk_tx: DiskTx,

    // Option is for moving out of the handle behind a mutable ref.
    disk_handle: Option<JoinHandle<fs::Result<()>>>,

    announce_tx: Option<AnnounceTx>,

    announce_handle: Option<JoinHandle<()>>,

    // An announce round is in flight; at most one ever is.
    announce_pending: bool,

    // The started event has been sent.
    sent_started: bool,

    last_announce: Option<Instant>,

    announce_interval: Duration,

    // Sessions currently in the active state, shared with the reporter.
    active_peers: Arc<AtomicUsize>,

    reporter_handle: Option<JoinHandle<()>>,

    config: Config,

}

impl Torrent {

    pub fn new(metainfo: MetaInfo, config: Config) -> Result<Self> {

        let info = StoreInfo::new(&metainfo, config.output_dir.clone());
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (disk_handle, disk_tx) = fs::spawn(info.clone(), torrent_tx.clone())?;
        let pieces = PieceStore::new(&info, metainfo.piece_hashes(), disk_tx.clone(), torrent_tx.clone());

        Ok(Torrent {
            ctx: Arc::new(TorrentContext {
                info_hash: metainfo.info_hash(),
                client_id: config.client_id,
                pieces,
                torrent_tx,
                downloaded: AtomicU64::new(0),
                info,
            }),
            peers: HashMap::new(),
            available: Vec::new(),
            trackers: metainfo.trackers(),
            torrent_rx,
            disk_tx,
            disk_handle: Some(disk_handle),
            announce_tx: None,
            announce_handle: None,
            announce_pending: false,
            sent_started: false,
            last_announce: None,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            active_peers: Arc::new(AtomicUsize::new(0)),
            reporter_handle: None,
            config,
        })
    }

    // A sender for injecting commands, e.g. a shutdown from a signal handler.
    pub fn handle(&self) -> TorrentTx {
        self.ctx.torrent_tx.clone()
    }

    // Runs the torrent to completion or interruption.
    // On success all files are on disk at their declared sizes.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent");

        self.spawn_announcer();
        self.spawn_reporter();
        self.request_announce();

        let complete = self.run().await;
        self.teardown().await;

        if !complete {
            return Err(TorrentError::Interrupted);
        }
        if !fs::verify_file_integrity(&self.ctx.info) {
            return Err(TorrentError::VerificationFailed);
        }
        println!(
            "downloaded {} to {}",
            format_bytes(self.ctx.info.total_len),
            self.ctx.info.output_dir.display(),
        );
        Ok(())
    }

    // Top level torrent loop; returns whether the download completed.
    #[tracing::instrument(skip_all, name = "torrent")]
    async fn run(&mut self) -> bool {

        let mut ticker = time::interval(Duration::from_secs(1));

        loop { tokio::select! {

            Some(cmd) = self.torrent_rx.recv() => match cmd {

                CommandToTorrent::PeerConnected { address } => {
                    if let Some(peer) = self.peers.get_mut(&address) {
                        if !peer.active {
                            peer.active = true;
                            self.active_peers.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                },

                CommandToTorrent::PeerDisconnected { address } => self.reap_peer(address).await,

                CommandToTorrent::Announced { peers, interval } => {
                    self.announce_pending = false;
                    self.last_announce = Some(Instant::now());
                    if let Some(interval) = interval {
                        self.announce_interval = interval;
                    }
                    self.add_peers(peers);
                },

                CommandToTorrent::PieceCompleted { idx } => {
                    let stats = self.ctx.pieces.stats();
                    tracing::info!(
                        "piece {} downloaded, {} pieces remain",
                        idx,
                        stats.total_pieces - stats.completed_pieces,
                    );
                },

                CommandToTorrent::PieceWritten { .. } => {
                    if self.ctx.pieces.is_complete() {
                        tracing::info!("torrent download complete");
                        return true;
                    }
                },

                CommandToTorrent::Shutdown => return false,

            },

            _ = ticker.tick() => self.tick(),

        }}
    }

    // Once a second: fill freed session slots and decide whether an
    // announce is due.
    fn tick(&mut self) {
        self.connect_to_peers();
        if self.announce_pending {
            return;
        }
        let active = self.active_peers.load(Ordering::Relaxed);
        let due = match self.last_announce {
            None => true,
            Some(at) => {
                let elapsed = at.elapsed();
                elapsed >= self.announce_interval
                    || (active < self.config.min_active_peers && elapsed >= MIN_ANNOUNCE_INTERVAL)
            },
        };
        if due {
            self.request_announce();
        }
    }

    // Queue an announce round: started the first time, the regular interval
    // announce afterwards.
    fn request_announce(&mut self) {
        let event = if !self.sent_started {
            Some(Event::Started)
        } else if self.config.announce_empty_event {
            Some(Event::Empty)
        } else {
            None
        };
        if self.send_announce(event) {
            self.sent_started = true;
            self.announce_pending = true;
        }
    }

    fn send_announce(&self, event: Option<Event>) -> bool {
        let stats = self.ctx.pieces.stats();
        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.config.port,
            uploaded: 0,
            downloaded: stats.bytes_downloaded,
            left: stats.total_bytes - stats.bytes_downloaded,
            event,
            num_want: Some(NUM_WANT),
        };
        match &self.announce_tx {
            Some(tx) => tx.send(params).is_ok(),
            None => false,
        }
    }

    fn add_peers(&mut self, peers: Vec<SocketAddr>) {
        for address in peers {
            if !self.peers.contains_key(&address) && !self.available.contains(&address) {
                self.available.push(address);
            }
        }
        self.connect_to_peers();
    }

    fn connect_to_peers(&mut self) {
        let count = self.available.len().min(self.config.max_peers.saturating_sub(self.peers.len()));
        if count == 0 {
            return;
        }
        tracing::info!("connecting to {} peers", count);
        for address in self.available.drain(0..count) {
            self.peers.insert(address, PeerHandle::spawn(address, self.ctx.clone()));
        }
    }

    async fn reap_peer(&mut self, address: SocketAddr) {
        if let Some(mut peer) = self.peers.remove(&address) {
            if peer.active {
                self.active_peers.fetch_sub(1, Ordering::Relaxed);
            }
            if let Some(handle) = peer.session_handle.take() {
                handle.await.ok();
            }
            tracing::debug!("reaped session for {}", address);
        }
    }

    fn spawn_announcer(&mut self) {
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let announcer = Announcer::new(std::mem::take(&mut self.trackers));
        let torrent_tx = self.ctx.torrent_tx.clone();
        self.announce_handle = Some(tokio::spawn(
            announcer
                .run(announce_rx, torrent_tx)
                .instrument(tracing::info_span!("tracker")),
        ));
        self.announce_tx = Some(announce_tx);
    }

    // Prints a progress line every few seconds, the way users expect a
    // console client to.
    fn spawn_reporter(&mut self) {
        let ctx = self.ctx.clone();
        let active_peers = self.active_peers.clone();

        self.reporter_handle = Some(tokio::spawn(async move {
            let mut ticker = time::interval(STATS_INTERVAL);
            // The first tick completes immediately.
            ticker.tick().await;
            let mut last_bytes = 0;
            loop {
                ticker.tick().await;
                let stats = ctx.pieces.stats();
                let downloaded = ctx.downloaded.load(Ordering::Relaxed);
                let speed = (downloaded - last_bytes) as f64 / STATS_INTERVAL.as_secs_f64();
                last_bytes = downloaded;
                println!(
                    "progress: {:5.1}% ({}/{} pieces) | {} / {} | {} | {} peers",
                    stats.percent,
                    stats.completed_pieces,
                    stats.total_pieces,
                    format_bytes(downloaded),
                    format_bytes(stats.total_bytes),
                    format_speed(speed),
                    active_peers.load(Ordering::Relaxed),
                );
            }
        }));
    }

    async fn teardown(&mut self) {

        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        for (_, mut peer) in self.peers.drain() {
            if let Some(handle) = peer.session_handle.take() {
                handle.await.ok();
            }
        }

        self.disk_tx.send(CommandToDisk::Shutdown).ok();
        if let Some(handle) = self.disk_handle.take() {
            match handle.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => tracing::error!("disk task error: {}", e),
                Err(e) => tracing::error!("disk task join error: {}", e),
            }
        }

        // Best-effort stopped announce; failures are ignored.
        self.send_announce(Some(Event::Stopped));
        self.announce_tx = None;
        if let Some(handle) = self.announce_handle.take() {
            time::timeout(STOPPED_ANNOUNCE_TIMEOUT, handle).await.ok();
        }

        if let Some(reporter) = self.reporter_handle.take() {
            reporter.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::tests::single_file_torrent;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            output_dir: dir.path().into(),
            ..Config::default()
        }
    }

    #[test]
    fn test_gen_client_id() {
        let id = gen_client_id();
        assert_eq!(&id[..8], b"-LE0001-");
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(id, gen_client_id());
    }

    #[tokio::test]
    async fn test_add_peers_dedupes_and_caps() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut torrent = Torrent::new(single_file_torrent(), Config {
            max_peers: 2,
            ..test_config(&dir)
        }).unwrap();

        // Loopback ports nothing listens on; the dials fail fast.
        let peers: Vec<SocketAddr> = vec![
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:3".parse().unwrap(),
        ];
        torrent.add_peers(peers.clone());

        // Session cap respected, the duplicate dropped, the overflow queued.
        assert_eq!(torrent.peers.len(), 2);
        assert_eq!(torrent.available, vec!["127.0.0.1:3".parse().unwrap()]);

        // Re-announced addresses we already track are not re-queued.
        torrent.add_peers(peers);
        assert_eq!(torrent.peers.len(), 2);
        assert_eq!(torrent.available.len(), 1);

        torrent.teardown().await;
    }

    #[tokio::test]
    async fn test_announce_events() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut torrent = Torrent::new(single_file_torrent(), test_config(&dir)).unwrap();
        let (announce_tx, mut announce_rx) = mpsc::unbounded_channel();
        torrent.announce_tx = Some(announce_tx);

        // First announce carries started, later ones omit the event.
        torrent.request_announce();
        assert_eq!(announce_rx.try_recv().unwrap().event, Some(Event::Started));
        assert!(torrent.announce_pending);

        torrent.announce_pending = false;
        torrent.request_announce();
        assert_eq!(announce_rx.try_recv().unwrap().event, None);

        // Unless configured to announce a literal empty event.
        torrent.config.announce_empty_event = true;
        torrent.announce_pending = false;
        torrent.request_announce();
        assert_eq!(announce_rx.try_recv().unwrap().event, Some(Event::Empty));

        // While a round is in flight the tick never queues another.
        torrent.last_announce = None;
        torrent.tick();
        assert!(announce_rx.try_recv().is_err());
    }
}
