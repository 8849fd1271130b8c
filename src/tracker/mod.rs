use std::{net::SocketAddr, time::Duration};
use tokio::sync::mpsc;
use url::Url;
use crate::{
    torrent::{CommandToTorrent, TorrentTx},
    ID,
};

mod http;
mod udp;
pub use http::HttpTracker;
pub use udp::UdpTracker;

type Result<T> = std::result::Result<T, TrackerError>;
pub type AnnounceTx = mpsc::UnboundedSender<AnnounceParams>;
pub type AnnounceRx = mpsc::UnboundedReceiver<AnnounceParams>;

// Socket and HTTP operations against a tracker give up after this long.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("response error: {0}")]
    ResponseError(String),

    #[error("no usable trackers")]
    NoTrackers,

}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {

    // Hash of the info dict.
    pub info_hash: ID,

    // Urlencoded 20-byte string used as a unique ID for the client.
    pub peer_id: ID,

    // Port the client nominally listens on.
    pub port: u16,

    // Total bytes uploaded; always zero, this client does not serve.
    pub uploaded: u64,

    // Total bytes of verified pieces downloaded so far.
    pub downloaded: u64,

    // Bytes needed for the download to be complete.
    pub left: u64,

    // If None, this is a request performed at regular intervals and no
    // event key is sent at all.
    pub event: Option<Event>,

    // Number of peers the client would like to receive.
    pub num_want: Option<usize>,

}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Event {

    Started,

    Completed,

    Stopped,

    // Some trackers expect a literal event=empty on interval announces
    // instead of an absent key.
    Empty,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
            Event::Empty => write!(f, "empty"),
        }
    }
}

#[derive(Debug, Default)]
pub struct AnnounceResponse {

    pub peers: Vec<SocketAddr>,

    // Seconds the tracker wants us to wait before the next regular announce.
    pub interval: Option<Duration>,

}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {

    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse>;

    fn url(&self) -> &Url;

}

// Announces against a tiered tracker list: tiers in order, first success
// wins. Runs as its own task so an unresponsive tracker never stalls the
// torrent; the single consumer loop also means at most one announce is in
// flight at a time.
pub struct Announcer {

    // Trackers ordered by tier.
    tiers: Vec<Vec<Box<dyn Tracker>>>,

}

impl Announcer {

    pub fn new(tiers: Vec<Vec<Url>>) -> Self {
        let tiers = tiers
            .into_iter()
            .map(|tier| tier.into_iter().filter_map(create_tracker).collect::<Vec<_>>())
            .filter(|tier: &Vec<_>| !tier.is_empty())
            .collect();
        Self { tiers }
    }

    pub async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse> {
        let mut last_err = TrackerError::NoTrackers;
        for tier in self.tiers.iter_mut() {
            for tracker in tier.iter_mut() {
                match tracker.announce(params).await {
                    Ok(resp) => {
                        tracing::info!("tracker {} provided {} peers", tracker.url(), resp.peers.len());
                        return Ok(resp);
                    },
                    Err(e) => {
                        tracing::warn!("announce to {} failed: {}", tracker.url(), e);
                        last_err = e;
                    },
                }
            }
        }
        Err(last_err)
    }

    // Announce loop driven by the torrent task. Failures are benign: the
    // torrent is told the announce round finished with no peers.
    pub async fn run(mut self, mut announce_rx: AnnounceRx, torrent_tx: TorrentTx) {
        while let Some(params) = announce_rx.recv().await {
            let result = self.announce(params).await;
            // Nobody cares about the outcome of the final stopped announce.
            if params.event == Some(Event::Stopped) {
                break;
            }
            let (peers, interval) = match result {
                Ok(resp) => (resp.peers, resp.interval),
                Err(_) => (Vec::new(), None),
            };
            if torrent_tx.send(CommandToTorrent::Announced { peers, interval }).is_err() {
                break;
            }
        }
    }
}

fn create_tracker(url: Url) -> Option<Box<dyn Tracker>> {
    match url.scheme() {
        "http" | "https" => Some(Box::new(HttpTracker::new(url))),
        "udp" => Some(Box::new(UdpTracker::new(url))),
        scheme => {
            tracing::warn!("unsupported tracker scheme: {}", scheme);
            None
        },
    }
}
