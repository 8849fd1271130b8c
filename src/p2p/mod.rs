use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::torrent::TorrentContext;

mod session;
mod message;
mod handshake;
mod state;

pub use session::PeerSession;

// A peer session may hold at most this many outstanding block requests.
pub const MAX_PENDING_REQUESTS: usize = 5;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("peer closed the connection")]
    Eof,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("connection timeout")]
    Timeout,

}

// Commands that can be sent to a peer session.
pub enum PeerCommand {

    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Sends commands to the session.
    pub peer_tx: PeerTx,

    // Handle to the session task.
    // Option is for moving out of the handle behind a mutable ref.
    pub session_handle: Option<JoinHandle<()>>,

    // Whether the session has reported reaching the active state.
    pub active: bool,

}

impl PeerHandle {
    // Spawns the session task; the session reports its fate to the torrent
    // task by itself, errors end the session and nothing else.
    pub fn spawn(address: SocketAddr, ctx: Arc<TorrentContext>) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            if let Err(e) = session.run().await {
                tracing::debug!("session ended: {}", e);
            }
            session.shutdown();
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            session_handle: Some(session_handle),
            active: false,
        }
    }
}
