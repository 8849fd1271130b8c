use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::Framed;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use crate::{
    block::{BlockData, BlockInfo},
    pieces::Ingest,
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield,
};
use super::{*, handshake::*, message::*, state::*};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// One outbound peer connection: dials, handshakes, then exchanges framed
// messages until an error, remote EOF, or a shutdown command.
#[derive(Debug)]
pub struct PeerSession {

    // The peer's address.
    address: SocketAddr,

    // Read-only state shared by all components of the torrent.
    ctx: Arc<TorrentContext>,

    // Commands from the torrent task.
    peer_rx: PeerRx,

    // Blocks requested from the peer and not yet answered, capped at
    // MAX_PENDING_REQUESTS.
    requests_out: HashSet<BlockInfo>,

    // Pieces the peer has.
    bitfield: Bitfield,

    state: SessionState,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, ctx.info.num_pieces);

        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                requests_out: HashSet::new(),
                bitfield,
                state: SessionState::default(),
            },
            peer_tx,
        )
    }

    pub async fn run(&mut self) -> Result<()> {

        self.state.conn_state = ConnState::Dialing;
        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address))
            .await
            .map_err(|_| PeerError::Timeout)??;
        tracing::trace!("outbound connection successful");

        let mut socket = Framed::new(stream, HandshakeCodec);
        self.exchange_handshake(&mut socket).await?;

        // Same socket, framed for regular messages from here on. Swapping
        // the codec in place keeps any bytes that arrived on the heels of
        // the handshake.
        let socket = socket.map_codec(|_| MessageCodec);
        self.state.conn_state = ConnState::Active;
        tracing::info!("peer connected");
        self.ctx.torrent_tx.send(CommandToTorrent::PeerConnected { address: self.address }).ok();

        self.drive(socket).await
    }

    // Tear-down counterpart of run, invoked exactly once when the session
    // task finishes. Blocks this peer had in flight become free for others.
    pub fn shutdown(&mut self) {
        self.state.conn_state = ConnState::Disconnected;
        self.abandon_requests();
        tracing::debug!("session done, {} bytes downloaded", self.state.downloaded);
        self.ctx.torrent_tx.send(CommandToTorrent::PeerDisconnected { address: self.address }).ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>) -> Result<()> {

        self.state.conn_state = ConnState::Handshaking;
        tracing::trace!("send handshake");
        socket.send(Handshake::new(self.ctx.info_hash, self.ctx.client_id)).await?;

        match time::timeout(CONNECT_TIMEOUT, socket.next()).await.map_err(|_| PeerError::Timeout)? {
            Some(Ok(handshake)) => {
                // The remote peer id is not validated.
                if handshake.info_hash != self.ctx.info_hash {
                    return Err(PeerError::IncorrectInfoHash);
                }
                tracing::trace!("handshake successful");
                Ok(())
            },
            Some(Err(e)) => Err(e),
            None => Err(PeerError::NoHandshake),
        }
    }

    async fn drive(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        let connect_time = Instant::now();
        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(Duration::from_secs(1));

        loop { tokio::select! {

            // Message from peer.
            msg = stream.next() => match msg {
                Some(Ok(msg)) => self.handle_msg(&mut sink, msg).await?,
                Some(Err(e)) => return Err(e),
                None => return Err(PeerError::Eof),
            },

            // Command from the torrent task.
            cmd = self.peer_rx.recv() => match cmd {
                Some(PeerCommand::Shutdown) | None => {
                    tracing::info!("session shutdown");
                    return Ok(());
                },
            },

            now = ticker.tick() => self.tick(&mut sink, connect_time, now.into_std()).await?,

        }}
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);

        match msg {

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    // The peer will not answer what is in flight; free the
                    // blocks for other sessions.
                    self.abandon_requests();
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    self.make_requests(sink).await?;
                }
            },

            Message::Interested => self.state.peer_interested = true,

            Message::NotInterested => self.state.peer_interested = false,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Bitfield(bitfield) => self.handle_bitfield(sink, bitfield).await?,

            // We do not serve uploads, remote requests and cancels are ignored.
            Message::Request(_) | Message::Cancel(_) => {},

            Message::Block(block) => {
                self.handle_block(block);
                self.make_requests(sink).await?;
            },

        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), self.ctx.info.num_pieces);
        // Remove trailing bits.
        bitfield.resize(self.ctx.info.num_pieces, false);
        self.bitfield = bitfield;
        self.update_interest(sink).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        if idx as usize >= self.ctx.info.num_pieces {
            tracing::warn!("have msg with invalid piece index: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        self.bitfield.set(idx as usize, true);
        self.update_interest(sink).await
    }

    fn handle_block(&mut self, block: BlockData) {
        let info = block.info();
        // A block we never asked for is still ingested; the pending set is
        // only adjusted when a matching entry exists.
        if !self.requests_out.remove(&info) {
            tracing::debug!("block with no matching pending request: {}", info);
        }

        match self.ctx.pieces.ingest(info.piece_idx, info.offset, &block.data) {
            Ingest::Accepted => {
                self.state.downloaded += info.len as u64;
                self.ctx.downloaded.fetch_add(info.len as u64, Ordering::Relaxed);
            },
            Ingest::AlreadyComplete => tracing::trace!("block for completed piece: {}", info),
            Ingest::Rejected => tracing::warn!("block rejected: {}", info),
        }
    }

    // Declare or withdraw interest when the peer's pieces change.
    // Messages are only sent on an actual transition.
    async fn update_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        let interested = self.ctx.pieces.interested_in(&self.bitfield);
        if interested && !self.state.interested {
            self.state.interested = true;
            self.send_message(sink, Message::Interested).await?;
            self.make_requests(sink).await?;
        } else if !interested && self.state.interested {
            self.state.interested = false;
            self.send_message(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    fn can_request(&self) -> bool {
        self.state.conn_state == ConnState::Active
            && !self.state.peer_choking
            && self.state.interested
            && self.requests_out.len() < MAX_PENDING_REQUESTS
    }

    // Top up the request pipeline from the piece store.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {
        while self.can_request() {
            let Some(block) = self.ctx.pieces.next_request(&self.bitfield) else { break };
            self.requests_out.insert(block);
            self.send_message(sink, Message::Request(block)).await?;
        }
        Ok(())
    }

    fn abandon_requests(&mut self) {
        let pieces: HashSet<usize> = self.requests_out.drain().map(|b| b.piece_idx).collect();
        for idx in pieces {
            self.ctx.pieces.reset_piece_requests(idx);
        }
    }

    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        sink.send(msg).await
    }

    async fn tick(&mut self, sink: &mut MessageSink, connect_time: Instant, now: Instant) -> Result<()> {

        if !self.state.interested
            && !self.state.peer_interested
            && now.saturating_duration_since(connect_time) >= INACTIVITY_TIMEOUT
        {
            tracing::warn!("disconnecting peer due to inactivity");
            return Err(PeerError::Timeout);
        }

        // Re-issue requests the store has recycled in the meantime.
        self.make_requests(sink).await
    }
}
