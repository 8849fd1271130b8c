use std::{
    sync::Mutex,
    time::{Duration, Instant},
};
use sha1::{Digest, Sha1};
use crate::{
    block::{block_len, num_blocks, BlockInfo},
    fs::{CommandToDisk, DiskTx},
    stats::DownloadStats,
    store::StoreInfo,
    torrent::{CommandToTorrent, TorrentTx},
    Bitfield, BLOCK_SIZE, ID,
};

// A block requested this long ago with no data arriving counts as missing
// again and may be handed out anew.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Outcome of offering a block of data to the store.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Ingest {

    // Block data copied into the piece buffer, or already present.
    Accepted,

    // No block with that (offset, length) exists, state unchanged.
    Rejected,

    // The piece was verified earlier, data discarded.
    AlreadyComplete,

}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum BlockState {

    #[default]
    Free,

    Requested(Instant),

    Received,

}

#[derive(Debug)]
struct Piece {

    // Expected sha1 digest of the piece data.
    hash: ID,

    // Length of piece.
    len: usize,

    // Piece buffer, allocated when the first block arrives.
    data: Vec<u8>,

    // State of all blocks within this piece, in offset order.
    blocks: Vec<BlockState>,

    num_received: usize,

}

impl Piece {

    fn new(hash: ID, len: usize) -> Self {
        Self {
            hash,
            len,
            data: Vec::new(),
            blocks: vec![BlockState::default(); num_blocks(len)],
            num_received: 0,
        }
    }

    // Blocks that are neither received nor live-requested.
    fn num_missing(&self, now: Instant) -> usize {
        self.blocks.iter().filter(|b| Self::is_missing(b, now)).count()
    }

    fn first_missing(&self, now: Instant) -> Option<usize> {
        self.blocks.iter().position(|b| Self::is_missing(b, now))
    }

    fn is_missing(block: &BlockState, now: Instant) -> bool {
        match block {
            BlockState::Free => true,
            BlockState::Requested(at) => now.duration_since(*at) >= REQUEST_TIMEOUT,
            BlockState::Received => false,
        }
    }

    fn verify(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }

    // Drops all progress, the piece is downloaded from scratch.
    fn reset(&mut self) {
        self.data = Vec::new();
        self.blocks.iter_mut().for_each(|b| *b = BlockState::Free);
        self.num_received = 0;
    }
}

#[derive(Debug)]
struct Inner {

    pieces: Vec<Piece>,

    // Pieces that have been verified.
    have: Bitfield,

    num_completed: usize,

    // Sum of verified piece lengths.
    bytes_downloaded: u64,

    // Pieces that failed verification, for diagnostics only.
    num_corrupt: u64,

}

// Owns all piece and block accounting: accepts incoming block writes,
// verifies completed pieces and answers "what should I request next given
// this peer's available set". Verified pieces are emitted to the disk task,
// corrupt pieces are reset without ever becoming visible downstream.
//
// All peer sessions share one store; a single mutex serializes every
// operation. Nothing blocks while the lock is held.
#[derive(Debug)]
pub struct PieceStore {

    inner: Mutex<Inner>,

    total_bytes: u64,

    // Verified pieces are handed to the disk task through this channel.
    disk_tx: DiskTx,

    // Completion notifications for the torrent task.
    torrent_tx: TorrentTx,

}

impl PieceStore {

    pub fn new(info: &StoreInfo, piece_hashes: Vec<ID>, disk_tx: DiskTx, torrent_tx: TorrentTx) -> Self {
        debug_assert_eq!(piece_hashes.len(), info.num_pieces);

        let pieces = piece_hashes
            .into_iter()
            .enumerate()
            .map(|(idx, hash)| Piece::new(hash, info.piece_len(idx)))
            .collect();

        Self {
            inner: Mutex::new(Inner {
                pieces,
                have: Bitfield::repeat(false, info.num_pieces),
                num_completed: 0,
                bytes_downloaded: 0,
                num_corrupt: 0,
            }),
            total_bytes: info.total_len,
            disk_tx,
            torrent_tx,
        }
    }

    // Offer a block of data to the store. Completes and verifies the piece
    // if this was its last block.
    pub fn ingest(&self, piece_idx: usize, offset: usize, data: &[u8]) -> Ingest {

        let mut inner = self.inner.lock().unwrap();

        if piece_idx >= inner.pieces.len() {
            return Ingest::Rejected;
        }
        if inner.have[piece_idx] {
            return Ingest::AlreadyComplete;
        }

        let piece = &mut inner.pieces[piece_idx];
        if offset % BLOCK_SIZE != 0 {
            return Ingest::Rejected;
        }
        let block_idx = offset / BLOCK_SIZE;
        if block_idx >= piece.blocks.len() || data.len() != block_len(piece.len, block_idx) {
            return Ingest::Rejected;
        }

        // Duplicate delivery, nothing to do.
        if piece.blocks[block_idx] == BlockState::Received {
            return Ingest::Accepted;
        }

        if piece.data.is_empty() {
            piece.data = vec![0; piece.len];
        }
        piece.data[offset..offset + data.len()].copy_from_slice(data);
        piece.blocks[block_idx] = BlockState::Received;
        piece.num_received += 1;

        if piece.num_received < piece.blocks.len() {
            return Ingest::Accepted;
        }

        // All blocks present, verify against the expected digest.
        let completed = if piece.verify() {
            Some(std::mem::take(&mut piece.data))
        } else {
            tracing::warn!("piece {} failed hash verification", piece_idx);
            piece.reset();
            None
        };
        match &completed {
            Some(data) => {
                inner.have.set(piece_idx, true);
                inner.num_completed += 1;
                inner.bytes_downloaded += data.len() as u64;
            },
            None => inner.num_corrupt += 1,
        }
        drop(inner);

        if let Some(data) = completed {
            // Send failures mean we are shutting down; the piece is safe to drop.
            self.disk_tx.send(CommandToDisk::WritePiece { idx: piece_idx, data }).ok();
            self.torrent_tx.send(CommandToTorrent::PieceCompleted { idx: piece_idx }).ok();
        }

        Ingest::Accepted
    }

    // Pick the next block to request from a peer with the given pieces.
    // Of the incomplete pieces on offer, the one with the fewest missing
    // blocks wins, ties broken by ascending index; within the piece, blocks
    // are requested in offset order. The returned block is marked requested.
    pub fn next_request(&self, available: &Bitfield) -> Option<BlockInfo> {

        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let mut best: Option<(usize, usize)> = None;
        for idx in 0..inner.pieces.len() {
            if !available.get(idx).is_some_and(|b| *b) || inner.have[idx] {
                continue;
            }
            let missing = inner.pieces[idx].num_missing(now);
            if missing == 0 {
                continue;
            }
            if best.map_or(true, |(m, _)| missing < m) {
                best = Some((missing, idx));
            }
        }

        let (_, piece_idx) = best?;
        let piece = &mut inner.pieces[piece_idx];
        let block_idx = piece.first_missing(now)?;
        piece.blocks[block_idx] = BlockState::Requested(now);

        Some(BlockInfo {
            piece_idx,
            offset: block_idx * BLOCK_SIZE,
            len: block_len(piece.len, block_idx),
        })
    }

    // Clears the requested flag on all non-received blocks of a piece.
    // Called for each piece a disconnecting peer had pending blocks on.
    pub fn reset_piece_requests(&self, piece_idx: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(piece) = inner.pieces.get_mut(piece_idx) {
            for block in piece.blocks.iter_mut() {
                if matches!(block, BlockState::Requested(_)) {
                    *block = BlockState::Free;
                }
            }
        }
    }

    // Whether the peer has any piece we still need.
    pub fn interested_in(&self, available: &Bitfield) -> bool {
        let inner = self.inner.lock().unwrap();
        available
            .iter()
            .by_vals()
            .zip(inner.have.iter().by_vals())
            .any(|(theirs, ours)| theirs && !ours)
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.num_completed == inner.pieces.len()
    }

    pub fn stats(&self) -> DownloadStats {
        let inner = self.inner.lock().unwrap();
        DownloadStats {
            total_pieces: inner.pieces.len(),
            completed_pieces: inner.num_completed,
            bytes_downloaded: inner.bytes_downloaded,
            total_bytes: self.total_bytes,
            percent: inner.num_completed as f64 / inner.pieces.len() as f64 * 100.0,
        }
    }

    #[cfg(test)]
    fn corrupt_count(&self) -> u64 {
        self.inner.lock().unwrap().num_corrupt
    }
}
