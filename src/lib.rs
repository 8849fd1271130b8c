#![allow(dead_code)]

mod block;
mod metainfo;
mod store;
mod stats;
mod pieces;
mod fs;
mod p2p;
mod tracker;
mod torrent;

// Blocks are the unit of transfer on the wire, 16 KiB.
const BLOCK_SIZE: usize = 0x4000;

// Piece availability, bit-indexed MSB-first to match the wire format.
type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20-byte identifier, used for both info hashes and peer IDs.
type ID = [u8; 20];

pub use metainfo::MetaInfo;
pub use torrent::{CommandToTorrent, Config, Torrent, TorrentTx};
