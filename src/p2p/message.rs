use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block::{BlockData, BlockInfo}, Bitfield};
use super::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // Advises peers not to close the connection, carries nothing else.
    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // The sender wants to request blocks.
    Interested,

    // The sender no longer wants to request blocks.
    NotInterested,

    // The sender acquired the piece with this index.
    Have { idx: u32 },

    // Which pieces the sender has, MSB-first, sent after the handshake.
    Bitfield(Bitfield),

    // Ask for a block of a piece.
    Request(BlockInfo),

    // A block of piece data.
    Block(BlockData),

    // Withdraw an earlier request.
    Cancel(BlockInfo),

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // keep-alive: <len=0000>
            Message::KeepAlive => dst.put_u32(0),

            // choke: <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // unchoke: <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // interested: <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // not interested: <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                dst.put_u32(1 + bitfield.as_raw_slice().len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(bitfield.as_raw_slice());
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Messages with unknown ids are consumed and skipped, so decoding
        // loops until it produces a message or runs out of whole frames.
        loop {

            // Can't read message length.
            if src.remaining() < 4 {
                return Ok(None);
            }
            let msg_len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;

            // Haven't received all of the message.
            if src.remaining() < 4 + msg_len {
                return Ok(None);
            }
            src.advance(4);

            if msg_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let id = src.get_u8();
            let payload_len = msg_len - 1;

            let msg = match (id, payload_len) {
                (0, 0) => Message::Choke,
                (1, 0) => Message::Unchoke,
                (2, 0) => Message::Interested,
                (3, 0) => Message::NotInterested,
                (4, 4) => Message::Have { idx: src.get_u32() },
                (5, _) => {
                    let mut bitfield = vec![0; payload_len];
                    src.copy_to_slice(&mut bitfield);
                    Message::Bitfield(Bitfield::from_vec(bitfield))
                },
                (6, 12) => {
                    let piece_idx = src.get_u32() as usize;
                    let offset = src.get_u32() as usize;
                    let len = src.get_u32() as usize;
                    Message::Request(BlockInfo { piece_idx, offset, len })
                },
                (7, 8..) => {
                    let piece_idx = src.get_u32() as usize;
                    let offset = src.get_u32() as usize;
                    let mut data = vec![0; payload_len - 8];
                    src.copy_to_slice(&mut data);
                    Message::Block(BlockData { piece_idx, offset, data })
                },
                (8, 12) => {
                    let piece_idx = src.get_u32() as usize;
                    let offset = src.get_u32() as usize;
                    let len = src.get_u32() as usize;
                    Message::Cancel(BlockInfo { piece_idx, offset, len })
                },
                (0..=8, _) => return Err(PeerError::InvalidMessage),
                _ => {
                    tracing::debug!("skipping message with unknown id {}", id);
                    src.advance(payload_len);
                    continue;
                },
            };

            return Ok(Some(msg));
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {}", block),
            Message::Block(block) => write!(f, "block {}", block.info()),
            Message::Cancel(block) => write!(f, "cancel for block {}", block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn test_msg_stream_roundtrip() {

        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        // Unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        // Interested
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        // Not interested
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Cancel
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x8, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Block(BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }),
            Message::Cancel(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
        ];
        let expected_buf = buf.clone();

        for msg in expected.into_iter() {
            MessageCodec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn test_msg_decode_chunked() {

        let mut buf = BytesMut::new();

        // Add 1/2 of interested message
        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        // Add other 1/2
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Interested));

        // Add 1/2 of piece message
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        // Add other 1/2
        buf.extend_from_slice(&[0x2, 0x3]);
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap(),
            Some(Message::Block(BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] })),
        );
    }

    // Unknown ids must be skipped silently, with the following message
    // decoded as if nothing happened.
    #[test]
    fn test_msg_decode_skips_unknown_id() {
        let mut buf = BytesMut::new();
        // Port message (id 9), which we do not speak, followed by unchoke.
        buf.extend_from_slice(&[0, 0, 0, 3, 9, 0x1a, 0xe1]);
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert!(buf.is_empty());

        // An unknown message on its own is consumed outright.
        buf.extend_from_slice(&[0, 0, 0, 5, 0xfe, 1, 2, 3, 4]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_msg_decode_empty_and_incomplete() {
        let mut src = BytesMut::new();
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), None);

        let mut src = BytesMut::from(&[0u8, 1, 2][..]);
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn test_msg_decode_invalid_payload_len() {
        // A have message with a 2-byte payload is a framing error.
        let mut src = BytesMut::from(&[0u8, 0, 0, 3, 4, 0, 0][..]);
        assert!(MessageCodec.decode(&mut src).is_err());
    }
}
