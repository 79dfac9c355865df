//! Fixed-size block fragmentation and framing.
//!
//! A message is split into `Block`s of exactly [`BLOCK_PLAINTEXT_SIZE`]
//! bytes once serialized. Each block carries a shared `message_id` so the
//! recipient can regroup fragments of the same message, plus `total` and
//! `index` so it can detect missing or duplicate pieces, plus the exact
//! `length` of the payload actually carried (the remainder of the block
//! is zero-padding, not message content).
//!
//! Wire layout (big-endian):
//!
//! ```text
//! message_id : [u8; 16]
//! total      : u16
//! index      : u16
//! length     : u32
//! payload    : [u8; length]
//! padding    : [u8; B - length]   (all zero)
//! ```
//!
//! where `B = BLOCK_PLAINTEXT_SIZE - 24` is the maximum payload a single
//! block can carry.

use crate::{Error, Result};
use rand_core::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;

/// Size in bytes of a serialized block's plaintext frame.
pub const BLOCK_PLAINTEXT_SIZE: usize = 2048;

/// Size in bytes of the message identifier shared by all fragments of one message.
pub const MESSAGE_ID_SIZE: usize = 16;

/// Frame header size: `message_id (16) + total (2) + index (2) + length (4)`.
const HEADER_SIZE: usize = MESSAGE_ID_SIZE + 2 + 2 + 4;

/// Maximum payload bytes a single block can carry.
pub const BLOCK_PAYLOAD_CAPACITY: usize = BLOCK_PLAINTEXT_SIZE - HEADER_SIZE;

/// A single fixed-size fragment of a larger message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Identifier shared by every fragment of the same message.
    pub message_id: [u8; MESSAGE_ID_SIZE],
    /// Total number of fragments in the message this block belongs to.
    pub total: u16,
    /// Zero-based position of this fragment among `total`.
    pub index: u16,
    /// Number of meaningful payload bytes (the rest of the frame is padding).
    pub length: u32,
    /// Fragment payload, exactly `length` bytes.
    pub payload: Vec<u8>,
}

impl Block {
    /// Split `message` into a sequence of fixed-size blocks sharing a fresh
    /// random `message_id`.
    ///
    /// Returns [`Error::EmptyMessage`] if `message` is empty, or
    /// [`Error::MessageTooLarge`] if it would need more than `u16::MAX`
    /// blocks.
    pub fn fragment<R: RngCore + CryptoRng>(message: &[u8], rng: &mut R) -> Result<Vec<Block>> {
        if message.is_empty() {
            return Err(Error::EmptyMessage);
        }

        let total = message.len().div_ceil(BLOCK_PAYLOAD_CAPACITY);
        if total > u16::MAX as usize {
            return Err(Error::MessageTooLarge);
        }
        let total = total as u16;

        let mut message_id = [0u8; MESSAGE_ID_SIZE];
        rng.fill_bytes(&mut message_id);

        let blocks = message
            .chunks(BLOCK_PAYLOAD_CAPACITY)
            .enumerate()
            .map(|(i, chunk)| Block {
                message_id,
                total,
                index: i as u16,
                length: chunk.len() as u32,
                payload: chunk.to_vec(),
            })
            .collect();

        Ok(blocks)
    }

    /// Reassemble a complete, correctly-ordered set of blocks back into the
    /// original message bytes.
    ///
    /// Callers are responsible for having collected exactly `total` blocks
    /// sharing one `message_id` before calling this; this function does not
    /// itself perform dedup or completeness checks (that is the fetch
    /// loop's job, per component E).
    pub fn reassemble(blocks: &[Block]) -> Vec<u8> {
        let mut out = Vec::with_capacity(blocks.len() * BLOCK_PAYLOAD_CAPACITY);
        for block in blocks {
            out.extend_from_slice(&block.payload);
        }
        out
    }

    /// Serialize this block into a fixed [`BLOCK_PLAINTEXT_SIZE`]-byte frame,
    /// zero-padding the unused payload tail.
    pub fn serialize(&self) -> [u8; BLOCK_PLAINTEXT_SIZE] {
        let mut out = [0u8; BLOCK_PLAINTEXT_SIZE];
        out[0..MESSAGE_ID_SIZE].copy_from_slice(&self.message_id);
        out[16..18].copy_from_slice(&self.total.to_be_bytes());
        out[18..20].copy_from_slice(&self.index.to_be_bytes());
        out[20..24].copy_from_slice(&self.length.to_be_bytes());
        out[HEADER_SIZE..HEADER_SIZE + self.payload.len()].copy_from_slice(&self.payload);
        // The rest of `out` is already zeroed by the array initializer.
        out
    }

    /// Parse a [`BLOCK_PLAINTEXT_SIZE`]-byte frame back into a `Block`.
    ///
    /// Verifies, in constant time, that the padding region is all-zero;
    /// a tampered or corrupted frame with nonzero padding is rejected with
    /// [`Error::BadPadding`] rather than silently accepted.
    pub fn deserialize(frame: &[u8]) -> Result<Block> {
        if frame.len() != BLOCK_PLAINTEXT_SIZE {
            return Err(Error::BadFrame);
        }

        let mut message_id = [0u8; MESSAGE_ID_SIZE];
        message_id.copy_from_slice(&frame[0..MESSAGE_ID_SIZE]);
        let total = u16::from_be_bytes([frame[16], frame[17]]);
        let index = u16::from_be_bytes([frame[18], frame[19]]);
        let length = u32::from_be_bytes([frame[20], frame[21], frame[22], frame[23]]);

        let length_usize = length as usize;
        if length_usize > BLOCK_PAYLOAD_CAPACITY {
            return Err(Error::BadFrame);
        }

        let payload_start = HEADER_SIZE;
        let payload_end = payload_start + length_usize;
        let payload = frame[payload_start..payload_end].to_vec();

        let padding = &frame[payload_end..];
        let zero = vec![0u8; padding.len()];
        if padding.ct_eq(&zero).unwrap_u8() != 1 {
            return Err(Error::BadPadding);
        }

        Ok(Block {
            message_id,
            total,
            index,
            length,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn fragment_rejects_empty_message() {
        let mut rng = rng();
        assert!(matches!(
            Block::fragment(&[], &mut rng),
            Err(Error::EmptyMessage)
        ));
    }

    #[test]
    fn fragment_single_block_message() {
        let mut rng = rng();
        let msg = b"hello mix network";
        let blocks = Block::fragment(msg, &mut rng).expect("fragment");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].total, 1);
        assert_eq!(blocks[0].index, 0);
        assert_eq!(blocks[0].length as usize, msg.len());
        assert_eq!(Block::reassemble(&blocks), msg);
    }

    #[test]
    fn fragment_multi_block_message_round_trips() {
        let mut rng = rng();
        let msg = vec![0x42u8; BLOCK_PAYLOAD_CAPACITY * 3 + 17];
        let blocks = Block::fragment(&msg, &mut rng).expect("fragment");
        assert_eq!(blocks.len(), 4);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.index as usize, i);
            assert_eq!(block.total as usize, blocks.len());
            assert_eq!(block.message_id, blocks[0].message_id);
        }
        assert_eq!(Block::reassemble(&blocks), msg);
    }

    #[test]
    fn serialize_deserialize_round_trip() {
        let mut rng = rng();
        let msg = b"round trip me";
        let blocks = Block::fragment(msg, &mut rng).expect("fragment");
        let frame = blocks[0].serialize();
        assert_eq!(frame.len(), BLOCK_PLAINTEXT_SIZE);
        let parsed = Block::deserialize(&frame).expect("deserialize");
        assert_eq!(parsed, blocks[0]);
    }

    #[test]
    fn deserialize_rejects_wrong_length() {
        let short = vec![0u8; BLOCK_PLAINTEXT_SIZE - 1];
        assert!(matches!(
            Block::deserialize(&short),
            Err(Error::BadFrame)
        ));
    }

    #[test]
    fn deserialize_rejects_nonzero_padding() {
        let mut rng = rng();
        let blocks = Block::fragment(b"short", &mut rng).expect("fragment");
        let mut frame = blocks[0].serialize();
        *frame.last_mut().expect("nonempty frame") = 0xFF;
        assert!(matches!(
            Block::deserialize(&frame),
            Err(Error::BadPadding)
        ));
    }

    #[test]
    fn deserialize_rejects_length_exceeding_capacity() {
        let mut frame = [0u8; BLOCK_PLAINTEXT_SIZE];
        let bogus_length = (BLOCK_PAYLOAD_CAPACITY as u32) + 1;
        frame[20..24].copy_from_slice(&bogus_length.to_be_bytes());
        assert!(matches!(
            Block::deserialize(&frame),
            Err(Error::BadFrame)
        ));
    }

    #[test]
    fn fragment_exactly_fills_last_block() {
        let mut rng = rng();
        let msg = vec![7u8; BLOCK_PAYLOAD_CAPACITY * 2];
        let blocks = Block::fragment(&msg, &mut rng).expect("fragment");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].length as usize, BLOCK_PAYLOAD_CAPACITY);
        assert_eq!(Block::reassemble(&blocks), msg);
    }
}
