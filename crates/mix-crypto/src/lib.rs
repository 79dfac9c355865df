//! # mix-crypto
//!
//! Message fragmentation and end-to-end block sealing for the mix-network
//! client core.
//!
//! A message is split into fixed-size [`Block`]s (`block`), each sealed
//! individually under the recipient's long-term X25519 key with a
//! one-shot Noise_X handshake (`noise`). Intermediate mixes and the
//! provider never see plaintext or the sender's identity; only the
//! recipient, on `open`, learns both.
//!
//! ## Cipher suite
//!
//! Fixed: X25519 for the DH step, ChaCha20-Poly1305 for the AEAD,
//! BLAKE2b for key derivation and the handshake transcript hash.
//!
//! ## Safety
//!
//! This crate forbids all unsafe code.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod block;
pub mod noise;

pub use block::{Block, BLOCK_PLAINTEXT_SIZE, BLOCK_PAYLOAD_CAPACITY, MESSAGE_ID_SIZE};
pub use noise::{SealedBlock, SEALED_BLOCK_SIZE, X_HANDSHAKE_OVERHEAD};

use thiserror::Error;

/// Errors that can occur during block fragmentation, framing, or sealing.
#[derive(Debug, Error)]
pub enum Error {
    /// The message to fragment was empty.
    #[error("message must not be empty")]
    EmptyMessage,

    /// The message would require more than `u16::MAX` blocks.
    #[error("message too large to fragment into a 16-bit block count")]
    MessageTooLarge,

    /// A serialized block had the wrong size or an unreadable frame.
    #[error("malformed block frame")]
    BadFrame,

    /// A serialized block's padding region was not all-zero.
    #[error("block padding was not zero-filled")]
    BadPadding,

    /// A sealed block failed to authenticate under the given key.
    #[error("Noise_X authentication failed")]
    AuthFail,
}

/// Result type for `mix-crypto` operations.
pub type Result<T> = std::result::Result<T, Error>;
