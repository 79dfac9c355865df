//! # mix-transport
//!
//! Route construction, durable egress/ingress storage, Stop-and-Wait ARQ
//! scheduling, and the provider fetch/ACK loop for the mix-network client
//! core. Builds on [`mix_crypto`] for block fragmentation and per-block
//! Noise_X sealing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌──────────┐   ┌──────────┐
//! │  Block   │──▶│   Route   │──▶│  Sphinx │──▶│   ARQ    │──▶│  Fetch   │
//! │  codec   │   │  builder  │   │ primitive│   │ scheduler│   │   loop   │
//! └──────────┘   └───────────┘   └─────────┘   └──────────┘   └──────────┘
//!                                                     │               │
//!                                                     ▼               ▼
//!                                              egress store     ingress store
//! ```
//!
//! Each identity owns one send worker, one fetch worker, and one ARQ timer
//! task (`session`), all observing a shared cancellation token for
//! cooperative shutdown.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arq;
pub mod config;
pub mod epoch;
pub mod fetch;
pub mod identity;
pub mod link;
pub mod pki;
pub mod route;
pub mod session;
pub mod sphinx;
pub mod store;
pub mod userkeys;

pub use arq::{ArqScheduler, DirectorySnapshot, DirectorySource};
pub use config::ClientConfig;
pub use epoch::{Epoch, EpochKeys, MixDescriptor, PkiDocument};
pub use fetch::{FetchEvent, FetchLoop, PacingConfig};
pub use identity::{Address, Identity};
pub use link::LinkSession;
pub use pki::{CachingDirectory, PkiClient};
pub use route::{BuiltRoute, Route, RouteBuilder, RouteParams};
pub use session::Session;
pub use sphinx::{ReferenceSphinx, SphinxPrimitive};
pub use store::{EgressRecord, EgressStore, IngressRecord, InMemoryEgressStore, RouteContext, SqliteEgressStore, SurbId};
pub use userkeys::{UserId, UserKeyDirectory};

use thiserror::Error;

/// Node identifier in the mixnet (derived from a mix's public key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Construct a node ID from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Borrow the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A single mix node's routing-relevant attributes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MixNode {
    /// Unique identifier derived from the mix's public key.
    pub id: NodeId,
    /// X25519 public key used to seal Sphinx onion layers to this mix.
    pub public_key: [u8; 32],
    /// Network address (`host:port`) used by the link layer to dial it.
    pub address: String,
    /// Stratified layer this mix occupies (0 = provider, increasing inward).
    pub layer: u8,
}

/// Errors surfaced by the transport crate, following the input / protocol /
/// transient / fatal taxonomy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The caller supplied an invalid argument (e.g. an empty message, or
    /// a message that does not fit in any supported number of blocks).
    /// Never touches the ARQ; returned directly to the submission call site.
    #[error("invalid input: {0}")]
    Input(String),

    /// A received frame, packet, or directory document violated the wire
    /// protocol (bad MAC, malformed Sphinx frame, inconsistent fragment
    /// set). The caller may choose to reconnect.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A retryable failure: link I/O, a timed-out fetch, a transient
    /// directory lookup failure. Wraps the underlying cause for full
    /// diagnostic context.
    #[error("transient failure: {0}")]
    Transient(String, #[source] Option<Box<dyn std::error::Error + Send + Sync>>),

    /// No viable route could be constructed after exhausting retries.
    #[error("no viable route after {attempts} attempts")]
    NoViableRoute {
        /// Number of delay-sampling attempts made before giving up.
        attempts: u32,
    },

    /// An unrecoverable condition: corrupted local state, an exhausted
    /// keyspace, or a configuration error detected at startup.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// A block-codec or Noise_X sealing error from `mix-crypto`.
    #[error("crypto error: {0}")]
    Crypto(#[from] mix_crypto::Error),

    /// A local persistence error.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Result type for `mix-transport` operations.
pub type Result<T> = std::result::Result<T, TransportError>;
