//! Recipient static-key lookup contract.
//!
//! To seal a block under Noise_X (`mix_crypto::noise::seal`) the sender
//! needs the recipient's long-term X25519 static public key. This trait is
//! the seam between this crate and whatever directory maps a correspondent
//! identifier to that key (a user-key server, a contact list, a PGP-style
//! keyring — this crate does not care).

use crate::Result;
use async_trait::async_trait;
use x25519_dalek::PublicKey;

/// A stable handle identifying a correspondent, independent of any
/// particular mailbox or provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

/// Resolves a correspondent identifier to their current static public key.
#[async_trait]
pub trait UserKeyDirectory: Send + Sync {
    /// Look up `user`'s current long-term static public key.
    ///
    /// Returns [`crate::TransportError::Input`] if `user` is not a known
    /// correspondent, and [`crate::TransportError::Transient`] on a
    /// recoverable lookup failure.
    async fn lookup(&self, user: &UserId) -> Result<PublicKey>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    /// An in-memory `UserKeyDirectory` for tests.
    pub struct StaticUserKeyDirectory {
        pub keys: HashMap<UserId, PublicKey>,
    }

    #[async_trait]
    impl UserKeyDirectory for StaticUserKeyDirectory {
        async fn lookup(&self, user: &UserId) -> Result<PublicKey> {
            self.keys
                .get(user)
                .copied()
                .ok_or_else(|| crate::TransportError::Input(format!("unknown user {}", user.0)))
        }
    }
}
