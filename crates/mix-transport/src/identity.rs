//! Local client identity: a canonicalised address plus the long-term X25519
//! static keypair used both to seal outgoing blocks and to open incoming
//! ones.

use crate::{Result, TransportError};
use x25519_dalek::{PublicKey, StaticSecret};

/// A human-readable local-part plus provider name, canonicalised lowercase
/// on parse so two spellings of the same address always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// The part before `@`, e.g. `alice`.
    pub local_part: String,
    /// The part after `@`, e.g. `provider.example`.
    pub provider: String,
}

impl Address {
    /// Parse `local@provider`, lowercasing both parts. Fails with
    /// [`TransportError::Input`] if `raw` is missing the `@` separator,
    /// has more than one, or either side is empty.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split('@');
        let (Some(local_part), Some(provider), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(TransportError::Input(format!("malformed address: {raw:?}")));
        };
        if local_part.is_empty() || provider.is_empty() {
            return Err(TransportError::Input(format!("malformed address: {raw:?}")));
        }
        Ok(Self {
            local_part: local_part.to_lowercase(),
            provider: provider.to_lowercase(),
        })
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local_part, self.provider)
    }
}

/// A client's canonicalised address and long-term identity keypair.
///
/// The static secret never leaves the process; only the public key is
/// published to the user-key directory (`userkeys`) for correspondents to
/// look up.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    secret: StaticSecret,
    public: PublicKey,
}

impl Identity {
    /// Generate a fresh identity keypair for `address`.
    pub fn generate<R: rand_core::RngCore + rand_core::CryptoRng>(address: Address, rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { address, secret, public }
    }

    /// Reconstruct an identity from a previously-persisted static secret.
    pub fn from_secret(address: Address, secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { address, secret, public }
    }

    /// This identity's canonicalised address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// This identity's long-term static secret.
    pub fn static_secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// This identity's long-term static public key.
    pub fn static_public(&self) -> &PublicKey {
        &self.public
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address.to_string())
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generate_produces_matching_public_key() {
        let mut rng = StdRng::seed_from_u64(1);
        let address = Address::parse("alice@provider.example").expect("parse");
        let identity = Identity::generate(address, &mut rng);
        let expected_public = PublicKey::from(identity.static_secret());
        assert_eq!(identity.static_public().as_bytes(), expected_public.as_bytes());
    }

    #[test]
    fn address_parse_lowercases_both_parts() {
        let address = Address::parse("Alice@Provider.Example").expect("parse");
        assert_eq!(address.local_part, "alice");
        assert_eq!(address.provider, "provider.example");
        assert_eq!(address.to_string(), "alice@provider.example");
    }

    #[test]
    fn address_parse_rejects_missing_separator() {
        assert!(matches!(Address::parse("alice"), Err(TransportError::Input(_))));
    }

    #[test]
    fn address_parse_rejects_multiple_separators() {
        assert!(matches!(Address::parse("alice@a@b"), Err(TransportError::Input(_))));
    }

    #[test]
    fn address_parse_rejects_empty_parts() {
        assert!(matches!(Address::parse("@provider.example"), Err(TransportError::Input(_))));
        assert!(matches!(Address::parse("alice@"), Err(TransportError::Input(_))));
    }
}
