//! One-shot Noise_X sealing of a single block under the recipient's
//! long-term X25519 key.
//!
//! Unlike a ratcheting protocol, every block is sealed independently: there
//! is no persisted handshake state between blocks, and no forward secrecy
//! beyond the lifetime of the per-block ephemeral key. This matches the
//! Noise `X` one-way pattern (`-> e, es, s, ss`): the sender transmits a
//! fresh ephemeral key, authenticates itself to the recipient via its own
//! static key, and the recipient learns the sender's identity only after
//! successfully opening the block.
//!
//! Two Diffie-Hellman results feed the key schedule:
//!
//! - `es` = DH(ephemeral, recipient_static) — binds the message to this
//!   handshake and to the recipient.
//! - `ss` = DH(sender_static, recipient_static) — binds the message to the
//!   sender's long-term identity.
//!
//! Each DH result is mixed into the chaining key with HKDF over BLAKE2b,
//! and used to key one ChaCha20-Poly1305 encryption: first the sender's
//! static public key (so the recipient can recover the sender's identity),
//! then the block plaintext itself.

use crate::{Error, Result, BLOCK_PLAINTEXT_SIZE};
use blake2::Blake2b512;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

/// Protocol identifier mixed into the initial chaining key, per Noise
/// convention.
const PROTOCOL_NAME: &[u8] = b"Noise_X_25519_ChaChaPoly_BLAKE2b";

const AEAD_TAG_SIZE: usize = 16;
const PUBLIC_KEY_SIZE: usize = 32;

/// Fixed overhead the handshake adds on top of the block plaintext: the
/// sender's ephemeral public key, the sender's encrypted static public key
/// and its AEAD tag, and the payload's AEAD tag.
pub const X_HANDSHAKE_OVERHEAD: usize =
    PUBLIC_KEY_SIZE + PUBLIC_KEY_SIZE + AEAD_TAG_SIZE + AEAD_TAG_SIZE;

/// Size in bytes of a sealed block on the wire.
pub const SEALED_BLOCK_SIZE: usize = BLOCK_PLAINTEXT_SIZE + X_HANDSHAKE_OVERHEAD;

/// A single block sealed under a one-shot Noise_X handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    /// The sender's fresh ephemeral public key for this block.
    pub ephemeral_public: [u8; PUBLIC_KEY_SIZE],
    /// The sender's static public key, encrypted under the `es`-derived key.
    pub encrypted_static: Vec<u8>,
    /// The block plaintext, encrypted under the `ss`-derived key.
    pub ciphertext: Vec<u8>,
}

impl SealedBlock {
    /// Serialize to the fixed [`SEALED_BLOCK_SIZE`]-byte wire form:
    /// `ephemeral_public || encrypted_static || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SEALED_BLOCK_SIZE);
        out.extend_from_slice(&self.ephemeral_public);
        out.extend_from_slice(&self.encrypted_static);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the fixed wire form back into a `SealedBlock`.
    pub fn from_bytes(bytes: &[u8]) -> Result<SealedBlock> {
        if bytes.len() != SEALED_BLOCK_SIZE {
            return Err(Error::BadFrame);
        }
        let mut ephemeral_public = [0u8; PUBLIC_KEY_SIZE];
        ephemeral_public.copy_from_slice(&bytes[0..PUBLIC_KEY_SIZE]);

        let static_end = PUBLIC_KEY_SIZE + PUBLIC_KEY_SIZE + AEAD_TAG_SIZE;
        let encrypted_static = bytes[PUBLIC_KEY_SIZE..static_end].to_vec();
        let ciphertext = bytes[static_end..].to_vec();

        Ok(SealedBlock {
            ephemeral_public,
            encrypted_static,
            ciphertext,
        })
    }
}

fn hkdf_expand_key(chaining_key: &[u8], dh_output: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Blake2b512>::new(Some(chaining_key), dh_output);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key)
        .expect("32 bytes is a valid HKDF output length for Blake2b512");
    key
}

fn initial_chaining_key() -> [u8; 64] {
    use blake2::Digest;
    let mut hasher = Blake2b512::new();
    hasher.update(PROTOCOL_NAME);
    let digest = hasher.finalize();
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    // Each key is derived fresh per handshake step, so a fixed all-zero
    // nonce never repeats under the same key.
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(&[0u8; 12]);
    cipher
        .encrypt(nonce, plaintext)
        .expect("ChaCha20-Poly1305 encryption of a bounded plaintext cannot fail")
}

fn aead_decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(&[0u8; 12]);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::AuthFail)
}

/// Seal a block plaintext for `recipient_static_public`, authenticating the
/// sender via `sender_static_secret`.
///
/// `plaintext` must be exactly [`BLOCK_PLAINTEXT_SIZE`] bytes — callers
/// seal one serialized [`crate::Block`] frame at a time.
pub fn seal<R: RngCore + CryptoRng>(
    plaintext: &[u8; BLOCK_PLAINTEXT_SIZE],
    sender_static_secret: &StaticSecret,
    recipient_static_public: &PublicKey,
    rng: &mut R,
) -> SealedBlock {
    let ephemeral_secret = StaticSecret::random_from_rng(rng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let ck0 = initial_chaining_key();

    let es = ephemeral_secret.diffie_hellman(recipient_static_public);
    let k1 = hkdf_expand_key(&ck0, es.as_bytes(), b"noise-x-static");

    let sender_static_public = PublicKey::from(sender_static_secret);
    let encrypted_static = aead_encrypt(&k1, sender_static_public.as_bytes());

    let ss = sender_static_secret.diffie_hellman(recipient_static_public);
    let k2 = hkdf_expand_key(es.as_bytes(), ss.as_bytes(), b"noise-x-payload");

    let ciphertext = aead_encrypt(&k2, plaintext);

    SealedBlock {
        ephemeral_public: ephemeral_public.to_bytes(),
        encrypted_static,
        ciphertext,
    }
}

/// Open a sealed block using the recipient's long-term static secret,
/// returning the sender's static public key and the recovered plaintext.
///
/// Fails with [`Error::AuthFail`] if either AEAD authentication step fails
/// (tampered ciphertext, wrong recipient key, or a block not actually
/// addressed to this recipient).
pub fn open(
    sealed: &SealedBlock,
    recipient_static_secret: &StaticSecret,
) -> Result<(PublicKey, [u8; BLOCK_PLAINTEXT_SIZE])> {
    let ephemeral_public = PublicKey::from(sealed.ephemeral_public);

    let ck0 = initial_chaining_key();

    let es = recipient_static_secret.diffie_hellman(&ephemeral_public);
    let k1 = hkdf_expand_key(&ck0, es.as_bytes(), b"noise-x-static");

    let sender_static_bytes = aead_decrypt(&k1, &sealed.encrypted_static)?;
    let sender_static_public = PublicKey::from(
        <[u8; PUBLIC_KEY_SIZE]>::try_from(sender_static_bytes.as_slice())
            .map_err(|_| Error::BadFrame)?,
    );

    let ss = recipient_static_secret.diffie_hellman(&sender_static_public);
    let k2 = hkdf_expand_key(es.as_bytes(), ss.as_bytes(), b"noise-x-payload");

    let plaintext_vec = aead_decrypt(&k2, &sealed.ciphertext)?;
    let plaintext: [u8; BLOCK_PLAINTEXT_SIZE] = plaintext_vec
        .as_slice()
        .try_into()
        .map_err(|_| Error::BadFrame)?;

    Ok((sender_static_public, plaintext))
}
