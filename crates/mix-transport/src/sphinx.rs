//! Sphinx packet construction: the black-box onion-routing primitive this
//! crate's route builder and fetch loop depend on.
//!
//! Sphinx itself is out of scope for this specification — real deployments
//! swap in a standards-track implementation behind the [`SphinxPrimitive`]
//! trait. [`ReferenceSphinx`] is the one concrete implementation this
//! workspace ships, satisfying the trait's contract (MAC-protected onion
//! layers, SURB construction and SURB-keyed reply decryption) well enough
//! to drive the rest of the system end to end in tests.
//!
//! Packets are padded to a fixed size so that no observer can distinguish
//! forward traffic from cover traffic or reply traffic by length alone.
//!
//! Plaintext frame carried inside the innermost payload layer, once fully
//! unwrapped at the destination:
//!
//! ```text
//! flags        : u8      (bit 0: SURB present)
//! reserved     : u8
//! surb_length  : u16 BE  (0 if flags bit 0 is clear)
//! surb_bytes   : [u8; surb_length]
//! block_ciphertext : remainder of the payload
//! ```

use crate::{Result, Route, TransportError};
use blake2::Blake2b512;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

/// Fixed packet size for traffic-analysis resistance.
pub const PACKET_SIZE: usize = 32 * 1024;

/// Size of the Sphinx header (onion-encrypted routing information).
pub const HEADER_SIZE: usize = 1024;

/// Size of the payload section.
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE;

/// Maximum number of hops a route may have.
pub const MAX_HOPS: usize = 5;

const ROUTING_ENTRY_SIZE: usize = 64;
const MAC_SIZE: usize = 16;

/// Routing command decoded by a mix at one onion layer.
#[derive(Debug, Clone)]
pub enum RoutingCommand {
    /// Forward to the next hop after the given delay.
    Relay {
        /// Next hop's network address.
        next_address: String,
        /// Delay in milliseconds to hold the packet before forwarding.
        delay_ms: u32,
    },
    /// Final hop: deliver to the named mailbox.
    Deliver {
        /// Mailbox identifier.
        mailbox_id: [u8; 32],
    },
}

/// Result of peeling one onion layer off a Sphinx packet.
pub struct UnwrapResult {
    /// The routing command carried at this layer.
    pub command: RoutingCommand,
    /// The packet to forward, with this layer removed (meaningless once
    /// `command` is `Deliver`, at which point `final_payload` is relevant
    /// instead).
    pub next_packet: Vec<u8>,
    /// The innermost plaintext frame, populated only once the last layer
    /// has been peeled (i.e. when `command` is `Deliver`).
    pub final_payload: Option<Vec<u8>>,
}

/// Key material recovered from constructing a SURB, needed later to
/// decrypt whatever the recipient encrypts under it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SurbKeys {
    /// Per-hop payload keys, innermost-last, mirroring the forward path's
    /// own per-hop keys so the reply payload can be unwrapped the same way.
    pub layer_keys: Vec<[u8; 32]>,
}

/// Sphinx packet construction, onion-unwrapping, and SURB handling.
///
/// This crate depends only on this trait; [`ReferenceSphinx`] is the one
/// implementation the workspace ships.
pub trait SphinxPrimitive: Send + Sync {
    /// Build a forward Sphinx packet carrying `block_ciphertext` (a sealed
    /// block) to `route`'s final hop, optionally piggybacking a `surb` for
    /// an anonymous reply.
    fn new_packet<R: RngCore + CryptoRng>(
        &self,
        route: &Route,
        block_ciphertext: &[u8],
        surb: Option<&[u8]>,
        rng: &mut R,
    ) -> Result<Vec<u8>>;

    /// Pre-construct a reply path (a SURB) through `reply_route`, returning
    /// its wire bytes (to embed in an outgoing packet) and the key
    /// material needed later to decrypt a reply sent along it.
    fn new_surb<R: RngCore + CryptoRng>(
        &self,
        reply_route: &Route,
        rng: &mut R,
    ) -> Result<(Vec<u8>, SurbKeys)>;

    /// Peel one onion layer using `our_secret`.
    fn unwrap(&self, packet: &[u8], our_secret: &StaticSecret) -> Result<UnwrapResult>;

    /// Decrypt a reply payload using the key material returned by
    /// `new_surb` when that SURB was constructed.
    fn decrypt_surb_payload(&self, keys: &SurbKeys, payload: &[u8]) -> Result<Vec<u8>>;

    /// Parse a mailbox-delivered plaintext frame (the `final_payload` a
    /// mix produces on `unwrap`-ing the last onion layer) into its
    /// optional embedded SURB and block ciphertext.
    fn parse_delivered_frame(&self, frame: &[u8]) -> Result<(Option<Vec<u8>>, Vec<u8>)>;
}

/// The workspace's one concrete [`SphinxPrimitive`]: MAC-protected onion
/// layers sealed with X25519 + ChaCha20-Poly1305, keys derived via HKDF
/// over BLAKE2b.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceSphinx;

impl ReferenceSphinx {
    fn derive_layer_keys(shared_secret: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
        let hk = Hkdf::<Blake2b512>::new(None, shared_secret);
        let mut routing_key = [0u8; 32];
        let mut payload_key = [0u8; 32];
        hk.expand(b"sphinx-routing", &mut routing_key)
            .expect("32 bytes is valid for HKDF<Blake2b512>");
        hk.expand(b"sphinx-payload", &mut payload_key)
            .expect("32 bytes is valid for HKDF<Blake2b512>");
        (routing_key, payload_key)
    }

    fn mac(secret: &[u8; 32], data: &[u8]) -> [u8; MAC_SIZE] {
        use blake2::digest::{Update, VariableOutput};
        use blake2::Blake2bVar;
        let mut hasher = Blake2bVar::new(MAC_SIZE).expect("MAC_SIZE is a valid Blake2b output length");
        hasher.update(secret);
        hasher.update(data);
        let mut out = [0u8; MAC_SIZE];
        hasher
            .finalize_variable(&mut out)
            .expect("output buffer matches requested length");
        out
    }

    fn aead_encrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(key.into());
        let nonce = Nonce::from_slice(&[0u8; 12]);
        cipher
            .encrypt(nonce, data)
            .map_err(|e| TransportError::Protocol(format!("layer encryption failed: {e}")))
    }

    fn aead_decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(key.into());
        let nonce = Nonce::from_slice(&[0u8; 12]);
        cipher
            .decrypt(nonce, data)
            .map_err(|_| TransportError::Protocol("layer decryption failed".into()))
    }

    fn build_plaintext_frame(surb: Option<&[u8]>, block_ciphertext: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + surb.map_or(0, <[u8]>::len) + block_ciphertext.len());
        let flags: u8 = if surb.is_some() { 0x01 } else { 0x00 };
        frame.push(flags);
        frame.push(0u8);
        let surb_len = surb.map_or(0, <[u8]>::len) as u16;
        frame.extend_from_slice(&surb_len.to_be_bytes());
        if let Some(surb) = surb {
            frame.extend_from_slice(surb);
        }
        frame.extend_from_slice(block_ciphertext);
        frame
    }

    fn parse_plaintext_frame(frame: &[u8]) -> Result<(Option<Vec<u8>>, Vec<u8>)> {
        if frame.len() < 4 {
            return Err(TransportError::Protocol("plaintext frame too short".into()));
        }
        let flags = frame[0];
        let surb_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        let surb_start = 4;
        let surb_end = surb_start + surb_len;
        if frame.len() < surb_end {
            return Err(TransportError::Protocol("plaintext frame truncated".into()));
        }
        let surb = if flags & 0x01 != 0 {
            Some(frame[surb_start..surb_end].to_vec())
        } else {
            None
        };
        let block_ciphertext = frame[surb_end..].to_vec();
        Ok((surb, block_ciphertext))
    }
}

impl SphinxPrimitive for ReferenceSphinx {
    fn new_packet<R: RngCore + CryptoRng>(
        &self,
        route: &Route,
        block_ciphertext: &[u8],
        surb: Option<&[u8]>,
        rng: &mut R,
    ) -> Result<Vec<u8>> {
        if route.hops.is_empty() {
            return Err(TransportError::Input("route must have at least one hop".into()));
        }
        if route.hops.len() > MAX_HOPS {
            return Err(TransportError::Input("route exceeds MAX_HOPS".into()));
        }

        let plaintext = Self::build_plaintext_frame(surb, block_ciphertext);
        if plaintext.len() > PAYLOAD_SIZE - MAC_SIZE {
            return Err(TransportError::Input("payload too large for one Sphinx packet".into()));
        }

        let hop_secrets: Vec<StaticSecret> = (0..route.hops.len())
            .map(|_| StaticSecret::random_from_rng(&mut *rng))
            .collect();

        let shared_secrets: Vec<[u8; 32]> = route
            .hops
            .iter()
            .zip(hop_secrets.iter())
            .map(|(hop, secret)| *secret.diffie_hellman(&PublicKey::from(hop.key)).as_bytes())
            .collect();

        let routing_info = Self::build_routing_info(route)?;
        let encrypted_routing = Self::layer_encrypt_routing(&routing_info, &shared_secrets)?;

        let mut padded_payload = plaintext;
        padded_payload.resize(PAYLOAD_SIZE - MAC_SIZE, 0);
        let mut encrypted_payload = padded_payload;
        for secret in shared_secrets.iter().rev() {
            let (_, payload_key) = Self::derive_layer_keys(secret);
            encrypted_payload = Self::aead_encrypt(&payload_key, &encrypted_payload)?;
        }

        let mac = Self::mac(&shared_secrets[0], &encrypted_routing);

        let mut out = Vec::with_capacity(PACKET_SIZE);
        out.extend_from_slice(PublicKey::from(&hop_secrets[0]).as_bytes());
        out.extend_from_slice(&mac);
        out.extend_from_slice(&encrypted_routing);
        out.resize(out.len().max(HEADER_SIZE), 0);
        out.truncate(HEADER_SIZE);
        out.extend_from_slice(&encrypted_payload);
        out.resize(PACKET_SIZE, 0);

        Ok(out)
    }

    fn new_surb<R: RngCore + CryptoRng>(
        &self,
        reply_route: &Route,
        rng: &mut R,
    ) -> Result<(Vec<u8>, SurbKeys)> {
        // A SURB is, mechanically, a pre-built header plus the layer keys
        // needed to decrypt whatever payload travels back along it; we
        // reuse the forward-packet header construction for the header
        // itself (with an empty plaintext placeholder) and hand the caller
        // the keys separately.
        let placeholder = Self::build_plaintext_frame(None, &[]);
        let mut padded = placeholder;
        padded.resize(PAYLOAD_SIZE - MAC_SIZE, 0);

        let hop_secrets: Vec<StaticSecret> = (0..reply_route.hops.len())
            .map(|_| StaticSecret::random_from_rng(&mut *rng))
            .collect();
        let shared_secrets: Vec<[u8; 32]> = reply_route
            .hops
            .iter()
            .zip(hop_secrets.iter())
            .map(|(hop, secret)| *secret.diffie_hellman(&PublicKey::from(hop.key)).as_bytes())
            .collect();

        let routing_info = Self::build_routing_info(reply_route)?;
        let encrypted_routing = Self::layer_encrypt_routing(&routing_info, &shared_secrets)?;
        let mac = Self::mac(&shared_secrets[0], &encrypted_routing);

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(PublicKey::from(&hop_secrets[0]).as_bytes());
        header.extend_from_slice(&mac);
        header.extend_from_slice(&encrypted_routing);
        header.resize(HEADER_SIZE, 0);

        let layer_keys = shared_secrets
            .iter()
            .map(|s| Self::derive_layer_keys(s).1)
            .collect();

        Ok((header, SurbKeys { layer_keys }))
    }

    fn unwrap(&self, packet: &[u8], our_secret: &StaticSecret) -> Result<UnwrapResult> {
        if packet.len() != PACKET_SIZE {
            return Err(TransportError::Protocol("packet has wrong size".into()));
        }

        let ephemeral_public = PublicKey::from(
            <[u8; 32]>::try_from(&packet[0..32]).expect("slice is 32 bytes"),
        );
        let mac = &packet[32..32 + MAC_SIZE];
        let encrypted_routing = &packet[32 + MAC_SIZE..HEADER_SIZE];
        let encrypted_payload = &packet[HEADER_SIZE..];

        let shared_secret = our_secret.diffie_hellman(&ephemeral_public);
        let shared_secret_bytes = *shared_secret.as_bytes();

        let expected_mac = Self::mac(&shared_secret_bytes, encrypted_routing);
        if expected_mac.as_slice() != mac {
            return Err(TransportError::Protocol("Sphinx MAC verification failed".into()));
        }

        let (routing_key, payload_key) = Self::derive_layer_keys(&shared_secret_bytes);

        let decrypted_routing = Self::aead_decrypt(&routing_key, encrypted_routing)
            .map_err(|_| TransportError::Protocol("routing layer decryption failed".into()))?;
        let (command, remaining_routing) = Self::parse_routing_entry(&decrypted_routing)?;

        let decrypted_payload = Self::aead_decrypt(&payload_key, encrypted_payload)?;

        match command {
            RoutingCommand::Deliver { .. } => {
                let (_surb, _block_ciphertext) = Self::parse_plaintext_frame(&decrypted_payload)?;
                Ok(UnwrapResult {
                    command,
                    next_packet: Vec::new(),
                    final_payload: Some(decrypted_payload),
                })
            }
            RoutingCommand::Relay { .. } => {
                let mut next_packet = Vec::with_capacity(PACKET_SIZE);
                // Re-blind the ephemeral key for the next hop using the
                // shared secret as blinding material, mirroring standard
                // Sphinx header re-randomization.
                let hk = Hkdf::<Blake2b512>::new(Some(&shared_secret_bytes), ephemeral_public.as_bytes());
                let mut next_ephemeral = [0u8; 32];
                hk.expand(b"sphinx-blind", &mut next_ephemeral)
                    .expect("32 bytes is valid for HKDF<Blake2b512>");
                next_packet.extend_from_slice(&next_ephemeral);
                let next_mac = &remaining_routing[..MAC_SIZE.min(remaining_routing.len())];
                let mut mac_buf = [0u8; MAC_SIZE];
                mac_buf[..next_mac.len()].copy_from_slice(next_mac);
                next_packet.extend_from_slice(&mac_buf);
                next_packet.extend_from_slice(&remaining_routing[MAC_SIZE.min(remaining_routing.len())..]);
                next_packet.resize(HEADER_SIZE, 0);
                next_packet.extend_from_slice(&decrypted_payload);
                next_packet.resize(PACKET_SIZE, 0);

                Ok(UnwrapResult {
                    command,
                    next_packet,
                    final_payload: None,
                })
            }
        }
    }

    fn decrypt_surb_payload(&self, keys: &SurbKeys, payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = payload.to_vec();
        for key in &keys.layer_keys {
            out = Self::aead_decrypt(key, &out)?;
        }
        Ok(out)
    }

    fn parse_delivered_frame(&self, frame: &[u8]) -> Result<(Option<Vec<u8>>, Vec<u8>)> {
        Self::parse_plaintext_frame(frame)
    }
}

impl ReferenceSphinx {
    fn build_routing_info(route: &Route) -> Result<Vec<u8>> {
        let mut info = Vec::new();
        for (i, hop) in route.hops.iter().enumerate() {
            let mut entry = Vec::with_capacity(ROUTING_ENTRY_SIZE);
            if i == route.hops.len() - 1 {
                entry.push(0x02);
                entry.extend_from_slice(&hop.mailbox_id.unwrap_or([0u8; 32]));
            } else {
                entry.push(0x01);
                let next_addr = route.hops[i + 1].address.as_bytes();
                entry.push(next_addr.len() as u8);
                entry.extend_from_slice(next_addr);
                entry.extend_from_slice(&hop.delay_ms.to_be_bytes());
            }
            entry.resize(ROUTING_ENTRY_SIZE, 0);
            info.extend_from_slice(&entry);
        }
        Ok(info)
    }

    fn layer_encrypt_routing(routing: &[u8], secrets: &[[u8; 32]]) -> Result<Vec<u8>> {
        let mut encrypted = routing.to_vec();
        for secret in secrets.iter().rev() {
            let (routing_key, _) = Self::derive_layer_keys(secret);
            encrypted = Self::aead_encrypt(&routing_key, &encrypted)?;
        }
        Ok(encrypted)
    }

    fn parse_routing_entry(data: &[u8]) -> Result<(RoutingCommand, Vec<u8>)> {
        if data.is_empty() {
            return Err(TransportError::Protocol("empty routing entry".into()));
        }
        let command = match data[0] {
            0x01 => {
                let addr_len = *data.get(1).ok_or_else(|| {
                    TransportError::Protocol("truncated relay routing entry".into())
                })? as usize;
                let addr = String::from_utf8_lossy(&data[2..2 + addr_len]).to_string();
                let delay_start = 2 + addr_len;
                let delay_ms = u32::from_be_bytes([
                    data[delay_start],
                    data[delay_start + 1],
                    data[delay_start + 2],
                    data[delay_start + 3],
                ]);
                RoutingCommand::Relay {
                    next_address: addr,
                    delay_ms,
                }
            }
            0x02 => {
                let mut mailbox_id = [0u8; 32];
                mailbox_id.copy_from_slice(&data[1..33]);
                RoutingCommand::Deliver { mailbox_id }
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "unknown routing command tag {other}"
                )))
            }
        };
        let remaining = data.get(ROUTING_ENTRY_SIZE..).unwrap_or(&[]).to_vec();
        Ok((command, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Hop;
    use crate::NodeId;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn hop(secret: &StaticSecret, address: &str, delay_ms: u32, mailbox_id: Option<[u8; 32]>) -> Hop {
        Hop {
            node: NodeId::new(PublicKey::from(secret).to_bytes()),
            key: PublicKey::from(secret).to_bytes(),
            address: address.to_string(),
            delay_ms,
            mailbox_id,
        }
    }

    #[test]
    fn new_packet_unwrap_delivers_at_final_hop() {
        let mut rng = StdRng::seed_from_u64(11);
        let s1 = StaticSecret::random_from_rng(&mut rng);
        let s2 = StaticSecret::random_from_rng(&mut rng);
        let s3 = StaticSecret::random_from_rng(&mut rng);

        let mailbox_id = [0x55u8; 32];
        let route = Route {
            hops: vec![
                hop(&s1, "127.0.0.1:9001", 10, None),
                hop(&s2, "127.0.0.1:9002", 20, None),
                hop(&s3, "127.0.0.1:9003", 0, Some(mailbox_id)),
            ],
        };

        let sphinx = ReferenceSphinx;
        let block_ciphertext = vec![0xABu8; 200];
        let packet = sphinx
            .new_packet(&route, &block_ciphertext, None, &mut rng)
            .expect("packet construction");
        assert_eq!(packet.len(), PACKET_SIZE);

        let unwrap1 = sphinx.unwrap(&packet, &s1).expect("unwrap hop 1");
        assert!(matches!(unwrap1.command, RoutingCommand::Relay { .. }));
        assert!(unwrap1.final_payload.is_none());

        let unwrap2 = sphinx.unwrap(&unwrap1.next_packet, &s2).expect("unwrap hop 2");
        assert!(matches!(unwrap2.command, RoutingCommand::Relay { .. }));

        let unwrap3 = sphinx.unwrap(&unwrap2.next_packet, &s3).expect("unwrap hop 3");
        match unwrap3.command {
            RoutingCommand::Deliver { mailbox_id: delivered } => {
                assert_eq!(delivered, mailbox_id);
            }
            _ => panic!("expected Deliver at final hop"),
        }
        let final_payload = unwrap3.final_payload.expect("final payload present");
        let (surb, recovered_block) = ReferenceSphinx::parse_plaintext_frame(&final_payload)
            .expect("parse plaintext frame");
        assert!(surb.is_none());
        assert_eq!(&recovered_block[..block_ciphertext.len()], block_ciphertext.as_slice());
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let mut rng = StdRng::seed_from_u64(12);
        let s1 = StaticSecret::random_from_rng(&mut rng);
        let s2 = StaticSecret::random_from_rng(&mut rng);

        let route = Route {
            hops: vec![
                hop(&s1, "127.0.0.1:9001", 10, None),
                hop(&s2, "127.0.0.1:9002", 0, Some([0u8; 32])),
            ],
        };

        let sphinx = ReferenceSphinx;
        let mut packet = sphinx
            .new_packet(&route, b"hi", None, &mut rng)
            .expect("packet construction");
        packet[32] ^= 0xFF;

        assert!(matches!(
            sphinx.unwrap(&packet, &s1),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn surb_round_trips_reply_payload() {
        let mut rng = StdRng::seed_from_u64(13);
        let s1 = StaticSecret::random_from_rng(&mut rng);
        let s2 = StaticSecret::random_from_rng(&mut rng);

        let route = Route {
            hops: vec![
                hop(&s1, "127.0.0.1:9001", 10, None),
                hop(&s2, "127.0.0.1:9002", 0, Some([0u8; 32])),
            ],
        };

        let sphinx = ReferenceSphinx;
        let (_header, keys) = sphinx.new_surb(&route, &mut rng).expect("surb construction");

        let reply = vec![0x11u8; 64];
        let mut sealed = reply.clone();
        for key in keys.layer_keys.iter().rev() {
            sealed = ReferenceSphinx::aead_encrypt(key, &sealed).expect("encrypt reply layer");
        }

        let recovered = sphinx
            .decrypt_surb_payload(&keys, &sealed)
            .expect("decrypt surb payload");
        assert_eq!(recovered, reply);
    }
}
