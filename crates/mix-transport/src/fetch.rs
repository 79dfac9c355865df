//! Provider fetch/ACK loop: polls the provider for queued frames, dispatches
//! them by kind, and reassembles complete messages from their blocks.
//!
//! Every fetch request carries a monotonically increasing 32-bit sequence
//! number so a provider (or an observer) cannot trivially replay a stale
//! response into a later poll; a reply whose echoed sequence disagrees tears
//! the session down rather than being silently accepted. Polling itself is
//! adaptively paced: an empty mailbox backs off geometrically up to a
//! ceiling, while a `queue_size_hint > 0` tells the caller to drain again
//! immediately instead of waiting out the pacing interval.

use crate::link::LinkSession;
use crate::sphinx::SphinxPrimitive;
use crate::store::{EgressStore, IngressRecord};
use crate::{Result, TransportError};
use mix_crypto::{noise, Block};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, trace, warn};
use x25519_dalek::StaticSecret;

const FRAME_TAG_ACK: u8 = 0x01;
const FRAME_TAG_MESSAGE: u8 = 0x02;

/// Outcome of a single fetch poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// The provider had nothing queued.
    Empty,
    /// An acknowledgment for a previously-sent block, its SURB-keyed
    /// payload already verified to be all-zero.
    Ack {
        /// SURB identifier of the acknowledged send.
        surb_id: [u8; 16],
    },
    /// One block of an incoming message was received (and, if it completed
    /// the message, reassembled and recorded for delivery).
    Message {
        /// Identifier of the message this block belongs to.
        message_id: [u8; 16],
        /// This block's index.
        index: u16,
        /// Declared total block count for the message.
        total: u16,
        /// Set once every block `0..total` has arrived and the message was
        /// reassembled and handed to [`EgressStore::put_assembled`].
        completed: bool,
    },
}

/// Adaptive polling cadence: backs off geometrically on repeated empty
/// polls, resets on any non-empty response. A positive `queue_size_hint`
/// overrides this entirely in favor of an immediate redrain.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    /// Interval used immediately after a non-empty poll.
    pub min_interval: Duration,
    /// Ceiling the backoff never exceeds.
    pub max_interval: Duration,
    /// Multiplier applied to the interval after each consecutive empty poll.
    pub backoff_factor: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            backoff_factor: 1.5,
        }
    }
}

impl PacingConfig {
    /// The interval to wait before the next poll, given how many
    /// consecutive empty polls have just occurred (0 if the last poll was
    /// non-empty).
    pub fn interval_for(&self, consecutive_empty: u32) -> Duration {
        let scaled = self.min_interval.as_secs_f64() * self.backoff_factor.powi(consecutive_empty as i32);
        Duration::from_secs_f64(scaled.min(self.max_interval.as_secs_f64()))
    }
}

/// The provider fetch/ACK loop for one identity.
pub struct FetchLoop<S: EgressStore> {
    store: Arc<S>,
    sequence: AtomicU32,
}

impl<S: EgressStore> FetchLoop<S> {
    /// Construct a fetch loop backed by `store`, starting its request
    /// sequence counter at zero.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            sequence: AtomicU32::new(0),
        }
    }

    /// Poll once: send `RetrieveMessage{sequence}` over `link`, unwrap the
    /// reply with `sphinx`/`our_secret` if it carries a message, verify its
    /// echoed sequence, and dispatch by kind. Returns the dispatched event
    /// together with the provider's `queue_size_hint` (0 for an empty
    /// mailbox), which the caller should use to pace the next poll.
    pub async fn once_fetch<P: SphinxPrimitive>(
        &self,
        link: &dyn LinkSession,
        sphinx: &P,
        our_secret: &StaticSecret,
        now_ms: u64,
    ) -> Result<(FetchEvent, u8)> {
        let sequence = self.sequence.load(Ordering::SeqCst);

        let Some(frame) = link.fetch_frame(sequence).await? else {
            trace!("fetch poll returned empty mailbox");
            return Ok((FetchEvent::Empty, 0));
        };

        if frame.is_empty() {
            return Err(TransportError::Protocol("empty fetch response frame".into()));
        }

        match frame[0] {
            FRAME_TAG_ACK => {
                let (surb_id, rseq, queue_hint, payload) = Self::parse_ack_frame(&frame[1..])?;
                self.check_sequence(sequence, rseq)?;

                self.verify_ack_payload(sphinx, &surb_id, payload)?;
                self.sequence.fetch_add(1, Ordering::SeqCst);

                debug!(surb_id = hex::encode(surb_id), "received verified ACK");
                Ok((FetchEvent::Ack { surb_id }, queue_hint))
            }
            FRAME_TAG_MESSAGE => {
                let (rseq, queue_hint, payload) = Self::parse_message_frame(&frame[1..])?;
                self.check_sequence(sequence, rseq)?;

                let (_surb, mut block_ciphertext) = sphinx.parse_delivered_frame(payload)?;
                // The Sphinx payload is zero-padded out to a fixed size;
                // the sealed block itself has a fixed, known length.
                block_ciphertext.truncate(mix_crypto::SEALED_BLOCK_SIZE);
                let sealed = mix_crypto::SealedBlock::from_bytes(&block_ciphertext)?;
                let (sender_public, plaintext) = noise::open(&sealed, our_secret)?;
                let sender_key = *sender_public.as_bytes();
                let block = Block::deserialize(&plaintext)?;

                self.store.put_ingress(IngressRecord {
                    message_id: block.message_id,
                    sender_key,
                    index: block.index,
                    total: block.total,
                    payload: block.payload.clone(),
                    received_at_ms: now_ms,
                })?;

                let completed = self.try_reassemble(&block.message_id, block.total, &sender_key)?;
                self.sequence.fetch_add(1, Ordering::SeqCst);

                Ok((
                    FetchEvent::Message {
                        message_id: block.message_id,
                        index: block.index,
                        total: block.total,
                        completed,
                    },
                    queue_hint,
                ))
            }
            other => Err(TransportError::Protocol(format!("unknown fetch frame tag {other}"))),
        }
    }

    /// Reject a reply whose echoed sequence disagrees with what we sent,
    /// per the sequence-mismatch scenario: the session must be torn down
    /// and the local counter left unadvanced, which falling through to an
    /// `Err` without touching `self.sequence` achieves.
    fn check_sequence(&self, expected: u32, got: u32) -> Result<()> {
        if expected != got {
            return Err(TransportError::Protocol(format!(
                "fetch sequence mismatch: sent {expected}, provider echoed {got}"
            )));
        }
        Ok(())
    }

    /// Look up the SURB keys this ACK's `surb_id` was issued under,
    /// iteratively peel them off `payload` via `sphinx`, and constant-time
    /// verify the recovered plaintext is all-zero bytes.
    fn verify_ack_payload<P: SphinxPrimitive>(&self, sphinx: &P, surb_id: &[u8; 16], payload: &[u8]) -> Result<()> {
        let Some(keys_bytes) = self.store.get_surb_keys(surb_id)? else {
            return Err(TransportError::Protocol(
                "ACK for unknown or already-acknowledged SURB".into(),
            ));
        };
        let keys: crate::sphinx::SurbKeys = bincode::deserialize(&keys_bytes)
            .map_err(|e| TransportError::Fatal(format!("decoding SURB keys: {e}")))?;

        let opened = sphinx.decrypt_surb_payload(&keys, payload)?;
        let zeros = vec![0u8; opened.len()];
        if opened.ct_eq(&zeros).unwrap_u8() != 1 {
            return Err(TransportError::Protocol("non-zero ACK payload".into()));
        }
        Ok(())
    }

    fn parse_ack_frame(frame: &[u8]) -> Result<([u8; 16], u32, u8, &[u8])> {
        if frame.len() < 16 + 4 + 1 {
            return Err(TransportError::Protocol("malformed ACK frame".into()));
        }
        let mut surb_id = [0u8; 16];
        surb_id.copy_from_slice(&frame[0..16]);
        let sequence = u32::from_be_bytes(frame[16..20].try_into().expect("4 bytes"));
        let queue_hint = frame[20];
        Ok((surb_id, sequence, queue_hint, &frame[21..]))
    }

    fn parse_message_frame(frame: &[u8]) -> Result<(u32, u8, &[u8])> {
        if frame.len() < 4 + 1 {
            return Err(TransportError::Protocol("malformed message frame".into()));
        }
        let sequence = u32::from_be_bytes(frame[0..4].try_into().expect("4 bytes"));
        let queue_hint = frame[4];
        Ok((sequence, queue_hint, &frame[5..]))
    }

    /// Check whether every fragment `0..total` of `message_id` has arrived;
    /// if so, reassemble, record the assembled message, and clean up the
    /// fragment group.
    ///
    /// A `message_id` collision between two different senders (or a
    /// fragment declaring a different `total`) is a sibling-consistency
    /// violation, not a protocol error: such fragments are simply excluded
    /// from this reassembly attempt and left for whichever message they
    /// actually belong to, rather than tearing the fetch session down.
    fn try_reassemble(&self, message_id: &[u8; 16], total: u16, sender_key: &[u8; 32]) -> Result<bool> {
        let mut group = self.store.get_ingress_group(message_id)?;
        group.dedup_by_key(|r| r.index);

        let (matching, mismatched): (Vec<_>, Vec<_>) =
            group.into_iter().partition(|r| r.total == total && &r.sender_key == sender_key);
        group = matching;
        if !mismatched.is_empty() {
            warn!(
                message_id = hex::encode(message_id),
                discarded = mismatched.len(),
                "discarding sibling fragments inconsistent on total or sender key"
            );
        }

        if group.len() < total as usize {
            return Ok(false);
        }

        group.sort_by_key(|r| r.index);
        let blocks: Vec<Block> = group
            .into_iter()
            .map(|r| Block {
                message_id: *message_id,
                total: r.total,
                index: r.index,
                length: r.payload.len() as u32,
                payload: r.payload,
            })
            .collect();

        let assembled = Block::reassemble(&blocks);
        self.store.put_assembled(*message_id, assembled)?;
        self.store.remove_ingress(message_id)?;
        debug!(message_id = hex::encode(message_id), "message reassembled");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::test_support::LoopbackLink;
    use crate::sphinx::{ReferenceSphinx, SurbKeys};
    use crate::store::InMemoryEgressStore;
    use chacha20poly1305::aead::{Aead, KeyInit};
    use chacha20poly1305::{ChaCha20Poly1305, Nonce};

    struct NeverCalled;
    impl SphinxPrimitive for NeverCalled {
        fn new_packet<R: rand_core::RngCore + rand_core::CryptoRng>(
            &self,
            _route: &crate::Route,
            _block_ciphertext: &[u8],
            _surb: Option<&[u8]>,
            _rng: &mut R,
        ) -> Result<Vec<u8>> {
            unreachable!()
        }
        fn new_surb<R: rand_core::RngCore + rand_core::CryptoRng>(
            &self,
            _reply_route: &crate::Route,
            _rng: &mut R,
        ) -> Result<(Vec<u8>, SurbKeys)> {
            unreachable!()
        }
        fn unwrap(&self, _packet: &[u8], _our_secret: &StaticSecret) -> Result<crate::sphinx::UnwrapResult> {
            unreachable!()
        }
        fn decrypt_surb_payload(&self, _keys: &SurbKeys, _payload: &[u8]) -> Result<Vec<u8>> {
            unreachable!()
        }
        fn parse_delivered_frame(&self, _frame: &[u8]) -> Result<(Option<Vec<u8>>, Vec<u8>)> {
            unreachable!()
        }
    }

    fn encrypt_layers(keys: &SurbKeys, plaintext: &[u8]) -> Vec<u8> {
        let mut sealed = plaintext.to_vec();
        for key in keys.layer_keys.iter().rev() {
            let cipher = ChaCha20Poly1305::new(key.into());
            let nonce = Nonce::from_slice(&[0u8; 12]);
            sealed = cipher.encrypt(nonce, sealed.as_slice()).expect("encrypt layer");
        }
        sealed
    }

    #[tokio::test]
    async fn empty_mailbox_yields_empty_event() {
        let store = Arc::new(InMemoryEgressStore::new());
        let fetch_loop = FetchLoop::new(store);
        let link = LoopbackLink::default();

        let secret = StaticSecret::random_from_rng(&mut rand::thread_rng());
        let (event, queue_hint) = fetch_loop
            .once_fetch(&link, &NeverCalled, &secret, 0)
            .await
            .expect("fetch");
        assert_eq!(event, FetchEvent::Empty);
        assert_eq!(queue_hint, 0);
    }

    #[tokio::test]
    async fn ack_with_zero_payload_is_accepted_and_cancels() {
        let store = Arc::new(InMemoryEgressStore::new());
        let surb_id = [7u8; 16];
        let keys = SurbKeys {
            layer_keys: vec![[1u8; 32], [2u8; 32]],
        };
        store
            .put(crate::store::EgressRecord {
                surb_id,
                message_id: [0u8; 16],
                block_index: 0,
                sealed_block: vec![],
                route_context: crate::store::RouteContext {
                    sender_provider: crate::NodeId::new([0; 32]),
                    sender_provider_layer: 0,
                    recipient_provider: crate::NodeId::new([0; 32]),
                    recipient_provider_layer: 0,
                    recipient_mailbox_id: [0; 32],
                    sender_mailbox_id: [0; 32],
                },
                surb_keys: bincode::serialize(&keys).expect("encode"),
                sent_at_ms: 0,
                deadline_ms: 0,
                retransmit_count: 0,
            })
            .expect("seed record");

        let fetch_loop = FetchLoop::new(store);
        let link = LoopbackLink::default();

        let sealed = encrypt_layers(&keys, &[0u8; 32]);
        let mut frame = vec![FRAME_TAG_ACK];
        frame.extend_from_slice(&surb_id);
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.push(3); // queue_size_hint
        frame.extend_from_slice(&sealed);
        link.inbox.lock().await.push_back(frame);

        let secret = StaticSecret::random_from_rng(&mut rand::thread_rng());
        let (event, queue_hint) = fetch_loop
            .once_fetch(&link, &ReferenceSphinx, &secret, 0)
            .await
            .expect("fetch");
        assert_eq!(event, FetchEvent::Ack { surb_id });
        assert_eq!(queue_hint, 3);
    }

    #[tokio::test]
    async fn ack_with_nonzero_payload_is_rejected() {
        let store = Arc::new(InMemoryEgressStore::new());
        let surb_id = [8u8; 16];
        let keys = SurbKeys {
            layer_keys: vec![[5u8; 32]],
        };
        store
            .put(crate::store::EgressRecord {
                surb_id,
                message_id: [0u8; 16],
                block_index: 0,
                sealed_block: vec![],
                route_context: crate::store::RouteContext {
                    sender_provider: crate::NodeId::new([0; 32]),
                    sender_provider_layer: 0,
                    recipient_provider: crate::NodeId::new([0; 32]),
                    recipient_provider_layer: 0,
                    recipient_mailbox_id: [0; 32],
                    sender_mailbox_id: [0; 32],
                },
                surb_keys: bincode::serialize(&keys).expect("encode"),
                sent_at_ms: 0,
                deadline_ms: 0,
                retransmit_count: 0,
            })
            .expect("seed record");

        let fetch_loop = FetchLoop::new(store);
        let link = LoopbackLink::default();

        let mut tampered_plaintext = [0u8; 16];
        tampered_plaintext[0] = 1;
        let sealed = encrypt_layers(&keys, &tampered_plaintext);
        let mut frame = vec![FRAME_TAG_ACK];
        frame.extend_from_slice(&surb_id);
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.push(0);
        frame.extend_from_slice(&sealed);
        link.inbox.lock().await.push_back(frame);

        let secret = StaticSecret::random_from_rng(&mut rand::thread_rng());
        let err = fetch_loop
            .once_fetch(&link, &ReferenceSphinx, &secret, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn sequence_mismatch_is_rejected_and_counter_unchanged() {
        let store = Arc::new(InMemoryEgressStore::new());
        let fetch_loop = FetchLoop::new(store);
        let link = LoopbackLink::default();

        let mut frame = vec![FRAME_TAG_ACK];
        frame.extend_from_slice(&[0u8; 16]);
        frame.extend_from_slice(&99u32.to_be_bytes()); // provider echoes the wrong sequence
        frame.push(0);
        link.inbox.lock().await.push_back(frame);

        let secret = StaticSecret::random_from_rng(&mut rand::thread_rng());
        let err = fetch_loop
            .once_fetch(&link, &NeverCalled, &secret, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert_eq!(fetch_loop.sequence.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pacing_backs_off_then_is_capped() {
        let pacing = PacingConfig::default();
        let first = pacing.interval_for(0);
        let later = pacing.interval_for(10);
        assert!(later >= first);
        assert!(later <= pacing.max_interval);
    }

    #[test]
    fn reassembly_discards_inconsistent_siblings_without_erroring() {
        let store = Arc::new(InMemoryEgressStore::new());
        let fetch_loop = FetchLoop::new(store);
        let message_id = [1u8; 16];
        let sender_key = [9u8; 32];
        fetch_loop
            .store
            .put_ingress(IngressRecord {
                message_id,
                sender_key,
                index: 0,
                total: 2,
                payload: vec![1],
                received_at_ms: 0,
            })
            .expect("put_ingress");
        // Declares a different total under the same message_id — a sibling
        // inconsistency, not a different sender in this case.
        fetch_loop
            .store
            .put_ingress(IngressRecord {
                message_id,
                sender_key,
                index: 1,
                total: 3,
                payload: vec![2],
                received_at_ms: 0,
            })
            .expect("put_ingress");

        let completed = fetch_loop
            .try_reassemble(&message_id, 2, &sender_key)
            .expect("mismatched siblings are discarded, not an error");
        assert!(!completed);
    }

    #[test]
    fn reassembly_discards_fragments_from_a_different_sender() {
        let store = Arc::new(InMemoryEgressStore::new());
        let fetch_loop = FetchLoop::new(store.clone());
        let message_id = [3u8; 16];
        let sender_a = [1u8; 32];
        let sender_b = [2u8; 32];

        store
            .put_ingress(IngressRecord {
                message_id,
                sender_key: sender_a,
                index: 0,
                total: 2,
                payload: vec![1],
                received_at_ms: 0,
            })
            .expect("put_ingress");
        store
            .put_ingress(IngressRecord {
                message_id,
                sender_key: sender_b,
                index: 1,
                total: 2,
                payload: vec![2],
                received_at_ms: 0,
            })
            .expect("put_ingress");

        let completed = fetch_loop
            .try_reassemble(&message_id, 2, &sender_a)
            .expect("try_reassemble");
        assert!(!completed, "only one of the two senders' fragments counts toward this message");
    }

    #[test]
    fn reassembly_waits_for_all_fragments() {
        let store = Arc::new(InMemoryEgressStore::new());
        let fetch_loop = FetchLoop::new(store.clone());
        let message_id = [2u8; 16];
        let sender_key = [4u8; 32];
        store
            .put_ingress(IngressRecord {
                message_id,
                sender_key,
                index: 0,
                total: 2,
                payload: vec![1],
                received_at_ms: 0,
            })
            .expect("put_ingress");

        let completed = fetch_loop.try_reassemble(&message_id, 2, &sender_key).expect("try_reassemble");
        assert!(!completed);

        store
            .put_ingress(IngressRecord {
                message_id,
                sender_key,
                index: 1,
                total: 2,
                payload: vec![2],
                received_at_ms: 0,
            })
            .expect("put_ingress");
        let completed = fetch_loop.try_reassemble(&message_id, 2, &sender_key).expect("try_reassemble");
        assert!(completed);
        assert_eq!(store.list_assembled().expect("list").len(), 1);
    }
}
