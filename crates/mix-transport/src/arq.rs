//! Stop-and-Wait ARQ scheduler.
//!
//! Every outstanding send has exactly one retransmit timer, armed to the
//! round-trip estimate plus a fixed slop; the timer fires by popping the
//! earliest deadline off a priority queue, not by polling each entry. An
//! ACK cancels the corresponding entry so a later timer fire is a no-op
//! rather than a spurious retransmit.
//!
//! Per §4.D and §9, a retransmit is not a verbatim resend: it builds a
//! fresh route and a fresh SURB, because a stale route may have rolled
//! past its epoch keys and because reusing a SURB would let an observer
//! link the retransmit to the original send. The old `surb_id` is simply
//! dropped; `cancelled` entries for it are garbage once their deadline
//! passes.

use crate::epoch::{Epoch, PkiDocument};
use crate::link::LinkSession;
use crate::route::RouteBuilder;
use crate::sphinx::SphinxPrimitive;
use crate::store::{EgressRecord, EgressStore, RouteContext, SurbId};
use crate::{Result, RouteParams, TransportError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Extra margin added on top of the round-trip estimate before a block is
/// considered overdue for retransmission, absorbing normal jitter so a
/// slightly slow ACK doesn't trigger a needless resend.
pub const RTT_SLOP_MS: u64 = 2_000;

/// Fallback retransmit interval used when a send attempt fails before a
/// route could be built (§7: transient errors get a fixed 10s schedule
/// since no `expected_round_trip` is known).
pub const FALLBACK_RETRY_MS: u64 = 10_000;

/// A live snapshot of the directory and epoch clock, refreshed by whatever
/// owns the PKI client. The ARQ scheduler consults this on every send and
/// retransmit so routes are always built against current keys.
pub trait DirectorySource: Send + Sync {
    /// The document, epoch, period, and time-to-next-epoch valid right now.
    fn snapshot(&self) -> DirectorySnapshot;
}

/// One directory snapshot, as returned by [`DirectorySource::snapshot`].
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    /// Topology document for `epoch`.
    pub document: PkiDocument,
    /// The epoch `document` was published for.
    pub epoch: Epoch,
    /// Epoch rotation period, in milliseconds.
    pub period_ms: u64,
    /// Milliseconds remaining until the network rolls to `epoch.next()`.
    pub time_to_next_epoch_ms: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct QueueEntry {
    deadline_ms: u64,
    surb_id: SurbId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so a `BinaryHeap` (normally max-first) pops the
        // earliest deadline first.
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.surb_id.cmp(&self.surb_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The Stop-and-Wait ARQ scheduler for one identity's outstanding sends.
pub struct ArqScheduler<S: EgressStore, P: SphinxPrimitive> {
    store: Arc<S>,
    sphinx: Arc<P>,
    directory: Arc<dyn DirectorySource>,
    route_builder: RouteBuilder,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    cancelled: Mutex<HashSet<SurbId>>,
    rng: Mutex<StdRng>,
    rtt_slop_ms: u64,
}

impl<S: EgressStore, P: SphinxPrimitive> ArqScheduler<S, P> {
    /// Construct a scheduler backed by `store`, `sphinx`, and `directory`,
    /// using the default [`RTT_SLOP_MS`] margin and an OS-seeded RNG.
    pub fn new(store: Arc<S>, sphinx: Arc<P>, directory: Arc<dyn DirectorySource>, route_builder: RouteBuilder) -> Self {
        Self::with_rtt_slop(store, sphinx, directory, route_builder, RTT_SLOP_MS, StdRng::from_entropy())
    }

    /// Construct a scheduler with explicit RTT slop and RNG seed, for tests
    /// that need deterministic routing decisions and tighter timing.
    pub fn with_rtt_slop(
        store: Arc<S>,
        sphinx: Arc<P>,
        directory: Arc<dyn DirectorySource>,
        route_builder: RouteBuilder,
        rtt_slop_ms: u64,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            sphinx,
            directory,
            route_builder,
            queue: Mutex::new(BinaryHeap::new()),
            cancelled: Mutex::new(HashSet::new()),
            rng: Mutex::new(rng),
            rtt_slop_ms,
        }
    }

    /// Send a sealed block for the first time: build a route, build its
    /// reply SURB, seal the Sphinx packet, transmit it, persist the
    /// resulting record under a fresh SURB id, and arm its retransmit
    /// timer. Returns the SURB id the caller should track to recognize the
    /// eventual ACK.
    pub async fn send(
        &self,
        link: &dyn LinkSession,
        message_id: [u8; 16],
        block_index: u16,
        sealed_block: Vec<u8>,
        route_context: RouteContext,
        now_ms: u64,
    ) -> Result<SurbId> {
        self.send_or_resend(link, message_id, block_index, sealed_block, route_context, now_ms)
            .await
    }

    async fn send_or_resend(
        &self,
        link: &dyn LinkSession,
        message_id: [u8; 16],
        block_index: u16,
        sealed_block: Vec<u8>,
        route_context: RouteContext,
        now_ms: u64,
    ) -> Result<SurbId> {
        let snapshot = self.directory.snapshot();
        let params = RouteParams {
            epoch: snapshot.epoch,
            period_ms: snapshot.period_ms,
            time_to_next_epoch_ms: snapshot.time_to_next_epoch_ms,
            sender_provider: route_context.sender_provider,
            sender_provider_layer: route_context.sender_provider_layer,
            recipient_provider: route_context.recipient_provider,
            recipient_provider_layer: route_context.recipient_provider_layer,
            recipient_mailbox_id: route_context.recipient_mailbox_id,
            sender_mailbox_id: route_context.sender_mailbox_id,
        };

        let (built, surb_bytes, surb_keys) = {
            let mut rng = self.rng.lock().await;
            let built = self.route_builder.build(&snapshot.document, &params, &mut *rng)?;
            let (surb_bytes, surb_keys) = self.sphinx.new_surb(&built.reply, &mut *rng)?;
            (built, surb_bytes, surb_keys)
        };

        let packet = {
            let mut rng = self.rng.lock().await;
            self.sphinx.new_packet(&built.forward, &sealed_block, Some(&surb_bytes), &mut *rng)?
        };

        link.send_frame(&packet).await?;

        let surb_keys_bytes = bincode::serialize(&surb_keys)
            .map_err(|e| TransportError::Fatal(format!("encoding SURB keys: {e}")))?;
        let deadline_ms = now_ms + built.expected_round_trip_ms + self.rtt_slop_ms;

        let record = EgressRecord {
            surb_id: built.surb_id,
            message_id,
            block_index,
            sealed_block,
            route_context,
            surb_keys: surb_keys_bytes,
            sent_at_ms: now_ms,
            deadline_ms,
            retransmit_count: 0,
        };
        self.store.put(record)?;

        self.queue.lock().await.push(QueueEntry { deadline_ms, surb_id: built.surb_id });
        self.cancelled.lock().await.remove(&built.surb_id);

        trace!(surb_id = hex::encode(built.surb_id), deadline_ms, "armed ARQ timer");
        Ok(built.surb_id)
    }

    /// Cancel the outstanding record for `surb_id`, typically once an ACK
    /// arrives. A later timer fire for this id becomes a no-op; the record
    /// is removed from the store immediately.
    pub async fn cancel(&self, surb_id: &SurbId) -> Result<()> {
        self.cancelled.lock().await.insert(*surb_id);
        self.store.remove(surb_id)?;
        debug!(surb_id = hex::encode(surb_id), "cancelled outstanding send");
        Ok(())
    }

    /// The deadline of the earliest still-armed entry, if any, for the
    /// caller to sleep until.
    pub async fn next_deadline(&self) -> Option<u64> {
        self.queue.lock().await.peek().map(|e| e.deadline_ms)
    }

    /// Fire the timer: pop and retransmit every entry whose deadline is
    /// `<= now_ms`, skipping (and dropping) any that were cancelled in the
    /// meantime. Each retransmit builds a brand-new route and SURB (a new
    /// `surb_id` replaces the old one in the store). Returns the number of
    /// blocks actually retransmitted.
    pub async fn fire(&self, link: &dyn LinkSession, now_ms: u64) -> Result<u32> {
        let mut retransmitted = 0u32;

        loop {
            let due = {
                let mut queue = self.queue.lock().await;
                match queue.peek() {
                    Some(entry) if entry.deadline_ms <= now_ms => queue.pop(),
                    _ => None,
                }
            };
            let Some(entry) = due else { break };

            if self.cancelled.lock().await.remove(&entry.surb_id) {
                continue;
            }

            let Some(record) = self.store.get(&entry.surb_id)? else {
                // Already removed (e.g. cancelled and cleaned up between
                // our peek and this lookup); nothing to retransmit.
                continue;
            };

            let message_id = record.message_id;
            let block_index = record.block_index;
            match self
                .send_or_resend(link, message_id, block_index, record.sealed_block, record.route_context, now_ms)
                .await
            {
                Ok(new_surb_id) => {
                    self.store.remove(&entry.surb_id)?;
                    retransmitted += 1;
                    debug!(
                        old_surb_id = hex::encode(entry.surb_id),
                        new_surb_id = hex::encode(new_surb_id),
                        "retransmitted block on a fresh route"
                    );
                }
                Err(err) => {
                    warn!(
                        surb_id = hex::encode(entry.surb_id),
                        %err,
                        "retransmit failed, re-arming at fallback interval"
                    );
                    let retry_deadline = now_ms + FALLBACK_RETRY_MS;
                    self.store.update_deadline(&entry.surb_id, retry_deadline)?;
                    self.queue.lock().await.push(QueueEntry {
                        deadline_ms: retry_deadline,
                        surb_id: entry.surb_id,
                    });
                }
            }
        }

        Ok(retransmitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::test_support::LoopbackLink;
    use crate::sphinx::ReferenceSphinx;
    use crate::store::InMemoryEgressStore;
    use crate::{MixNode, NodeId};
    use rand::SeedableRng;

    fn test_route_context() -> RouteContext {
        RouteContext {
            sender_provider: NodeId::new([1; 32]),
            sender_provider_layer: 0,
            recipient_provider: NodeId::new([9; 32]),
            recipient_provider_layer: 0,
            recipient_mailbox_id: [2u8; 32],
            sender_mailbox_id: [3u8; 32],
        }
    }

    struct StaticDirectory {
        document: PkiDocument,
    }

    impl DirectorySource for StaticDirectory {
        fn snapshot(&self) -> DirectorySnapshot {
            DirectorySnapshot {
                document: self.document.clone(),
                epoch: Epoch(1),
                period_ms: 3_600_000,
                time_to_next_epoch_ms: 3_600_000,
            }
        }
    }

    fn document_with_providers() -> PkiDocument {
        use crate::epoch::MixDescriptor;
        let mut doc = PkiDocument::default();
        for &(id, layer) in &[([1u8; 32], 0u8), ([9u8; 32], 0u8)] {
            doc.layers.entry(layer).or_default().push(MixDescriptor {
                node: MixNode { id: NodeId::new(id), public_key: id, address: format!("127.0.0.1:800{}", id[0]), layer },
                epoch: Epoch(1),
                epoch_public_key: id,
            });
        }
        doc
    }

    fn scheduler(rtt_slop_ms: u64) -> ArqScheduler<InMemoryEgressStore, ReferenceSphinx> {
        let store = Arc::new(InMemoryEgressStore::new());
        let sphinx = Arc::new(ReferenceSphinx);
        let directory: Arc<dyn DirectorySource> = Arc::new(StaticDirectory { document: document_with_providers() });
        let route_builder = RouteBuilder { hop_count: 2, lambda: 1.0 / 10.0 };
        ArqScheduler::with_rtt_slop(store, sphinx, directory, route_builder, rtt_slop_ms, StdRng::seed_from_u64(1))
    }

    #[tokio::test]
    async fn send_arms_timer_and_persists_record() {
        let scheduler = scheduler(2_000);
        let link = LoopbackLink::default();

        let surb_id = scheduler
            .send(&link, [2u8; 16], 0, vec![0xAA; 4], test_route_context(), 0)
            .await
            .expect("send");

        assert!(scheduler.store.get(&surb_id).expect("get").is_some());
        assert!(scheduler.next_deadline().await.is_some());
        assert_eq!(link.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_retransmit() {
        let scheduler = scheduler(100);
        let link = LoopbackLink::default();

        let surb_id = scheduler
            .send(&link, [4u8; 16], 0, vec![0xBB; 4], test_route_context(), 0)
            .await
            .expect("send");
        scheduler.cancel(&surb_id).await.expect("cancel");

        let retransmitted = scheduler.fire(&link, 10_000).await.expect("fire");
        assert_eq!(retransmitted, 0);
        assert_eq!(link.sent.lock().await.len(), 1, "only the original send, no retransmit");
    }

    #[tokio::test]
    async fn fire_retransmits_overdue_entry_under_a_new_surb_id() {
        let scheduler = scheduler(500);
        let link = LoopbackLink::default();

        let surb_id = scheduler
            .send(&link, [6u8; 16], 0, vec![0xCC; 4], test_route_context(), 0)
            .await
            .expect("send");

        let retransmitted = scheduler.fire(&link, 100_000).await.expect("fire");
        assert_eq!(retransmitted, 1);
        assert_eq!(link.sent.lock().await.len(), 2);

        assert!(scheduler.store.get(&surb_id).expect("get").is_none(), "old surb id retired");
        assert!(scheduler.next_deadline().await.is_some());
    }

    #[tokio::test]
    async fn fire_before_deadline_is_noop() {
        let scheduler = scheduler(1_000_000);
        let link = LoopbackLink::default();

        scheduler
            .send(&link, [8u8; 16], 0, vec![0xDD; 4], test_route_context(), 0)
            .await
            .expect("send");

        let retransmitted = scheduler.fire(&link, 500).await.expect("fire");
        assert_eq!(retransmitted, 0);
        assert_eq!(link.sent.lock().await.len(), 1);
    }
}
