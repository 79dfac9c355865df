//! Route construction: Poisson-delay path selection through the stratified
//! mix topology, per-hop epoch key selection, and joint forward/reply
//! (SURB) path assembly, with retry-on-overrun and fixed provider
//! endpoints.

use crate::epoch::{Epoch, PkiDocument};
use crate::{NodeId, Result, TransportError};
use rand_core::{CryptoRng, RngCore};
use rand_distr::{Distribution, Exp};

/// One hop of a constructed route: the key to seal under, the address to
/// dial or relay to, the delay to instruct that hop to hold the packet,
/// and (only at the final hop) the destination mailbox.
#[derive(Debug, Clone)]
pub struct Hop {
    /// Identity of the mix this hop addresses.
    pub node: NodeId,
    /// Sphinx-layer public key valid for this hop in the epoch its expected
    /// arrival time falls in (not necessarily the route's starting epoch).
    pub key: [u8; 32],
    /// Network address of this hop.
    pub address: String,
    /// Milliseconds this hop should hold the packet before forwarding.
    pub delay_ms: u32,
    /// Destination mailbox, set only on the final hop.
    pub mailbox_id: Option<[u8; 32]>,
}

/// A complete route from our provider through intermediate mixes to the
/// recipient's provider (or, for a reply route, from the recipient's
/// provider back to ours).
#[derive(Debug, Clone)]
pub struct Route {
    /// Ordered hops, first to last.
    pub hops: Vec<Hop>,
}

impl Route {
    /// The entry hop (our provider).
    pub fn entry(&self) -> &Hop {
        &self.hops[0]
    }

    /// The exit hop (the recipient's provider).
    pub fn exit(&self) -> &Hop {
        self.hops.last().expect("route is never empty")
    }

    /// Total end-to-end delay this route instructs, summed across hops.
    pub fn total_delay_ms(&self) -> u64 {
        self.hops.iter().map(|h| h.delay_ms as u64).sum()
    }
}

/// The forward path, reply path (SURB), and bookkeeping a caller needs to
/// send a message and later recognize its acknowledgment.
#[derive(Debug, Clone)]
pub struct BuiltRoute {
    /// Path from our provider to the recipient's provider.
    pub forward: Route,
    /// Path from the recipient's provider back to ours, used to construct
    /// the SURB embedded in the forward packet.
    pub reply: Route,
    /// Freshly-drawn identifier naming the expected reply, carried to the
    /// reply path's terminal hop.
    pub surb_id: [u8; 16],
    /// Sum of every sampled delay across both paths, in milliseconds — the
    /// basis for the ARQ retransmit deadline (`expected_round_trip + slop`).
    pub expected_round_trip_ms: u64,
}

/// Fixed endpoints and directory context a route is built against. The
/// provider endpoints are never resampled across delay-sampling retries —
/// only intermediate mixes and per-hop delays are.
#[derive(Debug, Clone)]
pub struct RouteParams {
    /// Directory document for `epoch`.
    pub epoch: Epoch,
    /// Epoch rotation period, in milliseconds.
    pub period_ms: u64,
    /// Milliseconds remaining until the network rolls over to `epoch.next()`.
    pub time_to_next_epoch_ms: u64,
    /// Our provider (forward path hop 0 / reply path terminal hop).
    pub sender_provider: NodeId,
    /// Our provider's stratified layer (conventionally 0).
    pub sender_provider_layer: u8,
    /// Recipient's provider (forward path terminal hop / reply path hop 0).
    pub recipient_provider: NodeId,
    /// Recipient's provider's stratified layer (conventionally 0).
    pub recipient_provider_layer: u8,
    /// Recipient's mailbox identifier at their provider, carried as the
    /// `Recipient(recipient_id)` command on the forward path's final hop.
    pub recipient_mailbox_id: [u8; 32],
    /// Our own mailbox identifier at our provider, where the reply path
    /// ultimately delivers its SURB-wrapped payload.
    pub sender_mailbox_id: [u8; 32],
}

/// Maximum number of times the builder resamples delays (or epoch
/// assignments) before giving up with [`TransportError::NoViableRoute`].
const MAX_DELAY_RETRIES: u32 = 4;

/// Builds forward/reply route pairs through a [`PkiDocument`]'s topology,
/// sampling per-hop delays from an exponential (Poisson-process
/// inter-arrival) distribution.
#[derive(Debug, Clone)]
pub struct RouteBuilder {
    /// Number of hops in each constructed path, including both provider
    /// endpoints.
    pub hop_count: usize,
    /// Poisson rate parameter (events/ms) used to sample per-hop delays.
    pub lambda: f64,
}

impl Default for RouteBuilder {
    fn default() -> Self {
        Self {
            hop_count: 5,
            lambda: 1.0 / 120.0,
        }
    }
}

/// Which of the three concurrently-valid epoch keys a hop's expected
/// arrival time selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochSlot {
    /// The epoch the route construction started in.
    Current,
    /// The epoch immediately following.
    Next,
    /// Two epochs ahead.
    NextNext,
}

/// Select which epoch a hop whose packet is expected to arrive `elapsed_ms`
/// from now falls into, per spec §4.B step 4. Returns `None` if the hop's
/// arrival would fall beyond the three concurrently-published keys, which
/// forces the caller to resample.
fn epoch_slot_for(elapsed_ms: u64, time_to_next_epoch_ms: u64, period_ms: u64) -> Option<EpochSlot> {
    if elapsed_ms < time_to_next_epoch_ms {
        Some(EpochSlot::Current)
    } else if elapsed_ms < time_to_next_epoch_ms + period_ms {
        Some(EpochSlot::Next)
    } else if elapsed_ms < time_to_next_epoch_ms + 2 * period_ms {
        Some(EpochSlot::NextNext)
    } else {
        None
    }
}

fn epoch_for_slot(base: Epoch, slot: EpochSlot) -> Epoch {
    match slot {
        EpochSlot::Current => base,
        EpochSlot::Next => base.next(),
        EpochSlot::NextNext => base.next().next(),
    }
}

impl RouteBuilder {
    /// Build a forward path, a reply path (SURB), a fresh SURB identifier,
    /// and the expected round-trip delay, per spec §4.B steps 1–6.
    ///
    /// Retries the entire sample (delays, intermediate selection, and
    /// per-hop epoch assignment) up to [`MAX_DELAY_RETRIES`] times if the
    /// combined delay budget is exceeded or any hop's expected arrival
    /// falls outside the three concurrently-valid epoch keys. Provider
    /// endpoints are fixed across every retry; only delays, intermediates,
    /// and epoch assignments are resampled.
    pub fn build<R: RngCore + CryptoRng>(&self, document: &PkiDocument, params: &RouteParams, rng: &mut R) -> Result<BuiltRoute> {
        if self.hop_count < 2 {
            return Err(TransportError::Input("route must have at least 2 hops".into()));
        }

        let exp = Exp::new(self.lambda)
            .map_err(|e| TransportError::Fatal(format!("invalid Poisson rate parameter: {e}")))?;

        let intermediate_count = self.hop_count.saturating_sub(2);
        let mut surb_id = [0u8; 16];
        rng.fill_bytes(&mut surb_id);

        'retry: for _attempt in 0..MAX_DELAY_RETRIES {
            let forward_delays: Vec<u32> = (0..self.hop_count).map(|_| exp.sample(rng) as u32).collect();
            let reply_delays: Vec<u32> = (0..self.hop_count).map(|_| exp.sample(rng) as u32).collect();

            let total: u64 = forward_delays.iter().chain(reply_delays.iter()).map(|&d| d as u64).sum();
            if total > params.time_to_next_epoch_ms + 2 * params.period_ms {
                continue 'retry;
            }

            let Some(forward_nodes) = self.pick_path_nodes(
                document,
                params.epoch,
                params.sender_provider,
                params.sender_provider_layer,
                params.recipient_provider,
                params.recipient_provider_layer,
                intermediate_count,
                rng,
            ) else {
                return Err(TransportError::NoViableRoute { attempts: 0 });
            };

            let Some(reply_nodes) = self.pick_path_nodes(
                document,
                params.epoch,
                params.recipient_provider,
                params.recipient_provider_layer,
                params.sender_provider,
                params.sender_provider_layer,
                intermediate_count,
                rng,
            ) else {
                return Err(TransportError::NoViableRoute { attempts: 0 });
            };

            let Some(forward) = self.assemble(
                document,
                params.epoch,
                params.period_ms,
                params.time_to_next_epoch_ms,
                &forward_nodes,
                &forward_delays,
                0,
                Some(params.recipient_mailbox_id),
            ) else {
                continue 'retry;
            };

            let reply_base_elapsed: u64 = forward_delays.iter().map(|&d| d as u64).sum();
            let Some(reply) = self.assemble(
                document,
                params.epoch,
                params.period_ms,
                params.time_to_next_epoch_ms,
                &reply_nodes,
                &reply_delays,
                reply_base_elapsed,
                Some(params.sender_mailbox_id),
            ) else {
                continue 'retry;
            };

            return Ok(BuiltRoute {
                forward,
                reply,
                surb_id,
                expected_round_trip_ms: total,
            });
        }

        Err(TransportError::NoViableRoute {
            attempts: MAX_DELAY_RETRIES,
        })
    }

    /// Resolve the fixed endpoints plus `intermediate_count` independently,
    /// uniformly-sampled intermediate mixes (one per layer `1..=count`) into
    /// an ordered list of node identifiers. Returns `None` if any layer
    /// (including the endpoints' own layers) has no eligible descriptor for
    /// `epoch` — a directory-incompleteness failure, not a retryable one.
    #[allow(clippy::too_many_arguments)]
    fn pick_path_nodes<R: RngCore>(
        &self,
        document: &PkiDocument,
        epoch: Epoch,
        entry_provider: NodeId,
        entry_layer: u8,
        exit_provider: NodeId,
        exit_layer: u8,
        intermediate_count: usize,
        rng: &mut R,
    ) -> Option<Vec<(NodeId, u8)>> {
        document.key_for(entry_provider, epoch)?;
        document.key_for(exit_provider, epoch)?;

        let mut nodes = Vec::with_capacity(intermediate_count + 2);
        nodes.push((entry_provider, entry_layer));
        for layer in 1..=intermediate_count as u8 {
            let node = document.random_node_in_layer(layer, epoch, rng)?;
            nodes.push((node, layer));
        }
        nodes.push((exit_provider, exit_layer));
        Some(nodes)
    }

    /// Turn a fixed node sequence plus per-hop delays into a [`Route`],
    /// selecting each hop's epoch key from its expected arrival time.
    /// `base_elapsed_ms` offsets the cumulative delay clock — used by the
    /// reply path, whose hops don't start ticking until the full forward
    /// trip has elapsed. Returns `None` (triggering a resample) if any
    /// hop's arrival falls outside the three concurrently-valid keys.
    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        document: &PkiDocument,
        epoch: Epoch,
        period_ms: u64,
        time_to_next_epoch_ms: u64,
        nodes: &[(NodeId, u8)],
        delays: &[u32],
        base_elapsed_ms: u64,
        terminal_mailbox: Option<[u8; 32]>,
    ) -> Option<Route> {
        let mut hops = Vec::with_capacity(nodes.len());
        let mut elapsed = base_elapsed_ms;

        for (i, &(node, _layer)) in nodes.iter().enumerate() {
            elapsed += delays[i] as u64;
            let slot = epoch_slot_for(elapsed, time_to_next_epoch_ms, period_ms)?;
            let hop_epoch = epoch_for_slot(epoch, slot);
            let key = document.key_for(node, hop_epoch)?;
            let address = document.address_for(node, hop_epoch).or_else(|| document.address_for(node, epoch))?;

            let is_last = i == nodes.len() - 1;
            hops.push(Hop {
                node,
                key,
                address,
                delay_ms: if is_last { 0 } else { delays[i] },
                mailbox_id: if is_last { terminal_mailbox } else { None },
            });
        }

        Some(Route { hops })
    }
}
