//! Epoch-based mix key rotation.
//!
//! The network advances through numbered epochs on a fixed period
//! (`PERIOD`, default one hour). A mix's Sphinx key rotates every epoch,
//! but because clocks and in-flight packets never line up perfectly with
//! epoch boundaries, a well-behaved mix accepts packets sealed under any of
//! three concurrently valid keys: the current epoch, the next one (clients
//! that have already rolled over), and the one before (packets still in
//! flight from just before rollover).

use crate::{MixNode, NodeId};
use std::collections::HashMap;

/// A monotonically increasing epoch number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The epoch immediately following this one.
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }

    /// The epoch immediately preceding this one, if any.
    pub fn previous(self) -> Option<Epoch> {
        self.0.checked_sub(1).map(Epoch)
    }
}

/// A mix descriptor as published by the PKI for one epoch: routing
/// attributes plus the Sphinx key valid for that epoch specifically.
#[derive(Debug, Clone)]
pub struct MixDescriptor {
    /// The mix this descriptor describes.
    pub node: MixNode,
    /// The epoch this descriptor's `epoch_public_key` is valid for.
    pub epoch: Epoch,
    /// The Sphinx-layer public key valid only during `epoch`.
    pub epoch_public_key: [u8; 32],
}

/// The three Sphinx keys a mix may legitimately be addressed under at any
/// given moment: the previous, current, and next epoch's keys.
#[derive(Debug, Clone)]
pub struct EpochKeys {
    /// Key for the epoch immediately before `current`, if the network has
    /// advanced past epoch 0.
    pub previous: Option<[u8; 32]>,
    /// Key for the currently active epoch.
    pub current: [u8; 32],
    /// Key for the epoch the network will roll over to next.
    pub next: [u8; 32],
}

/// A snapshot of the network's routing topology for one epoch, as fetched
/// from the directory authority (`pki::PkiClient`).
#[derive(Debug, Clone, Default)]
pub struct PkiDocument {
    /// Descriptors grouped by stratified layer (0 = provider layer).
    pub layers: HashMap<u8, Vec<MixDescriptor>>,
}

impl PkiDocument {
    /// Descriptors for a given layer, or an empty slice if the layer is
    /// unknown.
    pub fn layer(&self, layer: u8) -> &[MixDescriptor] {
        self.layers.get(&layer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Look up the currently-valid epoch key triple for a specific mix, by
    /// scanning descriptors for `previous`/`current`/`next` epochs.
    ///
    /// Returns `None` if the directory lacks a descriptor for the mix in
    /// the current epoch (the mandatory one); missing previous/next
    /// descriptors are tolerated by reusing the current key, since a mix
    /// that has not yet published a rotation is still reachable under its
    /// current key.
    pub fn epoch_keys_for(&self, node_id: NodeId, current: Epoch) -> Option<EpochKeys> {
        let current_key = self.key_for(node_id, current)?;
        let previous_key = current.previous().and_then(|e| self.key_for(node_id, e));
        let next_key = self.key_for(node_id, current.next()).unwrap_or(current_key);

        Some(EpochKeys {
            previous: previous_key,
            current: current_key,
            next: next_key,
        })
    }

    /// Look up a single mix's published Sphinx key for one specific epoch,
    /// without regard to current/previous/next framing.
    ///
    /// Used by the route builder (§4.B step 4) to seal each hop under the
    /// key valid for that hop's *expected arrival epoch*, which may differ
    /// hop to hop within one route.
    pub fn key_for(&self, node_id: NodeId, epoch: Epoch) -> Option<[u8; 32]> {
        self.layers
            .values()
            .flatten()
            .find_map(|d| (d.node.id == node_id && d.epoch == epoch).then_some(d.epoch_public_key))
    }

    /// The node identifier of the (arbitrary, but deterministic-given-`rng`)
    /// descriptor this layer publishes for `epoch`, chosen uniformly among
    /// distinct mixes active in that layer. `None` if the layer is empty for
    /// that epoch.
    pub fn random_node_in_layer<R: rand_core::RngCore>(&self, layer: u8, epoch: Epoch, rng: &mut R) -> Option<NodeId> {
        use rand::seq::SliceRandom;
        let mut candidates: Vec<NodeId> = self
            .layer(layer)
            .iter()
            .filter(|d| d.epoch == epoch)
            .map(|d| d.node.id)
            .collect();
        candidates.dedup();
        candidates.choose(rng).copied()
    }

    /// The network address published for `node_id` at `epoch`.
    pub fn address_for(&self, node_id: NodeId, epoch: Epoch) -> Option<String> {
        self.layers
            .values()
            .flatten()
            .find(|d| d.node.id == node_id && d.epoch == epoch)
            .map(|d| d.node.address.clone())
    }
}
