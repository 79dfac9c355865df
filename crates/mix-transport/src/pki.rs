//! Directory-authority client contract.
//!
//! `mix-transport` never talks to a directory authority's wire protocol
//! itself; it depends only on this trait, so production code can supply a
//! real consensus-fetching implementation (HTTP, gossip, whatever the
//! deployment uses) without this crate knowing the details.

use crate::arq::{DirectorySnapshot, DirectorySource};
use crate::epoch::{Epoch, PkiDocument};
use crate::Result;
use async_trait::async_trait;
use std::sync::RwLock;
use tracing::warn;

/// Fetches the routing document for a given epoch from the network's
/// directory authority.
#[async_trait]
pub trait PkiClient: Send + Sync {
    /// Fetch the consensus document describing the topology valid for
    /// `epoch`. Implementations should cache aggressively; callers may ask
    /// for the same epoch repeatedly (e.g. once per route built).
    async fn fetch_document(&self, epoch: Epoch) -> Result<PkiDocument>;

    /// The epoch the directory authority currently considers active,
    /// as observed by this client's clock.
    async fn current_epoch(&self) -> Result<Epoch>;
}

/// A [`DirectorySource`] backed by a [`PkiClient`], refreshed by a
/// background poller rather than on every route build.
///
/// `ArqScheduler::snapshot` is called synchronously from inside route
/// construction, so it cannot itself await a network fetch; this adapter
/// does the fetching out of band (via [`CachingDirectory::refresh`], run
/// periodically by whoever owns the identity's session) and serves the
/// last-known-good snapshot from a `RwLock` in between.
pub struct CachingDirectory {
    client: std::sync::Arc<dyn PkiClient>,
    period_ms: u64,
    current: RwLock<DirectorySnapshot>,
}

impl CachingDirectory {
    /// Build a `CachingDirectory` seeded with the document for `client`'s
    /// current epoch at construction time.
    pub async fn new(client: std::sync::Arc<dyn PkiClient>, period_ms: u64) -> Result<Self> {
        let epoch = client.current_epoch().await?;
        let document = client.fetch_document(epoch).await?;
        Ok(Self {
            client,
            period_ms,
            current: RwLock::new(DirectorySnapshot {
                document,
                epoch,
                period_ms,
                time_to_next_epoch_ms: period_ms,
            }),
        })
    }

    /// Re-fetch the current epoch's document and swap it into the
    /// snapshot served by [`DirectorySource::snapshot`]. On failure the
    /// previous snapshot keeps serving; callers should log and retry
    /// rather than tear down the session over one missed poll.
    pub async fn refresh(&self) {
        let epoch = match self.client.current_epoch().await {
            Ok(epoch) => epoch,
            Err(err) => {
                warn!(%err, "failed to refresh current epoch; keeping stale directory snapshot");
                return;
            }
        };
        let document = match self.client.fetch_document(epoch).await {
            Ok(document) => document,
            Err(err) => {
                warn!(%err, "failed to fetch directory document; keeping stale directory snapshot");
                return;
            }
        };
        let snapshot = DirectorySnapshot {
            document,
            epoch,
            period_ms: self.period_ms,
            time_to_next_epoch_ms: self.period_ms,
        };
        *self.current.write().expect("directory lock not poisoned") = snapshot;
    }
}

impl DirectorySource for CachingDirectory {
    fn snapshot(&self) -> DirectorySnapshot {
        self.current.read().expect("directory lock not poisoned").clone()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory `PkiClient` for tests: pre-seeded documents keyed by
    /// epoch, with a fixed "current" epoch.
    pub struct StaticPkiClient {
        pub documents: Mutex<HashMap<Epoch, PkiDocument>>,
        pub current: Epoch,
    }

    #[async_trait]
    impl PkiClient for StaticPkiClient {
        async fn fetch_document(&self, epoch: Epoch) -> Result<PkiDocument> {
            self.documents
                .lock()
                .expect("test mutex not poisoned")
                .get(&epoch)
                .cloned()
                .ok_or_else(|| crate::TransportError::Protocol(format!("no document for {epoch:?}")))
        }

        async fn current_epoch(&self) -> Result<Epoch> {
            Ok(self.current)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StaticPkiClient;
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn client_with(epoch: Epoch, document: PkiDocument) -> Arc<StaticPkiClient> {
        let mut documents = HashMap::new();
        documents.insert(epoch, document);
        Arc::new(StaticPkiClient {
            documents: Mutex::new(documents),
            current: epoch,
        })
    }

    #[tokio::test]
    async fn new_seeds_snapshot_from_current_epoch() {
        let client = client_with(Epoch(3), PkiDocument::default());
        let directory = CachingDirectory::new(client, 3_600_000).await.expect("construct");

        let snapshot = directory.snapshot();
        assert_eq!(snapshot.epoch, Epoch(3));
        assert_eq!(snapshot.period_ms, 3_600_000);
    }

    #[tokio::test]
    async fn refresh_swaps_in_the_newly_fetched_document() {
        let client = client_with(Epoch(1), PkiDocument::default());
        let directory = CachingDirectory::new(client.clone(), 1_000).await.expect("construct");

        let mut next_doc = PkiDocument::default();
        next_doc.layers.insert(0, Vec::new());
        client.documents.lock().expect("test mutex not poisoned").insert(Epoch(1), next_doc);

        directory.refresh().await;
        assert!(directory.snapshot().document.layers.contains_key(&0));
    }

    #[tokio::test]
    async fn refresh_keeps_stale_snapshot_on_fetch_failure() {
        let client = client_with(Epoch(1), PkiDocument::default());
        let directory = CachingDirectory::new(client.clone(), 1_000).await.expect("construct");

        client.documents.lock().expect("test mutex not poisoned").remove(&Epoch(1));
        directory.refresh().await;

        assert_eq!(directory.snapshot().epoch, Epoch(1));
    }
}
