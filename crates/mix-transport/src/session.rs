//! Per-identity concurrency glue: one send path, one fetch worker task, and
//! one ARQ timer task, all observing a shared cancellation token.
//!
//! The session itself does not dial the network or run a full scheduler
//! loop forever — `run_fetch_worker` and `run_arq_timer` are long-running
//! futures callers `tokio::spawn` per identity; `submit` is called
//! directly from whatever task accepts outbound messages. A
//! `tokio::sync::Mutex` around submission serializes route construction
//! against concurrent callers without blocking the fetch or timer tasks,
//! which touch independent state.

use crate::arq::ArqScheduler;
use crate::fetch::{FetchLoop, PacingConfig};
use crate::identity::Identity;
use crate::link::LinkSession;
use crate::sphinx::SphinxPrimitive;
use crate::store::{EgressStore, RouteContext};
use crate::userkeys::{UserId, UserKeyDirectory};
use crate::{Result, TransportError};
use mix_crypto::{noise, Block};
use rand_core::{CryptoRng, RngCore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-identity session state: one send worker, one fetch worker, one ARQ
/// timer, sharing a store and a link.
pub struct Session<S: EgressStore, P: SphinxPrimitive> {
    identity: Identity,
    store: Arc<S>,
    arq: Arc<ArqScheduler<S, P>>,
    fetch: Arc<FetchLoop<S>>,
    sphinx: Arc<P>,
    link: Arc<dyn LinkSession>,
    user_keys: Arc<dyn UserKeyDirectory>,
    submit_guard: Mutex<()>,
    cancellation: CancellationToken,
    started_at: Instant,
}

impl<S: EgressStore, P: SphinxPrimitive> Session<S, P> {
    /// Construct a session for `identity`, backed by `store` and `link`,
    /// with `arq` already wired to the directory source and route builder
    /// this identity's sends should use, and `user_keys` resolving
    /// correspondent addresses to their static public keys on send.
    pub fn new(
        identity: Identity,
        store: Arc<S>,
        link: Arc<dyn LinkSession>,
        arq: Arc<ArqScheduler<S, P>>,
        sphinx: Arc<P>,
        user_keys: Arc<dyn UserKeyDirectory>,
    ) -> Self {
        let fetch = Arc::new(FetchLoop::new(store.clone()));
        Self {
            identity,
            store,
            arq,
            fetch,
            sphinx,
            link,
            user_keys,
            submit_guard: Mutex::new(()),
            cancellation: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// A token observers can use to request cooperative shutdown of this
    /// session's background tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Request shutdown; in-flight `run_fetch_worker`/`run_arq_timer`
    /// futures observe this at their next `select!` point and return.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    /// Look up `recipient`'s long-term static public key via the user-key
    /// directory, then fragment, seal, and send `message` to it, routed per
    /// `route_context`, arming an ARQ timer for each resulting block. Each
    /// block's route and reply SURB are built fresh by the ARQ scheduler
    /// from `route_context` — `submit` itself never touches routing, only
    /// the recipient-key lookup and block-level Noise_X sealing.
    ///
    /// Fails with [`TransportError::Input`] if `recipient` is not a known
    /// correspondent (the user-PKI lookup's `UnknownRecipient` failure
    /// mode), before anything is fragmented or sent.
    ///
    /// Serialized against concurrent callers via an internal mutex so two
    /// submissions never interleave fragmentation state, while the fetch
    /// worker and ARQ timer (which touch independent queues) proceed
    /// unblocked.
    pub async fn submit<R: RngCore + CryptoRng>(
        &self,
        message: &[u8],
        recipient: &UserId,
        route_context: &RouteContext,
        rng: &mut R,
    ) -> Result<[u8; 16]> {
        let _guard = self.submit_guard.lock().await;

        let recipient_static_public = self.user_keys.lookup(recipient).await?;

        let blocks = Block::fragment(message, rng).map_err(TransportError::from)?;
        let message_id = blocks[0].message_id;

        for block in &blocks {
            let frame = block.serialize();
            let sealed = noise::seal(&frame, self.identity.static_secret(), &recipient_static_public, rng);
            let sealed_bytes = sealed.to_bytes();

            self.arq
                .send(
                    self.link.as_ref(),
                    message_id,
                    block.index,
                    sealed_bytes,
                    route_context.clone(),
                    self.now_ms(),
                )
                .await?;
        }

        info!(
            message_id = hex::encode(message_id),
            blocks = blocks.len(),
            "submitted message"
        );
        Ok(message_id)
    }

    /// Run the fetch worker until `shutdown` is called: repeatedly poll the
    /// provider, cancel the ARQ entry for any verified ACK, and pace the
    /// next poll either by `pacing` (empty or nothing special reported) or
    /// immediately, if the provider reported more still queued
    /// (`queue_size_hint > 0`) — draining a burst without waiting out the
    /// backoff interval.
    pub async fn run_fetch_worker(&self, pacing: PacingConfig) {
        let mut consecutive_empty = 0u32;
        loop {
            if self.cancellation.is_cancelled() {
                info!("fetch worker shutting down");
                return;
            }

            let outcome = self
                .fetch
                .once_fetch(self.link.as_ref(), self.sphinx.as_ref(), self.identity.static_secret(), self.now_ms())
                .await;

            let queue_hint = match outcome {
                Ok((crate::fetch::FetchEvent::Empty, hint)) => {
                    consecutive_empty = consecutive_empty.saturating_add(1);
                    hint
                }
                Ok((crate::fetch::FetchEvent::Ack { surb_id }, hint)) => {
                    consecutive_empty = 0;
                    if let Err(err) = self.arq.cancel(&surb_id).await {
                        warn!(%err, "failed to cancel ARQ entry for ACK");
                    }
                    hint
                }
                Ok((crate::fetch::FetchEvent::Message { .. }, hint)) => {
                    consecutive_empty = 0;
                    hint
                }
                Err(err) => {
                    warn!(%err, "fetch poll failed");
                    consecutive_empty = consecutive_empty.saturating_add(1);
                    0
                }
            };

            if queue_hint > 0 {
                // Drain the burst immediately: skip the pacing sleep
                // entirely and poll again right away.
                continue;
            }

            let sleep = tokio::time::sleep(pacing.interval_for(consecutive_empty));
            tokio::select! {
                _ = sleep => {}
                _ = self.cancellation.cancelled() => {
                    info!("fetch worker shutting down mid-sleep");
                    return;
                }
            }
        }
    }

    /// Run the ARQ timer until `shutdown` is called: sleep until the
    /// earliest armed deadline, fire due retransmits, repeat. Sleeps
    /// indefinitely (woken only by shutdown) when nothing is armed.
    pub async fn run_arq_timer(&self) {
        loop {
            if self.cancellation.is_cancelled() {
                info!("ARQ timer shutting down");
                return;
            }

            let sleep_duration = match self.arq.next_deadline().await {
                Some(deadline_ms) => {
                    let now = self.now_ms();
                    std::time::Duration::from_millis(deadline_ms.saturating_sub(now))
                }
                None => std::time::Duration::from_secs(3600),
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {}
                _ = self.cancellation.cancelled() => {
                    info!("ARQ timer shutting down mid-sleep");
                    return;
                }
            }

            if self.cancellation.is_cancelled() {
                return;
            }

            if let Err(err) = self.arq.fire(self.link.as_ref(), self.now_ms()).await {
                warn!(%err, "ARQ timer fire failed");
            }
        }
    }

    /// This identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The underlying durable store, for callers that want to drain
    /// assembled messages directly.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}
