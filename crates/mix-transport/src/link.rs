//! Authenticated transport to our provider.
//!
//! `LinkSession` abstracts the connection a client holds open to its
//! provider: a framed, authenticated byte-stream over which Sphinx packets
//! are sent and fetch requests/replies flow. Reconnection policy lives
//! here too, since only the concrete transport knows how to redial.

use crate::Result;
use async_trait::async_trait;

/// One authenticated session to a provider.
#[async_trait]
pub trait LinkSession: Send + Sync {
    /// Send one opaque frame (a serialized Sphinx `SendPacket`) to the
    /// provider.
    async fn send_frame(&self, frame: &[u8]) -> Result<()>;

    /// Send `RetrieveMessage{sequence}` and return whatever the provider
    /// replies with — the raw `MessageACK`/`Message`/`MessageEmpty` frame,
    /// tag byte first.
    ///
    /// Returns `Ok(None)` for `MessageEmpty` (an empty mailbox), distinct
    /// from an error.
    async fn fetch_frame(&self, sequence: u32) -> Result<Option<Vec<u8>>>;

    /// Whether the underlying connection is currently believed to be live.
    async fn is_connected(&self) -> bool;

    /// Attempt to (re)establish the connection to the provider.
    async fn reconnect(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// An in-process `LinkSession` for tests: frames sent via `send_frame`
    /// land directly in a queue drained by `fetch_frame`, simulating an
    /// echoing provider with zero network latency.
    #[derive(Default)]
    pub struct LoopbackLink {
        pub inbox: Mutex<VecDeque<Vec<u8>>>,
        pub sent: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl LinkSession for LoopbackLink {
        async fn send_frame(&self, frame: &[u8]) -> Result<()> {
            self.sent.lock().await.push(frame.to_vec());
            Ok(())
        }

        async fn fetch_frame(&self, _sequence: u32) -> Result<Option<Vec<u8>>> {
            Ok(self.inbox.lock().await.pop_front())
        }

        async fn is_connected(&self) -> bool {
            true
        }

        async fn reconnect(&self) -> Result<()> {
            Ok(())
        }
    }
}
