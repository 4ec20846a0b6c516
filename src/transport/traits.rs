// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    #[error("request timed out")]
    Timeout,
    #[error("request rejected by peer: {0}")]
    Rejected(String),
}

/// Channel to the session.
///
/// Payloads are already-encoded JSON envelopes; the transport never looks
/// inside them. Implementations must be cheap to share (`Arc<dyn Transport>`).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one encoded request and wait for the encoded response.
    async fn send(&self, payload: String) -> Result<String, TransportError>;

    /// Liveness check; an error means the connection is gone.
    async fn heartbeat(&self) -> Result<(), TransportError>;

    /// Re-establish the underlying connection after a loss.
    /// Default implementation treats a successful heartbeat as a handshake.
    async fn handshake(&self) -> Result<(), TransportError> {
        self.heartbeat().await
    }

    /// Server-initiated responses (push). Returns the receiver once; later
    /// calls and transports without push return `None`.
    fn take_push_channel(&self) -> Option<mpsc::Receiver<String>> {
        None
    }
}
