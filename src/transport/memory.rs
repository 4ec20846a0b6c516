// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process transport wired straight to a [`UiSession`].
//!
//! Used by the demo and the test suites. Payloads still go through the JSON
//! codec in both directions, and a few fault knobs let tests drop the
//! connection, lose responses and reorder pushed messages.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::traits::{Transport, TransportError};
use crate::protocol::codec;
use crate::protocol::SyncResponse;
use crate::session::UiSession;

const PUSH_CHANNEL_CAPACITY: usize = 256;

pub struct LoopbackTransport {
    session: Arc<Mutex<UiSession>>,
    push_tx: mpsc::Sender<String>,
    push_rx: Mutex<Option<mpsc::Receiver<String>>>,
    offline: AtomicBool,
    lose_responses: AtomicUsize,
    holding_pushes: AtomicBool,
    held_pushes: Mutex<Vec<String>>,
    requests: AtomicU64,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(session: Arc<Mutex<UiSession>>) -> Self {
        let (push_tx, push_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            session,
            push_tx,
            push_rx: Mutex::new(Some(push_rx)),
            offline: AtomicBool::new(false),
            lose_responses: AtomicUsize::new(0),
            holding_pushes: AtomicBool::new(false),
            held_pushes: Mutex::new(Vec::new()),
            requests: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn session(&self) -> Arc<Mutex<UiSession>> {
        Arc::clone(&self.session)
    }

    /// Requests that reached the session.
    #[must_use]
    pub fn requests_sent(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Send the session's pending changes to the client unprompted.
    /// Returns the sequence id pushed, if there was anything to push.
    pub fn push_pending(&self) -> Option<u64> {
        let message = self.session.lock().push()?;
        let sequence_id = message.sequence_id;
        let response = SyncResponse {
            messages: vec![message],
        };
        match codec::encode_response(&response) {
            Ok(payload) => self.deliver_push(payload),
            Err(e) => debug!(error = %e, "Dropping unencodable push"),
        }
        Some(sequence_id)
    }

    /// While offline every call fails with [`TransportError::Disconnected`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// The next `n` requests reach the session but their responses never
    /// arrive; the send future stays pending.
    pub fn lose_next_responses(&self, n: usize) {
        self.lose_responses.store(n, Ordering::SeqCst);
    }

    /// Queue pushed messages instead of delivering them.
    pub fn hold_pushes(&self) {
        self.holding_pushes.store(true, Ordering::SeqCst);
    }

    /// Deliver held pushes newest first and stop holding.
    pub fn release_pushes_reversed(&self) {
        self.holding_pushes.store(false, Ordering::SeqCst);
        let held: Vec<String> = std::mem::take(&mut *self.held_pushes.lock());
        for payload in held.into_iter().rev() {
            self.deliver_push(payload);
        }
    }

    /// Forget held pushes, as if they were lost in transit.
    pub fn discard_held_pushes(&self) -> usize {
        self.holding_pushes.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.held_pushes.lock()).len()
    }

    fn deliver_push(&self, payload: String) {
        if self.is_offline() {
            debug!("Offline; push lost");
            return;
        }
        if self.holding_pushes.load(Ordering::SeqCst) {
            self.held_pushes.lock().push(payload);
            return;
        }
        if self.push_tx.try_send(payload).is_err() {
            debug!("Push channel full or closed; dropping push");
        }
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.is_offline() {
            Err(TransportError::Disconnected("loopback offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn take_lost_response(&self) -> bool {
        self.lose_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, payload: String) -> Result<String, TransportError> {
        self.check_online()?;
        let request =
            codec::decode_request(&payload).map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.requests.fetch_add(1, Ordering::Relaxed);

        let response = self.session.lock().handle_request(request);
        if self.take_lost_response() {
            debug!("Losing response");
            std::future::pending::<()>().await;
        }
        codec::encode_response(&response).map_err(|e| TransportError::Rejected(e.to_string()))
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        self.check_online()
    }

    fn take_push_channel(&self) -> Option<mpsc::Receiver<String>> {
        self.push_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::protocol::{RequestKind, SyncRequest};
    use crate::session::EventRouter;
    use crate::tree::NodeId;

    fn transport() -> LoopbackTransport {
        let session = UiSession::new(&SyncConfig::default(), EventRouter::default());
        LoopbackTransport::new(Arc::new(Mutex::new(session)))
    }

    fn poll(client_id: u64) -> String {
        codec::encode_request(&SyncRequest {
            client_id,
            kind: RequestKind::Normal,
            last_sequence_id: None,
            events: vec![],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_round_trips_through_session() {
        let transport = transport();
        let payload = transport.send(poll(0)).await.unwrap();
        let response = codec::decode_response(&payload).unwrap();
        assert_eq!(response.messages[0].sequence_id, 1);
        assert_eq!(transport.requests_sent(), 1);
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let transport = transport();
        transport.set_offline(true);
        assert!(matches!(
            transport.send(poll(0)).await,
            Err(TransportError::Disconnected(_))
        ));
        assert!(transport.heartbeat().await.is_err());
        assert!(transport.handshake().await.is_err());

        transport.set_offline(false);
        assert!(transport.handshake().await.is_ok());
    }

    #[tokio::test]
    async fn test_garbage_is_rejected() {
        let transport = transport();
        assert!(matches!(
            transport.send("{not json".to_string()).await,
            Err(TransportError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_push_channel_taken_once() {
        let transport = transport();
        let mut rx = transport.take_push_channel().unwrap();
        assert!(transport.take_push_channel().is_none());

        transport
            .session()
            .lock()
            .tree_mut()
            .allocate_node(NodeId::ROOT)
            .unwrap();
        assert_eq!(transport.push_pending(), Some(1));
        assert_eq!(transport.push_pending(), None);

        let response = codec::decode_response(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(response.messages[0].sequence_id, 1);
    }

    #[tokio::test]
    async fn test_held_pushes_release_in_reverse() {
        let transport = transport();
        let mut rx = transport.take_push_channel().unwrap();
        transport.hold_pushes();
        for _ in 0..2 {
            transport
                .session()
                .lock()
                .tree_mut()
                .allocate_node(NodeId::ROOT)
                .unwrap();
            transport.push_pending();
        }
        assert!(rx.try_recv().is_err());

        transport.release_pushes_reversed();
        let first = codec::decode_response(&rx.recv().await.unwrap()).unwrap();
        let second = codec::decode_response(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.messages[0].sequence_id, 2);
        assert_eq!(second.messages[0].sequence_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_response_never_completes() {
        let transport = transport();
        transport.lose_next_responses(1);
        let result =
            tokio::time::timeout(std::time::Duration::from_secs(5), transport.send(poll(0))).await;
        assert!(result.is_err());
        // The session still processed it.
        assert_eq!(transport.session().lock().last_sequence_id(), 1);

        assert!(transport.send(poll(1)).await.is_ok());
    }
}
