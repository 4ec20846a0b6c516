// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lifecycle management for the sync client.
//!
//! Contains methods for starting, running, and shutting down the client.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::context::Effects;
use super::SyncClient;
use crate::communication::RequestId;
use crate::error::SyncError;
use crate::transport::{Transport, TransportError};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type Response = (RequestId, u64, Result<String, TransportError>);

/// Transport futures owned by the run loop.
#[derive(Default)]
struct InFlight {
    request: Option<BoxFuture<Response>>,
    heartbeat: Option<BoxFuture<Result<(), TransportError>>>,
    handshake: Option<BoxFuture<Result<(), TransportError>>>,
}

impl InFlight {
    fn apply(&mut self, effects: Effects, transport: &Arc<dyn Transport>, timeout: Duration) {
        if effects.cancel_request {
            self.request = None;
            self.heartbeat = None;
        }
        if effects.start_heartbeat && self.heartbeat.is_none() {
            let transport = Arc::clone(transport);
            self.heartbeat = Some(Box::pin(async move {
                with_timeout(timeout, transport.heartbeat()).await
            }));
        }
        if effects.start_handshake && self.handshake.is_none() {
            let transport = Arc::clone(transport);
            self.handshake = Some(Box::pin(async move {
                with_timeout(timeout, transport.handshake()).await
            }));
        }
    }
}

async fn with_timeout<F>(timeout: Duration, fut: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Await the future if there is one; otherwise never complete.
async fn wait_on<T>(fut: &mut Option<BoxFuture<T>>) -> T {
    match fut.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn recv_push(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SyncClient {
    /// Begin synchronizing.
    ///
    /// With `initial` (an encoded response, e.g. embedded in the page that
    /// hosts the client) the tree is bootstrapped from it right away.
    /// Without it the first request asks the session for a full snapshot.
    #[tracing::instrument(skip(self, initial), fields(bootstrapped = initial.is_some()))]
    pub fn start(&self, initial: Option<&str>) -> Result<(), SyncError> {
        let started = self.ctx.lock().start(initial, Instant::now());
        self.finish_phase();
        self.wake.notify_one();
        started?;
        info!("Sync client started");
        Ok(())
    }

    /// Run the protocol loop until [`shutdown`](Self::shutdown).
    ///
    /// Returns an error when reconnecting fails for good; the client then
    /// stays in `ReconnectFailedPermanently` with no further protocol activity.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<(), SyncError> {
        let mut config_rx = self.config_rx.lock().await;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut push_rx = self.transport.take_push_channel();
        let mut in_flight = InFlight::default();
        info!(push = push_rx.is_some(), "Sync client running");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let (deadline, timeout) = {
                let mut ctx = self.ctx.lock();
                if ctx.is_torn_down() {
                    break;
                }
                if let Some(outbound) = ctx.next_outbound(Instant::now()) {
                    if outbound.superseded {
                        debug!("Dropping superseded request");
                    }
                    let transport = Arc::clone(&self.transport);
                    in_flight.request = Some(Box::pin(async move {
                        let result = transport.send(outbound.payload).await;
                        (outbound.request_id, outbound.client_id, result)
                    }));
                }
                (ctx.next_deadline(), ctx.config.request_timeout())
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {}

                Ok(()) = config_rx.changed() => {
                    let config = config_rx.borrow_and_update().clone();
                    self.ctx.lock().apply_config(config, Instant::now());
                }

                (request_id, client_id, result) = wait_on(&mut in_flight.request) => {
                    in_flight.request = None;
                    let mut ctx = self.ctx.lock();
                    let now = Instant::now();
                    match result {
                        Ok(payload) => ctx.on_response(request_id, client_id, &payload, now),
                        Err(e) => {
                            let effects = ctx.on_request_failed(request_id, e, now);
                            drop(ctx);
                            in_flight.apply(effects, &self.transport, timeout);
                        }
                    }
                }

                result = wait_on(&mut in_flight.heartbeat) => {
                    in_flight.heartbeat = None;
                    let effects = self.ctx.lock().on_heartbeat_result(result, Instant::now());
                    in_flight.apply(effects, &self.transport, timeout);
                }

                result = wait_on(&mut in_flight.handshake) => {
                    in_flight.handshake = None;
                    let outcome = self.ctx.lock().on_handshake_result(result, Instant::now());
                    if let Err(fatal) = outcome {
                        self.finish_phase();
                        error!(error = %fatal, "Sync client stopped");
                        return Err(fatal);
                    }
                }

                payload = recv_push(&mut push_rx) => match payload {
                    Some(payload) => self.ctx.lock().on_push(&payload, Instant::now()),
                    None => {
                        debug!("Push channel closed");
                        push_rx = None;
                    }
                },

                _ = sleep_until(deadline) => {
                    let effects = self.ctx.lock().on_timers(Instant::now());
                    match effects {
                        Ok(effects) => in_flight.apply(effects, &self.transport, timeout),
                        Err(fatal) => {
                            self.finish_phase();
                            error!(error = %fatal, "Sync client stopped");
                            return Err(fatal);
                        }
                    }
                }

                _ = self.wake.notified() => {}
            }

            self.finish_phase();
        }

        info!("Sync client loop exited");
        self.finish_phase();
        Ok(())
    }

    /// Stop the loop and tear down every component. Idempotent.
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.ctx.lock().teardown();
        self.wake.notify_one();
        self.phase_done.notify_waiters();
    }
}
