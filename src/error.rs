// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy and the shared error sink.
//!
//! | Kind               | Examples                           | Handling                    |
//! |--------------------|------------------------------------|-----------------------------|
//! | `ProtocolOrdering` | unknown node id, gap over budget   | full resynchronization      |
//! | `Transport`        | connection drop, timeout           | reconnect with backoff      |
//! | `DuplicateRequest` | start while a request is active    | surfaced immediately        |
//! | `PermanentFailure` | reconnect budget exhausted         | terminal, surfaced to user  |
//! | `Handler`          | listener/handler panic or error    | routed to the error sink    |
//!
//! Listener-style callbacks are run through [`ErrorSink::guard`] so one
//! failing listener cannot stop delivery to the others or unwind the
//! synchronization loop.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::error;

use crate::protocol::CodecError;
use crate::transport::TransportError;
use crate::tree::TreeError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Structural tree error outside of message application (local contract).
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    /// A received diff could not be applied in order.
    #[error("protocol ordering error: {0}")]
    ProtocolOrdering(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Attempt to start a request while one is outstanding.
    #[error("a request is already active")]
    AlreadyActive,

    #[error("reconnect failed permanently after {attempts} attempts ({elapsed:?} offline)")]
    PermanentReconnectFailure { attempts: u32, elapsed: Duration },

    #[error("handler '{context}' failed: {message}")]
    Handler { context: String, message: String },

    #[error("client has been shut down")]
    ShutDown,
}

/// Coarse classification used for routing and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolOrdering,
    Transport,
    DuplicateRequest,
    PermanentFailure,
    Handler,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolOrdering => "protocol_ordering",
            Self::Transport => "transport",
            Self::DuplicateRequest => "duplicate_request",
            Self::PermanentFailure => "permanent_failure",
            Self::Handler => "handler",
            Self::Internal => "internal",
        }
    }
}

impl SyncError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolOrdering(_) | Self::Codec(_) => ErrorKind::ProtocolOrdering,
            Self::Transport(_) => ErrorKind::Transport,
            Self::AlreadyActive => ErrorKind::DuplicateRequest,
            Self::PermanentReconnectFailure { .. } => ErrorKind::PermanentFailure,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Tree(_) | Self::ShutDown => ErrorKind::Internal,
        }
    }

    /// Whether the sync loop recovers from this error without user action.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ProtocolOrdering | ErrorKind::Transport)
    }

    /// Wrap a tree error raised while applying a received diff.
    pub fn ordering(err: TreeError) -> Self {
        Self::ProtocolOrdering(err.to_string())
    }
}

/// Receiver of errors that have no caller to return to.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, err: &SyncError);
}

/// Default handler: structured log line.
#[derive(Debug, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, err: &SyncError) {
        error!(kind = err.kind().as_str(), error = %err, "Unhandled sync error");
    }
}

/// Cloneable handle to the one error handler shared by a client's (or
/// session's) components.
#[derive(Clone)]
pub struct ErrorSink {
    handler: Arc<dyn ErrorHandler>,
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new(Arc::new(LoggingErrorHandler))
    }
}

impl std::fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSink").finish_non_exhaustive()
    }
}

impl ErrorSink {
    pub fn new(handler: Arc<dyn ErrorHandler>) -> Self {
        Self { handler }
    }

    pub fn report(&self, err: &SyncError) {
        crate::metrics::record_error(err.kind().as_str(), "sink");
        // A panicking handler must not take the sync loop down with it.
        if catch_unwind(AssertUnwindSafe(|| self.handler.handle_error(err))).is_err() {
            error!(error = %err, "Error handler panicked while reporting");
        }
    }

    /// Run a fallible callback; a panic or `Err` is reported here and `None`
    /// is returned.
    pub fn guard<T, E, F>(&self, context: &str, f: F) -> Option<T>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::fmt::Display,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.report(&SyncError::Handler {
                    context: context.to_string(),
                    message: e.to_string(),
                });
                None
            }
            Err(panic) => {
                self.report(&SyncError::Handler {
                    context: context.to_string(),
                    message: panic_message(panic.as_ref()),
                });
                None
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Collects reported errors as strings.
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub(crate) errors: Mutex<Vec<String>>,
    }

    impl ErrorHandler for RecordingHandler {
        fn handle_error(&self, err: &SyncError) {
            self.errors.lock().push(err.to_string());
        }
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(SyncError::AlreadyActive.kind(), ErrorKind::DuplicateRequest);
        assert_eq!(
            SyncError::ordering(TreeError::UnknownNode(crate::NodeId(3))).kind(),
            ErrorKind::ProtocolOrdering
        );
        assert_eq!(
            SyncError::Transport(TransportError::Timeout).kind(),
            ErrorKind::Transport
        );
        assert!(SyncError::Transport(TransportError::Timeout).is_recoverable());
        assert!(!SyncError::AlreadyActive.is_recoverable());
        assert!(!SyncError::PermanentReconnectFailure {
            attempts: 3,
            elapsed: Duration::from_secs(1)
        }
        .is_recoverable());
    }

    #[test]
    fn test_guard_passes_through_success() {
        let sink = ErrorSink::default();
        let out = sink.guard("ok", || Ok::<_, String>(5));
        assert_eq!(out, Some(5));
    }

    #[test]
    fn test_guard_routes_errors_and_panics() {
        let handler = Arc::new(RecordingHandler::default());
        let sink = ErrorSink::new(handler.clone());

        let failed: Option<()> = sink.guard("listener-a", || Err("boom"));
        let panicked: Option<()> = sink.guard("listener-b", || -> Result<(), String> {
            panic!("kaboom")
        });

        assert!(failed.is_none());
        assert!(panicked.is_none());
        let errors = handler.errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("listener-a"));
        assert!(errors[0].contains("boom"));
        assert!(errors[1].contains("kaboom"));
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        struct Exploding;
        impl ErrorHandler for Exploding {
            fn handle_error(&self, _err: &SyncError) {
                panic!("handler exploded");
            }
        }
        let sink = ErrorSink::new(Arc::new(Exploding));
        sink.report(&SyncError::ShutDown);
    }
}
