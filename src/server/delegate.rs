//! The capability pair a wrapped server has to provide.

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::time::Instant;

/// Errors reported by a [`Delegate`].
#[derive(Debug, Error)]
pub enum DelegateError {
    /// The server was already closed. The coordinator treats this as success.
    #[error("server closed")]
    ServerClosed,

    #[error("server is already serving")]
    AlreadyServing,

    #[error("deadline exceeded while draining connections")]
    DeadlineExceeded,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl DelegateError {
    /// Create a free-form error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Whether this is the "already closed" sentinel.
    pub fn is_server_closed(&self) -> bool {
        matches!(self, Self::ServerClosed)
    }
}

/// Something that listens for connections and can be stopped gracefully.
///
/// Most of the time this is [`crate::http::HttpServer`], but any type works:
/// tests use in-memory spies that never touch a socket.
#[async_trait]
pub trait Delegate: Send + Sync + 'static {
    /// Serve until stopped or failed.
    ///
    /// Returns `Ok(())` or [`DelegateError::ServerClosed`] once a matching
    /// [`Delegate::shutdown`] call has stopped the server, and must return
    /// promptly after that call succeeds.
    async fn serve(&self) -> Result<(), DelegateError>;

    /// Stop accepting new work and drain in-flight work before `deadline`.
    async fn shutdown(&self, deadline: Instant) -> Result<(), DelegateError>;
}
