//! Outcome errors for a single `listen` invocation.

use crate::server::DelegateError;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

/// Why a `listen` call did not end in a clean shutdown.
///
/// Any of these means some in-flight work may have been lost. None of them
/// is retried.
#[derive(Debug, Error)]
pub enum ListenError {
    /// The delegate failed to start or crashed while serving.
    #[error("server failed while serving: {0}")]
    Serve(#[source] DelegateError),

    /// The serve task panicked or was aborted.
    #[error("serve task terminated abnormally: {0}")]
    ServeTask(#[from] JoinError),

    /// The delegate's shutdown failed for a reason other than being closed.
    #[error("server failed to shut down: {0}")]
    Shutdown(#[source] DelegateError),

    /// Shutdown did not complete inside the allotted time.
    #[error("graceful shutdown did not complete within {}", format_timeout(.timeout))]
    DeadlineExceeded { timeout: Duration },

    /// The default OS signal source could not be registered.
    #[error("failed to register shutdown signals: {0}")]
    Signal(#[source] io::Error),
}

fn format_timeout(timeout: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*timeout)
}

impl ListenError {
    /// The delegate error behind this outcome, if there is one.
    pub fn delegate_error(&self) -> Option<&DelegateError> {
        match self {
            Self::Serve(e) | Self::Shutdown(e) => Some(e),
            _ => None,
        }
    }
}
