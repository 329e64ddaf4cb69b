//! Construction-time options for [`Server`].

use crate::server::{Delegate, Server};
use crate::util::SignalReceiver;
use std::time::Duration;

/// One configurable aspect of a [`Server`], applied before first use.
#[derive(Debug)]
pub enum ServerOption {
    /// React to these notifications instead of OS termination signals.
    ShutdownSignal(SignalReceiver),
    /// Bound for graceful shutdown. Defaults to 30 seconds, the Kubernetes
    /// termination grace period.
    Timeout(Duration),
}

impl ServerOption {
    fn apply<D: Delegate>(self, server: Server<D>) -> Server<D> {
        match self {
            ServerOption::ShutdownSignal(signals) => server.with_shutdown_signal(signals),
            ServerOption::Timeout(timeout) => server.with_timeout(timeout),
        }
    }
}

impl<D: Delegate> Server<D> {
    /// Create a server and apply `options` in order; later options win.
    pub fn with_options(delegate: D, options: impl IntoIterator<Item = ServerOption>) -> Self {
        options
            .into_iter()
            .fold(Server::new(delegate), |server, option| option.apply(server))
    }
}
