//! OS termination signals as a stream of stop notifications.
//!
//! The default source subscribes to [`SIGNALS_TO_LISTEN_TO`] and forwards
//! every delivery into a one-slot channel. Callers that want to drive stops
//! themselves swap in their own channel from [`channel`].

use std::fmt;
use std::io;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A termination request from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Hangup,
    Quit,
    Terminate,
}

/// The signals the default source listens to.
pub const SIGNALS_TO_LISTEN_TO: [Signal; 4] = [
    Signal::Interrupt,
    Signal::Hangup,
    Signal::Quit,
    Signal::Terminate,
];

/// Receiving end of a signal source.
pub type SignalReceiver = mpsc::Receiver<Signal>;

/// Sending end of a signal source.
pub type SignalSender = mpsc::Sender<Signal>;

impl Signal {
    /// Conventional signal name, e.g. `SIGINT`.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Hangup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
            Signal::Terminate => "SIGTERM",
        }
    }

    #[cfg(unix)]
    fn kind(&self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;

        match self {
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Hangup => SignalKind::hangup(),
            Signal::Quit => SignalKind::quit(),
            Signal::Terminate => SignalKind::terminate(),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Create a signal source buffered by one.
///
/// The first notification is kept even if nobody is receiving yet.
pub fn channel() -> (SignalSender, SignalReceiver) {
    mpsc::channel(1)
}

/// Forward a delivered signal without ever blocking the producer.
///
/// Returns `false` once the receiving side is gone.
fn forward(tx: &SignalSender, signal: Signal) -> bool {
    match tx.try_send(signal) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!(signal = %signal, "stop notification already pending");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Subscribe to the OS termination signals.
///
/// All handlers are registered before this returns, so nothing is delivered
/// before registration and nothing delivered after it is lost. Must be
/// called from within a Tokio runtime.
#[cfg(unix)]
pub fn os_signals() -> io::Result<SignalReceiver> {
    use tokio::signal::unix::signal;

    let mut streams = Vec::with_capacity(SIGNALS_TO_LISTEN_TO.len());
    for sig in SIGNALS_TO_LISTEN_TO {
        streams.push((sig, signal(sig.kind())?));
    }

    let (tx, rx) = channel();
    for (sig, mut stream) in streams {
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                debug!(signal = %sig, "received OS signal");
                if !forward(&tx, sig) {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

/// Subscribe to Ctrl+C, the only termination signal available here.
#[cfg(not(unix))]
pub fn os_signals() -> io::Result<SignalReceiver> {
    let mut ctrl_c = tokio::signal::windows::ctrl_c()?;

    let (tx, rx) = channel();
    tokio::spawn(async move {
        while ctrl_c.recv().await.is_some() {
            debug!(signal = %Signal::Interrupt, "received OS signal");
            if !forward(&tx, Signal::Interrupt) {
                break;
            }
        }
    });

    Ok(rx)
}
