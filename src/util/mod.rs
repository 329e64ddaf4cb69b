//! Utility functions and helpers.

mod logging;
mod request_id;
pub mod signal;

pub use logging::init_logging;
pub use request_id::{RequestId, REQUEST_ID_HEADER};
pub use signal::{os_signals, Signal, SignalReceiver, SignalSender, SIGNALS_TO_LISTEN_TO};
