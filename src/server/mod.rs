//! Graceful shutdown coordination around a delegate server.

mod context;
mod coordinator;
mod delegate;
mod error;
mod options;

pub use context::Context;
pub use coordinator::{Server, DEFAULT_SHUTDOWN_TIMEOUT};
pub use delegate::{Delegate, DelegateError};
pub use error::ListenError;
pub use options::ServerOption;
