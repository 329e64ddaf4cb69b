//! A demonstration HTTP delegate.

mod handler;
mod server;

pub use handler::SlowHandler;
pub use server::HttpServer;
