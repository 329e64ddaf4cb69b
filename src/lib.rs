//! graceful-shutdown - orderly termination for long-running servers
//!
//! Wrap anything implementing [`Delegate`] in a [`Server`] and call
//! [`Server::listen`]. In-flight work is allowed to finish while new work is
//! refused, bounded by a deadline, once an OS termination signal (or a
//! caller-supplied [`Context`]) asks for it.
//!
//! ```no_run
//! use graceful_shutdown::config::HttpServerConfig;
//! use graceful_shutdown::http::HttpServer;
//! use graceful_shutdown::Server;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let http = HttpServer::bind(&HttpServerConfig::default()).await?;
//! let mut server = Server::new(http).with_timeout(Duration::from_secs(10));
//! server.listen().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod http;
pub mod server;
pub mod util;

pub use config::Config;
pub use server::{Context, Delegate, DelegateError, ListenError, Server, ServerOption};
