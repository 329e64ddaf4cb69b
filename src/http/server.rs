//! HTTP/1.1 server that drains in-flight requests on shutdown.

use crate::config::HttpServerConfig;
use crate::http::SlowHandler;
use crate::server::{Delegate, DelegateError};
use crate::util::RequestId;
use async_trait::async_trait;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A [`Delegate`] serving [`SlowHandler`] over HTTP/1.1.
///
/// The listener is bound up front so the address is known before serving.
/// Once shutdown starts the listener is closed right away: new connections
/// are refused while accepted ones finish their current request.
pub struct HttpServer {
    local_addr: SocketAddr,
    /// Taken by `serve`, or by `shutdown` if serving never started.
    listener: Mutex<Option<TcpListener>>,
    handler: SlowHandler,
    /// Stop accepting and start draining.
    stop: CancellationToken,
    /// Set once every connection has drained.
    stopped: watch::Sender<bool>,
}

impl HttpServer {
    /// Bind the configured address.
    pub async fn bind(config: &HttpServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Self::from_listener(listener, SlowHandler::from_config(config))
    }

    pub fn from_listener(listener: TcpListener, handler: SlowHandler) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        debug!(address = %local_addr, "http server bound");

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            handler,
            stop: CancellationToken::new(),
            stopped: watch::Sender::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn serve_connection(&self, graceful: &GracefulShutdown, stream: TcpStream, client: SocketAddr) {
        let conn_id = RequestId::short();
        debug!(conn_id = %conn_id, client = %client, "connection accepted");

        let handler = self.handler.clone();
        let service = service_fn(move |req| {
            let handler = handler.clone();
            async move { handler.handle(req).await }
        });

        let conn = http1::Builder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(stream), service);
        let conn = graceful.watch(conn);

        tokio::spawn(async move {
            match conn.await {
                Ok(()) => debug!(conn_id = %conn_id, "connection closed"),
                Err(e) => debug!(conn_id = %conn_id, client = %client, error = %e, "connection error"),
            }
        });
    }
}

#[async_trait]
impl Delegate for HttpServer {
    async fn serve(&self) -> Result<(), DelegateError> {
        let listener = self.listener.lock().take();
        let Some(listener) = listener else {
            return Err(if self.stop.is_cancelled() {
                DelegateError::ServerClosed
            } else {
                DelegateError::AlreadyServing
            });
        };

        info!(address = %self.local_addr, "http server listening");
        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client)) => self.serve_connection(&graceful, stream, client),
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }

                _ = self.stop.cancelled() => break,
            }
        }

        drop(listener);
        info!("http server stopped accepting connections, draining");

        graceful.shutdown().await;
        self.stopped.send_replace(true);
        info!("http server drained");

        Err(DelegateError::ServerClosed)
    }

    async fn shutdown(&self, deadline: Instant) -> Result<(), DelegateError> {
        if *self.stopped.borrow() {
            return Err(DelegateError::ServerClosed);
        }

        self.stop.cancel();

        let unused = self.listener.lock().take();
        if unused.is_some() {
            // Never served: nothing to drain.
            self.stopped.send_replace(true);
            return Ok(());
        }

        let mut stopped = self.stopped.subscribe();
        let drained = timeout_at(deadline, stopped.wait_for(|s| *s))
            .await
            .is_ok();

        if drained {
            Ok(())
        } else {
            warn!(address = %self.local_addr, "connections still open at shutdown deadline");
            Err(DelegateError::DeadlineExceeded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn bind(delay: Duration) -> Arc<HttpServer> {
        let config = HttpServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            delay,
            body: "OK".to_string(),
        };
        Arc::new(HttpServer::bind(&config).await.unwrap())
    }

    async fn get(addr: SocketAddr) -> io::Result<String> {
        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok(response)
    }

    #[tokio::test]
    async fn test_serves_requests() {
        let server = bind(Duration::ZERO).await;
        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve().await });

        let response = get(server.local_addr()).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("OK"));

        server.shutdown(Instant::now() + Duration::from_secs(5)).await.unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(DelegateError::ServerClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let server = bind(Duration::ZERO).await;
        let deadline = Instant::now() + Duration::from_secs(1);

        server.shutdown(deadline).await.unwrap();
        assert!(matches!(server.serve().await, Err(DelegateError::ServerClosed)));
        assert!(matches!(
            server.shutdown(deadline).await,
            Err(DelegateError::ServerClosed)
        ));
        assert!(TcpStream::connect(server.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_twice() {
        let server = bind(Duration::ZERO).await;
        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve().await });

        // Wait until the first serve owns the listener.
        get(server.local_addr()).await.unwrap();
        assert!(matches!(server.serve().await, Err(DelegateError::AlreadyServing)));

        server.shutdown(Instant::now() + Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap().unwrap_err();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        let server = bind(Duration::from_millis(300)).await;
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve().await });

        let addr = server.local_addr();
        let request = tokio::spawn(async move { get(addr).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        server.shutdown(Instant::now() + Duration::from_secs(5)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));

        let response = request.await.unwrap().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_deadline_exceeded() {
        let server = bind(Duration::from_secs(2)).await;
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve().await });

        let addr = server.local_addr();
        tokio::spawn(async move { get(addr).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = server.shutdown(Instant::now() + Duration::from_millis(100)).await;
        assert!(matches!(result, Err(DelegateError::DeadlineExceeded)));
    }
}
