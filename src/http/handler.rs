//! A deliberately slow request handler.
//!
//! Every request takes `delay` to answer, which makes the difference between
//! a graceful and an abrupt shutdown easy to observe.

use crate::config::HttpServerConfig;
use crate::util::{RequestId, REQUEST_ID_HEADER};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response};
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SlowHandler {
    delay: Duration,
    body: Bytes,
}

impl SlowHandler {
    pub fn new(delay: Duration, body: impl Into<Bytes>) -> Self {
        Self {
            delay,
            body: body.into(),
        }
    }

    pub fn from_config(config: &HttpServerConfig) -> Self {
        Self::new(config.delay, config.body.clone())
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait for the configured delay, then answer `200 OK` with the body.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible> {
        let request_id = RequestId::from_header(
            req.headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
        );
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        drop(req);

        debug!(request_id = %request_id, method = %method, path = %path, "request received");

        let start = Instant::now();
        tokio::time::sleep(self.delay).await;

        let mut response = Response::new(Full::new(self.body.clone()));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            duration_ms = start.elapsed().as_millis(),
            "request completed"
        );

        Ok(response)
    }
}
