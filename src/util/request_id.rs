//! Request IDs for correlating in-flight requests with shutdown logs.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Header carrying a caller-provided request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a short, process-unique request ID: `req-{counter:016x}`.
fn generate_short_request_id() -> String {
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("req-{:016x}", count)
}

/// A request ID that can be recorded in tracing fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    /// A random, globally unique ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short() -> Self {
        Self(generate_short_request_id())
    }

    /// Reuse the caller's ID, falling back to a fresh one when it is absent
    /// or empty.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => Self(v.to_string()),
            _ => Self::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
