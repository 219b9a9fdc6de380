//! The boundary between a request and the network.
//!
//! A [`Transport`] executes one composed [`RequestOptions`] and hands back the
//! status plus a stream of body chunks. [`HttpTransport`](crate::HttpTransport)
//! is the production implementation; tests use
//! [`MockTransport`](crate::testing::MockTransport).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use url::Url;

use crate::error::Result;
use crate::request::Method;

/// Everything the transport needs to perform one attempt.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    /// Fully composed URL, query string included.
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
    /// Deadline for the whole attempt, body included.
    pub timeout: Duration,
}

/// Status line, headers and streamed body of a response.
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl TransportResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Executes composed requests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform one attempt.
    ///
    /// Non-2xx statuses are returned as a response, not as an error; the
    /// request decides what they mean.
    async fn execute(&self, options: RequestOptions) -> Result<TransportResponse>;
}
