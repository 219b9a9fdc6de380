//! Request extension points.
//!
//! Every step of an attempt that a specialised request may want to change is
//! a method on [`RequestHooks`] with a default implementation. Override only
//! what you need:
//!
//! ```ignore
//! struct BearerAuth(String);
//!
//! #[async_trait]
//! impl RequestHooks for BearerAuth {
//!     async fn compose_options(&self, request: &Request) -> Result<RequestOptions> {
//!         let mut options = compose_options(request)?;
//!         options.headers.insert("authorization".into(), format!("Bearer {}", self.0));
//!         Ok(options)
//!     }
//! }
//!
//! let request = Request::get("https://api.example.com/items").with_hooks(BearerAuth(token));
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use url::Url;

use crate::error::{RestError, Result};
use crate::events::RestEvent;
use crate::request::{Body, Request};
use crate::transport::RequestOptions;

/// Deadline applied when a request sets no timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60);

const ALLOWED_SCHEMES: [&str; 2] = ["http", "https"];

/// Overridable steps of a request attempt.
#[async_trait]
pub trait RequestHooks: Send + Sync + 'static {
    /// Build the transport options for one attempt.
    async fn compose_options(&self, request: &Request) -> Result<RequestOptions> {
        compose_options(request)
    }

    /// Accumulate one body chunk.
    fn parse_chunk(&self, _request: &Request, buffer: &mut BytesMut, chunk: Bytes) -> Result<()> {
        buffer.extend_from_slice(&chunk);
        Ok(())
    }

    /// Turn the accumulated body into the value emitted as data.
    fn parse_body(&self, _request: &Request, body: Bytes) -> Result<Value> {
        parse_body(&body)
    }

    /// Prefix for log lines about this request.
    fn log_header(&self, request: &Request) -> String {
        format!("[{}] ", request.target())
    }

    fn emit_start(&self, request: &Request) -> anyhow::Result<()> {
        request.events().emit(&RestEvent::Start { id: request.id() })
    }

    fn emit_data(&self, request: &Request, value: Value) -> anyhow::Result<()> {
        request.events().emit(&RestEvent::Data {
            id: request.id(),
            value,
        })
    }

    fn emit_complete(&self, request: &Request) -> anyhow::Result<()> {
        request.events().emit(&RestEvent::Complete { id: request.id() })
    }

    fn emit_error_ignored(&self, request: &Request, error: &RestError) -> anyhow::Result<()> {
        request.events().emit(&RestEvent::ErrorIgnored {
            id: request.id(),
            error: error.clone(),
        })
    }
}

/// Hooks with every default in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl RequestHooks for DefaultHooks {}

/// Default option composition: URL plus query, headers, encoded body, timeout.
pub fn compose_options(request: &Request) -> Result<RequestOptions> {
    let mut url = Url::parse(request.target())?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(RestError::validation(format!(
            "Protocol {}: not available. Available: {}",
            url.scheme(),
            ALLOWED_SCHEMES.join(", ")
        )));
    }

    {
        let mut query = url.query_pairs_mut();
        for (name, value) in request.params() {
            if let Some(value) = query_value(value) {
                query.append_pair(name, &value);
            }
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }

    let mut headers = request.headers().clone();
    let body = match request.body() {
        None => None,
        Some(Body::Text(text)) => Some(Bytes::from(text.clone())),
        Some(Body::Json(value)) => {
            if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                headers.insert("content-type".to_string(), "application/json".to_string());
            }
            let encoded = serde_json::to_vec(value)
                .map_err(|e| RestError::validation(format!("invalid json body: {e}")))?;
            Some(Bytes::from(encoded))
        }
    };

    Ok(RequestOptions {
        method: request.method(),
        url,
        headers,
        body,
        timeout: request.timeout().unwrap_or(DEFAULT_REQUEST_TIMEOUT),
    })
}

/// Query encoding of a param value; `None` for null.
fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Default body parsing.
///
/// Empty bodies are `null`. Any valid JSON document is parsed; text that is
/// not JSON is kept as a string. Bodies that are not UTF-8 are a service
/// error.
pub fn parse_body(body: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(body)
        .map_err(|e| RestError::service(format!("Response body is not UTF-8: {e}")))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(value),
        Err(_) => Ok(Value::String(text.to_string())),
    }
}
