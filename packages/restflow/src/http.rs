//! `reqwest`-backed [`Transport`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{RestError, Result};
use crate::request::Method;
use crate::transport::{RequestOptions, Transport, TransportResponse};

/// HTTP(S) transport sharing one connection pool across requests.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http_client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (proxies, TLS settings, pool limits).
    pub fn with_client(http_client: Client) -> Self {
        Self { http_client }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, options: RequestOptions) -> Result<TransportResponse> {
        debug!(method = options.method.as_str(), url = %options.url, "sending http request");

        let mut builder = self
            .http_client
            .request(options.method.into(), options.url.clone())
            .timeout(options.timeout);
        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = options.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(url = %options.url, error = %e, "http request failed");
            RestError::from(e)
        })?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(RestError::from))
            .boxed();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_mapping() {
        assert_eq!(reqwest::Method::from(Method::Get), reqwest::Method::GET);
        assert_eq!(reqwest::Method::from(Method::Patch), reqwest::Method::PATCH);
        assert_eq!(reqwest::Method::from(Method::Delete), reqwest::Method::DELETE);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let transport = HttpTransport::new();
        let options = RequestOptions {
            method: Method::Get,
            url: url::Url::parse("http://127.0.0.1:1/").unwrap(),
            headers: BTreeMap::new(),
            body: None,
            timeout: std::time::Duration::from_secs(2),
        };

        let err = transport.execute(options).await.unwrap_err();
        assert!(err.is_transport());
    }
}
