//! Structured error types for restflow.
//!
//! `RestError` is `Clone` because a single failure is routinely broadcast:
//! a failed [`SignalCell`](crate::SignalCell) hands the same error to every
//! waiter, and a failed stream hands it to every consumer.
//!
//! # Taxonomy
//!
//! - [`RestError::Transport`] / [`RestError::Timeout`] - the transport could
//!   not deliver a successful response. These are the only retried failures.
//! - [`RestError::Service`] - the response arrived but could not be used.
//! - [`RestError::Validation`] - an input precondition failed.
//!
//! Ignored errors are not a variant. A request whose failure matches its
//! [`IgnorePolicy`](crate::IgnorePolicy) emits `request_error_ignored` and
//! `send` returns `Ok(None)`.
//!
//! # Example
//!
//! ```ignore
//! match request.send(&transport).await {
//!     Ok(Some(value)) => println!("{value}"),
//!     Ok(None) => println!("ignored"),
//!     Err(RestError::Transport { status: Some(404), .. }) => println!("missing"),
//!     Err(err) => return Err(err.into()),
//! }
//! ```

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Result type for restflow operations.
pub type Result<T> = std::result::Result<T, RestError>;

/// Errors produced by requests, the scheduler and the sync primitives.
#[derive(Debug, Clone, Error)]
pub enum RestError {
    /// Connection failure or a non-success HTTP status.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable failure description.
        message: String,
        /// HTTP status, when a response was received.
        status: Option<u16>,
    },

    /// The request deadline expired before the response completed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The response was transported but is semantically a failure.
    #[error("service error: {message}")]
    Service {
        /// Human-readable failure description.
        message: String,
        /// HTTP status associated with the failure, if any.
        status: Option<u16>,
        /// Structured failure payload returned by the service.
        payload: Option<Value>,
    },

    /// An input precondition failed.
    #[error("validation error: {0}")]
    Validation(String),

    /// An event listener failed while the engine emitted on its own behalf.
    #[error("listener error: {0}")]
    Listener(String),

    /// A signal cell was dropped while waiters were still pending.
    #[error("signal cell dropped before it was resolved")]
    Abandoned,
}

impl RestError {
    /// Create a transport error without a status.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
        }
    }

    /// Create a transport error for a received HTTP status.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Create a service error without payload.
    pub fn service(message: impl Into<String>) -> Self {
        Self::Service {
            message: message.into(),
            status: None,
            payload: None,
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// The HTTP status associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } | Self::Service { status, .. } => *status,
            _ => None,
        }
    }

    /// Returns true for failures of the transport itself (retry candidates).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

impl From<url::ParseError> for RestError {
    fn from(err: url::ParseError) -> Self {
        Self::Validation(format!("invalid url: {}", err))
    }
}
