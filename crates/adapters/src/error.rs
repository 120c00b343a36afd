//! Error types for the HTTP adapters.

use poolsync_reconciler::{PoolTarget, StoreOperation};
use thiserror::Error;

/// Result type for adapter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while talking to the Kubernetes or BIG-IP APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// The API answered with a status the adapter does not handle.
    #[error("unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// A pool member name could not be parsed into an endpoint.
    #[error("invalid pool member name: {name}")]
    InvalidMember { name: String },

    /// An address reported by the registry is not an IP address.
    #[error("invalid endpoint address: {address}")]
    InvalidAddress { address: String },

    /// A pool target cannot be mapped onto an iControl path.
    #[error("invalid pool target: {target}")]
    InvalidPoolTarget { target: String },

    /// A base URL cannot carry path segments.
    #[error("URL cannot be used as an API base: {url}")]
    InvalidBaseUrl { url: String },

    /// Client TLS settings are incomplete.
    #[error("invalid TLS configuration: {reason}")]
    InvalidTlsConfig { reason: String },

    /// HTTP error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parse error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an unexpected status error.
    pub fn unexpected_status(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        Self::UnexpectedStatus {
            status: status.as_u16(),
            body: body.into(),
        }
    }

    /// Create an invalid member error.
    pub fn invalid_member(name: impl Into<String>) -> Self {
        Self::InvalidMember { name: name.into() }
    }

    /// Create an invalid address error.
    pub fn invalid_address(address: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
        }
    }

    /// Create an invalid pool target error.
    pub fn invalid_pool_target(target: impl Into<String>) -> Self {
        Self::InvalidPoolTarget {
            target: target.into(),
        }
    }

    /// Create an invalid base URL error.
    pub fn invalid_base_url(url: impl Into<String>) -> Self {
        Self::InvalidBaseUrl { url: url.into() }
    }

    /// Create an invalid TLS configuration error.
    pub fn invalid_tls_config(reason: impl Into<String>) -> Self {
        Self::InvalidTlsConfig {
            reason: reason.into(),
        }
    }

    /// Convert into the reconciler's endpoint-source error.
    #[must_use]
    pub fn into_source_error(self) -> poolsync_reconciler::Error {
        poolsync_reconciler::Error::source_failed(self.to_string())
    }

    /// Convert into the reconciler's pool-store error.
    #[must_use]
    pub fn into_store_error(
        self,
        operation: StoreOperation,
        pool: &PoolTarget,
    ) -> poolsync_reconciler::Error {
        poolsync_reconciler::Error::store_failed(operation, pool.as_str(), self.to_string())
    }
}
