//! Error types for the reconciler crate.

use thiserror::Error;

use crate::store::StoreOperation;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Another instance already manages the requested pool.
    #[error("instance '{name}' cannot manage pool '{pool}': already managed by '{owner}'")]
    Conflict {
        name: String,
        pool: String,
        owner: String,
    },

    /// The endpoint source could not produce an endpoint list.
    #[error("endpoint source failed: {reason}")]
    Source { reason: String },

    /// A pool store call failed.
    #[error("pool store {operation} failed for '{pool}': {reason}")]
    Store {
        operation: StoreOperation,
        pool: String,
        reason: String,
    },

    /// An endpoint string could not be parsed.
    #[error("invalid endpoint '{value}'")]
    InvalidEndpoint { value: String },

    /// Instance not present in the registry.
    #[error("instance '{name}' not found")]
    InstanceNotFound { name: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a conflict error.
    pub fn conflict(
        name: impl Into<String>,
        pool: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            name: name.into(),
            pool: pool.into(),
            owner: owner.into(),
        }
    }

    /// Create an endpoint source error.
    pub fn source_failed(reason: impl Into<String>) -> Self {
        Self::Source {
            reason: reason.into(),
        }
    }

    /// Create a pool store error.
    pub fn store_failed(
        operation: StoreOperation,
        pool: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Store {
            operation,
            pool: pool.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid endpoint error.
    pub fn invalid_endpoint(value: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            value: value.into(),
        }
    }

    /// Create an instance not found error.
    pub fn instance_not_found(name: impl Into<String>) -> Self {
        Self::InstanceNotFound { name: name.into() }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether this error is a pool-target conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
