//! Endpoint source contract and a static implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::endpoint::EndpointSet;
use crate::error::{Error, Result};
use crate::types::{Credentials, ServiceRef};

/// Produces the current backend set of a service.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// List the endpoints of `service`.
    ///
    /// An empty set is a valid answer (no ready backends). Errors are treated as
    /// transient by the reconciler.
    async fn list_endpoints(
        &self,
        service: &ServiceRef,
        credentials: &Credentials,
    ) -> Result<EndpointSet>;
}

/// Endpoint source backed by a settable map of `namespace/service` to endpoints.
///
/// Unknown services resolve to the empty set.
#[derive(Debug, Default)]
pub struct StaticEndpointSource {
    services: Mutex<HashMap<String, EndpointSet>>,
    failure: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl StaticEndpointSource {
    /// Create a source with no services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the endpoints of `namespace/service`.
    pub async fn set(&self, namespace: &str, service: &str, endpoints: EndpointSet) {
        self.services
            .lock()
            .await
            .insert(format!("{namespace}/{service}"), endpoints);
    }

    /// Make every call fail with `reason` until [`Self::recover`] is called.
    pub async fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock().await = Some(reason.into());
    }

    /// Stop failing.
    pub async fn recover(&self) {
        *self.failure.lock().await = None;
    }

    /// Number of `list_endpoints` calls made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointSource for StaticEndpointSource {
    async fn list_endpoints(
        &self,
        service: &ServiceRef,
        _credentials: &Credentials,
    ) -> Result<EndpointSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.failure.lock().await.clone() {
            return Err(Error::source_failed(reason));
        }
        Ok(self
            .services
            .lock()
            .await
            .get(&service.key())
            .cloned()
            .unwrap_or_default())
    }
}
