//! Reconciliation engine keeping load-balancer pools in sync with service endpoints.
//!
//! This crate implements a reconciliation pattern inspired by Kubernetes controllers:
//!
//! - **Desired State**: the endpoint list of a service, read from an [`EndpointSource`]
//! - **Actual State**: the member list of a pool, read from a [`PoolStore`]
//! - **Diff**: members to add and members to remove ([`MembershipDiff`])
//! - **Actions**: incremental add/remove calls, never a wholesale replace
//!
//! # Key Concepts
//!
//! ## Instances
//!
//! An instance binds one service to one pool. Instances live in a shared
//! [`InstanceRegistry`], which refuses to let two instances manage the same pool.
//!
//! ## Reconciliation
//!
//! Each instance gets one [`Reconciler`] task that periodically:
//! 1. Re-reads its record from the registry (a missing record means "stop")
//! 2. Lists the service endpoints
//! 3. Reads the pool members (creating the pool if it is absent)
//! 4. Applies the diff
//!
//! ## Lifecycle
//!
//! [`LifecycleController`] is the entry point: `start`, `update` and `stop`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use poolsync_reconciler::{
//!     InMemoryPoolStore, InstanceSpec, LifecycleController, PoolConfig, ReconcilerConfig,
//!     ServiceRef, StaticEndpointSource,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let controller = LifecycleController::new(
//!         Arc::new(StaticEndpointSource::new()),
//!         Arc::new(InMemoryPoolStore::new()),
//!         ReconcilerConfig::default(),
//!     );
//!
//!     let spec = InstanceSpec::new(
//!         "web",
//!         ServiceRef::new("https://10.1.1.1:6443", "default", "web"),
//!         PoolConfig::new("/Common/web"),
//!     );
//!     let _ = controller.start(spec).await;
//! }
//! ```

#![forbid(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod diff;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod reconciler;
pub mod registry;
pub mod source;
pub mod store;
pub mod types;

// Re-export main types
pub use diff::{MembershipDiff, diff};
pub use endpoint::{Endpoint, EndpointSet, display_set};
pub use error::{Error, Result};
pub use lifecycle::{BindReport, BindingState, LifecycleController, StopReport};
pub use reconciler::{LoopExit, PassOutcome, Phase, Reconciler, ReconcilerConfig};
pub use registry::{InstanceRegistry, Registration, TickDecision};
pub use source::{EndpointSource, StaticEndpointSource};
pub use store::{InMemoryPoolStore, PoolStore, StoreCall, StoreOperation};
pub use types::{
    Credentials, InstanceRecord, InstanceSpec, InstanceState, LoopId, PollInterval, PoolConfig,
    PoolTarget, ServiceRef,
};
