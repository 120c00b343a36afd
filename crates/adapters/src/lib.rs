#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # poolsync-adapters
//!
//! HTTP implementations of the reconciler's collaborator traits.
//!
//! - [`KubernetesEndpointSource`] reads `core/v1` Endpoints objects and implements
//!   [`poolsync_reconciler::EndpointSource`].
//! - [`BigIpPoolStore`] drives LTM pools over iControl REST and implements
//!   [`poolsync_reconciler::PoolStore`].
//!
//! ## Example
//!
//! ```ignore
//! use poolsync_adapters::{BigIpConfig, BigIpPoolStore, KubernetesConfig, KubernetesEndpointSource};
//!
//! let source = KubernetesEndpointSource::new(&KubernetesConfig::default())?;
//! let store = BigIpPoolStore::new(&BigIpConfig::new(
//!     "https://10.1.1.245".parse()?,
//!     "admin",
//!     "admin",
//! ))?;
//! ```

pub mod bigip;
pub mod config;
pub mod error;
pub mod kubernetes;

pub use bigip::{BigIpPoolStore, PoolPath, member_name, parse_member_name};
pub use config::{BigIpConfig, KubernetesConfig};
pub use error::{Error, Result};
pub use kubernetes::KubernetesEndpointSource;
