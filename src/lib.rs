#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # poolsync
//!
//! Keeps BIG-IP pool membership in sync with Kubernetes service endpoints.
//!
//! The engine lives in [`poolsync_reconciler`] and the HTTP clients in
//! [`poolsync_adapters`]; this crate adds the configuration file and the daemon
//! commands on top.

pub use poolsync_adapters;
pub use poolsync_reconciler;

pub mod cli;
pub mod commands;
pub mod config;
