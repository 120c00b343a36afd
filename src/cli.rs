//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// poolsync - BIG-IP pool membership reconciler
#[derive(Parser, Debug)]
#[command(name = "poolsync")]
#[command(version)]
#[command(about = "Keeps BIG-IP pool members in sync with Kubernetes service endpoints")]
#[command(
    long_about = "poolsync polls the Endpoints of each configured Kubernetes service and applies the minimal add/remove diff to the matching BIG-IP pool. Pools are created on start and deleted on stop."
)]
pub struct Cli {
    /// Default log filter when RUST_LOG is unset (e.g. "debug", "poolsync_reconciler=trace")
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the reconciler daemon
    Run {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Use an in-memory pool store instead of the BIG-IP
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Validate a configuration file and print its instances
    Check {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}
