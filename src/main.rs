//! # poolsync
//!
//! Entry point for the pool membership reconciler.
//!
//! ## Startup
//!
//! 1. **Tracing** - `RUST_LOG` wins; otherwise `--log-level` (default `info`)
//! 2. **Configuration** - the TOML file is parsed, validated and overlaid with
//!    environment secrets
//! 3. **Binding** - every configured instance is started; conflicts are logged and
//!    skipped
//!
//! ## Shutdown
//!
//! Ctrl+C or SIGTERM aborts all loops. Pools are not deleted: state is not
//! persisted, and the next start adopts the existing pools.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use poolsync::cli::Cli;
use poolsync::commands::execute_command;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    execute_command(cli.command).await
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
