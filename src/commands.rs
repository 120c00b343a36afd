//! CLI command handlers.
//!
//! `run` owns the process lifecycle: it builds the collaborators, binds every
//! configured instance and then waits for signals. SIGHUP re-reads the file and
//! applies the difference; Ctrl-C and SIGTERM abort the loops and leave every pool
//! as it is.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use itertools::Itertools;
use poolsync_adapters::{BigIpPoolStore, KubernetesEndpointSource};
use poolsync_reconciler::{
    BindingState, EndpointSource, InMemoryPoolStore, InstanceSpec, LifecycleController,
    PoolStore,
};
use tracing::{error, info, warn};

use crate::cli::Commands;
use crate::config::DaemonConfig;

/// Execute a CLI command.
///
/// This is the main command dispatcher that routes to the appropriate handler.
pub async fn execute_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { config, dry_run } => cmd_run(config, dry_run).await,
        Commands::Check { config } => cmd_check(&config),
    }
}

/// Changes needed to move the running set of instances to a new configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadPlan {
    /// Names missing from the new configuration.
    pub stop: Vec<String>,
    /// Names present in both whose spec changed.
    pub update: Vec<InstanceSpec>,
    /// Names new in the configuration.
    pub start: Vec<InstanceSpec>,
}

impl ReloadPlan {
    /// Whether the reload changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stop.is_empty() && self.update.is_empty() && self.start.is_empty()
    }
}

/// Diff the running specs against the desired ones.
#[must_use]
pub fn plan_reload(current: &[InstanceSpec], desired: &[InstanceSpec]) -> ReloadPlan {
    let running: HashMap<&str, &InstanceSpec> = current
        .iter()
        .map(|spec| (spec.name.as_str(), spec))
        .collect();
    let wanted: HashMap<&str, &InstanceSpec> = desired
        .iter()
        .map(|spec| (spec.name.as_str(), spec))
        .collect();

    let stop = current
        .iter()
        .filter(|spec| !wanted.contains_key(spec.name.as_str()))
        .map(|spec| spec.name.clone())
        .sorted()
        .collect_vec();

    let (update, start): (Vec<_>, Vec<_>) = desired
        .iter()
        .filter(|spec| running.get(spec.name.as_str()) != Some(spec))
        .cloned()
        .partition(|spec| running.contains_key(spec.name.as_str()));

    ReloadPlan {
        stop,
        update,
        start,
    }
}

/// Apply `plan`: stops first so freed pools can be re-claimed, then updates, then
/// starts. Returns the number of rejected bindings.
pub async fn apply_plan(controller: &LifecycleController, plan: ReloadPlan) -> usize {
    for name in &plan.stop {
        let report = controller.stop(name).await;
        info!(instance = %name, state = %report.state(), "Instance stopped");
    }

    let mut rejected = 0usize;
    for spec in plan.update {
        let name = spec.name.clone();
        let result = controller.update(spec).await;
        rejected = rejected.saturating_add(report_binding(&name, &result));
    }
    for spec in plan.start {
        let name = spec.name.clone();
        let result = controller.start(spec).await;
        rejected = rejected.saturating_add(report_binding(&name, &result));
    }
    rejected
}

fn report_binding<T>(name: &str, result: &poolsync_reconciler::Result<T>) -> usize {
    let state = BindingState::of(result);
    match result {
        Ok(_) => {
            info!(instance = %name, state = %state, "Instance bound");
            0
        }
        Err(e) => {
            error!(instance = %name, state = %state, error = %e, "Instance rejected");
            1
        }
    }
}

async fn cmd_run(config_path: PathBuf, dry_run: bool) -> Result<()> {
    let config = DaemonConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let source: Arc<dyn EndpointSource> = Arc::new(
        KubernetesEndpointSource::new(&config.kubernetes)
            .context("Failed to build Kubernetes client")?,
    );
    let store: Arc<dyn PoolStore> = if dry_run {
        warn!("Dry run: pool changes are kept in memory and never reach the BIG-IP");
        Arc::new(InMemoryPoolStore::new())
    } else {
        let bigip = config
            .bigip
            .as_ref()
            .context("[bigip] section is required unless --dry-run is given")?;
        Arc::new(BigIpPoolStore::new(bigip).context("Failed to build BIG-IP client")?)
    };

    let controller = LifecycleController::new(source, store, config.reconciler_config());
    let initial = plan_reload(&[], &config.instance_specs());
    let rejected = apply_plan(&controller, initial).await;
    info!(
        instances = controller.instances().await.len(),
        rejected,
        config = %config_path.display(),
        "poolsync running"
    );

    let mut signals = Signals::new()?;
    loop {
        match signals.next().await {
            DaemonEvent::Reload => reload(&controller, &config_path).await,
            DaemonEvent::Shutdown => break,
        }
    }

    controller.shutdown().await;
    info!("poolsync stopped; pools left as they are");
    Ok(())
}

async fn reload(controller: &LifecycleController, config_path: &Path) {
    info!(config = %config_path.display(), "Reloading configuration");
    let config = match DaemonConfig::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Reload failed, keeping the running configuration");
            return;
        }
    };

    let current = controller
        .instances()
        .await
        .into_iter()
        .map(|record| record.spec)
        .collect_vec();
    let plan = plan_reload(&current, &config.instance_specs());
    if plan.is_empty() {
        info!("Configuration unchanged");
        return;
    }
    info!(
        stop = plan.stop.len(),
        update = plan.update.len(),
        start = plan.start.len(),
        "Applying configuration changes"
    );
    apply_plan(controller, plan).await;
}

fn cmd_check(config_path: &Path) -> Result<()> {
    let config = DaemonConfig::from_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    println!(
        "{:<20} {:<30} {:<30} {:>8}",
        "INSTANCE", "SERVICE", "POOL", "INTERVAL"
    );
    for spec in config.instance_specs() {
        println!(
            "{:<20} {:<30} {:<30} {:>7}s",
            spec.name,
            spec.service.key(),
            spec.pool_target(),
            spec.poll_interval.duration().as_secs()
        );
    }
    if config.bigip.is_none() {
        println!("warning: no [bigip] section; only --dry-run will work");
    }
    Ok(())
}

enum DaemonEvent {
    Reload,
    Shutdown,
}

struct Signals {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            hangup: signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?,
            terminate: signal(SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn next(&mut self) -> DaemonEvent {
        tokio::select! {
            () = wait_for_ctrl_c() => DaemonEvent::Shutdown,
            _ = self.terminate.recv() => {
                info!("Received SIGTERM, shutting down");
                DaemonEvent::Shutdown
            }
            _ = self.hangup.recv() => DaemonEvent::Reload,
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> DaemonEvent {
        wait_for_ctrl_c().await;
        DaemonEvent::Shutdown
    }
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
