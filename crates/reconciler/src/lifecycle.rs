//! Start, update and stop entry points.
//!
//! The controller translates configuration requests into registry mutations and
//! reconciler spawns. It never waits for a loop to finish: `stop` removes the record
//! and the loop notices on its next tick.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::EndpointSet;
use crate::error::Result;
use crate::reconciler::{LoopExit, Reconciler, ReconcilerConfig};
use crate::registry::{InstanceRegistry, Registration};
use crate::source::EndpointSource;
use crate::store::PoolStore;
use crate::types::{InstanceRecord, InstanceSpec, LoopId, PoolConfig};

/// Binding status reported back to whatever issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// Configuration accepted and being reconciled.
    Bound,
    /// Configuration rejected (e.g. pool conflict).
    Error,
    /// Configuration removed.
    Unbound,
}

impl BindingState {
    /// Binding state for the result of `start` or `update`.
    #[must_use]
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Bound,
            Err(_) => Self::Error,
        }
    }

    /// Convert to a string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bound => "BOUND",
            Self::Error => "ERROR",
            Self::Unbound => "UNBOUND",
        }
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful `start` or `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindReport {
    /// Whether the record was created or updated.
    pub registration: Registration,
    /// Whether a new reconciler task was spawned.
    pub loop_spawned: bool,
}

/// Result of `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Whether a record existed for the name.
    pub existed: bool,
}

impl StopReport {
    /// Binding state after the stop.
    #[must_use]
    pub const fn state(&self) -> BindingState {
        BindingState::Unbound
    }
}

struct LoopHandle {
    name: String,
    handle: JoinHandle<LoopExit>,
}

/// Entry points driving the instance registry and reconciler tasks.
pub struct LifecycleController {
    registry: Arc<InstanceRegistry>,
    source: Arc<dyn EndpointSource>,
    store: Arc<dyn PoolStore>,
    config: ReconcilerConfig,
    loops: Mutex<HashMap<LoopId, LoopHandle>>,
}

impl LifecycleController {
    /// Create a controller with its own registry.
    pub fn new(
        source: Arc<dyn EndpointSource>,
        store: Arc<dyn PoolStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self::with_registry(Arc::new(InstanceRegistry::new()), source, store, config)
    }

    /// Create a controller over an existing registry.
    pub fn with_registry(
        registry: Arc<InstanceRegistry>,
        source: Arc<dyn EndpointSource>,
        store: Arc<dyn PoolStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            source,
            store,
            config,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// The shared registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Start managing the pool described by `spec`.
    ///
    /// A name that is already registered is treated as an update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`](crate::Error::Conflict) if another instance already manages the pool. No
    /// reconciler is spawned in that case.
    pub async fn start(&self, spec: InstanceSpec) -> Result<BindReport> {
        info!(instance = %spec.name, pool = %spec.pool_target(), "Start requested");
        self.bind(spec).await
    }

    /// Replace the configuration of `spec.name`.
    ///
    /// The running loop picks the new spec up on its next tick. If no loop is running
    /// (or the name is unknown) a fresh one is spawned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`](crate::Error::Conflict) if the new pool target is managed by another
    /// instance. The previous configuration stays in effect.
    pub async fn update(&self, spec: InstanceSpec) -> Result<BindReport> {
        info!(instance = %spec.name, pool = %spec.pool_target(), "Update requested");
        self.bind(spec).await
    }

    /// Stop managing `name`. The loop deletes the pool after the grace delay.
    pub async fn stop(&self, name: &str) -> StopReport {
        let removed = self.registry.remove(name).await;
        if removed.is_none() {
            debug!(instance = %name, "Stop requested for unknown instance");
        }
        StopReport {
            existed: removed.is_some(),
        }
    }

    async fn bind(&self, spec: InstanceSpec) -> Result<BindReport> {
        let name = spec.name.clone();
        let pool = spec.pool.clone();

        let registration = self.registry.register(spec).await?;
        if registration == Registration::Created {
            self.ensure_placeholder(&pool).await;
        }
        let loop_spawned = self.ensure_loop(&name).await;

        info!(
            instance = %name,
            registration = ?registration,
            loop_spawned,
            "Instance bound"
        );
        Ok(BindReport {
            registration,
            loop_spawned,
        })
    }

    /// Create an empty pool if none exists yet. Best effort: failures are logged and
    /// the first pass retries the creation.
    async fn ensure_placeholder(&self, pool: &PoolConfig) {
        match self.store.exists(&pool.target).await {
            Ok(true) => debug!(pool = %pool.target, "Found the pool, no placeholder needed"),
            Ok(false) => match self.store.create(pool, &EndpointSet::new()).await {
                Ok(()) => info!(pool = %pool.target, "Empty pool created"),
                Err(e) => warn!(pool = %pool.target, error = %e, "Failed to create empty pool"),
            },
            Err(e) => warn!(pool = %pool.target, error = %e, "Failed to check pool existence"),
        }
    }

    /// Spawn a loop for `name` unless its owning loop is still running.
    async fn ensure_loop(&self, name: &str) -> bool {
        let mut loops = self.loops.lock().await;
        loops.retain(|_, entry| !entry.handle.is_finished());

        let Some(record) = self.registry.lookup(name).await else {
            return false;
        };
        if record.owner.is_some_and(|owner| loops.contains_key(&owner)) {
            debug!(instance = %name, "Existing loop will pick up the change");
            return false;
        }

        let Some(loop_id) = self.registry.assign_loop(name, record.owner).await else {
            return false;
        };
        let reconciler = Reconciler::new(
            name,
            loop_id,
            record.pool_target().clone(),
            self.registry.clone(),
            self.source.clone(),
            self.store.clone(),
            self.config.clone(),
        );
        loops.insert(
            loop_id,
            LoopHandle {
                name: name.to_string(),
                handle: tokio::spawn(reconciler.run()),
            },
        );
        true
    }

    /// Number of reconciler tasks that have not finished yet.
    ///
    /// This includes loops that are stopping (waiting out the cleanup grace delay).
    pub async fn active_loops(&self) -> usize {
        self.loops
            .lock()
            .await
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    /// Names with an unfinished reconciler task, sorted.
    pub async fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .loops
            .lock()
            .await
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// All registered instances, sorted by name.
    pub async fn instances(&self) -> Vec<InstanceRecord> {
        self.registry.snapshot().await
    }

    /// Abort every loop without touching pools or the registry.
    ///
    /// Used on process exit: state is ephemeral and pools are left as they are.
    pub async fn shutdown(&self) {
        let mut loops = self.loops.lock().await;
        info!(loops = loops.len(), "Aborting reconciler loops");
        for (_, entry) in loops.drain() {
            entry.handle.abort();
        }
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
