//! Per-instance reconciliation loop.
//!
//! Each registered instance is driven by one [`Reconciler`] task:
//!
//! ```text
//! Scheduled -> Polling -> Applying -> Scheduled
//!     \__________\___________\______> Stopped (record gone)
//! ```
//!
//! The loop re-reads its record from the [`InstanceRegistry`] at the top of every
//! tick. A missing record stops the loop and schedules the pool delete. A record
//! owned by a different loop makes this one exit; if that record targets another
//! pool, the pool this loop was driving is deleted first. A pool that is still
//! claimed by some record is never deleted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::diff::MembershipDiff;
use crate::endpoint::{EndpointSet, display_set};
use crate::error::Error;
use crate::registry::{InstanceRegistry, TickDecision};
use crate::source::EndpointSource;
use crate::store::PoolStore;
use crate::types::{InstanceSpec, LoopId, PoolTarget};

/// Configuration shared by all reconciler loops.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay between noticing a stop and deleting the pool, so a pass that is
    /// already in flight finishes first.
    pub cleanup_grace: Duration,
}

impl ReconcilerConfig {
    /// Grace delay used when none is configured.
    pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(2);

    /// Set the cleanup grace delay.
    #[must_use]
    pub const fn with_cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            cleanup_grace: Self::DEFAULT_CLEANUP_GRACE,
        }
    }
}

/// Where a loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Sleeping until the next tick.
    Scheduled,
    /// Listing endpoints and reading the pool.
    Polling,
    /// Creating the pool or applying the membership diff.
    Applying,
    /// The loop has exited.
    Stopped,
}

impl Phase {
    /// Convert to a string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Polling => "polling",
            Self::Applying => "applying",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The endpoint source failed; nothing was read from the store.
    SourceUnavailable(Error),
    /// The pool snapshot could not be read; nothing was applied.
    StoreUnavailable(Error),
    /// The pool was absent and has been created with `members` members.
    Created { members: usize },
    /// The pool was absent and creating it failed.
    CreateFailed(Error),
    /// The pool already matched the endpoint set.
    Unchanged,
    /// Members were added and/or removed. Failed calls are listed in `failures`.
    Applied {
        added: usize,
        removed: usize,
        failures: Vec<Error>,
    },
}

impl PassOutcome {
    /// Whether the pool matches the endpoint set after this pass.
    #[must_use]
    pub fn converged(&self) -> bool {
        match self {
            Self::Created { .. } | Self::Unchanged => true,
            Self::Applied { failures, .. } => failures.is_empty(),
            Self::SourceUnavailable(_) | Self::StoreUnavailable(_) | Self::CreateFailed(_) => {
                false
            }
        }
    }
}

/// How a loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The record was removed; `pool_deleted` reports whether the delete succeeded.
    Stopped { pool_deleted: bool },
    /// A newer loop took over the record. `pool_deleted` is set when the record had
    /// moved to another pool and this loop deleted the one it was driving.
    Superseded { pool_deleted: bool },
}

/// Reconciliation loop for one instance.
pub struct Reconciler {
    name: String,
    loop_id: LoopId,
    /// Pool of the most recently reconciled spec; the one deleted on stop.
    pool: PoolTarget,
    registry: Arc<InstanceRegistry>,
    source: Arc<dyn EndpointSource>,
    store: Arc<dyn PoolStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a loop for `name`, owned by `loop_id`, initially targeting `pool`.
    pub fn new(
        name: impl Into<String>,
        loop_id: LoopId,
        pool: PoolTarget,
        registry: Arc<InstanceRegistry>,
        source: Arc<dyn EndpointSource>,
        store: Arc<dyn PoolStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            loop_id,
            pool,
            registry,
            source,
            store,
            config,
        }
    }

    /// Instance this loop drives.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of this loop.
    #[must_use]
    pub const fn loop_id(&self) -> LoopId {
        self.loop_id
    }

    /// Run until the record disappears or another loop takes it over.
    ///
    /// Each tick completes before the next is scheduled, so at most one pass per
    /// instance is ever in flight.
    pub async fn run(mut self) -> LoopExit {
        info!(instance = %self.name, loop_id = %self.loop_id, "Reconciler started");

        loop {
            let spec = match self.registry.begin_tick(&self.name, self.loop_id).await {
                TickDecision::Proceed {
                    spec,
                    claimed_update,
                } => {
                    if claimed_update {
                        self.adopt_update(&spec).await;
                    }
                    spec
                }
                TickDecision::Removed => {
                    info!(instance = %self.name, pool = %self.pool, "Instance record gone, stopping loop");
                    let pool_deleted = self.delete_after_grace(&self.pool).await;
                    info!(instance = %self.name, phase = %Phase::Stopped, "Reconciler exited");
                    return LoopExit::Stopped { pool_deleted };
                }
                TickDecision::Superseded { pool } => {
                    info!(
                        instance = %self.name,
                        loop_id = %self.loop_id,
                        "Reconciler superseded by a newer loop"
                    );
                    let pool_deleted = if pool == self.pool {
                        false
                    } else {
                        info!(
                            instance = %self.name,
                            previous = %self.pool,
                            pool = %pool,
                            "Instance restarted on a new pool"
                        );
                        self.delete_after_grace(&self.pool).await
                    };
                    return LoopExit::Superseded { pool_deleted };
                }
            };

            let outcome = self.reconcile_once(&spec).await;
            debug!(
                instance = %self.name,
                converged = outcome.converged(),
                phase = %Phase::Scheduled,
                next_in_secs = spec.poll_interval.duration().as_secs(),
                "Pass finished"
            );

            tokio::time::sleep(spec.poll_interval.duration()).await;
        }
    }

    /// Switch to the spec of a claimed update. A pool move deletes the previous
    /// pool before the new one is reconciled.
    async fn adopt_update(&mut self, spec: &InstanceSpec) {
        if spec.pool_target() == &self.pool {
            info!(instance = %self.name, "Configuration update picked up");
            return;
        }
        info!(
            instance = %self.name,
            previous = %self.pool,
            pool = %spec.pool_target(),
            "Configuration update moved the instance to a new pool"
        );
        let previous = std::mem::replace(&mut self.pool, spec.pool_target().clone());
        self.delete_after_grace(&previous).await;
    }

    /// One pass: read desired, read observed, diff, apply.
    ///
    /// Failures are logged and reported in the outcome; they never end the loop.
    pub async fn reconcile_once(&self, spec: &InstanceSpec) -> PassOutcome {
        let pool = spec.pool_target();
        debug!(instance = %self.name, pool = %pool, phase = %Phase::Polling, "Polling endpoint source");

        let desired = match self
            .source
            .list_endpoints(&spec.service, &spec.credentials)
            .await
        {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(
                    instance = %self.name,
                    service = %spec.service.key(),
                    error = %e,
                    "Failed to retrieve endpoint list"
                );
                return PassOutcome::SourceUnavailable(e);
            }
        };
        debug!(instance = %self.name, endpoints = %display_set(&desired), "Service endpoint list");

        let observed = match self.store.read_members(pool).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(instance = %self.name, pool = %pool, error = %e, "Failed to read pool");
                return PassOutcome::StoreUnavailable(e);
            }
        };

        debug!(instance = %self.name, pool = %pool, phase = %Phase::Applying, "Applying membership");
        match observed {
            None => self.create_pool(spec, &desired).await,
            Some(observed) => self.apply_diff(pool, &desired, &observed).await,
        }
    }

    async fn create_pool(&self, spec: &InstanceSpec, desired: &EndpointSet) -> PassOutcome {
        let pool = spec.pool_target();
        match self.store.create(&spec.pool, desired).await {
            Ok(()) => {
                info!(
                    instance = %self.name,
                    pool = %pool,
                    members = %display_set(desired),
                    "Pool created"
                );
                PassOutcome::Created {
                    members: desired.len(),
                }
            }
            Err(e) => {
                warn!(instance = %self.name, pool = %pool, error = %e, "Failed to create pool");
                PassOutcome::CreateFailed(e)
            }
        }
    }

    async fn apply_diff(
        &self,
        pool: &PoolTarget,
        desired: &EndpointSet,
        observed: &EndpointSet,
    ) -> PassOutcome {
        let diff = MembershipDiff::between(desired, observed);
        if diff.is_empty() {
            debug!(instance = %self.name, pool = %pool, "Pool already matches service endpoints");
            return PassOutcome::Unchanged;
        }

        let mut failures = Vec::new();
        let mut added = 0;
        let mut removed = 0;

        if !diff.to_add.is_empty() {
            match self.store.add_members(pool, &diff.to_add).await {
                Ok(()) => {
                    info!(
                        instance = %self.name,
                        pool = %pool,
                        members = %display_set(&diff.to_add),
                        "Pool members added"
                    );
                    added = diff.to_add.len();
                }
                Err(e) => {
                    warn!(instance = %self.name, pool = %pool, error = %e, "Failed to add pool members");
                    failures.push(e);
                }
            }
        }

        if !diff.to_remove.is_empty() {
            match self.store.remove_members(pool, &diff.to_remove).await {
                Ok(()) => {
                    info!(
                        instance = %self.name,
                        pool = %pool,
                        members = %display_set(&diff.to_remove),
                        "Pool members removed"
                    );
                    removed = diff.to_remove.len();
                }
                Err(e) => {
                    warn!(instance = %self.name, pool = %pool, error = %e, "Failed to remove pool members");
                    failures.push(e);
                }
            }
        }

        PassOutcome::Applied {
            added,
            removed,
            failures,
        }
    }

    /// Delete `pool` after the grace delay. Returns whether the delete succeeded.
    ///
    /// The delete is skipped if a record claims the pool once the delay is over.
    async fn delete_after_grace(&self, pool: &PoolTarget) -> bool {
        debug!(
            instance = %self.name,
            pool = %pool,
            grace_ms = u64::try_from(self.config.cleanup_grace.as_millis()).unwrap_or(u64::MAX),
            "Deleting pool after grace delay"
        );
        tokio::time::sleep(self.config.cleanup_grace).await;

        if self.registry.is_pool_claimed(pool).await {
            info!(
                instance = %self.name,
                pool = %pool,
                "Pool re-claimed by another instance, skipping delete"
            );
            return false;
        }

        if let Err(e) = self.store.delete(pool).await {
            warn!(instance = %self.name, pool = %pool, error = %e, "Pool delete failed");
            return false;
        }
        info!(instance = %self.name, pool = %pool, "Pool removed");

        // A start between the claim check and the delete lost its placeholder.
        if let Some(config) = self.registry.claimant(pool).await {
            warn!(
                instance = %self.name,
                pool = %pool,
                "Pool re-claimed while it was being deleted, recreating empty pool"
            );
            if let Err(e) = self.store.create(&config, &EndpointSet::new()).await {
                warn!(pool = %pool, error = %e, "Failed to recreate pool; its owner retries on the next pass");
            }
        }
        true
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("name", &self.name)
            .field("loop_id", &self.loop_id)
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
