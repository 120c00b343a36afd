//! Process-wide registry of active instances.
//!
//! The registry is the only state shared between the lifecycle controller and the
//! reconciler tasks. Every operation takes the same lock, so a conflict check and the
//! insert that follows it can never interleave with another registration.
//!
//! A record's presence is also the cancellation signal: a reconciler keeps running
//! only while [`InstanceRegistry::begin_tick`] finds its record and still names it as
//! the owning loop.

use std::collections::HashMap;

use chrono::Utc;
use itertools::Itertools;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{InstanceRecord, InstanceSpec, InstanceState, LoopId, PoolConfig, PoolTarget};

/// What `register` did with the supplied spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new record was inserted in the polling state.
    Created,
    /// An existing record received the spec and is now update-pending.
    Updated,
}

/// What a reconciler should do at the start of a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickDecision {
    /// Run a pass with the currently bound spec.
    Proceed {
        /// Spec to reconcile against.
        spec: InstanceSpec,
        /// This tick moved the record from update-pending back to polling.
        claimed_update: bool,
    },
    /// The record is gone: clean up and exit.
    Removed,
    /// Another loop owns the record now. `pool` is the pool the record targets;
    /// a loop that was driving a different pool cleans its own up before exiting.
    Superseded {
        /// Pool targeted by the superseding record.
        pool: PoolTarget,
    },
}

/// Shared mapping of instance name to instance record.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    records: Mutex<HashMap<String, InstanceRecord>>,
}

impl InstanceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec.
    ///
    /// An unknown name is inserted in the polling state. A known name is treated as an
    /// update: the spec is replaced and the record becomes update-pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if a record with a different name already targets the
    /// same pool. Nothing is inserted or modified in that case.
    pub async fn register(&self, spec: InstanceSpec) -> Result<Registration> {
        let mut records = self.records.lock().await;

        if let Some(owner) = find_conflict(&records, spec.pool_target(), &spec.name) {
            warn!(
                instance = %spec.name,
                pool = %spec.pool_target(),
                owner = %owner,
                "Pool target already managed by another instance"
            );
            return Err(Error::conflict(
                spec.name.clone(),
                spec.pool_target().as_str(),
                owner,
            ));
        }

        match records.get_mut(&spec.name) {
            Some(record) => {
                debug!(instance = %spec.name, revision = record.revision, "Replacing instance spec");
                record.spec = spec;
                record.state = InstanceState::UpdatePending;
                record.revision = record.revision.saturating_add(1);
                record.updated_at = Utc::now();
                Ok(Registration::Updated)
            }
            None => {
                info!(instance = %spec.name, pool = %spec.pool_target(), "Instance registered");
                records.insert(spec.name.clone(), InstanceRecord::new(spec));
                Ok(Registration::Created)
            }
        }
    }

    /// Flag an existing record as update-pending.
    ///
    /// Returns `false` and creates nothing when `name` is unknown.
    pub async fn mark_for_update(&self, name: &str) -> bool {
        let mut records = self.records.lock().await;
        records.get_mut(name).is_some_and(|record| {
            record.state = InstanceState::UpdatePending;
            record.updated_at = Utc::now();
            true
        })
    }

    /// Delete a record, returning it in the removed state.
    pub async fn remove(&self, name: &str) -> Option<InstanceRecord> {
        let removed = self.records.lock().await.remove(name);
        removed.map(|mut record| {
            info!(instance = %name, pool = %record.pool_target(), "Instance removed");
            record.state = InstanceState::Removed;
            record
        })
    }

    /// Read a record.
    pub async fn lookup(&self, name: &str) -> Option<InstanceRecord> {
        self.records.lock().await.get(name).cloned()
    }

    /// Name of the record other than `excluding` that targets `pool`, if any.
    pub async fn conflicts_with(&self, pool: &PoolTarget, excluding: &str) -> Option<String> {
        find_conflict(&*self.records.lock().await, pool, excluding)
    }

    /// Whether any record currently targets `pool`.
    pub async fn is_pool_claimed(&self, pool: &PoolTarget) -> bool {
        self.records
            .lock()
            .await
            .values()
            .any(|record| record.pool_target() == pool)
    }

    /// Pool configuration of the record that targets `pool`, if any.
    pub async fn claimant(&self, pool: &PoolTarget) -> Option<PoolConfig> {
        self.records
            .lock()
            .await
            .values()
            .find(|record| record.pool_target() == pool)
            .map(|record| record.spec.pool.clone())
    }

    /// Stamp a fresh loop id on `name` if its current owner is `replacing`.
    ///
    /// This is a compare-and-swap: two callers racing to start a loop for the same
    /// record cannot both get an id. Returns `None` if the record is missing or the
    /// owner has changed.
    pub async fn assign_loop(&self, name: &str, replacing: Option<LoopId>) -> Option<LoopId> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(name)?;
        if record.owner != replacing {
            return None;
        }
        let id = LoopId::new();
        record.owner = Some(id);
        debug!(instance = %name, loop_id = %id, "Loop assigned");
        Some(id)
    }

    /// Decide what loop `loop_id` does at the start of a tick for `name`.
    ///
    /// If the record is update-pending and owned by `loop_id`, it is flipped back to
    /// polling under the lock, so exactly one loop claims each update.
    pub async fn begin_tick(&self, name: &str, loop_id: LoopId) -> TickDecision {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(name) else {
            return TickDecision::Removed;
        };
        if record.owner != Some(loop_id) {
            return TickDecision::Superseded {
                pool: record.pool_target().clone(),
            };
        }
        let claimed_update = record.state == InstanceState::UpdatePending;
        if claimed_update {
            record.state = InstanceState::Polling;
        }
        TickDecision::Proceed {
            spec: record.spec.clone(),
            claimed_update,
        }
    }

    /// All records, sorted by name.
    pub async fn snapshot(&self) -> Vec<InstanceRecord> {
        self.records
            .lock()
            .await
            .values()
            .cloned()
            .sorted_by(|a, b| a.name().cmp(b.name()))
            .collect_vec()
    }

    /// Number of registered instances.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

fn find_conflict(
    records: &HashMap<String, InstanceRecord>,
    pool: &PoolTarget,
    excluding: &str,
) -> Option<String> {
    records
        .values()
        .find(|record| record.name() != excluding && record.pool_target() == pool)
        .map(|record| record.name().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::{PoolConfig, ServiceRef};

    fn spec(name: &str, pool: &str) -> InstanceSpec {
        InstanceSpec::new(
            name,
            ServiceRef::new("https://k8s:6443", "default", name),
            PoolConfig::new(pool),
        )
    }

    #[tokio::test]
    async fn test_register_creates_polling_record() -> Result<()> {
        let registry = InstanceRegistry::new();

        let registration = registry.register(spec("web", "/Common/web")).await?;

        assert_eq!(registration, Registration::Created);
        let record = registry
            .lookup("web")
            .await
            .ok_or_else(|| Error::instance_not_found("web"))?;
        assert_eq!(record.state, InstanceState::Polling);
        Ok(())
    }

    #[tokio::test]
    async fn test_register_same_name_is_update() -> Result<()> {
        let registry = InstanceRegistry::new();
        registry.register(spec("web", "/Common/web")).await?;

        let updated = spec("web", "/Common/web").with_credentials(crate::Credentials::bearer("t"));
        let registration = registry.register(updated.clone()).await?;

        assert_eq!(registration, Registration::Updated);
        let record = registry
            .lookup("web")
            .await
            .ok_or_else(|| Error::instance_not_found("web"))?;
        assert_eq!(record.state, InstanceState::UpdatePending);
        assert_eq!(record.spec, updated);
        assert_eq!(record.revision, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_register_conflicting_pool_fails() -> Result<()> {
        let registry = InstanceRegistry::new();
        registry.register(spec("web-a", "/Common/web")).await?;

        let result = registry.register(spec("web-b", "/Common/web")).await;

        assert_eq!(
            result,
            Err(Error::conflict("web-b", "/Common/web", "web-a"))
        );
        assert!(registry.lookup("web-b").await.is_none());
        assert_eq!(registry.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_may_not_move_onto_owned_pool() -> Result<()> {
        let registry = InstanceRegistry::new();
        registry.register(spec("a", "/Common/a")).await?;
        registry.register(spec("b", "/Common/b")).await?;

        let result = registry.register(spec("b", "/Common/a")).await;

        assert!(result.is_err_and(|e| e.is_conflict()));
        let record = registry
            .lookup("b")
            .await
            .ok_or_else(|| Error::instance_not_found("b"))?;
        assert_eq!(record.pool_target().as_str(), "/Common/b");
        assert_eq!(record.state, InstanceState::Polling);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_conflicting_registrations_one_wins() {
        let registry = Arc::new(InstanceRegistry::new());

        let handles = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .register(spec(&format!("web-{i}"), "/Common/web"))
                        .await
                })
            })
            .collect_vec();

        let mut successes = 0_usize;
        let mut conflicts = 0_usize;
        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => successes = successes.saturating_add(1),
                Ok(Err(e)) if e.is_conflict() => conflicts = conflicts.saturating_add(1),
                _ => {}
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_mark_for_update_requires_existing_record() -> Result<()> {
        let registry = InstanceRegistry::new();
        assert!(!registry.mark_for_update("ghost").await);
        assert!(registry.is_empty().await);

        registry.register(spec("web", "/Common/web")).await?;
        assert!(registry.mark_for_update("web").await);
        assert_eq!(
            registry.lookup("web").await.map(|r| r.state),
            Some(InstanceState::UpdatePending)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_returns_removed_record() -> Result<()> {
        let registry = InstanceRegistry::new();
        registry.register(spec("web", "/Common/web")).await?;

        let removed = registry.remove("web").await;

        assert_eq!(removed.map(|r| r.state), Some(InstanceState::Removed));
        assert!(registry.lookup("web").await.is_none());
        assert!(registry.remove("web").await.is_none());
        assert!(!registry.is_pool_claimed(&PoolTarget::from("/Common/web")).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_conflicts_with_excludes_self() -> Result<()> {
        let registry = InstanceRegistry::new();
        registry.register(spec("web", "/Common/web")).await?;
        let pool = PoolTarget::from("/Common/web");

        assert_eq!(registry.conflicts_with(&pool, "web").await, None);
        assert_eq!(
            registry.conflicts_with(&pool, "other").await,
            Some("web".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_assign_loop_is_compare_and_swap() -> Result<()> {
        let registry = InstanceRegistry::new();
        registry.register(spec("web", "/Common/web")).await?;

        let first = registry.assign_loop("web", None).await;
        let second = registry.assign_loop("web", None).await;

        assert!(first.is_some());
        assert!(second.is_none());

        let replacement = registry.assign_loop("web", first).await;
        assert!(replacement.is_some());
        assert_ne!(replacement, first);
        assert!(registry.assign_loop("ghost", None).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_begin_tick_claims_update_once() -> Result<()> {
        let registry = InstanceRegistry::new();
        registry.register(spec("web", "/Common/web")).await?;
        let id = registry
            .assign_loop("web", None)
            .await
            .ok_or_else(|| Error::instance_not_found("web"))?;
        registry.register(spec("web", "/Common/web")).await?;

        let first = registry.begin_tick("web", id).await;
        let second = registry.begin_tick("web", id).await;

        assert!(matches!(
            first,
            TickDecision::Proceed {
                claimed_update: true,
                ..
            }
        ));
        assert!(matches!(
            second,
            TickDecision::Proceed {
                claimed_update: false,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_begin_tick_detects_removal_and_supersession() -> Result<()> {
        let registry = InstanceRegistry::new();
        registry.register(spec("web", "/Common/web")).await?;
        let old = registry
            .assign_loop("web", None)
            .await
            .ok_or_else(|| Error::instance_not_found("web"))?;
        registry.assign_loop("web", Some(old)).await;

        assert_eq!(
            registry.begin_tick("web", old).await,
            TickDecision::Superseded {
                pool: PoolTarget::from("/Common/web")
            }
        );

        registry.remove("web").await;
        assert_eq!(registry.begin_tick("web", old).await, TickDecision::Removed);
        Ok(())
    }

    #[tokio::test]
    async fn test_claimant_returns_owning_pool_config() -> Result<()> {
        let registry = InstanceRegistry::new();
        let pool = PoolTarget::from("/Common/web");
        assert!(registry.claimant(&pool).await.is_none());

        registry.register(spec("web", "/Common/web")).await?;

        assert_eq!(
            registry.claimant(&pool).await,
            Some(PoolConfig::new("/Common/web"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_sorted_by_name() -> Result<()> {
        let registry = InstanceRegistry::new();
        registry.register(spec("zeta", "/Common/z")).await?;
        registry.register(spec("alpha", "/Common/a")).await?;

        let names = registry
            .snapshot()
            .await
            .iter()
            .map(|r| r.name().to_string())
            .collect_vec();

        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
        Ok(())
    }
}
