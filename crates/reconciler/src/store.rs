//! Pool store contract and an in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::endpoint::EndpointSet;
use crate::error::{Error, Result};
use crate::types::{PoolConfig, PoolTarget};

/// Operations exposed by a pool store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// [`PoolStore::exists`].
    Exists,
    /// [`PoolStore::read_members`].
    ReadMembers,
    /// [`PoolStore::create`].
    Create,
    /// [`PoolStore::add_members`].
    AddMembers,
    /// [`PoolStore::remove_members`].
    RemoveMembers,
    /// [`PoolStore::delete`].
    Delete,
}

impl StoreOperation {
    /// Convert to a string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exists => "exists",
            Self::ReadMembers => "read-members",
            Self::Create => "create",
            Self::AddMembers => "add-members",
            Self::RemoveMembers => "remove-members",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads and mutates load-balancer pools.
///
/// Calls are independent; none are assumed to be transactional together. Member
/// mutations take explicit member sets, so repeating a call is harmless.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Whether the pool exists.
    async fn exists(&self, pool: &PoolTarget) -> Result<bool>;

    /// Current members, or `None` if the pool does not exist.
    async fn read_members(&self, pool: &PoolTarget) -> Result<Option<EndpointSet>>;

    /// Create the pool described by `config` with `members`.
    async fn create(&self, config: &PoolConfig, members: &EndpointSet) -> Result<()>;

    /// Add members to an existing pool.
    async fn add_members(&self, pool: &PoolTarget, members: &EndpointSet) -> Result<()>;

    /// Remove members from an existing pool.
    async fn remove_members(&self, pool: &PoolTarget, members: &EndpointSet) -> Result<()>;

    /// Delete the pool.
    async fn delete(&self, pool: &PoolTarget) -> Result<()>;
}

/// A call observed by [`InMemoryPoolStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// Existence check for a pool.
    Exists(PoolTarget),
    /// Snapshot read of a pool's members.
    ReadMembers(PoolTarget),
    /// Pool creation with its initial members.
    Create {
        config: PoolConfig,
        members: EndpointSet,
    },
    /// Members added to a pool.
    AddMembers {
        pool: PoolTarget,
        members: EndpointSet,
    },
    /// Members removed from a pool.
    RemoveMembers {
        pool: PoolTarget,
        members: EndpointSet,
    },
    /// Pool deletion.
    Delete(PoolTarget),
}

impl StoreCall {
    /// The operation this call performed.
    #[must_use]
    pub const fn operation(&self) -> StoreOperation {
        match self {
            Self::Exists(_) => StoreOperation::Exists,
            Self::ReadMembers(_) => StoreOperation::ReadMembers,
            Self::Create { .. } => StoreOperation::Create,
            Self::AddMembers { .. } => StoreOperation::AddMembers,
            Self::RemoveMembers { .. } => StoreOperation::RemoveMembers,
            Self::Delete(_) => StoreOperation::Delete,
        }
    }

    /// Whether this call changed (or tried to change) pool state.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        !matches!(self, Self::Exists(_) | Self::ReadMembers(_))
    }
}

#[derive(Debug, Clone)]
struct StoredPool {
    config: PoolConfig,
    members: EndpointSet,
}

/// In-memory pool store with a call journal and fault injection.
///
/// Used by tests and by dry runs of the daemon.
#[derive(Debug, Default)]
pub struct InMemoryPoolStore {
    pools: Mutex<HashMap<PoolTarget, StoredPool>>,
    journal: Mutex<Vec<StoreCall>>,
    failing: Mutex<HashSet<StoreOperation>>,
}

impl InMemoryPoolStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pool directly, bypassing the journal.
    pub async fn seed(&self, config: PoolConfig, members: EndpointSet) {
        self.pools
            .lock()
            .await
            .insert(config.target.clone(), StoredPool { config, members });
    }

    /// Current members of `pool`, bypassing the journal.
    pub async fn members(&self, pool: &PoolTarget) -> Option<EndpointSet> {
        self.pools
            .lock()
            .await
            .get(pool)
            .map(|stored| stored.members.clone())
    }

    /// Configuration `pool` was created with, bypassing the journal.
    pub async fn config(&self, pool: &PoolTarget) -> Option<PoolConfig> {
        self.pools
            .lock()
            .await
            .get(pool)
            .map(|stored| stored.config.clone())
    }

    /// Number of pools in the store.
    pub async fn pool_count(&self) -> usize {
        self.pools.lock().await.len()
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<StoreCall> {
        self.journal.lock().await.clone()
    }

    /// Calls that changed (or tried to change) pool state, in order.
    pub async fn mutations(&self) -> Vec<StoreCall> {
        self.journal
            .lock()
            .await
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    /// Forget the recorded calls.
    pub async fn clear_calls(&self) {
        self.journal.lock().await.clear();
    }

    /// Make every subsequent `operation` call fail.
    pub async fn fail(&self, operation: StoreOperation) {
        self.failing.lock().await.insert(operation);
    }

    /// Stop failing `operation` calls.
    pub async fn heal(&self, operation: StoreOperation) {
        self.failing.lock().await.remove(&operation);
    }

    async fn record(&self, call: StoreCall, pool: &PoolTarget) -> Result<()> {
        let operation = call.operation();
        debug!(pool = %pool, operation = %operation, "In-memory store call");
        self.journal.lock().await.push(call);
        if self.failing.lock().await.contains(&operation) {
            return Err(Error::store_failed(operation, pool.as_str(), "injected failure"));
        }
        Ok(())
    }
}

fn missing(operation: StoreOperation, pool: &PoolTarget) -> Error {
    Error::store_failed(operation, pool.as_str(), "pool does not exist")
}

#[async_trait]
impl PoolStore for InMemoryPoolStore {
    async fn exists(&self, pool: &PoolTarget) -> Result<bool> {
        self.record(StoreCall::Exists(pool.clone()), pool).await?;
        Ok(self.pools.lock().await.contains_key(pool))
    }

    async fn read_members(&self, pool: &PoolTarget) -> Result<Option<EndpointSet>> {
        self.record(StoreCall::ReadMembers(pool.clone()), pool)
            .await?;
        Ok(self.members(pool).await)
    }

    async fn create(&self, config: &PoolConfig, members: &EndpointSet) -> Result<()> {
        let call = StoreCall::Create {
            config: config.clone(),
            members: members.clone(),
        };
        self.record(call, &config.target).await?;

        let mut pools = self.pools.lock().await;
        if pools.contains_key(&config.target) {
            return Err(Error::store_failed(
                StoreOperation::Create,
                config.target.as_str(),
                "pool already exists",
            ));
        }
        pools.insert(
            config.target.clone(),
            StoredPool {
                config: config.clone(),
                members: members.clone(),
            },
        );
        Ok(())
    }

    async fn add_members(&self, pool: &PoolTarget, members: &EndpointSet) -> Result<()> {
        let call = StoreCall::AddMembers {
            pool: pool.clone(),
            members: members.clone(),
        };
        self.record(call, pool).await?;

        let mut pools = self.pools.lock().await;
        let stored = pools
            .get_mut(pool)
            .ok_or_else(|| missing(StoreOperation::AddMembers, pool))?;
        stored.members.extend(members.iter().copied());
        Ok(())
    }

    async fn remove_members(&self, pool: &PoolTarget, members: &EndpointSet) -> Result<()> {
        let call = StoreCall::RemoveMembers {
            pool: pool.clone(),
            members: members.clone(),
        };
        self.record(call, pool).await?;

        let mut pools = self.pools.lock().await;
        let stored = pools
            .get_mut(pool)
            .ok_or_else(|| missing(StoreOperation::RemoveMembers, pool))?;
        stored.members.retain(|member| !members.contains(member));
        Ok(())
    }

    async fn delete(&self, pool: &PoolTarget) -> Result<()> {
        self.record(StoreCall::Delete(pool.clone()), pool).await?;
        self.pools
            .lock()
            .await
            .remove(pool)
            .map(|_| ())
            .ok_or_else(|| missing(StoreOperation::Delete, pool))
    }
}
