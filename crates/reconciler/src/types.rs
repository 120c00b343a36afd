//! Core types for the reconciler.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of the load-balancer pool being kept in sync (e.g. `/Common/web`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolTarget(String);

impl PoolTarget {
    /// Create a new pool target.
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    /// The target as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolTarget {
    fn from(target: &str) -> Self {
        Self::new(target)
    }
}

/// Where to look up a service's endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    /// Address of the registry API (e.g. `https://10.1.1.1:6443`).
    pub endpoint: String,
    /// Namespace the service lives in.
    pub namespace: String,
    /// Service name.
    pub service_name: String,
}

impl ServiceRef {
    /// Create a new service reference.
    pub fn new(
        endpoint: impl Into<String>,
        namespace: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: namespace.into(),
            service_name: service_name.into(),
        }
    }

    /// `namespace/service` key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.service_name)
    }
}

/// Already-decoded credentials passed through to the endpoint source.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token for the registry API.
    pub bearer_token: Option<String>,
}

impl Credentials {
    /// No credentials.
    #[must_use]
    pub const fn none() -> Self {
        Self { bearer_token: None }
    }

    /// Bearer-token credentials.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Pool-level settings used when the pool has to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool being managed.
    pub target: PoolTarget,
    /// Load-balancing mode (e.g. `round-robin`).
    pub load_balancing_mode: String,
    /// Health monitor attached to the pool (`none` for no monitor).
    pub health_monitor: String,
}

impl PoolConfig {
    /// Create a pool config with round-robin balancing and no monitor.
    pub fn new(target: impl Into<PoolTarget>) -> Self {
        Self {
            target: target.into(),
            load_balancing_mode: "round-robin".to_string(),
            health_monitor: "none".to_string(),
        }
    }

    /// Set the load-balancing mode.
    #[must_use]
    pub fn with_load_balancing_mode(mut self, mode: impl Into<String>) -> Self {
        self.load_balancing_mode = mode.into();
        self
    }

    /// Set the health monitor.
    #[must_use]
    pub fn with_health_monitor(mut self, monitor: impl Into<String>) -> Self {
        self.health_monitor = monitor.into();
        self
    }
}

/// Effective poll interval of an instance.
///
/// Unset or zero means 30s; anything below 10s is raised to 10s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PollInterval(Duration);

impl PollInterval {
    /// Interval used when none is configured.
    pub const DEFAULT: Duration = Duration::from_secs(30);
    /// Shortest interval an instance may poll at.
    pub const MIN: Duration = Duration::from_secs(10);

    /// Clamp a requested interval.
    #[must_use]
    pub fn from_requested(requested: Option<Duration>) -> Self {
        match requested {
            None => Self(Self::DEFAULT),
            Some(d) if d.is_zero() => Self(Self::DEFAULT),
            Some(d) if d < Self::MIN => Self(Self::MIN),
            Some(d) => Self(d),
        }
    }

    /// Clamp a requested interval given in whole seconds.
    #[must_use]
    pub fn from_secs(requested: Option<u64>) -> Self {
        Self::from_requested(requested.map(Duration::from_secs))
    }

    /// An interval that bypasses clamping. Intended for tests and dry runs.
    #[must_use]
    pub const fn unclamped(interval: Duration) -> Self {
        Self(interval)
    }

    /// The effective duration.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.0
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

/// Everything an instance needs: where to read endpoints and which pool to drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Unique instance name.
    pub name: String,
    /// Service whose endpoints feed the pool.
    pub service: ServiceRef,
    /// Credentials for the endpoint source.
    pub credentials: Credentials,
    /// Pool being managed.
    pub pool: PoolConfig,
    /// Poll cadence.
    pub poll_interval: PollInterval,
}

impl InstanceSpec {
    /// Create a spec with no credentials and the default poll interval.
    pub fn new(name: impl Into<String>, service: ServiceRef, pool: PoolConfig) -> Self {
        Self {
            name: name.into(),
            service,
            credentials: Credentials::none(),
            pool,
            poll_interval: PollInterval::default(),
        }
    }

    /// Set the credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: PollInterval) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The managed pool.
    #[must_use]
    pub const fn pool_target(&self) -> &PoolTarget {
        &self.pool.target
    }
}

/// Lifecycle state of an instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Normal running state.
    Polling,
    /// A new configuration arrived and has not been picked up by the loop yet.
    UpdatePending,
    /// Deleted from the registry.
    Removed,
}

impl InstanceState {
    /// Convert to a string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::UpdatePending => "update_pending",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one reconciler task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopId(Ulid);

impl LoopId {
    /// Generate a fresh loop id.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LoopId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry entry for one managed pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    /// Currently bound configuration.
    pub spec: InstanceSpec,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Loop allowed to drive this record, if one has been assigned.
    pub owner: Option<LoopId>,
    /// Number of configuration updates applied since registration.
    pub revision: u64,
    /// When the record was first registered.
    pub registered_at: DateTime<Utc>,
    /// When the configuration was last replaced.
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Create a fresh record in the polling state.
    #[must_use]
    pub fn new(spec: InstanceSpec) -> Self {
        let now = Utc::now();
        Self {
            spec,
            state: InstanceState::Polling,
            owner: None,
            revision: 0,
            registered_at: now,
            updated_at: now,
        }
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Managed pool.
    #[must_use]
    pub const fn pool_target(&self) -> &PoolTarget {
        self.spec.pool_target()
    }
}
