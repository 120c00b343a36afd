//! Daemon configuration file.
//!
//! ```toml
//! [bigip]
//! url = "https://10.1.1.245"
//! username = "admin"
//! password = "admin"
//! accept_invalid_certs = true
//!
//! [kubernetes]
//! bearer_token_file = "/var/run/secrets/kubernetes.io/serviceaccount/token"
//! # or mutual TLS:
//! # client_cert_file = "/etc/poolsync/client.crt"
//! # client_key_file = "/etc/poolsync/client.key"
//! ca_cert_file = "/etc/poolsync/ca.crt"
//!
//! [reconciler]
//! cleanup_grace_secs = 2
//!
//! [[instances]]
//! name = "web"
//! endpoint = "https://10.1.1.1:6443"
//! namespace = "default"
//! service_name = "web"
//! pool_target = "/Common/web"
//! load_balancing_mode = "least-connections-member"
//! health_monitor = "http"
//! poll_interval_secs = 15
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use itertools::Itertools;
use poolsync_adapters::{BigIpConfig, KubernetesConfig};
use poolsync_reconciler::{
    Credentials, InstanceSpec, PollInterval, PoolConfig, ReconcilerConfig, ServiceRef,
};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Overrides `[bigip].password`.
pub const BIGIP_PASSWORD_ENV: &str = "POOLSYNC_BIGIP_PASSWORD";
/// Overrides `[kubernetes].bearer_token`.
pub const K8S_TOKEN_ENV: &str = "POOLSYNC_K8S_TOKEN";

/// Errors loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but its content is inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    /// Create an invalid configuration error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Whole daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// BIG-IP connection. Only optional for dry runs.
    #[serde(default)]
    pub bigip: Option<BigIpConfig>,

    /// Kubernetes client settings.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Reconciler tuning.
    #[serde(default)]
    pub reconciler: ReconcilerSection,

    /// Managed pools.
    #[serde(default)]
    pub instances: Vec<InstanceEntry>,
}

/// `[reconciler]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerSection {
    /// Delay before deleting the pool of a stopped instance.
    #[serde(default)]
    pub cleanup_grace_secs: Option<u64>,
}

/// One `[[instances]]` entry.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InstanceEntry {
    pub name: String,
    /// Kubernetes API server address.
    pub endpoint: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub service_name: String,
    pub pool_target: String,
    #[serde(default = "default_load_balancing_mode")]
    pub load_balancing_mode: String,
    #[serde(default = "default_health_monitor")]
    pub health_monitor: String,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    /// Per-instance bearer token, overriding the `[kubernetes]` default.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl InstanceEntry {
    /// Build the reconciler spec for this entry. The poll interval is clamped here.
    #[must_use]
    pub fn to_spec(&self) -> InstanceSpec {
        let pool = PoolConfig::new(self.pool_target.as_str())
            .with_load_balancing_mode(self.load_balancing_mode.as_str())
            .with_health_monitor(self.health_monitor.as_str());
        let credentials = self
            .bearer_token
            .as_deref()
            .map_or_else(Credentials::none, Credentials::bearer);

        InstanceSpec::new(
            self.name.as_str(),
            ServiceRef::new(
                self.endpoint.as_str(),
                self.namespace.as_str(),
                self.service_name.as_str(),
            ),
            pool,
        )
        .with_credentials(credentials)
        .with_poll_interval(PollInterval::from_secs(self.poll_interval_secs))
    }
}

impl fmt::Debug for InstanceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceEntry")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("namespace", &self.namespace)
            .field("service_name", &self.service_name)
            .field("pool_target", &self.pool_target)
            .field("load_balancing_mode", &self.load_balancing_mode)
            .field("health_monitor", &self.health_monitor)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_load_balancing_mode() -> String {
    "round-robin".to_string()
}

fn default_health_monitor() -> String {
    "none".to_string()
}

impl DaemonConfig {
    /// Parse and validate TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and [`ConfigError::Invalid`]
    /// when validation fails.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a file, validate it and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text)?.with_overrides(
            std::env::var(BIGIP_PASSWORD_ENV).ok(),
            std::env::var(K8S_TOKEN_ENV).ok(),
        ))
    }

    /// Replace secrets with values supplied out of band.
    #[must_use]
    pub fn with_overrides(
        mut self,
        bigip_password: Option<String>,
        k8s_token: Option<String>,
    ) -> Self {
        if let (Some(bigip), Some(password)) = (self.bigip.as_mut(), bigip_password) {
            bigip.password = password;
        }
        if let Some(token) = k8s_token {
            self.kubernetes.bearer_token = Some(token);
        }
        self
    }

    /// Check names, pool targets, endpoints and client TLS settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kubernetes.client_cert_file.is_some() != self.kubernetes.client_key_file.is_some() {
            return Err(ConfigError::invalid(
                "[kubernetes] client_cert_file and client_key_file must be set together",
            ));
        }
        if let Some(entry) = self.instances.iter().find(|e| e.name.trim().is_empty()) {
            return Err(ConfigError::invalid(format!(
                "instance for pool '{}' has an empty name",
                entry.pool_target
            )));
        }
        for entry in &self.instances {
            if entry.service_name.trim().is_empty() {
                return Err(ConfigError::invalid(format!(
                    "instance '{}' has an empty service_name",
                    entry.name
                )));
            }
            if entry.pool_target.trim().is_empty() {
                return Err(ConfigError::invalid(format!(
                    "instance '{}' has an empty pool_target",
                    entry.name
                )));
            }
            Url::parse(&entry.endpoint).map_err(|e| {
                ConfigError::invalid(format!(
                    "instance '{}' has an invalid endpoint '{}': {e}",
                    entry.name, entry.endpoint
                ))
            })?;
        }

        let duplicate_names = self.instances.iter().map(|e| &e.name).duplicates().join(", ");
        if !duplicate_names.is_empty() {
            return Err(ConfigError::invalid(format!(
                "duplicate instance names: {duplicate_names}"
            )));
        }

        let duplicate_pools = self
            .instances
            .iter()
            .map(|e| &e.pool_target)
            .duplicates()
            .join(", ");
        if !duplicate_pools.is_empty() {
            return Err(ConfigError::invalid(format!(
                "pool targets claimed by more than one instance: {duplicate_pools}"
            )));
        }
        Ok(())
    }

    /// Reconciler specs for every instance, in file order.
    #[must_use]
    pub fn instance_specs(&self) -> Vec<InstanceSpec> {
        self.instances.iter().map(InstanceEntry::to_spec).collect()
    }

    /// Reconciler settings from the `[reconciler]` section.
    #[must_use]
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        self.reconciler
            .cleanup_grace_secs
            .map_or_else(ReconcilerConfig::default, |secs| {
                ReconcilerConfig::default().with_cleanup_grace(Duration::from_secs(secs))
            })
    }
}
