//! Pool store backed by the BIG-IP iControl REST API.
//!
//! Pools are addressed as `/mgmt/tm/ltm/pool/~Partition~name`. Members are named
//! `address:port` for IPv4 and `address.port` for IPv6, the way TMOS names them.
//! Membership changes are issued one member at a time; the pool is never replaced
//! wholesale.
//!
//! Removals address members by the name the BIG-IP reports, so route-domain
//! members (`10.0.0.1%2:8080`) are deleted under their real name. Members whose
//! name is not an IP member name (FQDN nodes added by hand) cannot match any
//! endpoint; they are removed when the pool is read.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use itertools::{Either, Itertools};
use poolsync_reconciler::{
    Endpoint, EndpointSet, PoolConfig, PoolStore, PoolTarget, StoreOperation,
};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BigIpConfig;
use crate::error::{Error, Result};

const POOL_COLLECTION: [&str; 4] = ["mgmt", "tm", "ltm", "pool"];

/// A pool target split into its TMOS components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPath {
    /// Administrative partition (`Common` when the target has none).
    pub partition: String,
    /// Folder inside the partition, if any.
    pub sub_path: Option<String>,
    /// Pool name.
    pub name: String,
}

impl PoolPath {
    /// Parse `/Partition/name`, `/Partition/folder/name` or a bare `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPoolTarget`] for empty segments or deeper paths.
    pub fn parse(target: &PoolTarget) -> Result<Self> {
        let raw = target.as_str();
        let segments: Vec<&str> = raw.trim_start_matches('/').split('/').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(Error::invalid_pool_target(raw));
        }

        match segments.as_slice() {
            [name] if !raw.starts_with('/') => Ok(Self {
                partition: "Common".to_string(),
                sub_path: None,
                name: (*name).to_string(),
            }),
            [partition, name] => Ok(Self {
                partition: (*partition).to_string(),
                sub_path: None,
                name: (*name).to_string(),
            }),
            [partition, folder, name] => Ok(Self {
                partition: (*partition).to_string(),
                sub_path: Some((*folder).to_string()),
                name: (*name).to_string(),
            }),
            _ => Err(Error::invalid_pool_target(raw)),
        }
    }

    /// iControl resource id, e.g. `~Common~web`.
    #[must_use]
    pub fn resource_id(&self) -> String {
        match &self.sub_path {
            Some(folder) => format!("~{}~{}~{}", self.partition, folder, self.name),
            None => format!("~{}~{}", self.partition, self.name),
        }
    }
}

/// TMOS member name for `endpoint`.
#[must_use]
pub fn member_name(endpoint: &Endpoint) -> String {
    match endpoint.address {
        IpAddr::V4(address) => format!("{address}:{}", endpoint.port),
        IpAddr::V6(address) => format!("{address}.{}", endpoint.port),
    }
}

/// Parse a TMOS member name back into an endpoint.
///
/// Route-domain suffixes (`10.0.0.1%2:80`) are dropped.
///
/// # Errors
///
/// Returns [`Error::InvalidMember`] if the name is not an IP member name (FQDN
/// members, for example).
pub fn parse_member_name(name: &str) -> Result<Endpoint> {
    let v4 = name.rsplit_once(':').and_then(|(address, port)| {
        let address = strip_route_domain(address).parse::<Ipv4Addr>().ok()?;
        Some(Endpoint::new(IpAddr::V4(address), port.parse().ok()?))
    });
    let v6 = || {
        name.rsplit_once('.').and_then(|(address, port)| {
            let address = strip_route_domain(address).parse::<Ipv6Addr>().ok()?;
            Some(Endpoint::new(IpAddr::V6(address), port.parse().ok()?))
        })
    };
    v4.or_else(v6).ok_or_else(|| Error::invalid_member(name))
}

fn strip_route_domain(address: &str) -> &str {
    address
        .split_once('%')
        .map_or(address, |(address, _)| address)
}

#[derive(Debug, Deserialize)]
struct MemberCollection {
    #[serde(default)]
    items: Vec<MemberItem>,
}

#[derive(Debug, Deserialize)]
struct MemberItem {
    name: String,
    #[serde(default)]
    partition: Option<String>,
}

impl MemberItem {
    /// iControl member id, e.g. `~Common~10.0.0.1:8080`.
    fn resource_id(&self, pool: &PoolPath) -> String {
        let partition = self.partition.as_deref().unwrap_or(pool.partition.as_str());
        format!("~{partition}~{}", self.name)
    }
}

#[derive(Debug, Serialize)]
struct MemberRef {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePool {
    name: String,
    partition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub_path: Option<String>,
    load_balancing_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    monitor: Option<String>,
    members: Vec<MemberRef>,
}

fn member_refs(members: &EndpointSet) -> Vec<MemberRef> {
    members
        .iter()
        .map(|endpoint| MemberRef {
            name: member_name(endpoint),
        })
        .collect_vec()
}

/// Pool store talking to one BIG-IP over iControl REST.
#[derive(Clone)]
pub struct BigIpPoolStore {
    http_client: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl BigIpPoolStore {
    /// Build a client from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &BigIpConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, tail: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::invalid_base_url(self.base_url.as_str()))?
            .pop_if_empty()
            .extend(POOL_COLLECTION)
            .extend(tail);
        Ok(url)
    }

    fn pool_url(&self, pool: &PoolPath, tail: &[&str]) -> Result<Url> {
        let id = pool.resource_id();
        let segments: Vec<&str> = std::iter::once(id.as_str())
            .chain(tail.iter().copied())
            .collect();
        self.url(&segments)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        Ok(self.authed(request).send().await?)
    }

    async fn pool_exists(&self, pool: &PoolPath) -> Result<bool> {
        let response = self
            .send(self.http_client.get(self.pool_url(pool, &[])?))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(failure(status, response).await),
        }
    }

    async fn list_members(&self, pool: &PoolPath) -> Result<Option<Vec<MemberItem>>> {
        let response = self
            .send(self.http_client.get(self.pool_url(pool, &["members"])?))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let collection: MemberCollection =
                    serde_json::from_slice(&response.bytes().await?)?;
                Ok(Some(collection.items))
            }
            status => Err(failure(status, response).await),
        }
    }

    /// Parsed members of the pool. Members that do not parse are deleted.
    async fn pool_members(&self, pool: &PoolPath) -> Result<Option<EndpointSet>> {
        let Some(items) = self.list_members(pool).await? else {
            return Ok(None);
        };
        let (members, foreign): (EndpointSet, Vec<MemberItem>) =
            items.into_iter().partition_map(|item| match parse_member_name(&item.name) {
                Ok(endpoint) => Either::Left(endpoint),
                Err(_) => Either::Right(item),
            });

        for item in &foreign {
            warn!(member = %item.name, pool = %pool.resource_id(), "Removing pool member that is not an IP member");
            if let Err(e) = self.remove_member(pool, item).await {
                warn!(member = %item.name, error = %e, "Failed to remove pool member");
            }
        }
        Ok(Some(members))
    }

    async fn create_pool(&self, config: &PoolConfig, members: &EndpointSet) -> Result<()> {
        let pool = PoolPath::parse(&config.target)?;
        let body = CreatePool {
            name: pool.name.clone(),
            partition: pool.partition.clone(),
            sub_path: pool.sub_path.clone(),
            load_balancing_mode: config.load_balancing_mode.clone(),
            monitor: (config.health_monitor != "none").then(|| config.health_monitor.clone()),
            members: member_refs(members),
        };
        debug!(pool = %config.target, body = ?body, "Creating pool");

        let response = self
            .send(self.http_client.post(self.url(&[])?).json(&body))
            .await?;
        expect_success(response).await
    }

    async fn add_member(&self, pool: &PoolPath, endpoint: &Endpoint) -> Result<()> {
        let body = MemberRef {
            name: member_name(endpoint),
        };
        let response = self
            .send(
                self.http_client
                    .post(self.pool_url(pool, &["members"])?)
                    .json(&body),
            )
            .await?;
        expect_success(response).await
    }

    async fn remove_member(&self, pool: &PoolPath, item: &MemberItem) -> Result<()> {
        let member = item.resource_id(pool);
        let response = self
            .send(
                self.http_client
                    .delete(self.pool_url(pool, &["members", member.as_str()])?),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(member = %member, "Member already gone");
            return Ok(());
        }
        expect_success(response).await
    }

    async fn delete_pool(&self, pool: &PoolPath) -> Result<()> {
        let response = self
            .send(self.http_client.delete(self.pool_url(pool, &[])?))
            .await?;
        expect_success(response).await
    }
}

impl fmt::Debug for BigIpPoolStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigIpPoolStore")
            .field("base_url", &self.base_url.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

async fn failure(status: StatusCode, response: Response) -> Error {
    let body = response.text().await.unwrap_or_default();
    Error::unexpected_status(status, body)
}

async fn expect_success(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(failure(status, response).await)
    }
}

fn parse_target(
    pool: &PoolTarget,
    operation: StoreOperation,
) -> poolsync_reconciler::Result<PoolPath> {
    PoolPath::parse(pool).map_err(|e| e.into_store_error(operation, pool))
}

#[async_trait]
impl PoolStore for BigIpPoolStore {
    async fn exists(&self, pool: &PoolTarget) -> poolsync_reconciler::Result<bool> {
        let path = parse_target(pool, StoreOperation::Exists)?;
        self.pool_exists(&path)
            .await
            .map_err(|e| e.into_store_error(StoreOperation::Exists, pool))
    }

    async fn read_members(
        &self,
        pool: &PoolTarget,
    ) -> poolsync_reconciler::Result<Option<EndpointSet>> {
        let path = parse_target(pool, StoreOperation::ReadMembers)?;
        self.pool_members(&path)
            .await
            .map_err(|e| e.into_store_error(StoreOperation::ReadMembers, pool))
    }

    async fn create(
        &self,
        config: &PoolConfig,
        members: &EndpointSet,
    ) -> poolsync_reconciler::Result<()> {
        self.create_pool(config, members)
            .await
            .map_err(|e| e.into_store_error(StoreOperation::Create, &config.target))?;
        info!(pool = %config.target, members = members.len(), "BIG-IP pool created");
        Ok(())
    }

    async fn add_members(
        &self,
        pool: &PoolTarget,
        members: &EndpointSet,
    ) -> poolsync_reconciler::Result<()> {
        let path = parse_target(pool, StoreOperation::AddMembers)?;
        for endpoint in members {
            self.add_member(&path, endpoint)
                .await
                .map_err(|e| e.into_store_error(StoreOperation::AddMembers, pool))?;
        }
        Ok(())
    }

    async fn remove_members(
        &self,
        pool: &PoolTarget,
        members: &EndpointSet,
    ) -> poolsync_reconciler::Result<()> {
        let path = parse_target(pool, StoreOperation::RemoveMembers)?;
        let listed = self
            .list_members(&path)
            .await
            .map_err(|e| e.into_store_error(StoreOperation::RemoveMembers, pool))?
            .unwrap_or_default();
        let targets = listed
            .iter()
            .filter(|item| {
                parse_member_name(&item.name).is_ok_and(|endpoint| members.contains(&endpoint))
            })
            .collect_vec();
        if targets.len() < members.len() {
            debug!(pool = %pool, "Some members were already gone");
        }
        for item in targets {
            self.remove_member(&path, item)
                .await
                .map_err(|e| e.into_store_error(StoreOperation::RemoveMembers, pool))?;
        }
        Ok(())
    }

    async fn delete(&self, pool: &PoolTarget) -> poolsync_reconciler::Result<()> {
        let path = parse_target(pool, StoreOperation::Delete)?;
        self.delete_pool(&path)
            .await
            .map_err(|e| e.into_store_error(StoreOperation::Delete, pool))
    }
}
