//! Endpoint source backed by the Kubernetes core/v1 Endpoints API.

use std::net::IpAddr;

use async_trait::async_trait;
use itertools::Itertools;
use poolsync_reconciler::{Credentials, Endpoint, EndpointSet, EndpointSource, ServiceRef};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::KubernetesConfig;
use crate::error::{Error, Result};

/// `Endpoints` object, reduced to what membership needs.
#[derive(Debug, Deserialize)]
struct EndpointsObject {
    #[serde(default)]
    subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Deserialize)]
struct EndpointSubset {
    /// Ready addresses only; `notReadyAddresses` is never read.
    #[serde(default)]
    addresses: Vec<EndpointAddress>,
    #[serde(default)]
    ports: Vec<EndpointPort>,
}

#[derive(Debug, Deserialize)]
struct EndpointAddress {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct EndpointPort {
    port: u16,
}

/// Reads service endpoints from a Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubernetesEndpointSource {
    http_client: reqwest::Client,
    default_token: Option<String>,
}

impl KubernetesEndpointSource {
    /// Build a client from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token file or a TLS file cannot be read, or the HTTP
    /// client cannot be built.
    pub fn new(config: &KubernetesConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(ca) = config.ca_certificate()? {
            builder = builder.add_root_certificate(ca);
        }
        if let Some(identity) = config.client_identity()? {
            builder = builder.identity(identity);
        }
        let http_client = builder.build()?;

        Ok(Self {
            http_client,
            default_token: config.default_token()?,
        })
    }

    async fn fetch(&self, service: &ServiceRef, credentials: &Credentials) -> Result<EndpointSet> {
        let url = endpoints_url(service)?;
        debug!(url = %url, "Fetching service endpoints");

        let token = credentials
            .bearer_token
            .as_deref()
            .or(self.default_token.as_deref());
        let request = self.http_client.get(url);
        let request = match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        // A missing Endpoints object fails the pass; only an object with no
        // subsets empties the pool.
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::unexpected_status(status, body));
        }

        let object: EndpointsObject = serde_json::from_slice(&response.bytes().await?)?;
        endpoint_set(&object)
    }
}

#[async_trait]
impl EndpointSource for KubernetesEndpointSource {
    async fn list_endpoints(
        &self,
        service: &ServiceRef,
        credentials: &Credentials,
    ) -> poolsync_reconciler::Result<EndpointSet> {
        self.fetch(service, credentials)
            .await
            .map_err(Error::into_source_error)
    }
}

/// `{endpoint}/api/v1/namespaces/{namespace}/endpoints/{service}`.
fn endpoints_url(service: &ServiceRef) -> Result<Url> {
    let mut url = Url::parse(&service.endpoint)?;
    url.path_segments_mut()
        .map_err(|()| Error::invalid_base_url(&service.endpoint))?
        .pop_if_empty()
        .extend([
            "api",
            "v1",
            "namespaces",
            service.namespace.as_str(),
            "endpoints",
            service.service_name.as_str(),
        ]);
    Ok(url)
}

/// Every ready address paired with every port of its subset.
fn endpoint_set(object: &EndpointsObject) -> Result<EndpointSet> {
    object
        .subsets
        .iter()
        .flat_map(|subset| subset.addresses.iter().cartesian_product(&subset.ports))
        .map(|(address, port)| {
            address
                .ip
                .parse::<IpAddr>()
                .map(|ip| Endpoint::new(ip, port.port))
                .map_err(|_| Error::invalid_address(&address.ip))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn service(server: &MockServer) -> ServiceRef {
        ServiceRef::new(server.uri(), "default", "web")
    }

    fn endpoints(items: &[&str]) -> std::result::Result<EndpointSet, poolsync_reconciler::Error> {
        items.iter().map(|s| s.parse::<Endpoint>()).collect()
    }

    #[test]
    fn test_endpoints_url_appends_to_base_path() -> TestResult {
        let service = ServiceRef::new("https://k8s.local:6443/proxy/", "prod", "api");
        let url = endpoints_url(&service)?;
        assert_eq!(
            url.as_str(),
            "https://k8s.local:6443/proxy/api/v1/namespaces/prod/endpoints/api"
        );
        Ok(())
    }

    #[test]
    fn test_endpoints_url_rejects_garbage() {
        let service = ServiceRef::new("not a url", "prod", "api");
        assert!(endpoints_url(&service).is_err());
    }

    #[tokio::test]
    async fn test_cross_product_of_addresses_and_ports() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/default/endpoints/web"))
            .and(bearer_token("s3cr3t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "Endpoints",
                "subsets": [
                    {
                        "addresses": [{"ip": "10.0.0.1"}, {"ip": "10.0.0.2"}],
                        "notReadyAddresses": [{"ip": "10.0.0.9"}],
                        "ports": [{"port": 8080, "protocol": "TCP"}, {"port": 9090}]
                    },
                    {
                        "addresses": [{"ip": "fd00::5"}],
                        "ports": [{"port": 443}]
                    }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = KubernetesEndpointSource::new(&KubernetesConfig::default())?;
        let result = source
            .list_endpoints(&service(&server), &Credentials::bearer("s3cr3t"))
            .await?;

        assert_eq!(
            result,
            endpoints(&[
                "10.0.0.1:8080",
                "10.0.0.1:9090",
                "10.0.0.2:8080",
                "10.0.0.2:9090",
                "[fd00::5]:443",
            ])?
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_default_token_used_without_instance_credentials() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(bearer_token("cluster-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let config = KubernetesConfig {
            bearer_token: Some("cluster-token".to_string()),
            ..Default::default()
        };
        let source = KubernetesEndpointSource::new(&config)?;
        let result = source
            .list_endpoints(&service(&server), &Credentials::none())
            .await?;

        assert!(result.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_service_is_source_error() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "kind": "Status",
                "reason": "NotFound"
            })))
            .mount(&server)
            .await;

        let source = KubernetesEndpointSource::new(&KubernetesConfig::default())?;
        let result = source
            .list_endpoints(&service(&server), &Credentials::none())
            .await;

        assert!(matches!(
            result,
            Err(poolsync_reconciler::Error::Source { ref reason }) if reason.contains("404")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_object_without_subsets_is_empty_set() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "Endpoints",
                "metadata": {"name": "web"}
            })))
            .mount(&server)
            .await;

        let source = KubernetesEndpointSource::new(&KubernetesConfig::default())?;
        let result = source
            .list_endpoints(&service(&server), &Credentials::none())
            .await?;

        assert!(result.is_empty());
        Ok(())
    }

    #[test]
    fn test_unreadable_ca_file_fails_construction() {
        let config = KubernetesConfig {
            ca_cert_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(
            KubernetesEndpointSource::new(&config),
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_forbidden_is_source_error() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let source = KubernetesEndpointSource::new(&KubernetesConfig::default())?;
        let result = source
            .list_endpoints(&service(&server), &Credentials::none())
            .await;

        assert!(matches!(
            result,
            Err(poolsync_reconciler::Error::Source { ref reason }) if reason.contains("403")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_address_is_source_error() -> TestResult {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subsets": [{"addresses": [{"ip": "pod.local"}], "ports": [{"port": 80}]}]
            })))
            .mount(&server)
            .await;

        let source = KubernetesEndpointSource::new(&KubernetesConfig::default())?;
        let result = source
            .list_endpoints(&service(&server), &Credentials::none())
            .await;

        assert!(result.is_err());
        Ok(())
    }
}
