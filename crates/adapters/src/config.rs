//! Connection settings for the Kubernetes and BIG-IP clients.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::{Certificate, Identity};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// How to reach the BIG-IP iControl REST API.
#[derive(Clone, Deserialize)]
pub struct BigIpConfig {
    /// Management address (e.g. `https://10.1.1.245`).
    pub url: Url,

    /// Basic-auth user.
    #[serde(default = "default_username")]
    pub username: String,

    /// Basic-auth password.
    #[serde(default)]
    pub password: String,

    /// Timeout for each request.
    #[serde(with = "duration_secs", default = "default_timeout", rename = "timeout_secs")]
    pub timeout: Duration,

    /// Accept self-signed management certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl BigIpConfig {
    /// Create a config with default timeout and strict TLS.
    pub fn new(url: Url, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url,
            username: username.into(),
            password: password.into(),
            timeout: default_timeout(),
            accept_invalid_certs: false,
        }
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Accept self-signed certificates.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }
}

impl fmt::Debug for BigIpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigIpConfig")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

/// How to reach Kubernetes API servers.
///
/// The API server address itself comes from each instance, so only the
/// client-wide settings live here.
#[derive(Clone, Deserialize)]
pub struct KubernetesConfig {
    /// Default bearer token, used when an instance carries none.
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// File to read the default bearer token from (e.g. a mounted service-account token).
    #[serde(default)]
    pub bearer_token_file: Option<PathBuf>,

    /// Timeout for each request.
    #[serde(with = "duration_secs", default = "default_timeout", rename = "timeout_secs")]
    pub timeout: Duration,

    /// Accept self-signed API server certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// PEM client certificate presented to the API server.
    #[serde(default)]
    pub client_cert_file: Option<PathBuf>,

    /// PEM private key for `client_cert_file`.
    #[serde(default)]
    pub client_key_file: Option<PathBuf>,

    /// PEM CA bundle trusted in addition to the system roots.
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            bearer_token: None,
            bearer_token_file: None,
            timeout: default_timeout(),
            accept_invalid_certs: false,
            client_cert_file: None,
            client_key_file: None,
            ca_cert_file: None,
        }
    }
}

impl KubernetesConfig {
    /// The default bearer token: the inline token, else the token file's trimmed contents.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the token file cannot be read.
    pub fn default_token(&self) -> Result<Option<String>> {
        if let Some(token) = &self.bearer_token {
            return Ok(Some(token.clone()));
        }
        match &self.bearer_token_file {
            Some(path) => Ok(Some(std::fs::read_to_string(path)?.trim().to_string())),
            None => Ok(None),
        }
    }

    /// The extra trusted CA, if `ca_cert_file` is set.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read.
    pub fn ca_certificate(&self) -> Result<Option<Certificate>> {
        match &self.ca_cert_file {
            Some(path) => Ok(Some(Certificate::from_pem(&std::fs::read(path)?)?)),
            None => Ok(None),
        }
    }

    /// The client identity for mutual TLS, if a certificate and key are set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTlsConfig`] if only one of the two files is set, or an
    /// error if either file cannot be read or parsed.
    pub fn client_identity(&self) -> Result<Option<Identity>> {
        match (&self.client_cert_file, &self.client_key_file) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => {
                let mut pem = std::fs::read(key)?;
                pem.push(b'\n');
                pem.extend(std::fs::read(cert)?);
                Ok(Some(Identity::from_pem(&pem)?))
            }
            (Some(_), None) => Err(Error::invalid_tls_config(
                "client_cert_file is set without client_key_file",
            )),
            (None, Some(_)) => Err(Error::invalid_tls_config(
                "client_key_file is set without client_cert_file",
            )),
        }
    }
}

impl fmt::Debug for KubernetesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubernetesConfig")
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "<redacted>"),
            )
            .field("bearer_token_file", &self.bearer_token_file)
            .field("timeout", &self.timeout)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("client_cert_file", &self.client_cert_file)
            .field("client_key_file", &self.client_key_file)
            .field("ca_cert_file", &self.ca_cert_file)
            .finish()
    }
}

fn default_username() -> String {
    "admin".to_string()
}

const fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
