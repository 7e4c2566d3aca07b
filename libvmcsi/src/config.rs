//! Process configuration shared by the driver binary and tests.
//!
//! Everything here is resolved once at startup.  Failures are
//! bootstrap-fatal: a malformed API URL, an unreadable token file or an empty
//! vendor version stop the process before any RPC is served.  The one
//! permissive path is the infra CA file, which falls back to the system
//! trust roots with a warning when it cannot be loaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

/// Default plugin name reported by `GetPluginInfo`.
pub const DEFAULT_DRIVER_NAME: &str = "vmdisk.csi.rk8s.io";

/// Default timeout for a single HTTP call to the infra API server.
pub const DEFAULT_INFRA_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid infra cluster API URL {url}: {reason}")]
    InvalidApiUrl { url: String, reason: String },

    #[error("failed to read token file {}: {source}", path.display())]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("token file {} is empty", .0.display())]
    EmptyToken(PathBuf),

    #[error("infra cluster namespace must not be empty")]
    EmptyNamespace,

    #[error("driver vendor version must be set at build time")]
    MissingVendorVersion,

    #[error("invalid TLS material in {}: {reason}", path.display())]
    TlsMaterial { path: PathBuf, reason: String },
}

/// Immutable plugin identity, handed to the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: String,
    pub vendor_version: String,
}

impl DriverInfo {
    pub fn new(
        name: impl Into<String>,
        vendor_version: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let vendor_version = vendor_version.into();
        if vendor_version.trim().is_empty() {
            return Err(ConfigError::MissingVendorVersion);
        }
        Ok(Self {
            name: name.into(),
            vendor_version,
        })
    }

    /// Identity stamped at compile time from the crate version.
    pub fn from_build(name: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(name, env!("CARGO_PKG_VERSION"))
    }
}

/// Connection settings for the infra cluster API server.
#[derive(Clone)]
pub struct InfraClusterConfig {
    pub api_url: Url,
    /// Namespace holding the tenant VMs and their DataVolumes.
    pub namespace: String,
    pub bearer_token: String,
    /// PEM bundle pinned as the only trust root, when one could be loaded.
    pub ca_pem: Option<Vec<u8>>,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for InfraClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfraClusterConfig")
            .field("api_url", &self.api_url.as_str())
            .field("namespace", &self.namespace)
            .field("bearer_token", &"<redacted>")
            .field("ca_pinned", &self.ca_pem.is_some())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl InfraClusterConfig {
    /// Resolve the infra cluster configuration from its on-disk inputs.
    pub fn load(
        api_url: &str,
        namespace: &str,
        token_file: &Path,
        ca_file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let api_url = parse_api_url(api_url)?;
        if namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }

        let token = std::fs::read_to_string(token_file).map_err(|source| {
            ConfigError::TokenFile {
                path: token_file.to_path_buf(),
                source,
            }
        })?;
        let bearer_token = token.trim().to_owned();
        if bearer_token.is_empty() {
            return Err(ConfigError::EmptyToken(token_file.to_path_buf()));
        }

        let ca_pem = ca_file.and_then(load_ca_bundle);
        info!(
            api_url = %api_url,
            %namespace,
            ca_pinned = ca_pem.is_some(),
            "infra cluster config loaded"
        );

        Ok(Self {
            api_url,
            namespace: namespace.to_owned(),
            bearer_token,
            ca_pem,
            request_timeout: DEFAULT_INFRA_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn parse_api_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidApiUrl {
        url: raw.to_owned(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url),
        scheme => Err(ConfigError::InvalidApiUrl {
            url: raw.to_owned(),
            reason: format!("unsupported scheme {scheme:?} or missing host"),
        }),
    }
}

/// Load the CA bundle, or `None` (no pinning) when it is unusable.
fn load_ca_bundle(path: &Path) -> Option<Vec<u8>> {
    let pem = match std::fs::read(path) {
        Ok(pem) => pem,
        Err(e) => {
            warn!(path = %path.display(), error = %e,
                "failed to read infra CA file, falling back to system roots");
            return None;
        }
    };
    let certs: Result<Vec<CertificateDer<'static>>, _> =
        CertificateDer::pem_slice_iter(&pem).collect();
    match certs {
        Ok(certs) if !certs.is_empty() => Some(pem),
        Ok(_) => {
            warn!(path = %path.display(), "infra CA file holds no certificates, falling back to system roots");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e,
                "failed to parse infra CA file, falling back to system roots");
            None
        }
    }
}

/// Build the QUIC server TLS configuration from PEM files.
pub fn load_server_tls(
    cert_file: &Path,
    key_file: &Path,
) -> Result<rustls::ServerConfig, ConfigError> {
    let tls_err = |path: &Path, reason: String| ConfigError::TlsMaterial {
        path: path.to_path_buf(),
        reason,
    };

    let chain = CertificateDer::pem_file_iter(cert_file)
        .map_err(|e| tls_err(cert_file, e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(cert_file, e.to_string()))?;
    if chain.is_empty() {
        return Err(tls_err(cert_file, "no certificates found".to_owned()));
    }
    let key =
        PrivateKeyDer::from_pem_file(key_file).map_err(|e| tls_err(key_file, e.to_string()))?;

    rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_err(cert_file, e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| tls_err(cert_file, e.to_string()))
}
