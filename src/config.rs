//! Configuration management

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::certstore::{DEFAULT_CERT_DIR, WritePolicy};
use crate::trust::DEFAULT_DELEGATION_HEADER;
use crate::{Error, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "EXTENDED_APISERVER_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of all certificate stores
    pub cert_dir: PathBuf,
    /// What `CertStore::write` does with an existing label
    pub write_policy: WritePolicy,
    /// Forwarding (primary) service
    pub apiserver: ApiserverConfig,
    /// Receiving (secondary) service
    pub database: DatabaseConfig,
    /// Delegation protocol settings shared by both services
    pub delegation: DelegationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            write_policy: WritePolicy::default(),
            apiserver: ApiserverConfig::default(),
            database: DatabaseConfig::default(),
            delegation: DelegationConfig::default(),
        }
    }
}

/// Primary service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiserverConfig {
    /// Listen address
    pub address: SocketAddr,
    /// IP SANs of the server certificate
    pub server_ips: Vec<IpAddr>,
    /// Name of the sample client certificate issued under the main CA
    pub client_name: String,
    /// Forward `/database/{resource}` to the database service
    pub send_proxy_request: bool,
    /// Base URL of the database service
    pub backend_url: String,
}

impl Default for ApiserverConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 8443),
            server_ips: vec![Ipv4Addr::new(127, 0, 0, 1).into()],
            client_name: "saurov".to_string(),
            send_proxy_request: false,
            backend_url: "https://127.0.0.2:8443".to_string(),
        }
    }
}

/// Secondary service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Listen address
    pub address: SocketAddr,
    /// IP SANs of the server certificate
    pub server_ips: Vec<IpAddr>,
    /// Name of the sample client certificate issued under the database CA
    pub client_name: String,
    /// Accept delegated calls from the apiserver
    pub receive_proxy_request: bool,
    /// Also accept client certificates issued by the database CA itself
    pub trust_own_ca: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(Ipv4Addr::new(127, 0, 0, 2).into(), 8443),
            server_ips: vec![Ipv4Addr::new(127, 0, 0, 2).into()],
            client_name: "santo".to_string(),
            receive_proxy_request: false,
            trust_own_ca: false,
        }
    }
}

/// Delegation protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Header carrying the delegated principal
    pub header: String,
    /// CA dedicated to delegation
    pub ca_name: String,
    /// Common name of the forwarder's delegation client certificate
    pub delegator_name: String,
    /// Per-request timeout for forwarded calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Concurrent outbound connections per destination host
    pub max_conns_per_host: usize,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            header: DEFAULT_DELEGATION_HEADER.to_string(),
            ca_name: "requestheader".to_string(),
            delegator_name: "apiserver".to_string(),
            timeout: Duration::from_secs(20),
            max_conns_per_host: 10,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional YAML file and
    /// `EXTENDED_APISERVER_*` environment variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, mid-startup.
    pub fn validate(&self) -> Result<()> {
        if self.delegation.max_conns_per_host == 0 {
            return Err(Error::Config(
                "delegation.max_conns_per_host must be at least 1".into(),
            ));
        }
        if self.delegation.timeout.is_zero() {
            return Err(Error::Config("delegation.timeout must be non-zero".into()));
        }
        if self.apiserver.server_ips.is_empty() || self.database.server_ips.is_empty() {
            return Err(Error::Config("server_ips must not be empty".into()));
        }
        if self.apiserver.send_proxy_request {
            url::Url::parse(&self.apiserver.backend_url).map_err(|e| {
                Error::Config(format!(
                    "Invalid apiserver.backend_url '{}': {e}",
                    self.apiserver.backend_url
                ))
            })?;
        }
        Ok(())
    }
}
