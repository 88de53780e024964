//! Startup wiring of both services.
//!
//! Every step that touches the certificate stores runs before the listener
//! binds, so a service either starts fully configured or not at all.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use super::routes::{ApiserverState, DatabaseState, apiserver_router, database_router};
use super::{Service, server_tls_config};
use crate::certstore::{AltNames, CertFs, CertKeyPair, CertRole, CertStore, WritePolicy};
use crate::config::Config;
use crate::forward::{DelegatingForwarder, ForwarderSettings};
use crate::trust::{
    DelegationSettings, DelegatorAuthorities, IdentityResolver, ServicePools, TrustAnchorPool,
    TrustPurpose,
};
use crate::{Error, Result};

/// CA of the forwarding service.
pub const APISERVER_CA: &str = "apiserver";
/// CA of the receiving service.
pub const DATABASE_CA: &str = "database";
/// Label of each service's own server certificate.
pub const SERVER_LABEL: &str = "tls";

fn open_store(config: &Config, fs: &Arc<dyn CertFs>) -> CertStore {
    CertStore::new(Arc::clone(fs), &config.cert_dir).with_write_policy(config.write_policy)
}

/// Issue a pair and persist it under `label`.
///
/// Under [`WritePolicy::RejectExisting`] an existing pair is reused instead,
/// so a restart does not trip over its own earlier output.
fn issue_pair(
    store: &CertStore,
    label: &str,
    role: CertRole,
    alt_names: &AltNames,
) -> Result<CertKeyPair> {
    if store.write_policy() == WritePolicy::RejectExisting {
        match store.load_pair(label) {
            Ok(existing) => {
                info!(label = %label, "Reusing existing certificate pair");
                return Ok(existing);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    let pair = match role {
        CertRole::Server => store.new_server_cert_pair(alt_names)?,
        CertRole::Client => store.new_client_cert_pair(alt_names)?,
    };
    store.write(label, &pair)?;
    Ok(pair)
}

impl Service {
    /// Prepare the forwarding service.
    ///
    /// # Errors
    ///
    /// Fails on any certificate store error, and in send mode when the
    /// database CA has not been created yet.
    pub fn apiserver(config: &Config, fs: Arc<dyn CertFs>) -> Result<Self> {
        let settings = &config.apiserver;

        let mut store = open_store(config, &fs);
        store.init_ca(APISERVER_CA)?;
        let server_pair = issue_pair(
            &store,
            SERVER_LABEL,
            CertRole::Server,
            &AltNames {
                ips: settings.server_ips.clone(),
                dns_names: Vec::new(),
            },
        )?;
        issue_pair(
            &store,
            &settings.client_name,
            CertRole::Client,
            &AltNames::dns(settings.client_name.clone()),
        )?;

        let mut rh_store = open_store(config, &fs);
        rh_store.init_ca(&config.delegation.ca_name)?;
        issue_pair(
            &rh_store,
            &config.delegation.delegator_name,
            CertRole::Client,
            &AltNames::dns(config.delegation.delegator_name.clone()),
        )?;

        let forwarder = if settings.send_proxy_request {
            let mut db_store = open_store(config, &fs);
            db_store.load_ca(DATABASE_CA)?;
            let upstream =
                TrustAnchorPool::from_pem(TrustPurpose::Upstream, &[db_store.ca_cert_bytes()?])?;
            let delegator = rh_store.load_pair(&config.delegation.delegator_name)?;
            let backend_url = Url::parse(&settings.backend_url).map_err(|e| {
                Error::Config(format!("Invalid backend_url '{}': {e}", settings.backend_url))
            })?;

            info!(backend = %backend_url, "Send mode enabled");
            Some(Arc::new(DelegatingForwarder::new(
                ForwarderSettings {
                    backend_url,
                    header: config.delegation.header.clone(),
                    timeout: config.delegation.timeout,
                    max_conns_per_host: config.delegation.max_conns_per_host,
                },
                &delegator,
                &upstream,
            )?))
        } else {
            None
        };

        let pools = ServicePools::for_sender(&store.ca_cert_bytes()?)?;
        let resolver = IdentityResolver::new(pools.delegation, &config.delegation.header)?;
        let tls = server_tls_config(&server_pair, &pools.listener)?;

        let router = apiserver_router(Arc::new(ApiserverState {
            resolver,
            forwarder,
        }));

        Ok(Self::new(APISERVER_CA, settings.address, tls, router))
    }

    /// Prepare the receiving service.
    ///
    /// # Errors
    ///
    /// Fails on any certificate store error, and in receive mode when the
    /// apiserver or delegation CA has not been created yet.
    pub fn database(config: &Config, fs: Arc<dyn CertFs>) -> Result<Self> {
        let settings = &config.database;

        let mut store = open_store(config, &fs);
        store.init_ca(DATABASE_CA)?;
        let server_pair = issue_pair(
            &store,
            SERVER_LABEL,
            CertRole::Server,
            &AltNames {
                ips: settings.server_ips.clone(),
                dns_names: Vec::new(),
            },
        )?;
        issue_pair(
            &store,
            &settings.client_name,
            CertRole::Client,
            &AltNames::dns(settings.client_name.clone()),
        )?;

        let delegators = if settings.receive_proxy_request {
            let mut primary = open_store(config, &fs);
            primary.load_ca(APISERVER_CA)?;
            let mut rh_store = open_store(config, &fs);
            rh_store.load_ca(&config.delegation.ca_name)?;

            info!(
                delegation_ca = %config.delegation.ca_name,
                "Receive mode enabled"
            );
            Some(DelegatorAuthorities {
                primary_ca: primary.ca_cert_bytes()?,
                delegation_ca: rh_store.ca_cert_bytes()?,
            })
        } else {
            None
        };

        let pools = ServicePools::for_receiver(
            DelegationSettings {
                enabled: settings.receive_proxy_request,
                trust_own_ca: settings.trust_own_ca,
            },
            &store.ca_cert_bytes()?,
            delegators.as_ref(),
        )?;
        if pools.listener.is_empty() {
            warn!("Listener trusts no CA; every caller will be anonymous");
        }

        let resolver = IdentityResolver::new(pools.delegation, &config.delegation.header)?;
        let tls = server_tls_config(&server_pair, &pools.listener)?;
        let router = database_router(Arc::new(DatabaseState { resolver }));

        Ok(Self::new(DATABASE_CA, settings.address, tls, router))
    }
}

/// Where [`issue_client`] put the new pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedClient {
    /// Certificate file
    pub cert_file: PathBuf,
    /// Private key file
    pub key_file: PathBuf,
}

/// Issue an additional client certificate under an existing CA.
///
/// Only loads the CA, never creates one.
///
/// # Errors
///
/// `Error::NotFound` when the CA does not exist.
pub fn issue_client(config: &Config, fs: Arc<dyn CertFs>, ca: &str, name: &str) -> Result<IssuedClient> {
    let mut store = open_store(config, &fs);
    store.load_ca(ca)?;
    let pair = store.new_client_cert_pair(&AltNames::dns(name))?;
    store.write(name, &pair)?;

    let issued = IssuedClient {
        cert_file: store.cert_file(name)?,
        key_file: store.key_file(name)?,
    };
    info!(
        ca = %ca,
        name = %name,
        cert = %issued.cert_file.display(),
        "Issued client certificate"
    );
    Ok(issued)
}
