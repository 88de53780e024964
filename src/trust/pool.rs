//! Trust anchor pools.
//!
//! A [`TrustAnchorPool`] is an immutable set of CA certificates for exactly
//! one verification purpose.  Pools are assembled once at startup; nothing on
//! the request path mutates them.

use std::fmt;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use tracing::debug;

use super::crypto_provider;
use crate::certstore::pem::parse_certs;
use crate::{Error, Result};

/// What a pool's anchors are trusted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPurpose {
    /// Client certificates accepted during the inbound TLS handshake.
    Listener,
    /// Peers allowed to assert a delegated identity.
    Delegation,
    /// Servers the forwarder is willing to connect to.
    Upstream,
}

impl fmt::Display for TrustPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener => f.write_str("listener"),
            Self::Delegation => f.write_str("delegation"),
            Self::Upstream => f.write_str("upstream"),
        }
    }
}

impl TrustPurpose {
    /// Whether pools of this purpose validate client chains.
    #[must_use]
    pub fn verifies_clients(self) -> bool {
        matches!(self, Self::Listener | Self::Delegation)
    }
}

/// Outcome of validating a peer chain against a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerification {
    /// Chain reaches an anchor with valid signatures, dates and clientAuth usage.
    Verified,
    /// Chain does not validate; carries the verifier's reason.
    Rejected(String),
}

/// Immutable set of CA certificates for one purpose.
#[derive(Clone)]
pub struct TrustAnchorPool {
    purpose: TrustPurpose,
    roots: Arc<RootCertStore>,
    verifier: Option<Arc<dyn ClientCertVerifier>>,
}

impl fmt::Debug for TrustAnchorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchorPool")
            .field("purpose", &self.purpose)
            .field("anchors", &self.roots.len())
            .finish()
    }
}

impl TrustAnchorPool {
    /// A pool with no anchors.  Every chain is rejected.
    #[must_use]
    pub fn empty(purpose: TrustPurpose) -> Self {
        Self {
            purpose,
            roots: Arc::new(RootCertStore::empty()),
            verifier: None,
        }
    }

    /// Build a pool from PEM-encoded CA certificates.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if a PEM input holds no valid certificate or a
    /// certificate cannot be used as a trust anchor.
    pub fn from_pem<B: AsRef<[u8]>>(purpose: TrustPurpose, pems: &[B]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for pem in pems {
            for cert in parse_certs(pem.as_ref())? {
                roots.add(cert).map_err(|e| {
                    Error::Crypto(format!("Failed to add CA cert to {purpose} pool: {e}"))
                })?;
            }
        }
        if roots.is_empty() {
            return Ok(Self::empty(purpose));
        }

        let roots = Arc::new(roots);
        // Upstream pools only feed a root store for server verification.
        let verifier = if purpose.verifies_clients() {
            let verifier = WebPkiClientVerifier::builder_with_provider(
                Arc::clone(&roots),
                crypto_provider(),
            )
            .build()
            .map_err(|e| Error::Crypto(format!("Failed to build {purpose} verifier: {e}")))?;
            Some(verifier)
        } else {
            None
        };

        debug!(%purpose, anchors = roots.len(), "Trust anchor pool built");

        Ok(Self {
            purpose,
            roots,
            verifier,
        })
    }

    /// Purpose this pool was built for.
    #[must_use]
    pub fn purpose(&self) -> TrustPurpose {
        self.purpose
    }

    /// Whether the pool holds no anchors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of anchors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Anchors as a rustls root store, for outbound server verification.
    #[must_use]
    pub fn root_store(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    /// Validate `chain` (end entity first) as a client certificate chain.
    ///
    /// Checks signatures, validity window and clientAuth usage.  Revocation
    /// is not consulted.
    pub fn verify_client(&self, chain: &[CertificateDer<'_>]) -> ChainVerification {
        let Some(verifier) = &self.verifier else {
            let reason = if self.roots.is_empty() {
                "has no anchors"
            } else {
                "does not verify client certificates"
            };
            return ChainVerification::Rejected(format!("{} pool {reason}", self.purpose));
        };
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return ChainVerification::Rejected("no peer certificate".to_string());
        };

        match verifier.verify_client_cert(end_entity, intermediates, UnixTime::now()) {
            Ok(_) => ChainVerification::Verified,
            Err(e) => ChainVerification::Rejected(e.to_string()),
        }
    }

    /// Handshake-level client verifier for a listener using this pool.
    ///
    /// Client certificates are requested but optional.  An empty pool does
    /// not request client certificates at all.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if the verifier cannot be built.
    pub fn listener_verifier(&self) -> Result<Arc<dyn ClientCertVerifier>> {
        if self.roots.is_empty() {
            return Ok(WebPkiClientVerifier::no_client_auth());
        }
        WebPkiClientVerifier::builder_with_provider(Arc::clone(&self.roots), crypto_provider())
            .allow_unauthenticated()
            .build()
            .map_err(|e| Error::Crypto(format!("Failed to build client verifier: {e}")))
    }
}
