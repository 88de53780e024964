//! Trust delegation between two mutually authenticated services.
//!
//! # Architecture
//!
//! ```text
//! client ──mTLS──▶ apiserver ──mTLS (requestheader client cert)──▶ database
//!                   │                X-Remote-User: <caller>          │
//!                   └─ resolves caller from its own cert              └─ IdentityResolver:
//!                                                                        delegator? header : CN
//! ```
//!
//! Two pools per receiving service, never merged:
//! - **listener** - which client certificates the TLS handshake accepts
//! - **delegation** - which of those may additionally assert someone else's
//!   identity through the delegation header
//!
//! # Modules
//!
//! - [`pool`] - `TrustAnchorPool` and chain verification
//! - [`identity`] - X.509 subject field extraction (`CertIdentity`)
//! - [`resolver`] - the decision procedure (`IdentityResolver`)

pub mod identity;
pub mod pool;
pub mod resolver;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use tracing::info;

pub use identity::CertIdentity;
pub use pool::{ChainVerification, TrustAnchorPool, TrustPurpose};
pub use resolver::{
    ANONYMOUS_PRINCIPAL, DEFAULT_DELEGATION_HEADER, IdentityResolver, Provenance,
    ResolvedIdentity,
};

use crate::{Error, Result};

/// The process-wide rustls crypto backend.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

// ─────────────────────────────────────────────────────────────────────────────
// Pool assembly
// ─────────────────────────────────────────────────────────────────────────────

/// Whether delegation is switched on for a service, and what else its
/// listener trusts.  Decides pool contents once, at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelegationSettings {
    /// Send mode on the forwarding service, receive mode on the receiving one.
    pub enabled: bool,
    /// Whether the receiving listener also accepts certificates from its own CA.
    pub trust_own_ca: bool,
}

/// CA certificates of the forwarding side, as seen by the receiving side.
#[derive(Debug, Clone)]
pub struct DelegatorAuthorities {
    /// The forwarding service's main CA (PEM).
    pub primary_ca: Vec<u8>,
    /// The CA dedicated to delegation (PEM).
    pub delegation_ca: Vec<u8>,
}

/// The two inbound pools of one service.
#[derive(Debug, Clone)]
pub struct ServicePools {
    /// Handshake-level trust.
    pub listener: Arc<TrustAnchorPool>,
    /// Which accepted peers may assert a delegated identity.
    pub delegation: Arc<TrustAnchorPool>,
}

impl ServicePools {
    /// Pools of the forwarding service: its own CA at the listener, nobody
    /// may delegate to it.
    pub fn for_sender(own_ca: &[u8]) -> Result<Self> {
        Ok(Self {
            listener: Arc::new(TrustAnchorPool::from_pem(TrustPurpose::Listener, &[own_ca])?),
            delegation: Arc::new(TrustAnchorPool::empty(TrustPurpose::Delegation)),
        })
    }

    /// Pools of the receiving service.
    ///
    /// With delegation enabled the listener trusts the delegator's main CA and
    /// the delegation CA, and only the delegation CA may assert identities.
    /// With it disabled `delegators` is ignored and the delegation pool is
    /// empty.
    ///
    /// # Errors
    ///
    /// `Error::Config` if delegation is enabled without delegator authorities,
    /// `Error::Crypto` if a CA certificate cannot be parsed.
    pub fn for_receiver(
        settings: DelegationSettings,
        own_ca: &[u8],
        delegators: Option<&DelegatorAuthorities>,
    ) -> Result<Self> {
        let mut listener: Vec<&[u8]> = Vec::new();
        if settings.trust_own_ca {
            listener.push(own_ca);
        }

        let delegation = if settings.enabled {
            let delegators = delegators.ok_or_else(|| {
                Error::Config("delegation enabled but delegator CAs were not loaded".into())
            })?;
            listener.push(&delegators.primary_ca);
            listener.push(&delegators.delegation_ca);
            TrustAnchorPool::from_pem(TrustPurpose::Delegation, &[&delegators.delegation_ca])?
        } else {
            TrustAnchorPool::empty(TrustPurpose::Delegation)
        };

        let listener = TrustAnchorPool::from_pem(TrustPurpose::Listener, &listener)?;
        info!(
            delegation = settings.enabled,
            listener_anchors = listener.len(),
            delegation_anchors = delegation.len(),
            "Receiver trust pools assembled"
        );

        Ok(Self {
            listener: Arc::new(listener),
            delegation: Arc::new(delegation),
        })
    }
}
