//! Caller identity resolution.
//!
//! # Decision procedure
//!
//! For each request, in this order:
//! 1. No peer certificate → anonymous principal, provenance `None`.
//! 2. First peer certificate validates against the **delegation** pool
//!    (signature, validity window, clientAuth usage) → the peer is a trusted
//!    delegator; principal = delegation header value verbatim, provenance
//!    `HeaderDelegated`.
//! 3. Otherwise → principal = CN of the first peer certificate, provenance
//!    `DirectPeerCertificate`.
//!
//! Resolution never fails: every input maps to exactly one
//! [`ResolvedIdentity`].

use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName};
use rustls::pki_types::CertificateDer;
use tracing::debug;

use super::identity::CertIdentity;
use super::pool::{ChainVerification, TrustAnchorPool};
use crate::{Error, Result};

/// Principal used when the caller presented no certificate.
pub const ANONYMOUS_PRINCIPAL: &str = "system:anonymous";

/// Default header carrying the delegated principal name.
pub const DEFAULT_DELEGATION_HEADER: &str = "X-Remote-User";

/// Basis on which an identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// No credential was presented.
    None,
    /// Common name of the caller's own certificate.
    DirectPeerCertificate,
    /// Header asserted by a trusted delegator.
    HeaderDelegated,
}

impl Provenance {
    /// Short label shown to callers.  Delegated identities are labelled with
    /// the header that carried them.
    #[must_use]
    pub fn label<'a>(self, delegation_header: &'a str) -> &'a str {
        match self {
            Self::None => "-",
            Self::DirectPeerCertificate => "Client-Cert-CN",
            Self::HeaderDelegated => delegation_header,
        }
    }
}

/// Resolved caller identity for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Principal name.
    pub principal: String,
    /// How the principal was established.
    pub provenance: Provenance,
}

impl ResolvedIdentity {
    /// The anonymous identity.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            principal: ANONYMOUS_PRINCIPAL.to_owned(),
            provenance: Provenance::None,
        }
    }
}

impl fmt::Display for ResolvedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.principal, self.provenance)
    }
}

/// Applies the delegation decision procedure against one delegation pool.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    delegation: Arc<TrustAnchorPool>,
    header: HeaderName,
    /// Header name as configured; `HeaderName` only keeps the lowercase form.
    header_label: String,
}

impl IdentityResolver {
    /// Resolver trusting `delegation` to assert identities via `header`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `header` is not a valid header name.
    pub fn new(delegation: Arc<TrustAnchorPool>, header: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(header.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid delegation header '{header}': {e}")))?;
        Ok(Self {
            delegation,
            header: name,
            header_label: header.to_owned(),
        })
    }

    /// Name of the delegation header.
    #[must_use]
    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    /// `[<provenance label>]=<principal>`, as reported to callers.
    #[must_use]
    pub fn describe(&self, identity: &ResolvedIdentity) -> String {
        format!(
            "[{}]={}",
            identity.provenance.label(&self.header_label),
            identity.principal
        )
    }

    /// Resolve from the peer chain and the raw delegation header value.
    ///
    /// An absent header on the delegated branch yields the empty principal,
    /// still with `HeaderDelegated` provenance.
    pub fn resolve(
        &self,
        peer_certs: &[CertificateDer<'_>],
        delegated: Option<&str>,
    ) -> ResolvedIdentity {
        let Some(first) = peer_certs.first() else {
            return ResolvedIdentity::anonymous();
        };

        match self.delegation.verify_client(peer_certs) {
            ChainVerification::Verified => ResolvedIdentity {
                principal: delegated.unwrap_or_default().to_owned(),
                provenance: Provenance::HeaderDelegated,
            },
            ChainVerification::Rejected(reason) => {
                debug!(%reason, "peer is not a delegator, using certificate CN");
                ResolvedIdentity {
                    principal: CertIdentity::from_der(first)
                        .ok()
                        .and_then(|id| id.common_name)
                        .unwrap_or_default(),
                    provenance: Provenance::DirectPeerCertificate,
                }
            }
        }
    }

    /// Resolve using the delegation header from `headers`.
    ///
    /// Only the first header value counts; bytes that are not UTF-8 are
    /// replaced rather than dropped.
    pub fn resolve_request(
        &self,
        peer_certs: &[CertificateDer<'_>],
        headers: &HeaderMap,
    ) -> ResolvedIdentity {
        let delegated = headers
            .get(&self.header)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
        self.resolve(peer_certs, delegated.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certstore::pem::parse_certs;
    use crate::certstore::{AltNames, CertRole, CertificateAuthority};
    use crate::trust::TrustPurpose;
    use axum::http::HeaderValue;

    struct Fixture {
        resolver: IdentityResolver,
        delegator: CertificateDer<'static>,
        direct: CertificateDer<'static>,
    }

    fn fixture() -> Fixture {
        let requestheader = CertificateAuthority::generate("requestheader").unwrap();
        let database = CertificateAuthority::generate("database").unwrap();
        let pool =
            TrustAnchorPool::from_pem(TrustPurpose::Delegation, &[requestheader.cert_pem()])
                .unwrap();

        let delegator = requestheader
            .issue(CertRole::Client, &AltNames::dns("apiserver"))
            .unwrap();
        let direct = database
            .issue(CertRole::Client, &AltNames::dns("santo"))
            .unwrap();

        Fixture {
            resolver: IdentityResolver::new(Arc::new(pool), DEFAULT_DELEGATION_HEADER).unwrap(),
            delegator: parse_certs(delegator.cert_pem.as_bytes()).unwrap().remove(0),
            direct: parse_certs(direct.cert_pem.as_bytes()).unwrap().remove(0),
        }
    }

    // ── no peer certificate ──────────────────────────────────────────────────

    #[test]
    fn no_cert_without_header_is_anonymous() {
        let f = fixture();
        assert_eq!(f.resolver.resolve(&[], None), ResolvedIdentity::anonymous());
    }

    #[test]
    fn no_cert_ignores_header() {
        // GIVEN: a header but no certificate to back it
        let f = fixture();
        // THEN: still anonymous
        assert_eq!(
            f.resolver.resolve(&[], Some("saurov")),
            ResolvedIdentity::anonymous()
        );
    }

    // ── delegator certificate ────────────────────────────────────────────────

    #[test]
    fn delegator_with_header_is_header_delegated() {
        let f = fixture();
        let id = f.resolver.resolve(&[f.delegator.clone()], Some("saurov"));
        assert_eq!(id.provenance, Provenance::HeaderDelegated);
        assert_eq!(id.principal, "saurov");
    }

    #[test]
    fn delegator_header_value_is_taken_verbatim() {
        let f = fixture();
        let id = f
            .resolver
            .resolve(&[f.delegator.clone()], Some(" system:admin "));
        assert_eq!(id.principal, " system:admin ");
    }

    #[test]
    fn delegator_without_header_is_empty_principal() {
        let f = fixture();
        let id = f.resolver.resolve(&[f.delegator.clone()], None);
        assert_eq!(id.provenance, Provenance::HeaderDelegated);
        assert_eq!(id.principal, "");
        assert_eq!(f.resolver.describe(&id), "[X-Remote-User]=");
    }

    // ── direct certificate ───────────────────────────────────────────────────

    #[test]
    fn direct_cert_uses_common_name() {
        let f = fixture();
        let id = f.resolver.resolve(&[f.direct.clone()], None);
        assert_eq!(id.provenance, Provenance::DirectPeerCertificate);
        assert_eq!(id.principal, "santo");
    }

    #[test]
    fn direct_cert_cannot_assert_header_identity() {
        // GIVEN: a non-delegator that sets the header itself
        let f = fixture();
        let id = f.resolver.resolve(&[f.direct.clone()], Some("admin"));
        // THEN: the header is ignored
        assert_eq!(id.provenance, Provenance::DirectPeerCertificate);
        assert_eq!(id.principal, "santo");
    }

    #[test]
    fn empty_delegation_pool_always_falls_back_to_cn() {
        let f = fixture();
        let resolver = IdentityResolver::new(
            Arc::new(TrustAnchorPool::empty(TrustPurpose::Delegation)),
            DEFAULT_DELEGATION_HEADER,
        )
        .unwrap();
        let id = resolver.resolve(&[f.delegator], Some("saurov"));
        assert_eq!(id.provenance, Provenance::DirectPeerCertificate);
        assert_eq!(id.principal, "apiserver");
    }

    #[test]
    fn unparseable_cert_resolves_to_empty_principal() {
        let f = fixture();
        let junk = CertificateDer::from(b"junk".to_vec());
        let id = f.resolver.resolve(&[junk], Some("saurov"));
        assert_eq!(id.provenance, Provenance::DirectPeerCertificate);
        assert_eq!(id.principal, "");
    }

    // ── header extraction ────────────────────────────────────────────────────

    #[test]
    fn resolve_request_reads_configured_header() {
        let f = fixture();
        let mut headers = HeaderMap::new();
        headers.insert("x-remote-user", HeaderValue::from_static("saurov"));

        let id = f.resolver.resolve_request(&[f.delegator.clone()], &headers);
        assert_eq!(id.principal, "saurov");
    }

    #[test]
    fn resolve_request_non_utf8_header_is_kept_lossily() {
        let f = fixture();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-remote-user",
            HeaderValue::from_bytes(b"s\xffnto").unwrap(),
        );

        let id = f.resolver.resolve_request(&[f.delegator.clone()], &headers);
        assert_eq!(id.provenance, Provenance::HeaderDelegated);
        assert_eq!(id.principal, "s\u{fffd}nto");
    }

    #[test]
    fn resolve_request_without_header_is_empty_principal() {
        let f = fixture();
        let id = f
            .resolver
            .resolve_request(&[f.delegator.clone()], &HeaderMap::new());
        assert_eq!(id.provenance, Provenance::HeaderDelegated);
        assert_eq!(id.principal, "");
    }

    #[test]
    fn invalid_header_name_is_config_error() {
        let pool = Arc::new(TrustAnchorPool::empty(TrustPurpose::Delegation));
        assert!(matches!(
            IdentityResolver::new(pool, "bad header"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn describe_uses_configured_header_casing() {
        let f = fixture();
        let id = f.resolver.resolve(&[f.delegator.clone()], Some("saurov"));
        assert_eq!(f.resolver.describe(&id), "[X-Remote-User]=saurov");
        assert_eq!(
            f.resolver.describe(&ResolvedIdentity::anonymous()),
            "[-]=system:anonymous"
        );
    }

    #[test]
    fn provenance_labels() {
        assert_eq!(Provenance::None.label("X-Remote-User"), "-");
        assert_eq!(
            Provenance::DirectPeerCertificate.label("X-Remote-User"),
            "Client-Cert-CN"
        );
        assert_eq!(
            Provenance::HeaderDelegated.label("X-Remote-User"),
            "X-Remote-User"
        );
    }
}
