//! Certificate authority and leaf issuance, backed by `rcgen`.
//!
//! A [`CertificateAuthority`] is a key pair plus its self-signed root
//! certificate.  Leaf certificates carry exactly one role; the role fixes the
//! extended key usage at issuance time so a client certificate can never be
//! presented as a server certificate and vice versa.

use std::fmt;
use std::net::IpAddr;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};

use crate::{Error, Result};

/// Root certificates stay valid for ten years.
const CA_VALIDITY: Duration = Duration::days(3650);
/// Leaf certificates stay valid for one year.
const LEAF_VALIDITY: Duration = Duration::days(365);
/// Back-date `not_before` so peers with a slightly slow clock accept new certs.
const CLOCK_SKEW: Duration = Duration::minutes(5);

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

/// Subject alternative names for a leaf certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltNames {
    /// IP address entries.
    pub ips: Vec<IpAddr>,
    /// DNS name entries.
    pub dns_names: Vec<String>,
}

impl AltNames {
    /// Alt names with a single IP entry.
    #[must_use]
    pub fn ip(ip: IpAddr) -> Self {
        Self {
            ips: vec![ip],
            dns_names: Vec::new(),
        }
    }

    /// Alt names with a single DNS entry.
    pub fn dns(name: impl Into<String>) -> Self {
        Self {
            ips: Vec::new(),
            dns_names: vec![name.into()],
        }
    }

    /// Whether no entry is present at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.dns_names.is_empty()
    }

    /// Subject common name: the first DNS name, else the first IP.
    fn common_name(&self) -> Option<String> {
        self.dns_names
            .first()
            .cloned()
            .or_else(|| self.ips.first().map(ToString::to_string))
    }

    fn to_san_types(&self) -> Result<Vec<SanType>> {
        let mut sans = Vec::with_capacity(self.ips.len() + self.dns_names.len());
        for dns in &self.dns_names {
            let ia5 = Ia5String::try_from(dns.as_str())
                .map_err(|e| Error::Validation(format!("Invalid DNS SAN '{dns}': {e}")))?;
            sans.push(SanType::DnsName(ia5));
        }
        sans.extend(self.ips.iter().copied().map(SanType::IpAddress));
        Ok(sans)
    }
}

/// Role of an issued leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertRole {
    /// TLS server (serverAuth).
    Server,
    /// TLS client (clientAuth).
    Client,
}

impl CertRole {
    fn extended_key_usages(self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            Self::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            Self::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
        }
    }

    fn key_usages(self) -> Vec<KeyUsagePurpose> {
        match self {
            Self::Server => vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
            Self::Client => vec![KeyUsagePurpose::DigitalSignature],
        }
    }
}

impl fmt::Display for CertRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

/// A PEM-encoded certificate and its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl fmt::Debug for CertKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertKeyPair")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate authority
// ─────────────────────────────────────────────────────────────────────────────

/// A signing authority: key pair plus self-signed root certificate.
pub struct CertificateAuthority {
    name: String,
    pem: CertKeyPair,
    issuer: Issuer<'static, KeyPair>,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a fresh key pair and self-signed root named `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if key generation or self-signing fails.
    pub fn generate(name: &str) -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Crypto(format!("Failed to generate CA key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + CA_VALIDITY;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Crypto(format!("CA cert generation failed: {e}")))?;

        let pem = CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        };

        Ok(Self {
            name: name.to_owned(),
            pem,
            issuer: Issuer::new(params, key_pair),
        })
    }

    /// Rebuild an authority from its persisted PEM certificate and key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if either PEM block cannot be parsed or the
    /// certificate is not a CA.
    pub fn from_pem(name: &str, cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Crypto(format!("Failed to parse CA key '{name}': {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| Error::Crypto(format!("Failed to parse CA cert '{name}': {e}")))?;

        Ok(Self {
            name: name.to_owned(),
            pem: CertKeyPair {
                cert_pem: cert_pem.to_owned(),
                key_pem: key_pem.to_owned(),
            },
            issuer,
        })
    }

    /// Authority name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PEM-encoded root certificate.
    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.pem.cert_pem
    }

    /// PEM root certificate and key, as persisted.
    #[must_use]
    pub fn pem(&self) -> &CertKeyPair {
        &self.pem
    }

    /// Issue a leaf certificate of `role` for `alt_names`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `alt_names` is empty or holds an invalid
    /// DNS name, `Error::Crypto` if key generation or signing fails.
    pub fn issue(&self, role: CertRole, alt_names: &AltNames) -> Result<CertKeyPair> {
        let common_name = alt_names.common_name().ok_or_else(|| {
            Error::Validation("at least one IP or DNS subject alternative name is required".into())
        })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name.as_str());
        params.distinguished_name = dn;
        params.subject_alt_names = alt_names.to_san_types()?;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = role.key_usages();
        params.extended_key_usages = role.extended_key_usages();
        params.use_authority_key_identifier_extension = true;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now + LEAF_VALIDITY;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Crypto(format!("Failed to generate leaf key: {e}")))?;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| Error::Crypto(format!("Leaf cert signing failed: {e}")))?;

        tracing::debug!(ca = %self.name, cn = %common_name, %role, "issued leaf certificate");

        Ok(CertKeyPair {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }
}
