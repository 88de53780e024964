//! Certificate identity extraction.
//!
//! Parses an X.509 DER-encoded certificate and extracts the subject fields the
//! services report: Common Name, SAN DNS names, SAN IP addresses.

use std::net::IpAddr;

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

/// Identity fields of a peer or issued certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Certificate Common Name (CN).
    pub common_name: Option<String>,

    /// Subject Alternative Name - DNS entries.
    pub san_dns_names: Vec<String>,

    /// Subject Alternative Name - IP entries.
    pub san_ips: Vec<IpAddr>,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Crypto(format!("Failed to parse certificate: {e}")))?;

        let (san_dns_names, san_ips) = extract_sans(&cert);

        Ok(Self {
            common_name: extract_cn(&cert),
            san_dns_names,
            san_ips,
        })
    }
}

fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<IpAddr>) {
    let mut dns_names = Vec::new();
    let mut ips = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        ips.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    (dns_names, ips)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn make_cert_der(cn: Option<&str>, sans: Vec<SanType>) -> Vec<u8> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        if let Some(cn) = cn {
            dn.push(DnType::CommonName, cn);
        }
        params.distinguished_name = dn;
        params.subject_alt_names = sans;

        let key_pair = KeyPair::generate().expect("key generation failed");
        params
            .self_signed(&key_pair)
            .expect("rcgen cert generation failed")
            .der()
            .to_vec()
    }

    #[test]
    fn from_der_extracts_common_name() {
        // GIVEN: cert with CN=santo
        let der = make_cert_der(Some("santo"), vec![]);
        // WHEN: parsing
        let id = CertIdentity::from_der(&der).unwrap();
        // THEN: CN extracted
        assert_eq!(id.common_name.as_deref(), Some("santo"));
    }

    #[test]
    fn from_der_extracts_dns_and_ip_sans() {
        let der = make_cert_der(
            Some("database"),
            vec![
                SanType::DnsName("database.local".try_into().unwrap()),
                SanType::IpAddress(Ipv4Addr::new(127, 0, 0, 2).into()),
                SanType::IpAddress(Ipv6Addr::LOCALHOST.into()),
            ],
        );
        let id = CertIdentity::from_der(&der).unwrap();

        assert_eq!(id.san_dns_names, vec!["database.local"]);
        assert_eq!(
            id.san_ips,
            vec![
                IpAddr::from(Ipv4Addr::new(127, 0, 0, 2)),
                IpAddr::from(Ipv6Addr::LOCALHOST)
            ]
        );
    }

    #[test]
    fn common_name_is_none_when_absent() {
        let der = make_cert_der(None, vec![SanType::DnsName("x".try_into().unwrap())]);
        let id = CertIdentity::from_der(&der).unwrap();
        assert!(id.common_name.is_none());
    }

    #[test]
    fn from_der_invalid_bytes_returns_error() {
        assert!(CertIdentity::from_der(b"not a cert").is_err());
    }
}
