//! PEM decoding for certificates and private keys.
//!
//! All certificate and key material handled by the store is **PEM**.  The
//! path-based loaders are what a TLS listener or client uses to consume the
//! files written by [`super::CertStore::write`].

use std::path::Path;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::{Error, Result};

/// Decode every certificate block in `pem`.
///
/// # Errors
///
/// Returns `Error::Crypto` if a block is malformed or no certificate is present.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Crypto(format!("Failed to parse certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Crypto("No certificates found in PEM input".to_string()));
    }

    Ok(certs)
}

/// Decode the first private key in `pem` (PKCS#8, PKCS#1 or SEC1).
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| Error::Crypto(format!("Failed to parse private key PEM: {e}")))
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    parse_certs(&pem_data).map_err(|e| Error::Crypto(format!("'{}': {e}", path.display())))
}

/// Load the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    parse_private_key(&pem_data).map_err(|e| Error::Crypto(format!("'{}': {e}", path.display())))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(format!("Cannot read '{}'", path.display())),
        _ => Error::storage(path, e),
    })
}
