//! Outbound mutual-TLS client configuration.

use rustls::ClientConfig;

use crate::certstore::CertKeyPair;
use crate::certstore::pem::{parse_certs, parse_private_key};
use crate::trust::{TrustAnchorPool, crypto_provider};
use crate::{Error, Result};

/// Build a `rustls::ClientConfig` that presents `identity` and verifies
/// servers against `upstream`.
///
/// # Errors
///
/// Returns an error if the identity PEM cannot be parsed or does not match
/// its key.
pub fn client_tls_config(identity: &CertKeyPair, upstream: &TrustAnchorPool) -> Result<ClientConfig> {
    let certs = parse_certs(identity.cert_pem.as_bytes())?;
    let key = parse_private_key(identity.key_pem.as_bytes())?;

    ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Crypto(format!("TLS client protocol setup failed: {e}")))?
        .with_root_certificates(upstream.root_store())
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::Crypto(format!("TLS client config error (cert/key mismatch?): {e}")))
}
