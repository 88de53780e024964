//! TLS listener plumbing.
//!
//! ```text
//! TCP connection
//!   → TLS handshake  (rustls checks any client cert against the listener pool)
//!   → peer chain captured from the session
//!   → PeerCertificates inserted into every request on the connection
//!   → handlers resolve identity from it
//! ```

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use axum::Extension;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::middleware::AddExtension;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::ServerConfig;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::debug;

use crate::certstore::CertKeyPair;
use crate::certstore::pem::{parse_certs, parse_private_key};
use crate::trust::{TrustAnchorPool, crypto_provider};
use crate::{Error, Result};

/// Certificate chain the peer presented during the handshake, end entity
/// first.  Empty when the peer sent none.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificates(pub Arc<Vec<CertificateDer<'static>>>);

impl PeerCertificates {
    /// The chain as a slice.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        self.0.as_slice()
    }
}

impl<S> FromRequestParts<S> for PeerCertificates
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<Self>().cloned().unwrap_or_default())
    }
}

/// Build a `rustls::ServerConfig` serving `server_identity` and verifying
/// optional client certificates against `listener`.
///
/// # Errors
///
/// Returns an error if the identity cannot be parsed or does not match its
/// key, or the client verifier cannot be built.
pub fn server_tls_config(
    server_identity: &CertKeyPair,
    listener: &TrustAnchorPool,
) -> Result<ServerConfig> {
    let certs = parse_certs(server_identity.cert_pem.as_bytes())?;
    let key = parse_private_key(server_identity.key_pem.as_bytes())?;
    let client_verifier = listener.listener_verifier()?;

    let mut tls_cfg = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Crypto(format!("TLS server protocol setup failed: {e}")))?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::Crypto(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(listener_anchors = listener.len(), "TLS server config built");

    Ok(tls_cfg)
}

/// Rustls acceptor that hands the peer chain to the request handlers.
#[derive(Debug, Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    /// Wrap a rustls server config.
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(config)),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCertificates>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();

        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let chain = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                .unwrap_or_default();
            let service = Extension(PeerCertificates(Arc::new(chain))).layer(service);
            Ok((stream, service))
        })
    }
}
