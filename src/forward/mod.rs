//! Outbound side of the delegation protocol.
//!
//! [`DelegatingForwarder`] relays a request to the receiving service over
//! mutual TLS, authenticating with a certificate issued by the delegation CA
//! and asserting the original caller through the delegation header.
//!
//! - one outbound TLS client, built once at startup
//! - at most `max_conns_per_host` concurrent requests per destination
//! - one fixed timeout per request, no retries
//! - status and body are copied back verbatim; the body is streamed
//!
//! If the original caller goes away, the server drops the handler future;
//! that drops the in-flight outbound request and frees its limiter slot.

pub mod limiter;
pub mod tls;

use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, Method, Response, Uri};
use futures::StreamExt;
use tracing::{debug, info, warn};
use url::Url;

pub use limiter::HostLimiter;
pub use tls::client_tls_config;

use crate::certstore::CertKeyPair;
use crate::trust::{ResolvedIdentity, TrustAnchorPool};
use crate::{Error, Result};

/// Static settings of a forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    /// Base URL of the receiving service; the inbound path is appended.
    pub backend_url: Url,
    /// Header carrying the delegated principal.
    pub header: String,
    /// Per-request timeout, covering the wait for a slot and the whole exchange.
    pub timeout: Duration,
    /// Concurrent requests per destination host.
    pub max_conns_per_host: usize,
}

/// Relays requests to the receiving service on behalf of resolved callers.
#[derive(Debug)]
pub struct DelegatingForwarder {
    client: reqwest::Client,
    backend_url: Url,
    header: HeaderName,
    timeout: Duration,
    limiter: HostLimiter,
}

impl DelegatingForwarder {
    /// Build a forwarder that authenticates with `delegation_identity` and
    /// trusts servers anchored in `upstream`.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an invalid header, an empty upstream pool or a
    /// client that cannot be built; `Error::Crypto` for unusable key material.
    pub fn new(
        settings: ForwarderSettings,
        delegation_identity: &CertKeyPair,
        upstream: &TrustAnchorPool,
    ) -> Result<Self> {
        let header = HeaderName::from_bytes(settings.header.as_bytes()).map_err(|e| {
            Error::Config(format!("Invalid delegation header '{}': {e}", settings.header))
        })?;
        if upstream.is_empty() {
            return Err(Error::Config(
                "forwarder needs at least one upstream CA to verify the backend".into(),
            ));
        }

        let tls = client_tls_config(delegation_identity, upstream)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(settings.timeout)
            .pool_max_idle_per_host(settings.max_conns_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build forwarding client: {e}")))?;

        Ok(Self {
            client,
            backend_url: settings.backend_url,
            header,
            timeout: settings.timeout,
            limiter: HostLimiter::new(settings.max_conns_per_host),
        })
    }

    /// Backend URL for an inbound request URI.
    #[must_use]
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.backend_url.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        url
    }

    /// Forward one request and return the backend's response.
    ///
    /// Nothing is returned until the backend status is known, so a failed
    /// backend can never leak a success status to the caller.
    ///
    /// # Errors
    ///
    /// `Error::Transport` on timeout, refused connection or handshake failure.
    pub async fn forward(
        &self,
        method: Method,
        uri: &Uri,
        caller: &ResolvedIdentity,
        body: Body,
    ) -> Result<Response<Body>> {
        let url = self.target_url(uri);
        let host = host_key(&url);
        let principal = HeaderValue::from_str(&caller.principal).map_err(|e| {
            Error::Transport(format!("principal cannot be sent in a header: {e}"))
        })?;

        info!(
            %method,
            url = %url,
            principal = %caller.principal,
            provenance = ?caller.provenance,
            "Forwarding request"
        );

        let mut request = self
            .client
            .request(method, url.clone())
            .header(self.header.clone(), principal);
        if body.size_hint().exact() != Some(0) {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let exchange = async {
            let permit = self.limiter.acquire(&host).await?;
            let response = request.send().await?;
            Ok::<_, Error>((permit, response))
        };
        let (permit, response) = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "Forwarded request failed");
                return Err(e);
            }
            Err(_) => {
                warn!(url = %url, timeout = ?self.timeout, "Forwarded request timed out");
                return Err(Error::Transport(format!(
                    "request to {url} timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let status = response.status();
        debug!(url = %url, %status, "Backend responded");

        let mut builder = Response::builder().status(status);
        if let Some(content_type) = response.headers().get(CONTENT_TYPE) {
            builder = builder.header(CONTENT_TYPE, content_type.clone());
        }

        // The slot stays taken until the body has been relayed or dropped.
        let stream = response.bytes_stream().map(move |chunk| {
            let _slot = &permit;
            chunk
        });

        builder
            .body(Body::from_stream(stream))
            .map_err(|e| Error::Transport(format!("invalid backend response: {e}")))
    }

    /// Slots currently free towards the backend host.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.limiter.available(&host_key(&self.backend_url))
    }
}

fn host_key(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certstore::{AltNames, CertRole, CertificateAuthority};
    use crate::server::{PeerCertAcceptor, server_tls_config};
    use crate::trust::{Provenance, TrustPurpose};
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::any;
    use axum_server::Handle;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    fn forwarder(backend: &str, timeout: Duration) -> DelegatingForwarder {
        let requestheader = CertificateAuthority::generate("requestheader").unwrap();
        let database = CertificateAuthority::generate("database").unwrap();
        forwarder_between(backend, timeout, 10, &requestheader, &database)
    }

    fn forwarder_between(
        backend: &str,
        timeout: Duration,
        max_conns_per_host: usize,
        requestheader: &CertificateAuthority,
        database: &CertificateAuthority,
    ) -> DelegatingForwarder {
        let identity = requestheader
            .issue(CertRole::Client, &AltNames::dns("apiserver"))
            .unwrap();
        let upstream =
            TrustAnchorPool::from_pem(TrustPurpose::Upstream, &[database.cert_pem()]).unwrap();

        DelegatingForwarder::new(
            ForwarderSettings {
                backend_url: Url::parse(backend).unwrap(),
                header: "X-Remote-User".into(),
                timeout,
                max_conns_per_host,
            },
            &identity,
            &upstream,
        )
        .unwrap()
    }

    /// mTLS backend answering every `/database/*` call with 418 and a body
    /// naming the delegated user.
    async fn teapot_backend(
        database: &CertificateAuthority,
        requestheader: &CertificateAuthority,
    ) -> (SocketAddr, Handle<SocketAddr>) {
        let identity = database
            .issue(CertRole::Server, &AltNames::ip(Ipv4Addr::LOCALHOST.into()))
            .unwrap();
        let listener =
            TrustAnchorPool::from_pem(TrustPurpose::Listener, &[requestheader.cert_pem()])
                .unwrap();
        let tls = server_tls_config(&identity, &listener).unwrap();

        let app = Router::new().route(
            "/database/{resource}",
            any(|headers: HeaderMap| async move {
                let user = headers
                    .get("x-remote-user")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                (
                    StatusCode::IM_A_TEAPOT,
                    [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                    format!("teapot for {user}"),
                )
            }),
        );

        let handle = Handle::new();
        let server = axum_server::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .acceptor(PeerCertAcceptor::new(Arc::new(tls)))
            .handle(handle.clone())
            .serve(app.into_make_service());
        tokio::spawn(server);

        let addr = handle.listening().await.unwrap();
        (addr, handle)
    }

    #[test]
    fn target_url_keeps_backend_origin_and_inbound_path() {
        let f = forwarder("https://127.0.0.2:8443", Duration::from_secs(20));
        let uri: Uri = "/database/widget?watch=true".parse().unwrap();

        assert_eq!(
            f.target_url(&uri).as_str(),
            "https://127.0.0.2:8443/database/widget?watch=true"
        );
    }

    #[test]
    fn host_key_includes_default_port() {
        assert_eq!(
            host_key(&Url::parse("https://db.local/x").unwrap()),
            "db.local:443"
        );
    }

    #[test]
    fn new_rejects_empty_upstream_pool() {
        let ca = CertificateAuthority::generate("requestheader").unwrap();
        let identity = ca.issue(CertRole::Client, &AltNames::dns("apiserver")).unwrap();
        let result = DelegatingForwarder::new(
            ForwarderSettings {
                backend_url: Url::parse("https://127.0.0.2:8443").unwrap(),
                header: "X-Remote-User".into(),
                timeout: Duration::from_secs(1),
                max_conns_per_host: 1,
            },
            &identity,
            &TrustAnchorPool::empty(TrustPurpose::Upstream),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn backend_status_and_body_are_relayed_while_holding_the_slot() {
        // GIVEN: a backend that answers 418 with a body
        let requestheader = CertificateAuthority::generate("requestheader").unwrap();
        let database = CertificateAuthority::generate("database").unwrap();
        let (addr, handle) = teapot_backend(&database, &requestheader).await;
        let f = forwarder_between(
            &format!("https://{addr}"),
            Duration::from_secs(5),
            2,
            &requestheader,
            &database,
        );
        let caller = ResolvedIdentity {
            principal: "saurov".into(),
            provenance: Provenance::DirectPeerCertificate,
        };

        // WHEN: forwarding, before the body is read
        let response = f
            .forward(
                Method::GET,
                &"/database/widget".parse().unwrap(),
                &caller,
                Body::empty(),
            )
            .await
            .unwrap();

        // THEN: status and content type are copied, the slot is still taken
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(f.available_slots(), 1);

        // WHEN: the body is consumed
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();

        // THEN: the body arrived intact with the delegated user, slot released
        assert_eq!(&body[..], b"teapot for saurov");
        assert_eq!(f.available_slots(), 2);
        handle.shutdown();
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error_and_frees_slot() {
        // GIVEN: a port nobody listens on
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let f = forwarder(&format!("https://127.0.0.1:{port}"), Duration::from_secs(5));

        // WHEN: forwarding
        let result = f
            .forward(
                Method::GET,
                &"/database/widget".parse().unwrap(),
                &ResolvedIdentity::anonymous(),
                Body::empty(),
            )
            .await;

        // THEN: transport error, slot released
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(f.available_slots(), 10);
    }

    #[tokio::test]
    async fn hung_backend_times_out() {
        // GIVEN: a listener that accepts but never answers the TLS handshake
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        let f = forwarder(
            &format!("https://127.0.0.1:{port}"),
            Duration::from_millis(200),
        );

        let err = f
            .forward(
                Method::GET,
                &"/database/widget".parse().unwrap(),
                &ResolvedIdentity::anonymous(),
                Body::empty(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert!(err.to_string().contains("timed out"), "{err}");
        assert_eq!(f.available_slots(), 10);
        hold.abort();
    }
}
