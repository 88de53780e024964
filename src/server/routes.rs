//! HTTP routers and handlers of both services.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info};

use super::listener::PeerCertificates;
use crate::forward::DelegatingForwarder;
use crate::trust::IdentityResolver;

/// State of the forwarding service
pub struct ApiserverState {
    /// Resolves who called the apiserver
    pub resolver: IdentityResolver,
    /// Set when send mode is on
    pub forwarder: Option<Arc<DelegatingForwarder>>,
}

/// State of the receiving service
pub struct DatabaseState {
    /// Resolves who called the database, directly or by delegation
    pub resolver: IdentityResolver,
}

/// Router of the forwarding service.
///
/// `/database/{resource}` only exists while send mode is on.
pub fn apiserver_router(state: Arc<ApiserverState>) -> Router {
    let mut router = Router::new()
        .route("/", any(root_handler))
        .route("/core/{resource}", any(core_handler));

    if state.forwarder.is_some() {
        router = router.route("/database/{resource}", any(forward_handler));
    }

    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router of the receiving service.
pub fn database_router(state: Arc<DatabaseState>) -> Router {
    Router::new()
        .route("/", any(root_handler))
        .route("/database/{resource}", any(database_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root_handler() -> &'static str {
    "OK\n"
}

async fn core_handler(Path(resource): Path<String>) -> String {
    format!("Resource: {resource}\n")
}

async fn database_handler(
    State(state): State<Arc<DatabaseState>>,
    Path(resource): Path<String>,
    peer: PeerCertificates,
    headers: HeaderMap,
) -> String {
    let caller = state.resolver.resolve_request(peer.chain(), &headers);
    let described = state.resolver.describe(&caller);
    info!(resource = %resource, caller = %described, "Serving database resource");
    format!("Resource: {resource} requested by user {described}\n")
}

/// Relay the request to the database as the resolved caller.
async fn forward_handler(
    State(state): State<Arc<ApiserverState>>,
    peer: PeerCertificates,
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: Body,
) -> Response {
    let Some(forwarder) = state.forwarder.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let caller = state.resolver.resolve_request(peer.chain(), &headers);
    match forwarder.forward(method, &uri, &caller, body).await {
        Ok(response) => response,
        Err(e) => {
            error!(uri = %uri, error = %e, "Forwarding to database failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("error: {e}\n")).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certstore::{AltNames, CertRole, CertificateAuthority};
    use crate::certstore::pem::parse_certs;
    use crate::forward::ForwarderSettings;
    use crate::trust::{TrustAnchorPool, TrustPurpose};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tower::ServiceExt;

    fn resolver(delegation: TrustAnchorPool) -> IdentityResolver {
        IdentityResolver::new(Arc::new(delegation), "X-Remote-User").unwrap()
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn apiserver(forwarder: Option<Arc<DelegatingForwarder>>) -> Router {
        apiserver_router(Arc::new(ApiserverState {
            resolver: resolver(TrustAnchorPool::empty(TrustPurpose::Delegation)),
            forwarder,
        }))
    }

    #[tokio::test]
    async fn root_and_core_resources() {
        let (status, body) = call(apiserver(None), get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK\n");

        let (status, body) = call(apiserver(None), get("/core/pods")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Resource: pods\n");
    }

    #[tokio::test]
    async fn database_route_absent_without_send_mode() {
        let (status, _) = call(apiserver(None), get("/database/pods")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn database_without_peer_cert_reports_anonymous() {
        let router = database_router(Arc::new(DatabaseState {
            resolver: resolver(TrustAnchorPool::empty(TrustPurpose::Delegation)),
        }));

        let (status, body) = call(router, get("/database/pods")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Resource: pods requested by user [-]=system:anonymous\n");
    }

    #[tokio::test]
    async fn database_honours_header_only_from_delegators() {
        // GIVEN: a delegation CA and a client cert it issued
        let requestheader = CertificateAuthority::generate("requestheader").unwrap();
        let delegator = requestheader
            .issue(CertRole::Client, &AltNames::dns("apiserver"))
            .unwrap();
        let pool =
            TrustAnchorPool::from_pem(TrustPurpose::Delegation, &[requestheader.cert_pem()])
                .unwrap();
        let router = database_router(Arc::new(DatabaseState {
            resolver: resolver(pool),
        }));
        let chain = parse_certs(delegator.cert_pem.as_bytes()).unwrap();

        // WHEN: the delegator asserts a user
        let mut request = Request::builder()
            .uri("/database/pods")
            .header("X-Remote-User", "saurov")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(PeerCertificates(Arc::new(chain)));

        // THEN: the asserted user is reported
        let (_, body) = call(router, request).await;
        assert_eq!(body, "Resource: pods requested by user [X-Remote-User]=saurov\n");
    }

    #[tokio::test]
    async fn forward_failure_is_500_with_error_body() {
        // GIVEN: a forwarder pointed at a closed port
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let requestheader = CertificateAuthority::generate("requestheader").unwrap();
        let database = CertificateAuthority::generate("database").unwrap();
        let identity = requestheader
            .issue(CertRole::Client, &AltNames::dns("apiserver"))
            .unwrap();
        let upstream =
            TrustAnchorPool::from_pem(TrustPurpose::Upstream, &[database.cert_pem()]).unwrap();
        let forwarder = DelegatingForwarder::new(
            ForwarderSettings {
                backend_url: url::Url::parse(&format!("https://127.0.0.1:{port}")).unwrap(),
                header: "X-Remote-User".into(),
                timeout: Duration::from_secs(5),
                max_conns_per_host: 2,
            },
            &identity,
            &upstream,
        )
        .unwrap();

        // WHEN
        let (status, body) = call(apiserver(Some(Arc::new(forwarder))), get("/database/pods")).await;

        // THEN
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("error: "), "{body}");
        assert!(body.ends_with('\n'));
    }
}
