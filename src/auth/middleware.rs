//! Allowed-name middleware for the HTTPS endpoint.
//!
//! The TLS accept loop attaches the handshake's peer chain to every request
//! as a [`PeerCertificates`] extension. [`authorize_peer`] runs the
//! [`CertificateVerifier`] on it and either forwards the request untouched
//! or answers with a fixed rejection status without calling the inner
//! handler.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use rustls::pki_types::CertificateDer;
use tracing::{debug, warn};

use super::verifier::{Authorization, CertificateVerifier};

/// Peer certificate chain captured from a completed TLS handshake.
///
/// Index 0 is the peer's leaf certificate.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificates(Arc<Vec<CertificateDer<'static>>>);

impl PeerCertificates {
    /// Wrap a chain taken from the TLS session.
    #[must_use]
    pub fn new(chain: Vec<CertificateDer<'static>>) -> Self {
        Self(Arc::new(chain))
    }

    /// The captured chain, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.0
    }
}

/// Status written when no verified peer chain is attached.
pub const UNAUTHENTICATED_STATUS: StatusCode = StatusCode::UNAUTHORIZED;

/// Status written when the peer's subject is not allowed.
pub const REJECTED_STATUS: StatusCode = StatusCode::FORBIDDEN;

/// Wrap every route of `router` with the allowed-name check.
///
/// Applied as a route layer so unknown paths still 404 instead of
/// revealing the authorization outcome.
pub fn require_allowed_peer<S>(router: Router<S>, verifier: Arc<CertificateVerifier>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(verifier, authorize_peer))
}

/// Allowed-name middleware.
///
/// A request without a [`PeerCertificates`] extension never completed a
/// client-authenticated handshake and is refused.
pub async fn authorize_peer(
    State(verifier): State<Arc<CertificateVerifier>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let decision = request
        .extensions()
        .get::<PeerCertificates>()
        .map_or(Authorization::Unauthenticated, |peer| {
            verifier.authorize(peer.chain())
        });

    let path = request.uri().path();
    match decision {
        Authorization::Authorized => {
            debug!(path = %path, "Peer certificate authorized");
            next.run(request).await
        }
        Authorization::Unauthenticated => {
            warn!(path = %path, "Rejected request without a verified client certificate");
            UNAUTHENTICATED_STATUS.into_response()
        }
        Authorization::Rejected { subject } => {
            warn!(path = %path, subject = %subject, "Rejected client certificate subject");
            REJECTED_STATUS.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::routing::post;
    use rcgen::{CertificateParams, DnType, KeyPair};
    use tower::ServiceExt;

    use super::*;

    fn leaf(cn: &str) -> CertificateDer<'static> {
        let mut params = CertificateParams::default();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let key_pair = KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().der().clone()
    }

    /// Router whose only handler counts how often it ran.
    fn counting_router(calls: Arc<AtomicUsize>) -> Router {
        let router = Router::new().route(
            "/self-update",
            post(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }
            }),
        );
        let verifier =
            Arc::new(CertificateVerifier::from_allowed_names(&["CN=ops-controller"]).unwrap());
        require_allowed_peer(router, verifier)
    }

    fn request(peer: Option<PeerCertificates>) -> Request<Body> {
        let mut req = Request::post("/self-update").body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            req.extensions_mut().insert(peer);
        }
        req
    }

    #[tokio::test]
    async fn allowed_peer_reaches_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_router(Arc::clone(&calls));

        let peer = PeerCertificates::new(vec![leaf("ops-controller")]);
        let resp = app.oneshot(request(Some(peer))).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disallowed_peer_is_rejected_without_calling_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_router(Arc::clone(&calls));

        let peer = PeerCertificates::new(vec![leaf("attacker")]);
        let resp = app.oneshot(request(Some(peer))).await.unwrap();

        assert_eq!(resp.status(), REJECTED_STATUS);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_peer_chain_is_unauthenticated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_router(Arc::clone(&calls));

        let resp = app.oneshot(request(None)).await.unwrap();

        assert_eq!(resp.status(), UNAUTHENTICATED_STATUS);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_peer_chain_is_unauthenticated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_router(Arc::clone(&calls));

        let resp = app
            .oneshot(request(Some(PeerCertificates::default())))
            .await
            .unwrap();

        assert_eq!(resp.status(), UNAUTHENTICATED_STATUS);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found_not_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = counting_router(calls);

        let req = Request::post("/elsewhere").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
