//! mTLS accept loop for the self-update listener.
//!
//! ```text
//! TcpListener::accept
//!   → TlsAcceptor::accept   (client cert required, chained to the CA pool)
//!   → PeerCertificates inserted into every request on that connection
//!   → axum Router           (allowed-name middleware → handler)
//! ```
//!
//! The loop ends when its stop token is cancelled. Because the token is
//! owned by the one listener it guards, a cancelled token is the
//! structural proof that the listener was closed on purpose. Temporary
//! accept failures back off and retry; only an unusable socket is
//! reported as [`ServeExit::Failed`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures::stream::{self, Stream, StreamExt};
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::auth::PeerCertificates;

/// Per-connection TLS handshake deadline.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a stopped listener waits for in-flight connections.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// First pause after a failed `accept`; doubles on each consecutive failure.
pub const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(100);

/// Upper bound for the `accept` retry pause.
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Why a serving task returned.
#[derive(Debug)]
pub enum ServeExit {
    /// The stop token for this listener was cancelled.
    Stopped,
    /// `accept` failed in a way retrying cannot fix.
    Failed(io::Error),
}

/// Accept and serve connections until `stop` is cancelled.
///
/// After the loop ends the listening socket is closed, open connections
/// are told to finish their current request, and the task waits up to
/// [`DRAIN_TIMEOUT`] for them before returning.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    stop: CancellationToken,
) -> ServeExit {
    let incoming = stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await;
        Some((accepted, listener))
    });
    serve_incoming(incoming, acceptor, app, stop).await
}

/// Accept loop over any source of TCP connections.
///
/// Temporary accept failures (for example `EMFILE` while descriptors are
/// exhausted) back off from [`ACCEPT_BACKOFF_MIN`] to [`ACCEPT_BACKOFF_MAX`]
/// and retry; the pause is cut short by `stop`.
async fn serve_incoming<S>(
    incoming: S,
    acceptor: TlsAcceptor,
    app: Router,
    stop: CancellationToken,
) -> ServeExit
where
    S: Stream<Item = io::Result<(TcpStream, SocketAddr)>>,
{
    let connections = TaskTracker::new();
    let mut incoming = Box::pin(incoming);
    let mut backoff: Option<Duration> = None;

    let exit = loop {
        tokio::select! {
            biased;

            () = stop.cancelled() => break ServeExit::Stopped,

            accepted = incoming.next() => match accepted {
                Some(Ok((tcp, peer_addr))) => {
                    backoff = None;
                    connections.spawn(serve_connection(
                        tcp,
                        peer_addr,
                        acceptor.clone(),
                        app.clone(),
                        stop.clone(),
                    ));
                }
                Some(Err(e)) if is_connection_error(&e) => {
                    debug!(error = %e, "Accepted connection failed before TLS");
                }
                Some(Err(e)) if stop.is_cancelled() => {
                    debug!(error = %e, "Accept interrupted by stop");
                    break ServeExit::Stopped;
                }
                Some(Err(e)) if is_fatal_accept_error(&e) => break ServeExit::Failed(e),
                Some(Err(e)) => {
                    let delay = backoff.map_or(ACCEPT_BACKOFF_MIN, |d| (d * 2).min(ACCEPT_BACKOFF_MAX));
                    backoff = Some(delay);
                    warn!(error = %e, retry_in = ?delay, "TCP accept failed");
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => break ServeExit::Stopped,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    break ServeExit::Failed(io::Error::other("connection source ended"));
                }
            },
        }
    };

    // Closes the listening socket.
    drop(incoming);
    connections.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, connections.wait())
        .await
        .is_err()
    {
        warn!(
            open = connections.len(),
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "Connections still open after drain timeout"
        );
    }

    exit
}

/// Handshake, capture the peer chain, then serve HTTP/1.1 on the stream.
async fn serve_connection(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
    stop: CancellationToken,
) {
    let tls_stream =
        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => {
                // Unknown CAs and missing client certs end up here.
                debug!(peer = %peer_addr, error = %e, "mTLS handshake failed");
                return;
            }
            Err(_) => {
                warn!(
                    peer = %peer_addr,
                    timeout_secs = TLS_HANDSHAKE_TIMEOUT.as_secs(),
                    "mTLS handshake timed out"
                );
                return;
            }
        };

    let (_, session) = tls_stream.get_ref();
    let peer = PeerCertificates::new(
        session
            .peer_certificates()
            .map(<[_]>::to_vec)
            .unwrap_or_default(),
    );
    debug!(peer = %peer_addr, chain_len = peer.chain().len(), "mTLS handshake successful");

    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(peer.clone());
        app.clone().oneshot(request)
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls_stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer_addr, error = %e, "Connection closed with error");
            }
        }
        () = stop.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(peer = %peer_addr, error = %e, "Connection closed with error during drain");
            }
        }
    }
}

/// Errors that only affect the connection being accepted, not the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// The socket itself is unusable (e.g. not listening); retrying cannot help.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::InvalidInput)
}
