//! Bootstrapper: pulls update packages and serves the self-update endpoint.
//!
//! Both directions use mutual TLS against the configured CA and then
//! require the peer's certificate subject to match one of the allowed
//! names.
//!
//! # Server lifecycle
//!
//! ```text
//! NotStarted ──listen──▶ Listening ──stop_listening──▶ Closing ──▶ Stopped
//!                             ▲                                       │
//!                             └──────────────── listen ───────────────┘
//! ```
//!
//! Control calls (`listen`, `stop_listening`) take `&mut self`, so callers
//! serialize them through a single owner. [`Bootstrapper::download`] only
//! needs `&self` and may run alongside an active listener.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use node_bootstrapper::{Bootstrapper, BootstrapperConfig, CommandInstaller};
//!
//! # tokio_test::block_on(async {
//! let config = BootstrapperConfig {
//!     cert_file: "/etc/node-bootstrapper/tls/node.crt".into(),
//!     key_file: "/etc/node-bootstrapper/tls/node.key".into(),
//!     ca_cert_pem: std::fs::read_to_string("/etc/node-bootstrapper/tls/ca.crt").unwrap(),
//!     allowed_names: vec!["CN=ops-controller,O=Example".to_string()],
//! };
//! let installer = CommandInstaller::new("/usr/local/bin/install-package", Vec::new());
//! let mut bootstrapper = Bootstrapper::new(config, Arc::new(installer));
//!
//! bootstrapper.listen(4443).await.unwrap();
//! // ... later
//! bootstrapper.stop_listening();
//! bootstrapper.wait_for_server_to_exit().await;
//! # });
//! ```

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::tls::TlsInfo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::auth::{Authorization, CertificateVerifier};
use crate::handler;
use crate::installer::PackageInstaller;
use crate::server::{self, ServeExit};
use crate::tls;
use crate::{Error, Result};

/// Immutable settings captured at construction.
#[derive(Debug, Clone, Default)]
pub struct BootstrapperConfig {
    /// PEM certificate presented by this node (as server and as client).
    pub cert_file: PathBuf,
    /// PEM private key for `cert_file`.
    pub key_file: PathBuf,
    /// PEM text of the CA(s) trusted for peers in both directions.
    pub ca_cert_pem: String,
    /// Distinguished names peers must match, e.g. `CN=ops-controller,O=Example`.
    pub allowed_names: Vec<String>,
}

/// Lifecycle of the listener owned by a [`Bootstrapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// `listen` has not succeeded yet.
    NotStarted,
    /// Accepting connections.
    Listening,
    /// `stop_listening` is closing the listener.
    Closing,
    /// The listener has been closed; `listen` may be called again.
    Stopped,
}

/// Cloneable waiter that resolves once no serving task is running.
#[derive(Debug, Clone)]
pub struct ServerExit(TaskTracker);

impl ServerExit {
    /// Wait until every serving task has returned.
    pub async fn wait(&self) {
        self.0.wait().await;
    }
}

struct ActiveListener {
    local_addr: SocketAddr,
    stop: CancellationToken,
}

/// Node bootstrapper.
pub struct Bootstrapper {
    config: Arc<BootstrapperConfig>,
    installer: Arc<dyn PackageInstaller>,
    state: ServerState,
    active: Option<ActiveListener>,
    /// Join counter: one entry per serving task spawned by `listen`.
    serving: TaskTracker,
}

impl Bootstrapper {
    /// Create a bootstrapper. Nothing is validated until `listen`/`download`.
    pub fn new(config: BootstrapperConfig, installer: Arc<dyn PackageInstaller>) -> Self {
        let serving = TaskTracker::new();
        // Closed up front so `wait` returns whenever the count is zero,
        // including before the first `listen`.
        serving.close();

        Self {
            config: Arc::new(config),
            installer,
            state: ServerState::NotStarted,
            active: None,
            serving,
        }
    }

    /// The configuration snapshot.
    #[must_use]
    pub fn config(&self) -> &BootstrapperConfig {
        &self.config
    }

    /// Current listener state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Address of the active listener, if any.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|a| a.local_addr)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Client role
    // ─────────────────────────────────────────────────────────────────────

    /// Fetch the package at `url` and install it.
    ///
    /// The body reaches the installer only after a 200 response *and* a
    /// successful allowed-name check on the server's certificate.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for empty/invalid allowed names, bad CA PEM,
    ///   unreadable key pair, or an unparseable URL (no network I/O happens)
    /// - [`Error::Http`] when the request itself fails (connect, handshake)
    /// - [`Error::Network`] when the status is not 200
    /// - [`Error::Unauthorized`] / [`Error::Unauthenticated`] when the server
    ///   is not an allowed update source
    /// - [`Error::Install`] exactly as the installer reported it
    pub async fn download(&self, url: &str) -> Result<()> {
        let verifier = CertificateVerifier::from_allowed_names(&self.config.allowed_names)?;

        info!(url = %url, "Downloading package");
        let parsed = reqwest::Url::parse(url).map_err(|e| {
            error!(url = %url, error = %e, "Couldn't make the request");
            Error::Config(format!("Invalid download URL '{url}': {e}"))
        })?;

        let client = self.http_client().inspect_err(|e| {
            error!(error = %e, "Couldn't make the http client");
        })?;

        let resp = client.get(parsed).send().await.inspect_err(|e| {
            error!(url = %url, error = %e, "Couldn't do the request");
        })?;

        if resp.status() != StatusCode::OK {
            let err = Error::Network(format!("Download failed, bad response: {}", resp.status()));
            error!(url = %url, status = %resp.status(), "Download failed");
            return Err(err);
        }

        let decision = resp
            .extensions()
            .get::<TlsInfo>()
            .and_then(TlsInfo::peer_certificate)
            .map_or(Authorization::Unauthenticated, |leaf| {
                verifier.authorize_leaf(leaf)
            });
        if let Err(e) = decision.into_result() {
            // The response body is dropped unread.
            warn!(url = %url, error = %e, "Update server failed allowed-name check");
            return Err(e);
        }

        info!(url = %url, "Download authorized. Installing...");
        let package = resp.bytes_stream().map_err(io::Error::other).boxed();
        self.installer.install(package).await?;

        info!(url = %url, "Download succeeded");
        Ok(())
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        let tls_config =
            tls::build_client_config(&self.config.cert_file, &self.config.key_file, &self.config.ca_cert_pem)?;

        reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .tls_info(true)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Server role
    // ─────────────────────────────────────────────────────────────────────

    /// Listen on `port` on all interfaces. See [`listen_on`](Self::listen_on).
    ///
    /// Binds the dual-stack `[::]` wildcard, falling back to `0.0.0.0` on
    /// hosts without IPv6.
    pub async fn listen(&mut self, port: u16) -> Result<SocketAddr> {
        self.start(&[
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        ])
        .await
    }

    /// Bind `addr` and start serving `POST /self-update` in the background.
    ///
    /// Returns the bound address as soon as the listener is up; it does
    /// not wait for any client. All configuration is validated before the
    /// socket is bound, and on any error the state is left unchanged.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for empty/invalid allowed names, bad CA PEM,
    ///   unreadable or mismatched key pair, or when already listening
    /// - [`Error::Io`] when the address cannot be bound (e.g. port in use)
    pub async fn listen_on(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        self.start(&[addr]).await
    }

    /// Validate, then bind the first of `addrs` that succeeds.
    async fn start(&mut self, addrs: &[SocketAddr]) -> Result<SocketAddr> {
        if self.state == ServerState::Listening {
            return Err(Error::Config("Already listening".to_string()));
        }

        let verifier = CertificateVerifier::from_allowed_names(&self.config.allowed_names)?;
        let tls_config = tls::build_server_config(
            &self.config.cert_file,
            &self.config.key_file,
            &self.config.ca_cert_pem,
        )?;
        let app = handler::router(Arc::clone(&self.installer), Arc::new(verifier));

        let listener = TcpListener::bind(addrs).await?;
        let local_addr = listener.local_addr()?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let stop = CancellationToken::new();

        self.serving.spawn({
            let stop = stop.clone();
            async move {
                match server::serve(listener, acceptor, app, stop).await {
                    ServeExit::Stopped => debug!(addr = %local_addr, "Listener stopped"),
                    ServeExit::Failed(e) => {
                        error!(addr = %local_addr, error = %e, "Listener terminated unexpectedly");
                    }
                }
            }
        });

        self.active = Some(ActiveListener { local_addr, stop });
        self.state = ServerState::Listening;
        info!(addr = %local_addr, "Listening for self-update requests (mTLS)");

        Ok(local_addr)
    }

    /// Close the listener. A no-op unless currently listening.
    ///
    /// Returns without waiting for the serving task; use
    /// [`wait_for_server_to_exit`](Self::wait_for_server_to_exit) for that.
    pub fn stop_listening(&mut self) {
        if self.state != ServerState::Listening {
            return;
        }

        self.state = ServerState::Closing;
        if let Some(active) = self.active.take() {
            active.stop.cancel();
            info!(addr = %active.local_addr, "Stopped listening");
        }
        self.state = ServerState::Stopped;
    }

    /// Wait until the serving task has fully returned.
    ///
    /// Returns immediately if `listen` was never called.
    pub async fn wait_for_server_to_exit(&self) {
        self.serving.wait().await;
    }

    /// Waiter usable from another task while this bootstrapper is
    /// borrowed mutably elsewhere.
    #[must_use]
    pub fn server_exit(&self) -> ServerExit {
        ServerExit(self.serving.clone())
    }
}

impl Drop for Bootstrapper {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::installer::{InstallError, PackageStream};

    struct NeverInstaller;

    #[async_trait]
    impl PackageInstaller for NeverInstaller {
        async fn install(&self, _package: PackageStream) -> std::result::Result<(), InstallError> {
            Err(InstallError::Failed("should not be called".to_string()))
        }
    }

    fn bootstrapper(config: BootstrapperConfig) -> Bootstrapper {
        Bootstrapper::new(config, Arc::new(NeverInstaller))
    }

    #[tokio::test]
    async fn new_bootstrapper_is_not_started() {
        let b = bootstrapper(BootstrapperConfig::default());
        assert_eq!(b.state(), ServerState::NotStarted);
        assert!(b.local_addr().is_none());
    }

    #[tokio::test]
    async fn listen_without_allowed_names_is_config_error() {
        let mut b = bootstrapper(BootstrapperConfig::default());
        let err = b.listen(0).await.unwrap_err();
        assert!(err.is_config());
        assert_eq!(b.state(), ServerState::NotStarted);
    }

    #[tokio::test]
    async fn download_without_allowed_names_is_config_error() {
        let b = bootstrapper(BootstrapperConfig::default());
        // Port 9 on localhost: nothing should ever be dialled.
        let err = b.download("https://127.0.0.1:9/pkg").await.unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn invalid_allowed_name_fails_listen() {
        let mut b = bootstrapper(BootstrapperConfig {
            allowed_names: vec!["not a dn".to_string()],
            ..BootstrapperConfig::default()
        });
        assert!(b.listen(0).await.unwrap_err().is_config());
    }

    #[tokio::test]
    async fn bad_ca_pem_fails_both_directions() {
        let config = BootstrapperConfig {
            allowed_names: vec!["CN=ops-controller".to_string()],
            ca_cert_pem: "Huh? not PEM".to_string(),
            ..BootstrapperConfig::default()
        };
        let mut b = bootstrapper(config);

        assert!(b.listen(0).await.unwrap_err().is_config());
        assert_eq!(b.state(), ServerState::NotStarted);
        assert!(b.download("https://127.0.0.1:9/pkg").await.unwrap_err().is_config());
    }

    #[tokio::test]
    async fn stop_listening_without_listen_is_noop() {
        let mut b = bootstrapper(BootstrapperConfig::default());
        b.stop_listening();
        b.stop_listening();
        assert_eq!(b.state(), ServerState::NotStarted);
    }

    #[tokio::test]
    async fn wait_without_listen_returns_immediately() {
        let b = bootstrapper(BootstrapperConfig::default());
        tokio::time::timeout(Duration::from_secs(1), b.wait_for_server_to_exit())
            .await
            .expect("wait blocked although nothing was started");
        tokio::time::timeout(Duration::from_secs(1), b.server_exit().wait())
            .await
            .expect("waiter blocked although nothing was started");
    }
}
