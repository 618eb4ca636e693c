//! Allowed-name authorization layered on top of mutual TLS.
//!
//! # Architecture
//!
//! ```text
//! TCP connection
//!   → TLS handshake   (rustls verifies the client chain against the CA pool)
//!   → PeerCertificates attached to each request
//!   → authorize_peer  (leaf subject checked against the allowed names)
//!   → self-update handler
//! ```
//!
//! The download path reuses [`CertificateVerifier`] on the update server's
//! leaf certificate before any downloaded byte reaches the installer.
//!
//! # Modules
//!
//! - [`dn`] — distinguished name parsing and wildcard-field matching
//! - [`verifier`] — chain authorization (`CertificateVerifier`, `Authorization`)
//! - [`middleware`] — axum middleware applying the verifier per request

pub mod dn;
pub mod middleware;
pub mod verifier;

pub use dn::{DistinguishedName, DnParseError};
pub use middleware::{PeerCertificates, authorize_peer, require_allowed_peer};
pub use verifier::{Authorization, CertificateVerifier};
