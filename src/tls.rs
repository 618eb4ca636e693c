//! Certificate loading and rustls config building.
//!
//! Provides:
//! - [`load_certs`] / [`load_private_key`] — PEM file loading
//! - [`parse_ca_pem`] — CA pool from inline PEM text
//! - [`build_server_config`] — `rustls::ServerConfig` requiring client certs
//! - [`build_client_config`] — `rustls::ClientConfig` presenting this node's cert
//!
//! # File format
//!
//! All certificate and key material is expected in **PEM format**.
//!
//! # Protocol versions
//!
//! Both directions speak TLS 1.3 only, with the aws-lc-rs provider passed
//! explicitly so no process-wide default provider has to be installed.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::{Error, Result};

/// ALPN protocol offered by the self-update listener.
const ALPN_HTTP11: &[u8] = b"http/1.1";

// ─────────────────────────────────────────────────────────────────────────────
// Public: build TLS configs
// ─────────────────────────────────────────────────────────────────────────────

/// Build the listener's `rustls::ServerConfig`.
///
/// Clients without a certificate chaining to `ca_pem` are rejected during
/// the handshake. This is the transport-level layer; the allowed-name check
/// happens per request in [`crate::auth::middleware`].
///
/// # Errors
///
/// [`Error::Config`] if the CA PEM is malformed, the cert/key files cannot
/// be read, or the key does not match the certificate.
pub fn build_server_config(cert_file: &Path, key_file: &Path, ca_pem: &str) -> Result<ServerConfig> {
    let roots = parse_ca_pem(ca_pem)?;
    let server_certs = load_certs(cert_file)?;
    let server_key = load_private_key(key_file)?;

    let provider = provider();
    let client_verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| Error::Config(format!("Failed to build client verifier: {e}")))?;

    let mut tls_cfg = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("Unsupported TLS protocol versions: {e}")))?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(server_certs, server_key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    tls_cfg.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

    debug!(cert_file = %cert_file.display(), "mTLS server config built");
    Ok(tls_cfg)
}

/// Build the download client's `rustls::ClientConfig`.
///
/// Only `ca_pem` is trusted (no system roots) and the node's own
/// certificate is offered for client authentication.
///
/// # Errors
///
/// [`Error::Config`] under the same conditions as [`build_server_config`].
pub fn build_client_config(cert_file: &Path, key_file: &Path, ca_pem: &str) -> Result<ClientConfig> {
    let roots = parse_ca_pem(ca_pem)?;
    let client_certs = load_certs(cert_file)?;
    let client_key = load_private_key(key_file)?;

    let tls_cfg = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("Unsupported TLS protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_client_auth_cert(client_certs, client_key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    debug!(cert_file = %cert_file.display(), "mTLS client config built");
    Ok(tls_cfg)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Build a trust store from inline CA PEM text.
///
/// # Errors
///
/// [`Error::Config`] if the text holds no certificate block, a block fails
/// to decode, or a certificate is refused by the store.
pub fn parse_ca_pem(ca_pem: &str) -> Result<RootCertStore> {
    let certs = parse_certs(ca_pem.as_bytes())
        .map_err(|e| Error::Config(format!("Failed to load CA cert: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Config(
            "Failed to load CA cert: no PEM certificate found".to_string(),
        ));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("Failed to add CA cert to trust store: {e}")))?;
    }
    Ok(roots)
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs = parse_certs(&pem_data).map_err(|e| {
        Error::Config(format!("Failed to parse certs from '{}': {e}", path.display()))
    })?;

    if certs.is_empty() {
        return Err(Error::Config(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains no private key, or
/// the key format is unsupported.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    let key = rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| {
            Error::Config(format!(
                "Failed to parse private key from '{}': {e}",
                path.display()
            ))
        })?
        .ok_or_else(|| Error::Config(format!("No private key found in '{}'", path.display())))?;

    Ok(key)
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn parse_certs(mut pem: &[u8]) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem).collect()
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
