//! Error types for the node bootstrapper

use std::io;

use thiserror::Error;

use crate::installer::InstallError;

/// Result type alias for the node bootstrapper
pub type Result<T> = std::result::Result<T, Error>;

/// Node bootstrapper errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (allowed names, CA PEM, key pair, bad URL).
    ///
    /// Always raised synchronously, before any network resource is touched.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (non-200 response)
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP client error (connect, handshake, transport)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer presented no certificate chain at all
    #[error("No verified peer certificate chain")]
    Unauthenticated,

    /// The peer's certificate subject is not in the allowed names
    #[error("Subject ({subject}) didn't match allowed distinguished names")]
    Unauthorized {
        /// Rejected certificate subject, for audit logging
        subject: String,
    },

    /// Installer failure, passed through unchanged
    #[error(transparent)]
    Install(#[from] InstallError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// `true` for configuration errors.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// `true` for transport-level failures the caller may retry.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_))
    }

    /// `true` when a peer failed the allowed-names check.
    #[must_use]
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_message_carries_subject() {
        let err = Error::Unauthorized {
            subject: "CN=attacker".to_string(),
        };
        assert!(err.to_string().contains("CN=attacker"));
        assert!(err.is_authorization());
        assert!(!err.is_config());
    }

    #[test]
    fn install_errors_pass_through_unchanged() {
        let err: Error = InstallError::MalformedPayload("bad tarball".to_string()).into();
        assert_eq!(err.to_string(), "Malformed package: bad tarball");
    }

    #[test]
    fn network_classification() {
        assert!(Error::Network("bad response: 404".to_string()).is_network());
        assert!(!Error::Config("x".to_string()).is_network());
    }
}
