//! Allowed-name authorization of peer certificate chains.
//!
//! TLS has already proven the chain is signed by the configured CA by the
//! time [`CertificateVerifier::authorize`] runs. This layer only answers
//! "is this peer one of the names the operator allowed?", and it is used
//! in both directions: inbound self-update callers and the remote download
//! server.

use rustls::pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use super::dn::DistinguishedName;
use crate::{Error, Result};

/// Outcome of checking a peer chain against the allowed names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// The leaf subject matched an allowed name.
    Authorized,
    /// No peer certificate was available to check.
    Unauthenticated,
    /// The leaf subject matched none of the allowed names.
    Rejected {
        /// Rejected subject, rendered for audit logs.
        subject: String,
    },
}

impl Authorization {
    /// `true` only for [`Authorization::Authorized`].
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized)
    }

    /// Convert into the crate error space.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthenticated`] or [`Error::Unauthorized`] for anything
    /// other than [`Authorization::Authorized`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Authorized => Ok(()),
            Self::Unauthenticated => Err(Error::Unauthenticated),
            Self::Rejected { subject } => Err(Error::Unauthorized { subject }),
        }
    }
}

/// Checks peer certificates against a fixed set of allowed names.
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    allowed_names: Vec<DistinguishedName>,
}

impl CertificateVerifier {
    /// Create a verifier over already-parsed allowed names.
    #[must_use]
    pub fn new(allowed_names: Vec<DistinguishedName>) -> Self {
        Self { allowed_names }
    }

    /// Parse operator-supplied DN strings into a verifier.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the list is empty or any entry fails to parse.
    pub fn from_allowed_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::Config("AllowedNames must be specified".to_string()));
        }

        let allowed_names = names
            .iter()
            .map(|name| {
                DistinguishedName::parse(name.as_ref()).map_err(|e| {
                    Error::Config(format!("Invalid allowed names: '{}': {e}", name.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(allowed_names))
    }

    /// The parsed allowed names.
    #[must_use]
    pub fn allowed_names(&self) -> &[DistinguishedName] {
        &self.allowed_names
    }

    /// Authorize a peer chain. Index 0 must be the leaf certificate.
    ///
    /// A leaf that cannot be parsed is rejected rather than skipped.
    #[must_use]
    pub fn authorize(&self, chain: &[CertificateDer<'_>]) -> Authorization {
        let Some(leaf) = chain.first() else {
            return Authorization::Unauthenticated;
        };
        self.authorize_leaf(leaf.as_ref())
    }

    /// Authorize a single DER-encoded leaf certificate.
    #[must_use]
    pub fn authorize_leaf(&self, der: &[u8]) -> Authorization {
        let subject = match X509Certificate::from_der(der) {
            Ok((_, cert)) => DistinguishedName::from_x509_name(cert.subject()),
            Err(e) => {
                return Authorization::Rejected {
                    subject: format!("<unparseable certificate: {e}>"),
                };
            }
        };

        if self.allowed_names.iter().any(|allowed| allowed.matches(&subject)) {
            Authorization::Authorized
        } else {
            Authorization::Rejected {
                subject: subject.to_string(),
            }
        }
    }

    /// [`authorize`](Self::authorize) mapped into a `Result`.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthenticated`] for an empty chain and
    /// [`Error::Unauthorized`] when no allowed name matches.
    pub fn verify(&self, chain: &[CertificateDer<'_>]) -> Result<()> {
        self.authorize(chain).into_result()
    }
}
