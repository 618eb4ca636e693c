//! Node Bootstrapper Library
//!
//! The trust boundary of a fleet-managed node agent: a mutually
//! authenticated HTTPS subsystem that
//!
//! - serves `POST /self-update` so an allowed orchestrator can push a package, and
//! - downloads a package from an allowed distribution server.
//!
//! In both directions the peer must present a certificate chained to the
//! configured CA **and** whose subject matches an operator-supplied
//! distinguished name. Package bytes are handed to a [`PackageInstaller`]
//! only after both checks pass.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod bootstrapper;
pub mod cli;
pub mod config;
pub mod error;
pub mod handler;
pub mod installer;
pub mod server;
pub mod tls;

pub use bootstrapper::{Bootstrapper, BootstrapperConfig, ServerExit, ServerState};
pub use error::{Error, Result};
pub use installer::{CommandInstaller, InstallError, PackageInstaller, PackageStream};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
