//! Self-update endpoint and route table.

use std::io;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::StatusCode,
    routing::post,
};
use futures::{StreamExt, TryStreamExt};
use tracing::{error, info, warn};

use crate::auth::{CertificateVerifier, require_allowed_peer};
use crate::installer::{InstallError, PackageInstaller};

/// Path of the self-update endpoint.
pub const SELF_UPDATE_PATH: &str = "/self-update";

/// Routes served by the bootstrapper listener.
///
/// Only `POST /self-update`, wrapped by the allowed-name middleware.
pub fn router(installer: Arc<dyn PackageInstaller>, verifier: Arc<CertificateVerifier>) -> Router {
    let routes = Router::new()
        .route(SELF_UPDATE_PATH, post(self_update))
        .with_state(installer);
    require_allowed_peer(routes, verifier)
}

/// Stream the request body into the installer.
///
/// Exactly one status per request: 200 installed, 422 payload rejected,
/// 500 any other installer failure.
pub async fn self_update(
    State(installer): State<Arc<dyn PackageInstaller>>,
    body: Body,
) -> StatusCode {
    let package = body.into_data_stream().map_err(io::Error::other).boxed();

    match installer.install(package).await {
        Ok(()) => {
            info!("Self-update package installed");
            StatusCode::OK
        }
        Err(e) => status_for(&e),
    }
}

fn status_for(err: &InstallError) -> StatusCode {
    match err {
        InstallError::MalformedPayload(_) => {
            warn!(error = %err, "Self-update package rejected");
            StatusCode::UNPROCESSABLE_ENTITY
        }
        InstallError::Failed(_) => {
            error!(error = %err, "Self-update install failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
