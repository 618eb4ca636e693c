//! Node bootstrapper - mTLS self-update agent
//!
//! `listen` serves the self-update endpoint until Ctrl+C/SIGTERM;
//! `download` pulls and installs one package.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use node_bootstrapper::{
    Bootstrapper,
    cli::{Cli, Command},
    config::Config,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Listen { port } => run_listen(&config, port).await,
        Command::Download { url } => run_download(&config, url).await,
    }
}

fn build_bootstrapper(config: &Config) -> node_bootstrapper::Result<Bootstrapper> {
    let installer = config.installer.build()?;
    Ok(Bootstrapper::new(
        config.bootstrapper_config()?,
        Arc::new(installer),
    ))
}

/// Serve until a shutdown signal arrives.
async fn run_listen(config: &Config, port: Option<u16>) -> ExitCode {
    let mut bootstrapper = match build_bootstrapper(config) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let port = port.unwrap_or(config.listen_port);
    if let Err(e) = bootstrapper.listen(port).await {
        error!(port, error = %e, "Failed to start listener");
        return ExitCode::FAILURE;
    }

    let exit = bootstrapper.server_exit();
    tokio::select! {
        () = shutdown_signal() => {}
        () = exit.wait() => {
            error!("Listener exited on its own");
            return ExitCode::FAILURE;
        }
    }

    bootstrapper.stop_listening();
    bootstrapper.wait_for_server_to_exit().await;
    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Download and install one package.
async fn run_download(config: &Config, url: Option<String>) -> ExitCode {
    let Some(url) = url.or_else(|| config.update_url.clone()) else {
        error!("No URL given and update_url is not configured");
        return ExitCode::FAILURE;
    };

    let bootstrapper = match build_bootstrapper(config) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match bootstrapper.download(&url).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(url = %url, error = %e, "Download failed");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
