//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Mutually-authenticated self-update agent
#[derive(Parser, Debug)]
#[command(name = "node-bootstrapper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "NODE_BOOTSTRAPPER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "NODE_BOOTSTRAPPER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "NODE_BOOTSTRAPPER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve `POST /self-update` until interrupted
    Listen {
        /// Port to listen on (overrides `listen_port`)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Download and install a package once
    Download {
        /// Package URL (overrides `update_url`)
        url: Option<String>,
    },
}
