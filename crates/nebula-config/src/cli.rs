//! Command-line argument parsing for the Nebula server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Nebula server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "nebula-server", about = "Nebula session server")]
pub struct CliArgs {
    /// Bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Listener port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent sessions.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.bind {
            self.network.bind_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(max) = args.max_connections {
            self.network.max_connections = max;
        }
        if let Some(ref level) = args.log_level {
            self.log.log_level = level.clone();
        }
    }
}
