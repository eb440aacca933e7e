//! Command-line overrides shared by every Tessera binary.

use std::path::PathBuf;

use clap::Args;

use crate::Config;

/// Flags that override values loaded from `config.ron`.
///
/// Flattened into each binary's own clap parser.
#[derive(Args, Debug, Default, Clone)]
pub struct CliArgs {
    /// Server address to connect to or bind on.
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Maximum concurrent client connections.
    #[arg(long, global = true)]
    pub max_connections: Option<usize>,

    /// Replication tick rate in Hz.
    #[arg(long, global = true)]
    pub tick_rate: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(max) = args.max_connections {
            self.network.max_connections = max;
        }
        if let Some(rate) = args.tick_rate {
            self.network.tick_rate_hz = rate;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
