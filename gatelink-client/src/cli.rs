use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "gatelink-client",
    version,
    about = "Publish a local game server through a gatelink relay"
)]
pub struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the proxy and run until interrupted
    Run,

    /// Ask the relay whether an access key is valid
    ValidateKey {
        /// Key to check instead of the configured one
        #[arg(long)]
        key: Option<String>,
    },

    /// Create a starter config file to fill in
    InitConfig {
        /// Replace the file if it already exists
        #[arg(long)]
        force: bool,
    },

    /// Show where the config file lives
    ConfigPath,
}
