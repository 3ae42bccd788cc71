//! # CLI Interface
//!
//! `clap` derive definitions for `tessera-daemon`. Global flags apply to
//! every subcommand and override the config file.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::Overrides;
use crate::logging::LogFormat;

/// Tessera wallet daemon.
///
/// Keeps one wallet's token set synchronized with remote storage nodes
/// and reports its health over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "tessera-daemon",
    about = "Tessera wallet daemon",
    version,
    propagate_version = true
)]
pub struct TesseraCli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Configuration file (TOML). Defaults to `config.toml` in the data
    /// directory, if present.
    #[arg(long, short = 'c', env = "TESSERA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the wallet key and database.
    #[arg(long, short = 'd', env = "TESSERA_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "TESSERA_LOG_FORMAT", value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Add an in-process storage node. Data is lost on exit.
    #[arg(long, env = "TESSERA_DEVNET", global = true)]
    pub devnet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data directory, a wallet key and a default config file.
    Init(InitArgs),
    /// Print tokens, breaker state and pending operations.
    Status(StatusArgs),
    /// Run one sync against the configured storage nodes and exit.
    Sync,
    /// Sync periodically and serve the status API until interrupted.
    Serve(ServeArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Replace an existing wallet key. The old key is unrecoverable.
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Ask a running daemon instead of opening the wallet database.
    #[arg(long)]
    pub api_url: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address for the status API.
    #[arg(long, env = "TESSERA_API_ADDR")]
    pub api_addr: Option<SocketAddr>,
}

impl TesseraCli {
    pub fn overrides(&self) -> Overrides {
        let api_addr = match &self.command {
            Commands::Serve(args) => args.api_addr,
            _ => None,
        };
        Overrides {
            config: self.global.config.clone(),
            data_dir: self.global.data_dir.clone(),
            log_format: self.global.log_format,
            api_addr,
            devnet: self.global.devnet,
        }
    }
}
