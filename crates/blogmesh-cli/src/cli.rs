use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use blogmesh_server::RelayConfig;
use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "blogmesh-relay",
    about = "blogmesh relay: keeps blogs reachable while their publishers are offline",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the relay until SIGINT or SIGTERM
    Run(RunArgs),
    /// Print the relay's peer id, creating it on first use
    Identity(IdentityArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// TOML configuration file. Flags and environment override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "BLOGMESH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Peer transport port (0 = ephemeral).
    #[arg(long, env = "BLOGMESH_TCP_PORT")]
    pub tcp_port: Option<u16>,

    /// Metrics HTTP port (0 disables).
    #[arg(long, env = "BLOGMESH_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Peer to dial at startup; repeat or comma-separate for several.
    #[arg(long = "bootstrap", env = "BLOGMESH_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Write the final metrics to this file on shutdown.
    #[arg(long)]
    pub metrics_dump: Option<PathBuf>,
}

impl RunArgs {
    /// Defaults, then the config file, then environment and flags.
    pub fn into_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => RelayConfig::default(),
        };
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(port) = self.tcp_port {
            config.tcp_port = port;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if !self.bootstrap.is_empty() {
            config.bootstrap = self.bootstrap;
        }
        if let Some(path) = self.metrics_dump {
            config.metrics_dump_path = Some(path);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args)]
pub struct IdentityArgs {
    #[arg(long, env = "BLOGMESH_DATA_DIR", default_value = "blogmesh-data")]
    pub data_dir: PathBuf,
}
