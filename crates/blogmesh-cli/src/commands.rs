use anyhow::Context;
use blogmesh_server::RelayNode;
use blogmesh_store::DataDir;
use colored::Colorize;
use tracing::{info, warn};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Identity(args) => cmd_identity(args),
    }
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.into_config()?;
    let data_dir = config.data_dir.clone();
    let relay = RelayNode::start(config)
        .await
        .with_context(|| format!("failed to start relay (data dir {})", data_dir.display()))?;

    println!(
        "{} Relay {} listening on {}",
        "✓".green().bold(),
        relay.peer_id().to_hex().cyan(),
        relay.tcp_addr().to_string().bold()
    );
    match relay.metrics_addr() {
        Some(addr) => println!("  Metrics: http://{addr}/metrics"),
        None => println!("  Metrics: {}", "disabled".yellow()),
    }

    relay.run_until(shutdown_signal()).await?;
    println!("{} Relay stopped.", "✓".green());
    Ok(())
}

fn cmd_identity(args: IdentityArgs) -> anyhow::Result<()> {
    let dir = DataDir::open(&args.data_dir)
        .with_context(|| format!("cannot use data dir {}", args.data_dir.display()))?;
    let identity = dir.load_or_create_identity()?;
    println!("{}", identity.peer_id().to_hex());
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
