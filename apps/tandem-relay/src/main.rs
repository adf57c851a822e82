use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tandem_relay::{
    cli::{self, Cli, Commands},
    config::RelayConfig,
    rooms::RoomRegistry,
};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    // Quiet by default; RUST_LOG opts in.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Some(Commands::Probe { url, room, seconds }) = &cli.command {
        if let Err(e) = cli::run_probe(url, room, *seconds).await {
            error!("probe failed: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    if let Err(e) = run_server(&cli).await {
        error!("relay failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.apply(RelayConfig::from_env());
    info!(
        "starting tandem relay on {} (heartbeat timeout {:?})",
        config.bind_addr(),
        config.heartbeat_timeout
    );

    let registry = RoomRegistry::new(config.heartbeat_timeout);
    tokio::spawn(registry.clone().run_heartbeat_monitor());

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    info!("tandem relay listening on {}", config.bind_addr());

    tandem_relay::serve(listener, registry)
        .await
        .context("serving relay")
}
