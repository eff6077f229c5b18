use clap::Parser;
use homescript::config::Config;
use homescript::start_server_with_config;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "homescript-server")]
#[command(version, about = "HomeScript automation server", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./homescript.toml when present)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("{},hyper=warn,reqwest=warn", config.logging.level))
        });
    if config.logging.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_filter(filter))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().compact().with_target(false).with_filter(filter))
            .init();
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let port = start_server_with_config(config, shutdown_rx).await?;
    info!(port, "HomeScript server started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping server...");
    let _ = shutdown_tx.send(());
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("server stopped");
    Ok(())
}
