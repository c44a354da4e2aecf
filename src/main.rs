//! `a2pctm`: the a2pc transaction manager

use a2pc::{Config, Service};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "a2pctm", version, about = "a2pc transaction manager")]
struct Args {
    /// Configuration file
    #[arg(long, short, default_value = "a2pc.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Overrides `[id] worker_id`
    #[arg(long)]
    worker_id: Option<u8>,
}

#[tokio::main]
async fn main() -> a2pc::Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(&args.config)?;
    if let Some(worker_id) = args.worker_id {
        config.id.worker_id = worker_id;
    }
    let addr = config.listen_addr()?;

    let service = Service::build(config).await?;
    let listener = TcpListener::bind(addr).await?;
    let result = service.run(listener, shutdown_signal()).await;
    if let Err(err) = &result {
        tracing::error!("a2pctm failed: {}", err);
    }
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
