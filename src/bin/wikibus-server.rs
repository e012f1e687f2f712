//! Main entry point for the wikibus server.
//!
//! Deploys one persistence worker and the front-tier pool with configuration
//! from environment variables; command-line flags override the environment.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wikibus::{Bus, Config, Deployment};

#[derive(Debug, Parser)]
#[command(name = "wikibus-server", about = "Bus-connected wiki service")]
struct Args {
    /// Shared listening port (overrides WIKI_HTTP_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Front-tier replica count (overrides WIKI_HTTP_INSTANCES)
    #[arg(long)]
    instances: Option<usize>,

    /// SQLite URL (overrides WIKI_DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// Query catalog file (overrides WIKI_QUERIES_FILE)
    #[arg(long)]
    queries_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(instances) = args.instances {
        config.http_instances = instances.max(1);
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    if let Some(queries_file) = args.queries_file {
        config.queries_file = Some(queries_file);
    }
    info!(?config, "loaded configuration");

    let bus = Bus::new();
    let deployment = Deployment::start(&config, &bus).await?;
    info!(addr = %deployment.addr(), "wikibus started, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    deployment.shutdown().await;

    Ok(())
}
