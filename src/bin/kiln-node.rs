//! Main entry point for a kiln node.
//!
//! Starts one engine for this node with configuration from command-line
//! flags and environment variables. Payloads are registered by linking
//! their crates into a node binary like this one and adding them to the
//! registry before the engine starts.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln::{Config, Engine, MemoryStore, PayloadRegistry, PostgresStore, Store};

#[derive(Parser, Debug)]
#[command(name = "kiln-node", about = "Batch-job scheduler node")]
struct Args {
    /// Node name; overrides KILN_NODE_NAME.
    #[arg(long)]
    node_name: Option<String>,
    /// Postgres connection string; overrides KILN_DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env();
    let args = Args::parse();
    if let Some(node_name) = args.node_name {
        config.node_name = node_name;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = Some(database_url);
    }

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url).await?;
            info!("connected to database");
            Arc::new(store)
        }
        None => {
            warn!("no database configured, using the embedded in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = PayloadRegistry::new();

    let engine = Engine::start(store, registry, &config.node_name).await?;
    info!(node = %engine.node().name, "kiln node started, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    engine.shutdown().await?;

    Ok(())
}
