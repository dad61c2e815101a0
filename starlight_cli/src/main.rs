//! Operator daemon for Starlight payment channels.
//!
//! Opens the agent database, starts the agent and serves the peer HTTP surface
//! (message endpoint, federation lookup, well-known descriptor).

use anyhow::Context;
use clap::{Parser, Subcommand};
use libstarlight::agent::Agent;
use libstarlight::ledger::horizon::HorizonClient;
use libstarlight::peer;
use libstarlight::store::{Store, StoreError};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Starlight payment channels on the Stellar testnet.
#[derive(Parser, Debug)]
#[command(version, about)]
struct CliOptions {
    /// Path to the agent database.
    #[arg(long = "db", short = 'd', default_value = "starlight.db")]
    db: PathBuf,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the agent and serve the peer endpoints.
    #[command(name = "serve", alias = "start")]
    Serve {
        /// Address to listen on for peer requests.
        #[arg(long, default_value = "127.0.0.1:7167")]
        listen: SocketAddr,
        /// Horizon endpoint used until the agent is configured.
        #[arg(long, default_value = "https://horizon-testnet.stellar.org")]
        horizon: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let options = CliOptions::parse();
    match options.command {
        CliCommand::Serve { listen, horizon } => serve(options.db, listen, horizon).await,
    }
}

async fn serve(db: PathBuf, listen: SocketAddr, default_horizon: String) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&db).with_context(|| format!("opening database {}", db.display()))?);
    // A configured agent keeps using its stored endpoint; the flag only seeds
    // the first run.
    let horizon_url = store
        .view::<_, StoreError>(|snap| Ok(snap.config()?.map(|c| c.horizon_url)))?
        .unwrap_or(default_horizon);
    let ledger = Arc::new(HorizonClient::new(horizon_url));
    let agent = Agent::new(store, ledger);
    agent.start()?;

    let listener = tokio::net::TcpListener::bind(listen).await.with_context(|| format!("binding {listen}"))?;
    info!("serving starlight endpoints on {listen}");
    axum::serve(listener, peer::router(agent.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    info!("shutting down");
    agent.shutdown();
    Ok(())
}
