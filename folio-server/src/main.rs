//! Folio server: hosts collaborative notebooks over WebSocket.
//!
//! Seeds the in-memory demo dataset, opens the session engine (recovering
//! any persisted notebooks) and serves until interrupted.

mod cli;

use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use cli::Cli;
use folio_collab::engine::SessionEngine;
use folio_collab::sandbox::MemoryDataset;
use folio_collab::server::NotebookServer;

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let config = cli.engine_config();

    let engine = match SessionEngine::open(config, Arc::new(MemoryDataset::demo())).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Could not open the session engine: {e}");
            std::process::exit(1);
        }
    };
    match &cli.data_dir {
        Some(dir) => info!("Persisting notebooks under {}", dir.display()),
        None => info!("No data directory; notebooks are kept in memory"),
    }

    let server = NotebookServer::new(engine.clone());
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    engine.shutdown().await;
    let stats = server.stats().await;
    info!(
        "Served {} connections, {} messages",
        stats.total_connections, stats.total_messages
    );
}
