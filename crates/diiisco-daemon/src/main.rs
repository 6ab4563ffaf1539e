//! diiisco daemon: wires the collaborators, node, and HTTP façade,
//! then runs until Ctrl-C.
//!
//! Graceful shutdown order: stop accepting HTTP, cancel node timers
//! and unsubscribe (inside the event loop), stop the peer network.

mod config;

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use diiisco_ledger::{InMemoryLedger, LedgerClient};
use diiisco_model::{ModelClient, OpenAiModelClient};
use diiisco_node::Node;

use crate::config::{default_data_dir, resolve_config, CliArgs};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(%e, "daemon failed");
        std::process::exit(1);
    }
}

async fn run() -> diiisco_types::Result<()> {
    let cli = CliArgs::parse_from_env();
    let app_config = resolve_config(&cli)?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir).map_err(|e| diiisco_types::DiiiscoError::ConfigError {
        reason: format!("failed to create data dir {}: {e}", data_dir.display()),
    })?;
    let identity_path = data_dir.join("identity.key");

    // Collaborators. The in-memory ledger carries full escrow
    // semantics; deployments against a live chain plug an SDK-backed
    // `LedgerClient` in here.
    let ledger: Arc<dyn LedgerClient> = Arc::new(InMemoryLedger::new());
    let model: Arc<dyn ModelClient> = Arc::new(OpenAiModelClient::new(
        app_config.model_runtime_url(),
        app_config.models.api_key.clone(),
    ));

    let api_config = app_config.api.clone();
    let mut node = Node::new(app_config, &identity_path, ledger, model).await?;
    let handle = node.handle();
    let node_join = node.start()?;
    tracing::info!(peer_id = %handle.own_peer_id(), "node started");

    // HTTP façade, stopped first on shutdown.
    let (api_shutdown_tx, api_shutdown_rx) = watch::channel(false);
    let api_join = if api_config.enabled {
        let api_handle = handle.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = diiisco_api::serve(api_handle, api_config, api_shutdown_rx).await {
                tracing::error!(%e, "API facade exited with error");
            }
        }))
    } else {
        None
    };

    // Run until Ctrl-C.
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("interrupt received, shutting down"),
        Err(e) => tracing::error!(%e, "failed to listen for interrupt"),
    }

    // 1. Stop accepting HTTP.
    let _ = api_shutdown_tx.send(true);
    if let Some(join) = api_join {
        let _ = join.await;
    }

    // 2.-4. Timers, topics, and the swarm stop inside the event loop.
    node.shutdown()?;
    node_join.await.map_err(|e| diiisco_types::DiiiscoError::NetworkError {
        reason: format!("event loop panicked: {e}"),
    })?;

    tracing::info!("shutdown complete");
    Ok(())
}
