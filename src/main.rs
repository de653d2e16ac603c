//! Process bootstrap for the Palisade firewall RPC.

use anyhow::{Context, Result};
use palisade_rpc::classifier::HttpClassifier;
use palisade_rpc::config::Config;
use palisade_rpc::history::InMemoryHistory;
use palisade_rpc::oracle::RpcOracle;
use palisade_rpc::rpc;
use palisade_rpc::scan::{ScanContext, ScanStats};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("palisade_rpc=info,info")),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    info!(
        host = %config.host,
        port = config.port,
        chains = config.chains.len(),
        deep_scan = config.deep_scan,
        "starting palisade firewall"
    );

    let ctx = Arc::new(ScanContext {
        oracle: Arc::new(RpcOracle::from_config(&config)),
        classifier: Arc::new(HttpClassifier::from_config(&config)),
        history: Arc::new(InMemoryHistory::new()),
        stats: ScanStats::default(),
        config: config.clone(),
    });

    let router = rpc::build_router(ctx);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await.context("server crashed")?;
    Ok(())
}
