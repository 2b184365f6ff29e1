//! Streamgate server binary.
//!
//! Loads configuration, connects the shared store, wires the component
//! graph, spawns the failover queue worker, and serves the API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use streamgate_core::breaker::CircuitBreakerRegistry;
use streamgate_core::config::Config;
use streamgate_core::providers::ProviderRegistry;
use streamgate_core::queue::QueueWorker;
use streamgate_core::store::{RedisStore, SharedStore};
use streamgate_server::state::AppState;

/// Streamgate gateway — streams LLM tokens over SSE.
#[derive(Parser)]
#[command(name = "streamgate-server", version, about)]
struct Cli {
    /// Port to listen on. Overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Host address to bind to. Overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Path to the gateway configuration file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (respects RUST_LOG env var).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            tracing::error!("config: {error}");
        }
        anyhow::bail!("configuration invalid ({} problems)", errors.len());
    }

    let bind_host = cli.host.unwrap_or_else(|| config.server.host.clone());
    let bind_port = cli.port.unwrap_or(config.server.port);

    tracing::info!(
        store = %config.store.url,
        host = %bind_host,
        port = bind_port,
        environment = ?config.server.environment,
        providers = config.providers.len(),
        "starting streamgate server"
    );

    let store: Arc<dyn SharedStore> = Arc::new(
        RedisStore::connect(
            &config.store.url,
            Duration::from_millis(config.store.operation_timeout_ms),
        )
        .await
        .context("connecting to the shared store")?,
    );

    let breakers = Arc::new(CircuitBreakerRegistry::new(
        store.clone(),
        config.breaker.clone(),
    ));
    let registry = ProviderRegistry::from_config(&config.providers, breakers);

    let state = AppState::new(config, store.clone(), registry);

    // Failover worker: serves jobs queued by any instance in the fleet.
    let shutdown = CancellationToken::new();
    let worker_handle = if state.config.queue.failover_enabled {
        let worker = QueueWorker::new(
            store,
            state.pipeline.clone(),
            state.pool.clone(),
            state.config.queue.clone(),
        );
        let token = shutdown.clone();
        Some(tokio::spawn(async move { worker.run(token).await }))
    } else {
        tracing::info!("queue failover disabled; worker not started");
        None
    };

    let router = streamgate_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{bind_host}:{bind_port}"))
        .await
        .context("binding listener")?;
    tracing::info!("listening on http://{bind_host}:{bind_port}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Let the worker drain its current job before exiting.
    shutdown.cancel();
    if let Some(handle) = worker_handle {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    Ok(())
}
