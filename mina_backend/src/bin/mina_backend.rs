use anyhow::{Context, Result};
use flume::unbounded;
use mina_backend::config::AgentConfig;
use mina_backend::runtime::BackendRuntime;
use mina_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mina_backend=debug")),
        )
        .init();

    let config = AgentConfig::load();
    let (event_tx, event_rx) = unbounded();

    tracing::info!(
        "Starting Mina backend service (set MINA_BACKEND_TOKEN + optional MINA_BACKEND_BIND; auth mode via MINA_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let runtime = BackendRuntime::bootstrap(config, event_tx)
            .context("failed to bootstrap backend runtime")?;
        serve_backend(runtime, event_rx).await
    })
}
