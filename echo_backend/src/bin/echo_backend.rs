use anyhow::{Context, Result};
use echo_backend::config::EchoConfig;
use echo_backend::runtime::BackendRuntime;
use echo_backend::server::serve_backend;
use flume::unbounded;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,echo_backend=debug")),
        )
        .init();

    let config = EchoConfig::load();
    let (event_tx, event_rx) = unbounded();

    tracing::info!(
        "Starting Echo backend (set ECHO_BACKEND_TOKEN + optional ECHO_BACKEND_BIND; auth mode via ECHO_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let runtime = BackendRuntime::bootstrap(config, event_tx)
            .context("failed to bootstrap backend runtime")?;
        serve_backend(runtime, event_rx).await
    })
}
