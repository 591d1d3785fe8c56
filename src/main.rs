use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use uwsgi_proxy::config::Config;
use uwsgi_proxy::module::{Registry, MODULE_ID};
use uwsgi_proxy::proxy::ProxyServer;
use uwsgi_proxy::transport::UwsgiTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("uwsgi_proxy=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let mut registry = Registry::new();
    registry.register(UwsgiTransport::module_info())?;
    let module = registry
        .get(MODULE_ID)
        .ok_or_else(|| anyhow::anyhow!("Transport module {} not registered", MODULE_ID))?;
    (module.validate)(&config.transport).map_err(|e| anyhow::anyhow!("Invalid transport: {}", e))?;

    info!(
        module = module.id,
        upstream = %config.upstream.address,
        network = %config.upstream.network,
        params = config.transport.params().len(),
        request_timeout_secs = config.server.request_timeout_secs,
        "uwsgi transport configured"
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = ProxyServer::new(
        bind_addr,
        Arc::new(config.transport.clone()),
        config.upstream.dial_info(),
        shutdown_rx,
    )
    .with_request_timeout(config.server.request_timeout());

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}
