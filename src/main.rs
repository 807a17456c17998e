//! Gateway entry point: logging, metrics exporter, configuration, serve.

use anyhow::Context;
use tracing::info;

use chat_gateway::observability::logging::init_logging;
use chat_gateway::{GatewayConfig, GatewayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install()
        .context("failed to install prometheus exporter")?;

    info!("Starting chat gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::var("GATEWAY_CONFIG_PATH") {
        Ok(path) => GatewayConfig::load_from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        Err(_) => {
            info!("GATEWAY_CONFIG_PATH not set, using default configuration");
            GatewayConfig::default()
        }
    };

    let server = GatewayServer::from_config(config)
        .await
        .context("gateway startup failed")?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    server.run().await.context("gateway server error")?;
    Ok(())
}
