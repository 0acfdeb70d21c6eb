mod config;
mod netio;
mod telemetry;
mod tls;

use anyhow::Context;
use std::net::SocketAddr;
use tokio::signal;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;

    let bind_addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| "invalid bind address")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    runtime.block_on(async move {
        let metrics_handle = telemetry::init_telemetry(&config.telemetry)
            .context("failed to initialize telemetry")?;

        info!(?config, "configuration loaded");

        let netio_handle =
            netio::spawn(bind_addr, &config).context("failed to spawn network layer")?;

        info!(
            %bind_addr,
            workers = netio_handle.worker_count(),
            "QUIC endpoint started"
        );

        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;

        info!("shutdown signal received");

        netio_handle.shutdown().await;
        metrics_handle.shutdown().await;

        Ok::<(), anyhow::Error>(())
    })
}
