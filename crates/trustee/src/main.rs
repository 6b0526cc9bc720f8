mod server;

use anyhow::Context;
use tracing::info;

use agency_core::config::AgencyConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _basic_tracing = agency_core::logging::init_basic("info,trustee=debug");

    info!("starting trustee v{}", env!("CARGO_PKG_VERSION"));

    let config = AgencyConfig::load().context("failed to load configuration")?;
    config.validate().context("configuration validation failed")?;

    drop(_basic_tracing);
    agency_core::logging::init_from_config(&config.logging);

    info!("configuration loaded successfully");
    info!(socket = %config.trustee.bind_socket_path, "trustee will bind");

    let vault = server::Vault::new();
    let socket_path = config.trustee.bind_socket_path.clone();

    tokio::select! {
        result = server::serve(&socket_path, vault) => {
            result.context("trustee server exited with an error")?;
        }
        _ = agency_core::logging::shutdown_signal() => {
            info!("trustee shutting down");
        }
    }

    Ok(())
}
