use anyhow::{bail, Context, Result};
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tftp_engine::config::DEFAULT_PORT;
use tftp_engine::{Server, ServerConfig, ServerMode};

/// Builds a configuration from `TFTP_BIND`, `TFTP_ROOT`, `TFTP_MODE` (get, put or both),
/// `TFTP_TIMEOUT_MS` and `TFTP_RETRIES`, defaulting anything unset.
fn config_from_vars(var: impl Fn(&str) -> Option<String>) -> Result<ServerConfig> {
    let bind: SocketAddr = match var("TFTP_BIND") {
        Some(raw) => raw.parse::<SocketAddr>().with_context(|| format!("Invalid TFTP_BIND '{raw}'"))?,
        None => (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
    };
    let root = var("TFTP_ROOT").unwrap_or_else(|| ".".to_string());
    let mut config = ServerConfig::new(bind, root);

    if let Some(raw) = var("TFTP_MODE") {
        config.mode = match raw.to_ascii_lowercase().as_str() {
            "get" => ServerMode::GetOnly,
            "put" => ServerMode::PutOnly,
            "both" => ServerMode::GetAndPut,
            _ => bail!("Invalid TFTP_MODE '{raw}', expected get, put or both"),
        };
    }
    if let Some(raw) = var("TFTP_TIMEOUT_MS") {
        let ms = raw.parse::<u64>().with_context(|| format!("Invalid TFTP_TIMEOUT_MS '{raw}'"))?;
        config.transfer.timeout = Duration::from_millis(ms);
        config.transfer.linger = config.transfer.timeout;
    }
    if let Some(raw) = var("TFTP_RETRIES") {
        config.transfer.max_retries = raw.parse::<u32>().with_context(|| format!("Invalid TFTP_RETRIES '{raw}'"))?;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_vars(|key| env::var(key).ok()).context("Invalid server configuration")?;
    let mut server = Server::new(config);
    server.start()?;
    server.await_ready().await.context("TFTP server failed to start")?;

    tokio::signal::ctrl_c().await.context("Couldn't wait for Ctrl-C")?;
    log::info!("Shutting down");
    server.stop().await;

    Ok(())
}
