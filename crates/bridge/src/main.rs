mod config;
mod mcp;

use anyhow::Context as _;
use clap::Parser as _;
use config::{Cli, LogFormat};
use mcp::McpServer;
use mcp_openapi_bridge_core::{Bridge, BridgeError};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const STARTUP_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// [`STARTUP_FAILED`] when the bridge refused to come up (see
/// [`BridgeError::is_startup_fatal`]), 1 for anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<BridgeError>() {
        Some(e) if e.is_startup_fatal() => STARTUP_FAILED,
        _ => 1,
    }
}

// stdout carries the protocol; logs go to stderr only.
fn init_tracing(default_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::resolve(&cli)?;
    let base_url = config.base_url.clone();
    let bridge = Arc::new(
        Bridge::start(config)
            .await
            .with_context(|| format!("startup against {base_url} failed"))?,
    );
    let skipped = bridge.warnings().len();
    if skipped > 0 {
        tracing::warn!("{skipped} operation(s) skipped as malformed");
    }

    if cli.spec_refresh_secs > 0 {
        spawn_refresh(bridge.clone(), Duration::from_secs(cli.spec_refresh_secs));
    }

    let server = McpServer::new(bridge);
    tracing::info!("Serving MCP over stdio");
    tokio::select! {
        res = server.serve(tokio::io::BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
    }
    Ok(())
}

fn spawn_refresh(bridge: Arc<Bridge>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = bridge.reload().await {
                tracing::warn!("Spec refresh failed, keeping current catalog: {e}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_failures_get_their_own_exit_code() {
        let fatal = anyhow::Error::new(BridgeError::Authentication("bad password".into()))
            .context("startup against https://teamserver failed");
        assert_eq!(exit_code(&fatal), STARTUP_FAILED);

        let per_call = anyhow::Error::new(BridgeError::Transport("reset".into()));
        assert_eq!(exit_code(&per_call), 1);

        let io = anyhow::anyhow!("stdin closed unexpectedly");
        assert_eq!(exit_code(&io), 1);
    }
}
