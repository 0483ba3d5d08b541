use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use mcp_openapi_bridge_core::BridgeConfig;
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "mcp-openapi-bridge",
    version,
    about = "Expose an OpenAPI-described HTTP API as MCP tools over stdio"
)]
pub struct Cli {
    /// YAML config file (`baseUrl`, `username`, `autoDiscover`, ...). Flags override it.
    #[arg(long, env = "BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base URL of the remote API, e.g. `https://teamserver:50443`.
    #[arg(long, env = "API_BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "API_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "API_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Verify the API's TLS certificate (`false` keeps TLS but skips validation).
    #[arg(long, env = "API_VERIFY_TLS", value_parser = clap::builder::BoolishValueParser::new())]
    pub verify_tls: Option<bool>,

    /// Timeout for every outbound request, in seconds.
    #[arg(long, env = "API_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Re-fetch the API description at this interval (0 = never).
    #[arg(long, env = "BRIDGE_SPEC_REFRESH_SECS", default_value_t = 0)]
    pub spec_refresh_secs: u64,

    /// Log filter used when `RUST_LOG` is unset. Logs always go to stderr.
    #[arg(long, env = "BRIDGE_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "BRIDGE_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

/// Merge the optional config file with flags/env into a validated [`BridgeConfig`].
pub fn resolve(cli: &Cli) -> anyhow::Result<BridgeConfig> {
    let mut doc = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            if text.trim().is_empty() {
                Mapping::new()
            } else {
                serde_yaml::from_str::<Mapping>(&text)
                    .with_context(|| format!("parse {}", path.display()))?
            }
        }
        None => Mapping::new(),
    };

    set(&mut doc, "baseUrl", cli.base_url.clone().map(Value::String));
    set(&mut doc, "username", cli.username.clone().map(Value::String));
    set(&mut doc, "password", cli.password.clone().map(Value::String));
    set(&mut doc, "verifyTls", cli.verify_tls.map(Value::Bool));
    set(&mut doc, "timeoutSecs", cli.timeout_secs.map(|t| Value::Number(t.into())));

    let config: BridgeConfig = serde_yaml::from_value(Value::Mapping(doc))
        .context("invalid configuration (baseUrl, username and password are required)")?;
    config.validate()?;
    Ok(config)
}

fn set(doc: &mut Mapping, key: &str, value: Option<Value>) {
    if let Some(v) = value {
        doc.insert(Value::String(key.to_string()), v);
    }
}
