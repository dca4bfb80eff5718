use anyhow::{Context, Result};
use clap::Parser;
use mcp_bridge::{BridgeConfig, ConnectionConfig, Runner, analytics};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Relay JSON-RPC traffic between local stdio and a tool server.
#[derive(Debug, Parser)]
#[command(name = "mcp-bridge", version)]
struct Cli {
    /// Qualified name of the tool server (used for diagnostics and
    /// analytics)
    #[arg(long)]
    name: String,

    /// Resolved connection descriptor as JSON, e.g.
    /// '{"kind":"stdio","command":"npx","args":["-y","@example/server"]}'
    #[arg(long)]
    connection: String,

    /// Configuration value passed to the server, as key=value (repeatable)
    #[arg(long = "config", value_name = "KEY=VALUE")]
    config_values: Vec<String>,

    /// Disable the tool-call analytics side channel
    #[arg(long)]
    no_analytics: bool,
}

fn parse_config_value(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("config value {raw:?} is not of the form key=value"))?;
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr only; stdout carries the relayed wire.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let connection: ConnectionConfig =
        serde_json::from_str(&cli.connection).context("invalid connection descriptor")?;

    let mut builder = BridgeConfig::builder();
    builder.name(cli.name).connection(connection);
    for raw in &cli.config_values {
        let (key, value) = parse_config_value(raw)?;
        builder.config_value(key, value);
    }
    if !cli.no_analytics {
        builder.analytics_endpoint(analytics::DEFAULT_ENDPOINT.to_string());
    }
    let config = builder.build().context("incomplete bridge configuration")?;

    let runner = Runner::new(config, tokio::io::stdin(), tokio::io::stdout());

    // Thin adapter: OS signals converge on the runner's one shutdown entry
    // point. The core never registers global handlers itself.
    let shutdown = runner.shutdown_token();
    tokio::spawn(async move {
        subscribe_signals().await;
        info!("Termination signal received");
        shutdown.cancel();
    });

    let code = runner.run().await?;
    Ok(code)
}

#[cfg(unix)]
async fn subscribe_signals() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("Failed to subscribe SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn subscribe_signals() {
    let _ = tokio::signal::ctrl_c().await;
}
