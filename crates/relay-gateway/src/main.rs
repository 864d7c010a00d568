//! # relay-gateway
//!
//! Gateway binary. `serve` wires the runtime into the WebSocket server;
//! `call` issues a single RPC against a running gateway and prints the result.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use relay_client::{ClientOptions, GatewayClient};
use relay_runtime::{EchoExecutor, GatewayRuntime};
use relay_server::{GatewayServer, ServerConfig};
use relay_settings::GatewaySettings;
use serde_json::Value;

/// Relay gateway.
#[derive(Parser, Debug)]
#[command(name = "relay-gateway", about = "Relay gateway server and RPC client")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway server until ctrl-c.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Call one RPC method and print the result as JSON.
    Call {
        /// Method name, e.g. `session.list`.
        method: String,

        /// Params as a JSON object.
        #[arg(long)]
        params: Option<String>,

        /// Gateway URL. Requires `--token` or `--password`.
        #[arg(long)]
        url: Option<String>,

        /// Shared token.
        #[arg(long, conflicts_with = "password")]
        token: Option<String>,

        /// Shared password.
        #[arg(long)]
        password: Option<String>,

        /// Request timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn load_settings(path: Option<&Path>) -> Result<GatewaySettings> {
    let path = path.map_or_else(relay_settings::settings_path, Path::to_path_buf);
    relay_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("--params is not valid JSON")?;
    if !value.is_object() {
        bail!("--params must be a JSON object");
    }
    Ok(Some(value))
}

fn server_config(settings: &GatewaySettings, host: Option<String>, port: Option<u16>) -> ServerConfig {
    let mut config = ServerConfig::from_settings(&settings.server);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    config
}

fn client_options(
    settings: &GatewaySettings,
    url: Option<String>,
    token: Option<String>,
    password: Option<String>,
) -> ClientOptions {
    let mut opts = ClientOptions::from_settings(&settings.client, &settings.server.auth);
    if let Some(url) = url {
        opts = opts.with_url_override(url);
    }
    if let Some(token) = token {
        opts = opts.with_token(token);
    }
    if let Some(password) = password {
        opts = opts.with_password(password);
    }
    // one retry, then give up
    opts.reconnect.max_attempts = 1;
    opts
}

async fn serve(settings: GatewaySettings, host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = server_config(&settings, host, port);
    let runtime = GatewayRuntime::new(&settings, Arc::new(EchoExecutor));

    let mut server = GatewayServer::new(config, runtime);
    match relay_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(err) => tracing::warn!(error = %err, "metrics recorder unavailable"),
    }
    let method_count = server.registry().methods().len();

    let running = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "Relay gateway listening on {} ({method_count} RPC methods registered)",
        running.url()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !running.shutdown().await {
        tracing::warn!("shutdown drain timed out");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn call(opts: ClientOptions, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<()> {
    let connect_timeout = opts.handshake_timeout;
    let client = GatewayClient::new(opts).context("Invalid client options")?;
    client.start();

    let outcome = async {
        client
            .wait_connected(connect_timeout)
            .await
            .context("Failed to connect to gateway")?;
        let result = match timeout {
            Some(limit) => client.request_with_timeout(method, params, limit).await,
            None => client.request(method, params).await,
        };
        result.with_context(|| format!("{method} failed"))
    }
    .await;

    client.stop();
    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = load_settings(args.settings.as_deref())?;
    relay_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    match args.command {
        Command::Serve { host, port } => serve(settings, host, port).await,
        Command::Call {
            method,
            params,
            url,
            token,
            password,
            timeout_ms,
        } => {
            let params = parse_params(params.as_deref())?;
            let opts = client_options(&settings, url, token, password);
            call(opts, &method, params, timeout_ms.map(Duration::from_millis)).await
        }
    }
}
