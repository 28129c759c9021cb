//! rpcprobe - send JSON-RPC messages to a language server over TCP.
//!
//! ```text
//! main() -> config (file, env, flags) -> [ServerProcess::spawn] -> RpcClient::connect
//!                                                                       |
//!                                                                       v
//!                                                   request | notify | diagnostics
//!                                                                       |
//!                                                                       v
//!                                                   disconnect -> [ServerProcess::stop]
//! ```
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); results go to stdout as
//! JSON.

mod args;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{path::Path, time::Duration};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use args::{CliArgs, Command};
use rpcprobe_lsp::protocol::{did_open_params, initialize_params, path_to_file_uri};
use rpcprobe_lsp::{ClientConfig, RpcClient, ServerAddress, ServerProcess, next_notification};

const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(args: &CliArgs) -> Result<ClientConfig> {
    let mut config = match args.config.clone().or_else(ClientConfig::default_path) {
        Some(path) => ClientConfig::load(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    config.apply_process_env();
    args.apply_to(&mut config);
    Ok(config)
}

fn parse_params(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("params are not valid JSON: {raw}"))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("formatting output")?;
    println!("{out}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    let port = config.port_for_worker(args.worker);

    let server = if config.server.spawn {
        Some(ServerProcess::spawn(&config, port).context("starting language server")?)
    } else {
        tracing::info!("Not starting language server");
        None
    };

    let client = RpcClient::new(ServerAddress::new(config.host.clone(), port));
    let outcome = run(&client, &config, &args).await;

    if !client.disconnect(config.disconnect_grace()).await {
        tracing::debug!("Connection did not close cleanly");
    }
    if let Some(server) = server {
        server.stop().await;
    }

    outcome
}

async fn run(client: &RpcClient, config: &ClientConfig, args: &CliArgs) -> Result<()> {
    let address = client.address();
    if !client.connect(config.connect_timeout()).await {
        bail!("Unable to connect to the server {address}");
    }

    let wait = Duration::from_millis(args.wait_ms);

    match &args.command {
        Command::Request { method, params } => {
            let params = parse_params(params)?;
            let result = tokio::time::timeout(wait, client.request(method, params))
                .await
                .with_context(|| format!("no response to {method} within {}ms", args.wait_ms))?
                .with_context(|| format!("request {method} failed"))?;
            print_json(&result)
        }
        Command::Notify { method, params } => {
            let params = parse_params(params)?;
            client
                .notify(method, params)
                .await
                .with_context(|| format!("sending {method}"))
        }
        Command::Diagnostics {
            file,
            language_id,
            no_initialize,
        } => {
            if !no_initialize {
                initialize(client, wait).await?;
            }
            let diagnostics = open_and_wait(client, file, language_id, wait).await?;
            print_json(&diagnostics)
        }
    }
}

async fn initialize(client: &RpcClient, wait: Duration) -> Result<()> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    let root_uri = path_to_file_uri(&cwd)?;

    tokio::time::timeout(
        wait,
        client.request("initialize", initialize_params(root_uri.as_str())),
    )
    .await
    .context("no response to initialize")?
    .context("initialize failed")?;

    client
        .notify("initialized", serde_json::json!({}))
        .await
        .context("sending initialized")?;
    Ok(())
}

/// Send `didOpen` for `file` and return the `params` of the first
/// diagnostics notification published for it.
async fn open_and_wait(
    client: &RpcClient,
    file: &Path,
    language_id: &str,
    wait: Duration,
) -> Result<serde_json::Value> {
    let path = std::fs::canonicalize(file)
        .with_context(|| format!("resolving {}", file.display()))?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let uri = path_to_file_uri(&path)?;

    // Subscribe first so a fast server cannot beat us to it.
    let mut events = client.subscribe();
    client
        .notify(
            "textDocument/didOpen",
            did_open_params(uri.as_str(), language_id, 1, &text),
        )
        .await
        .context("sending didOpen")?;

    let wanted = async {
        loop {
            let Some(message) = next_notification(&mut events, PUBLISH_DIAGNOSTICS).await else {
                bail!("client closed before diagnostics arrived");
            };
            let params = message.get("params").cloned().unwrap_or_default();
            if params.get("uri").and_then(|u| u.as_str()) == Some(uri.as_str()) {
                return Ok(params);
            }
            tracing::debug!("Ignoring diagnostics for another document");
        }
    };

    tokio::time::timeout(wait, wanted)
        .await
        .with_context(|| format!("no diagnostics for {uri} within {}ms", wait.as_millis()))?
}
