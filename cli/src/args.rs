use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rpcprobe_lsp::ClientConfig;

#[derive(Debug, Parser)]
#[command(name = "rpcprobe")]
#[command(version)]
#[command(about = "Talk JSON-RPC to a language server over TCP")]
pub struct CliArgs {
    /// Config file (default: ~/.rpcprobe/config.toml)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Server host, overrides config and RPC_SERVER_HOST
    #[arg(long)]
    pub host: Option<String>,

    /// Server port, overrides config and PORT
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Start the configured server binary before connecting
    #[arg(long)]
    pub spawn: bool,

    /// Worker number; a spawned server for worker N listens on port + N - 1
    #[arg(long, default_value_t = 1)]
    pub worker: u16,

    /// How long to keep retrying the connection
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// How long to wait for a response or notification
    #[arg(long, default_value_t = 5000)]
    pub wait_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send a request and print its result
    Request {
        method: String,
        /// JSON params
        #[arg(default_value = "null")]
        params: String,
    },
    /// Send a notification
    Notify {
        method: String,
        /// JSON params
        #[arg(default_value = "null")]
        params: String,
    },
    /// Open a file and print the diagnostics published for it
    Diagnostics {
        file: PathBuf,
        #[arg(long, default_value = "yaml")]
        language_id: String,
        /// Skip the initialize handshake (for servers that do not require it)
        #[arg(long)]
        no_initialize: bool,
    },
}

impl CliArgs {
    /// Command-line flags win over the file and the environment.
    pub fn apply_to(&self, config: &mut ClientConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.spawn {
            config.server.spawn = true;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.connect_timeout_ms = timeout_ms;
        }
    }
}
