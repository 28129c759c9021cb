use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::ServerAddress;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 10001;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DISCONNECT_GRACE_MS: u64 = 10;

const TRUTHY: [&str; 4] = ["1", "on", "true", "yes"];
const FALSY: [&str; 4] = ["0", "off", "false", "no"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Where to find the language server and how patient to be with it.
///
/// ```toml
/// host = "127.0.0.1"
/// port = 10001
/// connect_timeout_ms = 10000
///
/// [server]
/// spawn = true
/// bin_path = "~/bin/yaml-language-server"
/// schema_location = "schema.json"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    pub server: ServerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_grace_ms: DEFAULT_DISCONNECT_GRACE_MS,
            server: ServerConfig::default(),
        }
    }
}

/// Settings for starting a local server process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub spawn: bool,
    /// Absolute path, `~/` path, relative path, or a bare name looked up on
    /// `PATH`.
    pub bin_path: Option<PathBuf>,
    pub schema_location: Option<PathBuf>,
}

impl ClientConfig {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        Self::parse(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.server.normalize_paths();
        Ok(config)
    }

    /// `~/.rpcprobe/config.toml`
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".rpcprobe").join("config.toml"))
    }

    /// Override fields from the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok());
    }

    /// Override fields from `lookup`. Empty values count as unset.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(host) = var("RPC_SERVER_HOST") {
            self.host = host;
        }
        if let Some(port) = var("PORT") {
            match port.trim().parse() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!("Ignoring PORT={port:?}: not a port number"),
            }
        }
        if let Some(spawn) = var("SPAWN_LSP_SERVER").as_deref().and_then(parse_switch) {
            self.server.spawn = spawn;
        }
        if let Some(bin) = var("RPC_SERVER_BIN") {
            self.server.bin_path = Some(PathBuf::from(bin));
        }
        if let Some(schema) = var("SCHEMA_LOCATION") {
            self.server.schema_location = Some(PathBuf::from(schema));
        }

        self.server.normalize_paths();
    }

    #[must_use]
    pub fn address(&self) -> ServerAddress {
        ServerAddress::new(self.host.clone(), self.port)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Port for parallel worker `worker_id` (1-based).
    ///
    /// A spawned server is per worker, so worker N listens on
    /// `port + N - 1`. A shared external server keeps the configured port.
    #[must_use]
    pub fn port_for_worker(&self, worker_id: u16) -> u16 {
        if !self.server.spawn {
            return self.port;
        }
        self.port.saturating_add(worker_id.saturating_sub(1))
    }
}

impl ServerConfig {
    fn normalize_paths(&mut self) {
        if let Some(bin) = self.bin_path.take() {
            self.bin_path = Some(normalize_bin_path(&bin));
        }
        if let Some(schema) = self.schema_location.take() {
            self.schema_location = Some(absolutize(&expand_home(&schema)));
        }
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    if TRUTHY.contains(&value) {
        Some(true)
    } else if FALSY.contains(&value) {
        Some(false)
    } else {
        None
    }
}

/// Replace a leading `~` with the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(err) => {
            tracing::debug!("Cannot resolve {} against cwd: {err}", path.display());
            path.to_path_buf()
        }
    }
}

/// Bare names stay as-is for a `PATH` lookup at spawn time.
fn normalize_bin_path(path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.components().count() > 1 {
        absolutize(&expanded)
    } else {
        expanded
    }
}
