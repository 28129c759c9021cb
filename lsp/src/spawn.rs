//! Local language server process, started per worker when configured.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::config::ClientConfig;
use crate::types::ServerAddress;

const STOP_TIMEOUT_SECS: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("server binary path is not configured")]
    MissingBinary,
    #[error("a JSON schema location is required to start the server")]
    MissingSchema,
    #[error("server binary {} not found", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: Option<which::Error>,
    },
    #[error("failed to start {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A running server child. Killed when dropped.
#[derive(Debug)]
pub struct ServerProcess {
    address: ServerAddress,
    binary: PathBuf,
    child: Child,
}

impl ServerProcess {
    /// Start `<bin> --port <port> --host <host> --schema <schema>`.
    pub fn spawn(config: &ClientConfig, port: u16) -> Result<Self, SpawnError> {
        let bin = config
            .server
            .bin_path
            .as_deref()
            .ok_or(SpawnError::MissingBinary)?;
        let schema = config
            .server
            .schema_location
            .as_deref()
            .ok_or(SpawnError::MissingSchema)?;
        let binary = resolve_binary(bin)?;
        let address = ServerAddress::new(config.host.clone(), port);

        tracing::info!("Starting language server on {address}...");
        tracing::info!("  binary: {}", binary.display());
        tracing::info!("  schema: {}", schema.display());

        let mut cmd = Command::new(&binary);
        cmd.arg("--port")
            .arg(port.to_string())
            .arg("--host")
            .arg(&config.host)
            .arg("--schema")
            .arg(schema)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| SpawnError::Io {
            path: binary.clone(),
            source,
        })?;

        tracing::info!("[{address}] Language server started");
        Ok(Self {
            address,
            binary,
            child,
        })
    }

    #[must_use]
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Kill the server and reap it. Consumes self.
    pub async fn stop(mut self) {
        let address = &self.address;
        tracing::info!("[{address}] Stopping language server...");

        if let Err(e) = self.child.start_kill() {
            tracing::debug!("[{address}] Kill failed (already exited?): {e}");
        }

        match tokio::time::timeout(
            Duration::from_secs(STOP_TIMEOUT_SECS),
            self.child.wait(),
        )
        .await
        {
            Ok(Ok(status)) => tracing::info!("[{address}] Language server stopped ({status})"),
            Ok(Err(e)) => tracing::warn!("[{address}] Error while stopping language server: {e}"),
            Err(_) => tracing::warn!("[{address}] Language server did not exit in time"),
        }
    }
}

fn resolve_binary(bin: &Path) -> Result<PathBuf, SpawnError> {
    if bin.components().count() > 1 || bin.is_absolute() {
        if bin.is_file() {
            return Ok(bin.to_path_buf());
        }
        return Err(SpawnError::NotFound {
            path: bin.to_path_buf(),
            source: None,
        });
    }

    which::which(bin).map_err(|source| SpawnError::NotFound {
        path: bin.to_path_buf(),
        source: Some(source),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(bin: Option<&str>, schema: Option<&str>) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.server.spawn = true;
        config.server.bin_path = bin.map(PathBuf::from);
        config.server.schema_location = schema.map(PathBuf::from);
        config
    }

    #[test]
    fn test_missing_binary() {
        let err = ServerProcess::spawn(&config_with(None, Some("/tmp/schema.json")), 10001)
            .unwrap_err();
        assert!(matches!(err, SpawnError::MissingBinary));
    }

    #[test]
    fn test_missing_schema() {
        let err = ServerProcess::spawn(&config_with(Some("lsp"), None), 10001).unwrap_err();
        assert!(matches!(err, SpawnError::MissingSchema));
    }

    #[test]
    fn test_unknown_binary_name() {
        let config = config_with(
            Some("rpcprobe-no-such-language-server"),
            Some("/tmp/schema.json"),
        );
        let err = ServerProcess::spawn(&config, 10001).unwrap_err();
        assert!(matches!(err, SpawnError::NotFound { source: Some(_), .. }));
    }

    #[test]
    fn test_missing_binary_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("lsp");
        let config = config_with(bin.to_str(), Some("/tmp/schema.json"));
        let err = ServerProcess::spawn(&config, 10001).unwrap_err();
        assert!(matches!(err, SpawnError::NotFound { source: None, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_stop() {
        let config = config_with(Some("true"), Some("/tmp/schema.json"));
        let process = ServerProcess::spawn(&config, 10002).unwrap();
        assert_eq!(process.address().port, 10002);
        assert!(process.binary().is_absolute());
        process.stop().await;
    }
}
