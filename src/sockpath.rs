//! Socket path discovery.
//!
//! Resolution order:
//! 1. an explicitly configured path,
//! 2. the `WATCHD_SOCK` environment variable the daemon exports,
//! 3. asking the `watchd` CLI, whose `get-sockname` output is itself one
//!    framed PDU containing a `"sockname"` field.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::pdu::{self, Value};

/// Environment variable the daemon uses to advertise its socket path.
pub const SOCK_ENV_VAR: &str = "WATCHD_SOCK";

/// CLI binary queried when no other configuration is available.
const CLI_BIN: &str = "watchd";

/// Resolve the daemon's socket path.
pub async fn resolve(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    if let Ok(var) = std::env::var(SOCK_ENV_VAR) {
        if !var.is_empty() {
            tracing::debug!(path = %var, "resolved socket path from {SOCK_ENV_VAR}");
            return Ok(PathBuf::from(var));
        }
    }

    query_cli().await
}

/// Ask the CLI for the active socket path.
async fn query_cli() -> Result<PathBuf> {
    let output = Command::new(CLI_BIN)
        .args(["--output-encoding=pack", "get-sockname"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Connect(format!("failed to run {CLI_BIN}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Connect(format!(
            "{CLI_BIN} get-sockname exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let value = pdu::decode_framed(&output.stdout)
        .map_err(|e| Error::Connect(format!("bad get-sockname output: {e}")))?;

    match pdu::map_get(&value, "sockname").and_then(Value::as_str) {
        Some(path) => {
            tracing::debug!(path, "resolved socket path via {CLI_BIN}");
            Ok(PathBuf::from(path))
        }
        None => Err(Error::Connect(
            "get-sockname output has no \"sockname\" field".to_owned(),
        )),
    }
}
