// src/platform/command.rs

use std::path::Path;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Runs a host tool to completion and returns its trimmed stdout.
///
/// A non-zero exit status is an error carrying the tool's stderr.
pub async fn run_tool<S: AsRef<str>>(program: &Path, args: &[S]) -> Result<String, CommandError> {
    let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
    debug!(program = %program.display(), args = ?args, "running host tool");

    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CommandError::Spawn {
            program: program.display().to_string(),
            error: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(program = %program.display(), status = ?output.status.code(), stderr = %stderr, "host tool failed");
        return Err(CommandError::Failed {
            program: program.display().to_string(),
            status: output.status.code(),
            stderr,
        });
    }

    debug!(program = %program.display(), stdout = %stdout, "host tool succeeded");
    Ok(stdout)
}

/// Error while running a host tool
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    /// The tool could not be started
    #[error("Failed to spawn {program}: {error}")]
    Spawn {
        /// Tool path
        program: String,
        /// Spawn error
        error: String,
    },

    /// The tool exited unsuccessfully
    #[error("{program} exited with status {status:?}: {stderr}")]
    Failed {
        /// Tool path
        program: String,
        /// Exit code, if the tool was not killed by a signal
        status: Option<i32>,
        /// Trimmed standard error
        stderr: String,
    },
}
