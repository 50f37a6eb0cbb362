// src/platform/store.rs

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::command::{run_tool, CommandError};

/// Per-domain hierarchical key/value store
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Reads the value at an absolute path
    async fn read(&self, path: &str) -> Result<String, StoreError>;

    /// Writes a value at an absolute path, creating parents
    async fn write(&self, path: &str, value: &str) -> Result<(), StoreError>;

    /// Removes a path and everything below it
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Sets permissions on a path, e.g. `n12` for "owned by domain 12"
    async fn chmod(&self, path: &str, perms: &str) -> Result<(), StoreError>;

    /// Renders the subtree below a path, for diagnostics
    async fn list(&self, path: &str) -> Result<String, StoreError>;
}

/// Per-domain prefix every channel root template starts with
pub const DOMAIN_PREFIX: &str = "/local/domain/{domid}/";

/// Layout of the channel subtree for one domain instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    root: String,

    /// The root relative to the domain's own directory
    boot_root: String,
}

/// Relative keys under the channel root
pub mod keys {
    #![allow(missing_docs)]

    pub const USERNAME: &str = "auth/username";
    pub const PASSWORD: &str = "auth/password";
    pub const CERT: &str = "auth/cert";
    pub const DAEMON_IP: &str = "daemon-ip";
    /// `0` once the guest service is attached
    pub const DAEMON_STATUS: &str = "daemon-status";
    /// `1` asks the guest service to re-attach; it writes `0` back
    pub const RESTART: &str = "cmd/re-attach-daemon";
    /// MAC of the management interface
    pub const NETWORK_DEVICE: &str = "network-device";
}

impl StorePaths {
    /// Builds the layout from a template containing `{domid}`
    pub fn new(template: &str, domid: i64) -> Self {
        let boot_root = template
            .strip_prefix(DOMAIN_PREFIX)
            .unwrap_or_else(|| template.trim_start_matches('/'))
            .trim_end_matches('/')
            .to_string();

        Self {
            root: template.replace("{domid}", &domid.to_string()),
            boot_root,
        }
    }

    /// The channel root for this domain
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Absolute path of a key below the root
    pub fn key(&self, rel: &str) -> String {
        format!("{}/{}", self.root.trim_end_matches('/'), rel)
    }

    /// Key below the root as the toolstack names it in a guest's boot-time
    /// store data, relative to the domain directory
    pub fn boot_key(&self, rel: &str) -> String {
        format!("{}/{}", self.boot_root, rel)
    }
}

/// `ConfigStore` backed by the xenstore command-line tools
#[derive(Debug, Clone)]
pub struct XenstoreCli {
    tool_dir: PathBuf,
}

impl XenstoreCli {
    /// Uses the `xenstore-*` tools found in `tool_dir`
    pub fn new(tool_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool_dir: tool_dir.into(),
        }
    }

    fn tool(&self, name: &str) -> PathBuf {
        self.tool_dir.join(name)
    }
}

#[async_trait]
impl ConfigStore for XenstoreCli {
    async fn read(&self, path: &str) -> Result<String, StoreError> {
        run_tool(&self.tool("xenstore-read"), &[path])
            .await
            .map_err(|e| StoreError::from_command(path, e))
    }

    async fn write(&self, path: &str, value: &str) -> Result<(), StoreError> {
        debug!(path = %path, "store write");
        run_tool(&self.tool("xenstore-write"), &[path, value])
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_command(path, e))
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        debug!(path = %path, "store remove");
        run_tool(&self.tool("xenstore-rm"), &[path])
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_command(path, e))
    }

    async fn chmod(&self, path: &str, perms: &str) -> Result<(), StoreError> {
        run_tool(&self.tool("xenstore-chmod"), &[path, perms])
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_command(path, e))
    }

    async fn list(&self, path: &str) -> Result<String, StoreError> {
        run_tool(&self.tool("xenstore-ls"), &["-p", path])
            .await
            .map_err(|e| StoreError::from_command(path, e))
    }
}

/// Error raised by the configuration store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Path does not exist
    #[error("Store path not found: {0}")]
    NotFound(String),

    /// Any other tool failure
    #[error("Store operation on {path} failed: {source}")]
    Tool {
        /// Path operated on
        path: String,
        /// Tool failure
        #[source]
        source: CommandError,
    },
}

impl StoreError {
    fn from_command(path: &str, error: CommandError) -> Self {
        match &error {
            CommandError::Failed { stderr, .. }
                if stderr.contains("No such file") || stderr.contains("could not read path") =>
            {
                StoreError::NotFound(path.to_string())
            }
            _ => StoreError::Tool {
                path: path.to_string(),
                source: error,
            },
        }
    }
}
