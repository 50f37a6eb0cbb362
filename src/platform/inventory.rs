// src/platform/inventory.rs

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// Key holding the local host's UUID
pub const INSTALLATION_UUID: &str = "INSTALLATION_UUID";

/// Parses the host inventory file (`KEY='value'` lines)
pub async fn read_inventory(path: &Path) -> Result<HashMap<String, String>, InventoryError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| InventoryError::Read {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

    let inventory = parse_inventory(&contents)?;
    debug!(path = %path.display(), entries = inventory.len(), "parsed host inventory");
    Ok(inventory)
}

/// Parses inventory text
pub fn parse_inventory(contents: &str) -> Result<HashMap<String, String>, InventoryError> {
    let mut rec = HashMap::new();

    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| InventoryError::Malformed(line.to_string()))?;
        let value = value.trim().trim_matches('\'').trim_matches('"');
        rec.insert(key.trim().to_string(), value.to_string());
    }

    Ok(rec)
}

/// Returns the local host's UUID from the inventory
pub async fn local_host_uuid(path: &Path) -> Result<String, InventoryError> {
    read_inventory(path)
        .await?
        .remove(INSTALLATION_UUID)
        .ok_or_else(|| InventoryError::MissingKey(INSTALLATION_UUID.to_string()))
}

/// Error reading the host inventory
#[derive(Error, Debug)]
pub enum InventoryError {
    /// Inventory file could not be read
    #[error("Failed to read inventory {path}: {error}")]
    Read {
        /// File path
        path: String,
        /// Underlying I/O error
        error: String,
    },

    /// Line that is not `KEY='value'`
    #[error("Could not parse inventory line: {0}")]
    Malformed(String),

    /// Required key absent
    #[error("Inventory has no {0}")]
    MissingKey(String),
}
