// src/config/validator.rs

use crate::config::{ConfigError, ControlPlaneConfig, DaemonConfig, ListenConfig, NetworkConfig, StoreConfig, TimingConfig};
use crate::platform::store::DOMAIN_PREFIX;

/// Configuration validator
pub struct ConfigValidator {}

impl ConfigValidator {
    /// Creates a new configuration validator
    pub fn new() -> Self {
        Self {}
    }

    /// Validates a configuration.
    ///
    /// The listening transport is not checked here because only `serve`
    /// needs one; see [`ListenConfig::transport`].
    pub fn validate(&self, config: &DaemonConfig) -> Result<(), ConfigError> {
        if config.version.is_empty() {
            return Err(ConfigError::ValidationError(
                "Configuration version cannot be empty".to_string(),
            ));
        }

        self.validate_listen(&config.listen)?;
        self.validate_control_plane(&config.control_plane)?;
        self.validate_network(&config.network)?;
        self.validate_store(&config.store)?;
        self.validate_timing(&config.timing)?;

        Ok(())
    }

    fn validate_listen(&self, listen: &ListenConfig) -> Result<(), ConfigError> {
        if listen.plugin_name.is_empty() || listen.plugin_name.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "Invalid plugin name: {:?}",
                listen.plugin_name
            )));
        }

        if listen.port == Some(0) {
            return Err(ConfigError::ValidationError("Listen port cannot be zero".to_string()));
        }

        Ok(())
    }

    fn validate_control_plane(&self, control: &ControlPlaneConfig) -> Result<(), ConfigError> {
        if control.username.is_empty() {
            return Err(ConfigError::ValidationError(
                "Toolstack username cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_network(&self, network: &NetworkConfig) -> Result<(), ConfigError> {
        if network.bridge.is_empty() {
            return Err(ConfigError::ValidationError(
                "Management bridge name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_store(&self, store: &StoreConfig) -> Result<(), ConfigError> {
        // Boot-time store data is keyed relative to the domain directory
        let below_domain = store
            .root_template
            .strip_prefix(DOMAIN_PREFIX)
            .map_or(false, |rest| !rest.trim_matches('/').is_empty());
        if !below_domain {
            return Err(ConfigError::ValidationError(format!(
                "Store root template must lie below {}: {}",
                DOMAIN_PREFIX, store.root_template
            )));
        }

        Ok(())
    }

    fn validate_timing(&self, timing: &TimingConfig) -> Result<(), ConfigError> {
        let intervals = [
            ("poll_interval_ms", timing.poll_interval_ms),
            ("domid_poll_interval_ms", timing.domid_poll_interval_ms),
            ("request_timeout_secs", timing.request_timeout_secs),
            ("event_timeout_secs", timing.event_timeout_secs),
        ];

        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{} cannot be zero", name)));
            }
        }

        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
