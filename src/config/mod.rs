// src/config/mod.rs

/// Configuration validation
pub mod validator;

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Complete daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Configuration format version
    pub version: String,

    /// Where the control service listens
    pub listen: ListenConfig,

    /// Toolstack connection
    pub control_plane: ControlPlaneConfig,

    /// Management network and switch
    pub network: NetworkConfig,

    /// Per-domain configuration store
    pub store: StoreConfig,

    /// Timeouts and polling intervals
    pub timing: TimingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Host inventory file naming the local host
    pub inventory_path: PathBuf,

    /// File the daemon appends its process id to
    pub pid_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            listen: ListenConfig::default(),
            control_plane: ControlPlaneConfig::default(),
            network: NetworkConfig::default(),
            store: StoreConfig::default(),
            timing: TimingConfig::default(),
            logging: LoggingConfig::default(),
            inventory_path: PathBuf::from("/etc/xensource-inventory"),
            pid_file: Some(PathBuf::from("/var/run/vmchanneld.pids")),
        }
    }
}

/// Listening transport configuration.
///
/// Exactly one of TCP (`ip` + `port`) or the toolstack plugin socket
/// (`service`) must be selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// TCP listen address
    pub ip: Option<IpAddr>,

    /// TCP listen port
    pub port: Option<u16>,

    /// Listen on the toolstack plugin socket instead of TCP
    pub service: bool,

    /// Plugin name, also the socket file name
    pub plugin_name: String,

    /// Directory holding plugin sockets
    pub plugin_dir: PathBuf,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: None,
            port: None,
            service: false,
            plugin_name: "xscim".to_string(),
            plugin_dir: PathBuf::from("/var/xapi/plugin"),
        }
    }
}

/// Resolved listening transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// TCP socket
    Tcp(SocketAddr),

    /// Unix domain socket at the given path
    Unix(PathBuf),
}

impl ListenConfig {
    /// Resolves the configured transport
    pub fn transport(&self) -> Result<Transport, ConfigError> {
        match (self.ip, self.port, self.service) {
            (Some(ip), Some(port), false) => Ok(Transport::Tcp(SocketAddr::new(ip, port))),
            (None, None, true) => Ok(Transport::Unix(self.plugin_dir.join(&self.plugin_name))),
            (Some(_), Some(_), true) => Err(ConfigError::ValidationError(
                "Choose either an ip and port or the plugin service socket, not both".to_string(),
            )),
            _ => Err(ConfigError::ValidationError(
                "Need an ip and port or the plugin service socket".to_string(),
            )),
        }
    }

    /// HTTP path prefix under which the toolstack forwards plugin requests
    pub fn handler_prefix(&self) -> String {
        format!("/services/plugin/{}", self.plugin_name)
    }
}

/// Toolstack connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Local toolstack socket
    pub socket_path: PathBuf,

    /// Login username
    pub username: String,

    /// Login password source
    pub password: SecretSource,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/lib/xcp/xapi"),
            username: "root".to_string(),
            password: SecretSource::Value(String::new()),
        }
    }
}

/// Management network and switch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bridge of the host-internal management network
    pub bridge: String,

    /// Root of the sysfs network class directory
    pub sysfs_net_root: PathBuf,

    /// `ovs-ofctl` binary
    pub ovs_ofctl: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: "xenapi".to_string(),
            sysfs_net_root: PathBuf::from("/sys/class/net"),
            ovs_ofctl: PathBuf::from("/usr/bin/ovs-ofctl"),
        }
    }
}

/// Configuration store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory containing the `xenstore-*` tools
    pub tool_dir: PathBuf,

    /// Channel root; `{domid}` is replaced by the guest's domain id
    pub root_template: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tool_dir: PathBuf::from("/usr/bin"),
            root_template: "/local/domain/{domid}/vm-data/channel".to_string(),
        }
    }
}

/// Timeouts and polling intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long setup waits for the guest service to restart
    pub setup_liveness_timeout_secs: u64,

    /// How long a key operation waits for the guest service
    pub service_timeout_secs: u64,

    /// Interval between liveness checks
    pub poll_interval_ms: u64,

    /// How long to wait for a guest to obtain a domain id
    pub domid_timeout_secs: u64,

    /// Interval between domain id checks
    pub domid_poll_interval_ms: u64,

    /// Timeout of a single HTTP request to the guest or toolstack
    pub request_timeout_secs: u64,

    /// Timeout of a blocking event fetch
    pub event_timeout_secs: u64,

    /// Pause after a failed event batch
    pub event_retry_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            setup_liveness_timeout_secs: 60,
            service_timeout_secs: 30,
            poll_interval_ms: 1000,
            domid_timeout_secs: 60,
            domid_poll_interval_ms: 5000,
            request_timeout_secs: 30,
            event_timeout_secs: 60,
            event_retry_delay_ms: 1000,
        }
    }
}

impl TimingConfig {
    /// How long setup waits for the guest service to re-attach
    pub fn setup_liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_liveness_timeout_secs)
    }

    /// How long a key operation waits for the guest service
    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    /// Interval between guest service checks
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// How long to wait for a guest's domain id
    pub fn domid_timeout(&self) -> Duration {
        Duration::from_secs(self.domid_timeout_secs)
    }

    /// Interval between domain id checks
    pub fn domid_poll_interval(&self) -> Duration {
        Duration::from_millis(self.domid_poll_interval_ms)
    }

    /// Bound on one guest service request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Bound on one `event.next` wait
    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs)
    }

    /// Pause after a failed event batch
    pub fn event_retry_delay(&self) -> Duration {
        Duration::from_millis(self.event_retry_delay_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is not set
    pub level: LogLevel,

    /// Log format
    pub format: LogFormat,

    /// Append to this file instead of stdout
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            format: LogFormat::Plain,
            file: None,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text
    Plain,

    /// JSON format
    Json,
}

/// Secret source specification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretSource {
    /// Direct value
    Value(String),

    /// Reference of the form `env:NAME` or `file:/path`
    Reference { from: String },
}

/// Configuration manager
pub struct ConfigManager {
    /// Current active configuration
    config: DaemonConfig,

    /// Configuration file path
    config_path: Option<String>,
}

impl ConfigManager {
    /// Creates a manager holding the default configuration
    pub fn new() -> Self {
        Self {
            config: DaemonConfig::default(),
            config_path: None,
        }
    }

    /// Loads configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.as_ref().to_string_lossy().into_owned(),
            error: e.to_string(),
        })?;

        let config: DaemonConfig =
            serde_yaml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        info!("Configuration loaded from {}", path.as_ref().display());

        Ok(Self {
            config,
            config_path: Some(path.as_ref().to_string_lossy().into_owned()),
        })
    }

    /// Saves the current configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let config_str =
            serde_yaml::to_string(&self.config).map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        fs::write(&path, config_str).map_err(|e| ConfigError::FileWriteError {
            path: path.as_ref().to_string_lossy().into_owned(),
            error: e.to_string(),
        })?;

        info!("Configuration saved to {}", path.as_ref().display());
        Ok(())
    }

    /// Validates the current configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validator::ConfigValidator::new().validate(&self.config)?;
        debug!("Configuration validated successfully");
        Ok(())
    }

    /// Gets the current configuration
    pub fn get_config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Gets a mutable handle, e.g. for command-line overrides
    pub fn get_config_mut(&mut self) -> &mut DaemonConfig {
        &mut self.config
    }

    /// Path the configuration was loaded from, if any
    pub fn config_path(&self) -> Option<&str> {
        self.config_path.as_deref()
    }

    /// Resolves the toolstack password
    pub fn control_plane_password(&self) -> Result<String, ConfigError> {
        resolve_secret_source(&self.config.control_plane.password)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves a secret source to its actual value
pub fn resolve_secret_source(source: &SecretSource) -> Result<String, ConfigError> {
    match source {
        SecretSource::Value(value) => Ok(value.clone()),
        SecretSource::Reference { from } => {
            let (source_type, source_path) = from
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidSecretReference(from.clone()))?;

            match source_type {
                "env" => std::env::var(source_path).map_err(|_| ConfigError::SecretResolutionError {
                    reference: from.clone(),
                    error: format!("Environment variable {} not found", source_path),
                }),
                "file" => fs::read_to_string(source_path)
                    .map(|s| s.trim().to_string())
                    .map_err(|e| ConfigError::SecretResolutionError {
                        reference: from.clone(),
                        error: format!("Failed to read file {}: {}", source_path, e),
                    }),
                other => Err(ConfigError::InvalidSecretSource(other.to_string())),
            }
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read configuration file {path}: {error}")]
    FileReadError {
        /// File path
        path: String,
        /// Underlying I/O error
        error: String,
    },

    /// Configuration file could not be written
    #[error("Failed to write configuration file {path}: {error}")]
    FileWriteError {
        /// File path
        path: String,
        /// Underlying I/O error
        error: String,
    },

    /// Malformed YAML
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Configuration could not be rendered as YAML
    #[error("Failed to serialize configuration: {0}")]
    SerializationError(String),

    /// A field failed validation
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Secret reference without a `source:` prefix
    #[error("Invalid secret reference: {0}")]
    InvalidSecretReference(String),

    /// Secret reference naming an unknown source
    #[error("Invalid secret source: {0}")]
    InvalidSecretSource(String),

    /// Secret source could not be read
    #[error("Failed to resolve secret {reference}: {error}")]
    SecretResolutionError {
        /// The `source:path` reference
        reference: String,
        /// What went wrong
        error: String,
    },
}
