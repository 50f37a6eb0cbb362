// src/context.rs

//! Per-process daemon context.
//!
//! Every component receives the collaborators it talks to through a
//! [`DaemonContext`] rather than reaching for process-wide state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Body, Client};

use crate::config::{ConfigError, ConfigManager, DaemonConfig};
use crate::platform::{ConfigStore, ControlPlane, OvsSwitch, SwitchBackend, XapiClient, XenstoreCli};

/// Timing and naming knobs used by channel and isolation operations
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// How long setup waits for the guest service to come back
    pub liveness_timeout: Duration,

    /// How long a key operation waits for the guest service
    pub service_timeout: Duration,

    /// Interval between liveness checks
    pub poll_interval: Duration,

    /// How long to wait for a guest to obtain a domain id
    pub domid_timeout: Duration,

    /// Interval between domain id checks
    pub domid_poll_interval: Duration,

    /// Timeout of a single request to the guest service
    pub request_timeout: Duration,

    /// Bridge of the host-internal management network
    pub bridge: String,

    /// Root of the sysfs network class directory
    pub sysfs_net_root: PathBuf,

    /// Store root template containing `{domid}`
    pub store_root_template: String,
}

impl ChannelSettings {
    /// Derives settings from the daemon configuration
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            liveness_timeout: config.timing.setup_liveness_timeout(),
            service_timeout: config.timing.service_timeout(),
            poll_interval: config.timing.poll_interval(),
            domid_timeout: config.timing.domid_timeout(),
            domid_poll_interval: config.timing.domid_poll_interval(),
            request_timeout: config.timing.request_timeout(),
            bridge: config.network.bridge.clone(),
            sysfs_net_root: config.network.sysfs_net_root.clone(),
            store_root_template: config.store.root_template.clone(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

/// Collaborator handles shared by every operation in the process
pub struct DaemonContext {
    /// Toolstack API
    pub control: Arc<dyn ControlPlane>,

    /// Per-domain configuration store
    pub store: Arc<dyn ConfigStore>,

    /// Virtual switch flow table
    pub switch: Arc<dyn SwitchBackend>,

    /// Timing and naming settings
    pub settings: ChannelSettings,

    /// HTTP client used to reach guest services
    pub http: Client<HttpConnector, Body>,
}

impl DaemonContext {
    /// Assembles a context from explicit collaborators
    pub fn new(
        control: Arc<dyn ControlPlane>,
        store: Arc<dyn ConfigStore>,
        switch: Arc<dyn SwitchBackend>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            control,
            store,
            switch,
            settings,
            http: Client::new(),
        }
    }

    /// Builds the production context: toolstack over its local socket,
    /// xenstore tools, and Open vSwitch.
    pub fn from_config(manager: &ConfigManager) -> Result<Self, ConfigError> {
        let config = manager.get_config();
        let password = manager.control_plane_password()?;

        let control = XapiClient::new(
            &config.control_plane.socket_path,
            &config.control_plane.username,
            password,
            config.timing.request_timeout(),
            config.timing.event_timeout(),
        );
        let store = XenstoreCli::new(&config.store.tool_dir);
        let switch = OvsSwitch::new(&config.network.ovs_ofctl);

        Ok(Self::new(
            Arc::new(control),
            Arc::new(store),
            Arc::new(switch),
            ChannelSettings::from_config(config),
        ))
    }
}
