// src/platform/mod.rs

//! Host collaborators consumed by the daemon.
//!
//! Everything the channel manager needs from the host sits behind one of
//! three narrow traits: [`ControlPlane`] (the toolstack API),
//! [`store::ConfigStore`] (the per-domain configuration store) and
//! [`switch::SwitchBackend`] (the virtual switch). The concrete adapters in
//! this module carry no policy of their own.

/// Host tool invocation
pub mod command;
/// Host inventory file
pub mod inventory;
/// Per-domain configuration store
pub mod store;
/// Virtual switch flow programming
pub mod switch;
/// Toolstack JSON-RPC client
pub mod xapi;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Re-exports
pub use store::{ConfigStore, StoreError, XenstoreCli};
pub use switch::{FlowAction, FlowRule, OvsSwitch, SwitchBackend, SwitchError};
pub use xapi::XapiClient;

/// Key/value annotations attached to toolstack objects
pub type OtherConfig = HashMap<String, String>;

/// Domain id reported for a guest that is not currently running
pub const DOMID_NOT_RUNNING: i64 = -1;

/// Opaque reference to a toolstack object (`OpaqueRef:...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(String);

impl ObjectRef {
    /// Wraps a raw reference string
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw reference string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Guest record as returned by the toolstack
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmRecord {
    /// Stable guest identifier
    #[serde(default)]
    pub uuid: String,

    /// Free-form guest annotations
    #[serde(default)]
    pub other_config: OtherConfig,

    /// Whether the record describes a snapshot rather than a live guest
    #[serde(default)]
    pub is_a_snapshot: bool,

    /// Power state, e.g. `Running` or `Halted`
    #[serde(default)]
    pub power_state: String,

    /// Reference to the guest's metrics object
    #[serde(default, rename = "metrics")]
    pub metrics: Option<ObjectRef>,

    /// Host the guest currently runs on
    #[serde(default)]
    pub resident_on: Option<ObjectRef>,
}

impl VmRecord {
    /// Returns true when the power state reads as running
    pub fn is_running(&self) -> bool {
        self.power_state.eq_ignore_ascii_case("running")
    }
}

/// Virtual interface record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VifRecord {
    /// Device index within the guest, as a decimal string
    #[serde(default)]
    pub device: String,

    /// MAC address assigned to the interface
    #[serde(default, rename = "MAC")]
    pub mac: String,

    /// Network the interface is attached to
    #[serde(default)]
    pub network: Option<ObjectRef>,

    /// Owning guest
    #[serde(default, rename = "VM")]
    pub vm: Option<ObjectRef>,

    /// Interface annotations
    #[serde(default)]
    pub other_config: OtherConfig,
}

/// Parameters for creating a virtual interface
#[derive(Debug, Clone, Serialize)]
pub struct VifSpec {
    /// Device index within the guest
    pub device: String,

    /// Network to attach to
    pub network: ObjectRef,

    /// Owning guest
    #[serde(rename = "VM")]
    pub vm: ObjectRef,

    /// Requested MAC; empty lets the toolstack generate one
    #[serde(rename = "MAC")]
    pub mac: String,

    /// Interface MTU
    #[serde(rename = "MTU")]
    pub mtu: String,

    /// Interface annotations
    pub other_config: OtherConfig,

    /// QoS algorithm, empty for none
    pub qos_algorithm_type: String,

    /// QoS parameters
    pub qos_algorithm_params: HashMap<String, String>,
}

/// Network record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRecord {
    /// Bridge backing the network
    #[serde(default)]
    pub bridge: String,

    /// Network annotations
    #[serde(default)]
    pub other_config: OtherConfig,
}

/// Guest metrics record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmMetricsRecord {
    /// Start time as rendered by the toolstack
    #[serde(default)]
    pub start_time: serde_json::Value,
}

/// A single change event delivered by the toolstack
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEvent {
    /// Object class, e.g. `vm_metrics`
    #[serde(default)]
    pub class: String,

    /// `add`, `mod` or `del`
    #[serde(default)]
    pub operation: String,

    /// Reference of the changed object
    #[serde(rename = "ref")]
    pub object: ObjectRef,

    /// Object record after the change, if any
    #[serde(default)]
    pub snapshot: Option<serde_json::Value>,
}

/// Narrow view of the virtualization toolstack
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Looks up a guest by UUID
    async fn vm_by_uuid(&self, uuid: &str) -> Result<ObjectRef, ControlError>;

    /// Returns every guest record
    async fn vm_records(&self) -> Result<HashMap<ObjectRef, VmRecord>, ControlError>;

    /// Returns a single guest record
    async fn vm_record(&self, vm: &ObjectRef) -> Result<VmRecord, ControlError>;

    /// Returns the current domain id, `-1` when not running
    async fn vm_domid(&self, vm: &ObjectRef) -> Result<i64, ControlError>;

    /// Lists the guest's virtual interfaces
    async fn vm_vifs(&self, vm: &ObjectRef) -> Result<Vec<ObjectRef>, ControlError>;

    /// Reads guest annotations
    async fn vm_other_config(&self, vm: &ObjectRef) -> Result<OtherConfig, ControlError>;

    /// Adds one annotation; fails with `MAP_DUPLICATE_KEY` if present
    async fn vm_add_to_other_config(
        &self,
        vm: &ObjectRef,
        key: &str,
        value: &str,
    ) -> Result<(), ControlError>;

    /// Removes one annotation; absent keys are not an error
    async fn vm_remove_from_other_config(&self, vm: &ObjectRef, key: &str) -> Result<(), ControlError>;

    /// Reads the boot-time configuration store data
    async fn vm_xenstore_data(&self, vm: &ObjectRef) -> Result<OtherConfig, ControlError>;

    /// Replaces the boot-time configuration store data
    async fn vm_set_xenstore_data(&self, vm: &ObjectRef, data: OtherConfig) -> Result<(), ControlError>;

    /// Host the guest is resident on
    async fn vm_resident_on(&self, vm: &ObjectRef) -> Result<ObjectRef, ControlError>;

    /// Reads a virtual interface record
    async fn vif_record(&self, vif: &ObjectRef) -> Result<VifRecord, ControlError>;

    /// Creates a virtual interface
    async fn vif_create(&self, spec: VifSpec) -> Result<ObjectRef, ControlError>;

    /// Hot-plugs a virtual interface
    async fn vif_plug(&self, vif: &ObjectRef) -> Result<(), ControlError>;

    /// Hot-unplugs a virtual interface
    async fn vif_unplug(&self, vif: &ObjectRef) -> Result<(), ControlError>;

    /// Destroys a virtual interface
    async fn vif_destroy(&self, vif: &ObjectRef) -> Result<(), ControlError>;

    /// Returns every network record
    async fn network_records(&self) -> Result<HashMap<ObjectRef, NetworkRecord>, ControlError>;

    /// Looks up a host by UUID
    async fn host_by_uuid(&self, uuid: &str) -> Result<ObjectRef, ControlError>;

    /// Returns every guest metrics record
    async fn vm_metrics_records(&self) -> Result<HashMap<ObjectRef, VmMetricsRecord>, ControlError>;

    /// Subscribes the session to the given event classes
    async fn event_register(&self, classes: &[&str]) -> Result<(), ControlError>;

    /// Blocks until the next batch of events is available
    async fn event_next(&self) -> Result<Vec<ObjectEvent>, ControlError>;
}

/// Finds the host-internal management network bridged on `bridge`.
///
/// Pooled hosts may expose more than one network flagged as host-internal;
/// matching on the bridge name keeps every host on the same one.
pub async fn internal_management_network(
    control: &dyn ControlPlane,
    bridge: &str,
) -> Result<ObjectRef, ControlError> {
    let networks = control.network_records().await?;

    let mut candidates: Vec<_> = networks
        .into_iter()
        .filter(|(_, rec)| {
            rec.other_config.contains_key("is_host_internal_management_network") && rec.bridge == bridge
        })
        .map(|(net, _)| net)
        .collect();
    candidates.sort();

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ControlError::NotFound(format!("host internal management network on bridge {}", bridge)))
}

/// Error raised by toolstack calls
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    /// Failure reported by the toolstack
    #[error("Toolstack API failure {code}: {params:?}")]
    Api {
        /// Failure code, e.g. `HANDLE_INVALID`
        code: String,
        /// Parameters following the code
        params: Vec<String>,
    },

    /// Socket or HTTP failure
    #[error("Toolstack transport error: {0}")]
    Transport(String),

    /// Response did not match the expected shape
    #[error("Failed to decode toolstack response: {0}")]
    Decode(String),

    /// Lookup without a match
    #[error("Not found: {0}")]
    NotFound(String),

    /// Call exceeded its bound
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl ControlError {
    /// Returns true when this is an API failure with the given code
    pub fn is_code(&self, expected: &str) -> bool {
        matches!(self, ControlError::Api { code, .. } if code == expected)
    }
}

/// Toolstack failure code for a reference that does not name a live object
pub const HANDLE_INVALID: &str = "HANDLE_INVALID";

/// Toolstack failure code for adding an annotation that already exists
pub const MAP_DUPLICATE_KEY: &str = "MAP_DUPLICATE_KEY";
