// src/testing.rs

//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::context::{ChannelSettings, DaemonContext};
use crate::platform::store::{keys, ConfigStore, StoreError};
use crate::platform::switch::{FlowRule, SwitchBackend, SwitchError};
use crate::platform::{
    ControlError, ControlPlane, NetworkRecord, ObjectEvent, ObjectRef, OtherConfig, VifRecord, VifSpec,
    VmMetricsRecord, VmRecord, HANDLE_INVALID, MAP_DUPLICATE_KEY,
};

pub const INTERNAL_NETWORK: &str = "OpaqueRef:net-internal";
pub const LOCAL_HOST: &str = "OpaqueRef:host-local";
pub const LOCAL_HOST_UUID: &str = "host-local-uuid";
pub const REMOTE_HOST: &str = "OpaqueRef:host-remote";
pub const BOOT_TIME: &str = "20240101T00:00:00Z";
pub const BRIDGE_MAC: &str = "fe:ff:ff:ff:ff:ff";

/// A guest known to the fake toolstack
#[derive(Debug, Clone)]
pub struct FakeVm {
    pub record: VmRecord,
    pub domid: i64,
    pub vifs: Vec<ObjectRef>,
    pub xenstore_data: OtherConfig,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub vms: BTreeMap<ObjectRef, FakeVm>,
    pub vifs: BTreeMap<ObjectRef, VifRecord>,
    pub networks: HashMap<ObjectRef, NetworkRecord>,
    pub metrics: HashMap<ObjectRef, VmMetricsRecord>,
    pub hosts: HashMap<String, ObjectRef>,
    /// Pending `event.next` results; an error carries its failure code
    pub events: VecDeque<Result<Vec<ObjectEvent>, String>>,
    pub registered: Vec<String>,
    pub vif_creates: usize,
    next_id: u64,
}

impl FakeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn vm(&mut self, vm: &ObjectRef) -> Result<&mut FakeVm, ControlError> {
        self.vms.get_mut(vm).ok_or_else(|| handle_invalid(vm))
    }
}

fn handle_invalid(object: &ObjectRef) -> ControlError {
    ControlError::Api {
        code: HANDLE_INVALID.to_string(),
        params: vec![object.to_string()],
    }
}

/// Toolstack double holding every object in memory
pub struct FakeControl {
    state: Mutex<FakeState>,
}

impl FakeControl {
    /// A host with the internal management network and one decoy network
    pub fn new() -> Self {
        let mut state = FakeState::default();
        state.networks.insert(
            ObjectRef::new(INTERNAL_NETWORK),
            NetworkRecord {
                bridge: "xenapi".to_string(),
                other_config: HashMap::from([("is_host_internal_management_network".to_string(), "true".to_string())]),
            },
        );
        state.networks.insert(
            ObjectRef::new("OpaqueRef:net-guest"),
            NetworkRecord {
                bridge: "xenbr0".to_string(),
                other_config: HashMap::new(),
            },
        );
        state.hosts.insert(LOCAL_HOST_UUID.to_string(), ObjectRef::new(LOCAL_HOST));

        Self {
            state: Mutex::new(state),
        }
    }

    /// Runs `f` with exclusive access to the fake's state
    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Adds a running guest resident on the local host
    pub fn add_vm(&self, uuid: &str, domid: i64) -> ObjectRef {
        self.with(|state| {
            let vm = ObjectRef::new(format!("OpaqueRef:vm-{}", uuid));
            let metrics = ObjectRef::new(format!("OpaqueRef:metrics-{}", uuid));
            state.metrics.insert(
                metrics.clone(),
                VmMetricsRecord {
                    start_time: json!(BOOT_TIME),
                },
            );
            state.vms.insert(
                vm.clone(),
                FakeVm {
                    record: VmRecord {
                        uuid: uuid.to_string(),
                        other_config: HashMap::new(),
                        is_a_snapshot: false,
                        power_state: "Running".to_string(),
                        metrics: Some(metrics),
                        resident_on: Some(ObjectRef::new(LOCAL_HOST)),
                    },
                    domid,
                    vifs: Vec::new(),
                    xenstore_data: HashMap::new(),
                },
            );
            vm
        })
    }

    /// Attaches an interface to a guest, optionally carrying the channel tag
    pub fn add_vif(&self, vm: &ObjectRef, network: &str, mac: &str, tagged: bool) -> ObjectRef {
        self.with(|state| {
            let vif = ObjectRef::new(format!("OpaqueRef:vif-{}", state.next_id()));
            let fake = state.vms.get_mut(vm).expect("unknown vm");
            let device = fake.vifs.len().to_string();
            fake.vifs.push(vif.clone());
            let mut other_config = HashMap::new();
            if tagged {
                other_config.insert(crate::channel::CHANNEL_TAG.to_string(), "true".to_string());
            }
            state.vifs.insert(
                vif.clone(),
                VifRecord {
                    device,
                    mac: mac.to_string(),
                    network: Some(ObjectRef::new(network)),
                    vm: Some(vm.clone()),
                    other_config,
                },
            );
            vif
        })
    }

    pub fn set_tag(&self, vm: &ObjectRef, tag: &str) {
        self.with(|state| {
            let fake = state.vms.get_mut(vm).expect("unknown vm");
            fake.record.other_config.insert(tag.to_string(), "true".to_string());
        })
    }

    pub fn has_tag(&self, vm: &ObjectRef, tag: &str) -> bool {
        self.with(|state| state.vms[vm].record.other_config.contains_key(tag))
    }

    /// Interfaces of `vm` carrying the channel tag
    pub fn management_vifs(&self, vm: &ObjectRef) -> Vec<VifRecord> {
        self.with(|state| {
            state.vms[vm]
                .vifs
                .iter()
                .map(|vif| state.vifs[vif].clone())
                .filter(|rec| rec.other_config.contains_key(crate::channel::CHANNEL_TAG))
                .collect()
        })
    }

    pub fn xenstore_data(&self, vm: &ObjectRef) -> OtherConfig {
        self.with(|state| state.vms[vm].xenstore_data.clone())
    }

    pub fn vif_creates(&self) -> usize {
        self.with(|state| state.vif_creates)
    }

    pub fn push_events(&self, batch: Vec<ObjectEvent>) {
        self.with(|state| state.events.push_back(Ok(batch)))
    }

    /// Makes the next `event.next` call fail with `code`
    pub fn push_event_failure(&self, code: &str) {
        self.with(|state| state.events.push_back(Err(code.to_string())))
    }
}

#[async_trait]
impl ControlPlane for FakeControl {
    async fn vm_by_uuid(&self, uuid: &str) -> Result<ObjectRef, ControlError> {
        self.with(|state| {
            state
                .vms
                .iter()
                .find(|(_, vm)| vm.record.uuid == uuid)
                .map(|(vm, _)| vm.clone())
                .ok_or_else(|| ControlError::Api {
                    code: "UUID_INVALID".to_string(),
                    params: vec!["VM".to_string(), uuid.to_string()],
                })
        })
    }

    async fn vm_records(&self) -> Result<HashMap<ObjectRef, VmRecord>, ControlError> {
        self.with(|state| Ok(state.vms.iter().map(|(vm, fake)| (vm.clone(), fake.record.clone())).collect()))
    }

    async fn vm_record(&self, vm: &ObjectRef) -> Result<VmRecord, ControlError> {
        self.with(|state| Ok(state.vm(vm)?.record.clone()))
    }

    async fn vm_domid(&self, vm: &ObjectRef) -> Result<i64, ControlError> {
        self.with(|state| Ok(state.vm(vm)?.domid))
    }

    async fn vm_vifs(&self, vm: &ObjectRef) -> Result<Vec<ObjectRef>, ControlError> {
        self.with(|state| Ok(state.vm(vm)?.vifs.clone()))
    }

    async fn vm_other_config(&self, vm: &ObjectRef) -> Result<OtherConfig, ControlError> {
        self.with(|state| Ok(state.vm(vm)?.record.other_config.clone()))
    }

    async fn vm_add_to_other_config(&self, vm: &ObjectRef, key: &str, value: &str) -> Result<(), ControlError> {
        self.with(|state| {
            let other_config = &mut state.vm(vm)?.record.other_config;
            if other_config.contains_key(key) {
                return Err(ControlError::Api {
                    code: MAP_DUPLICATE_KEY.to_string(),
                    params: vec![key.to_string()],
                });
            }
            other_config.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn vm_remove_from_other_config(&self, vm: &ObjectRef, key: &str) -> Result<(), ControlError> {
        self.with(|state| {
            state.vm(vm)?.record.other_config.remove(key);
            Ok(())
        })
    }

    async fn vm_xenstore_data(&self, vm: &ObjectRef) -> Result<OtherConfig, ControlError> {
        self.with(|state| Ok(state.vm(vm)?.xenstore_data.clone()))
    }

    async fn vm_set_xenstore_data(&self, vm: &ObjectRef, data: OtherConfig) -> Result<(), ControlError> {
        self.with(|state| {
            state.vm(vm)?.xenstore_data = data;
            Ok(())
        })
    }

    async fn vm_resident_on(&self, vm: &ObjectRef) -> Result<ObjectRef, ControlError> {
        self.with(|state| {
            state
                .vm(vm)?
                .record
                .resident_on
                .clone()
                .ok_or_else(|| ControlError::NotFound(format!("{} is not resident", vm)))
        })
    }

    async fn vif_record(&self, vif: &ObjectRef) -> Result<VifRecord, ControlError> {
        self.with(|state| state.vifs.get(vif).cloned().ok_or_else(|| handle_invalid(vif)))
    }

    async fn vif_create(&self, spec: VifSpec) -> Result<ObjectRef, ControlError> {
        self.with(|state| {
            let id = state.next_id();
            let vif = ObjectRef::new(format!("OpaqueRef:vif-{}", id));
            let mac = if spec.mac.is_empty() {
                format!("02:00:00:00:{:02x}:{:02x}", id / 256, id % 256)
            } else {
                spec.mac.clone()
            };

            state.vm(&spec.vm)?.vifs.push(vif.clone());
            state.vifs.insert(
                vif.clone(),
                VifRecord {
                    device: spec.device,
                    mac,
                    network: Some(spec.network),
                    vm: Some(spec.vm),
                    other_config: spec.other_config,
                },
            );
            state.vif_creates += 1;
            Ok(vif)
        })
    }

    async fn vif_plug(&self, vif: &ObjectRef) -> Result<(), ControlError> {
        self.with(|state| state.vifs.get(vif).map(|_| ()).ok_or_else(|| handle_invalid(vif)))
    }

    async fn vif_unplug(&self, vif: &ObjectRef) -> Result<(), ControlError> {
        self.with(|state| state.vifs.get(vif).map(|_| ()).ok_or_else(|| handle_invalid(vif)))
    }

    async fn vif_destroy(&self, vif: &ObjectRef) -> Result<(), ControlError> {
        self.with(|state| {
            let record = state.vifs.remove(vif).ok_or_else(|| handle_invalid(vif))?;
            if let Some(owner) = record.vm {
                if let Some(fake) = state.vms.get_mut(&owner) {
                    fake.vifs.retain(|v| v != vif);
                }
            }
            Ok(())
        })
    }

    async fn network_records(&self) -> Result<HashMap<ObjectRef, NetworkRecord>, ControlError> {
        self.with(|state| Ok(state.networks.clone()))
    }

    async fn host_by_uuid(&self, uuid: &str) -> Result<ObjectRef, ControlError> {
        self.with(|state| {
            state
                .hosts
                .get(uuid)
                .cloned()
                .ok_or_else(|| ControlError::NotFound(format!("host {}", uuid)))
        })
    }

    async fn vm_metrics_records(&self) -> Result<HashMap<ObjectRef, VmMetricsRecord>, ControlError> {
        self.with(|state| Ok(state.metrics.clone()))
    }

    async fn event_register(&self, classes: &[&str]) -> Result<(), ControlError> {
        self.with(|state| state.registered.extend(classes.iter().map(|c| c.to_string())));
        Ok(())
    }

    async fn event_next(&self) -> Result<Vec<ObjectEvent>, ControlError> {
        match self.with(|state| state.events.pop_front()) {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(code)) => Err(ControlError::Api { code, params: Vec::new() }),
            None => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Behaviour of the simulated guest service
#[derive(Debug, Clone)]
pub struct FakeGuest {
    /// Address the guest publishes as `daemon-ip`
    pub daemon_ip: String,

    /// Whether the guest answers restart requests
    pub responsive: bool,

    /// Password generation, bumped on every restart
    pub generation: u32,
}

/// Configuration store double with a simulated guest service
pub struct FakeStore {
    entries: Mutex<BTreeMap<String, String>>,
    guest: Mutex<FakeGuest>,
    chmods: Mutex<Vec<(String, String)>>,
}

impl FakeStore {
    pub fn new(daemon_ip: &str) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            guest: Mutex::new(FakeGuest {
                daemon_ip: daemon_ip.to_string(),
                responsive: true,
                generation: 0,
            }),
            chmods: Mutex::new(Vec::new()),
        }
    }

    /// A store whose guest never acknowledges restarts
    pub fn unresponsive(daemon_ip: &str) -> Self {
        let store = Self::new(daemon_ip);
        store.guest.lock().unwrap().responsive = false;
        store
    }

    /// Publishes fresh credentials below `root` as a restarted guest would
    pub fn publish(&self, root: &str) {
        let generation = {
            let mut guest = self.guest.lock().unwrap();
            guest.generation += 1;
            guest.generation
        };
        let daemon_ip = self.guest.lock().unwrap().daemon_ip.clone();

        let mut entries = self.entries.lock().unwrap();
        let mut put = |rel: &str, value: String| {
            entries.insert(format!("{}/{}", root, rel), value);
        };
        put(keys::USERNAME, "admin".to_string());
        put(keys::PASSWORD, format!("pw-{}", generation));
        put(keys::DAEMON_IP, daemon_ip);
        put(keys::DAEMON_STATUS, "0".to_string());
        put(keys::RESTART, "0".to_string());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.entries.lock().unwrap().get(path).cloned()
    }

    pub fn generation(&self) -> u32 {
        self.guest.lock().unwrap().generation
    }

    pub fn chmods(&self) -> Vec<(String, String)> {
        self.chmods.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigStore for FakeStore {
    async fn read(&self, path: &str) -> Result<String, StoreError> {
        self.get(path).ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().insert(path.to_string(), value.to_string());

        let restart_suffix = format!("/{}", keys::RESTART);
        if value == "1" && self.guest.lock().unwrap().responsive {
            if let Some(root) = path.strip_suffix(&restart_suffix) {
                self.publish(root);
            }
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let prefix = format!("{}/", path);
        let before = entries.len();
        entries.retain(|k, _| k != path && !k.starts_with(&prefix));
        if entries.len() == before {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(())
    }

    async fn chmod(&self, path: &str, perms: &str) -> Result<(), StoreError> {
        self.chmods.lock().unwrap().push((path.to_string(), perms.to_string()));
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<String, StoreError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(path))
            .map(|(k, v)| format!("{} = \"{}\"", k, v))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Switch double recording every programmed rule
pub struct RecordingSwitch {
    ports: HashMap<String, u32>,
    rules: Mutex<Vec<FlowRule>>,
    clears: AtomicUsize,
}

impl RecordingSwitch {
    pub fn new(ports: HashMap<String, u32>) -> Self {
        Self {
            ports,
            rules: Mutex::new(Vec::new()),
            clears: AtomicUsize::new(0),
        }
    }

    pub fn rules(&self) -> Vec<FlowRule> {
        self.rules.lock().unwrap().clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwitchBackend for RecordingSwitch {
    async fn port_number(&self, _bridge: &str, iface: &str) -> Result<u32, SwitchError> {
        self.ports.get(iface).copied().ok_or_else(|| SwitchError::PortNotFound {
            iface: iface.to_string(),
            output: String::new(),
        })
    }

    async fn clear_rules(&self, _bridge: &str) -> Result<(), SwitchError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.rules.lock().unwrap().clear();
        Ok(())
    }

    async fn add_rule(&self, _bridge: &str, rule: &FlowRule) -> Result<(), SwitchError> {
        self.rules.lock().unwrap().push(rule.clone());
        Ok(())
    }
}

/// Settings with short timeouts so failing waits end quickly
pub fn fast_settings(sysfs_net_root: &Path) -> ChannelSettings {
    ChannelSettings {
        liveness_timeout: Duration::from_millis(500),
        service_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
        domid_timeout: Duration::from_millis(200),
        domid_poll_interval: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
        bridge: "xenapi".to_string(),
        sysfs_net_root: sysfs_net_root.to_path_buf(),
        store_root_template: "/local/domain/{domid}/vm-data/channel".to_string(),
    }
}

/// Writes a sysfs tree exposing the `xenapi` bridge MAC
pub fn sysfs_with_bridge() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("xenapi")).unwrap();
    std::fs::write(dir.path().join("xenapi/address"), format!("{}\n", BRIDGE_MAC)).unwrap();
    dir
}

/// Assembles a context around the given doubles
pub fn context(
    control: Arc<FakeControl>,
    store: Arc<FakeStore>,
    switch: Arc<dyn SwitchBackend>,
    sysfs_net_root: &Path,
) -> Arc<DaemonContext> {
    Arc::new(DaemonContext::new(control, store, switch, fast_settings(sysfs_net_root)))
}

/// Store root of a domain under the default template
pub fn store_root(domid: i64) -> String {
    format!("/local/domain/{}/vm-data/channel", domid)
}
