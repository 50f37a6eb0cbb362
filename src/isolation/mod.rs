// src/isolation/mod.rs

//! Host-only traffic rules for the internal management network.
//!
//! Every refresh recomputes the complete rule set from the toolstack's
//! current view: each running, channel-enabled guest may talk to the host
//! bridge and the host bridge may talk back. Nothing else is installed, so
//! guests never reach each other over the management network.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::channel::CHANNEL_TAG;
use crate::context::DaemonContext;
use crate::platform::switch::bridge_mac;
use crate::platform::{
    internal_management_network, ControlError, FlowAction, FlowRule, ObjectRef, SwitchError, VmRecord,
    DOMID_NOT_RUNNING,
};
use crate::readiness::poll_for;

/// Selects the guests whose management interfaces get rules
pub type GuestFilter = Arc<dyn Fn(&VmRecord) -> bool + Send + Sync>;

/// Channel-enabled, running, and not a snapshot
pub fn default_filter(record: &VmRecord) -> bool {
    record.other_config.contains_key(CHANNEL_TAG) && !record.is_a_snapshot && record.is_running()
}

/// Receiving end of a traffic path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// The host's own bridge interface
    Host,

    /// A guest interface, identified for port lookup
    Guest {
        /// Owning guest
        vm: ObjectRef,
        /// Interface device number
        device: String,
    },
}

/// One permitted direction of traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficPath {
    /// Sender MAC
    pub src_mac: String,

    /// Receiver MAC
    pub dst_mac: String,

    /// Receiver, resolved to a port when compiled
    pub dst: Endpoint,
}

impl fmt::Display for TrafficPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src_mac, self.dst_mac)
    }
}

/// Compiles and installs the isolation rules
pub struct IsolationRules {
    ctx: Arc<DaemonContext>,
    filter: GuestFilter,
}

impl IsolationRules {
    /// Rules for channel-enabled running guests
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self::with_filter(ctx, Arc::new(default_filter))
    }

    /// Rules for the guests selected by `filter`
    pub fn with_filter(ctx: Arc<DaemonContext>, filter: GuestFilter) -> Self {
        Self { ctx, filter }
    }

    /// Recomputes and installs the full rule set.
    ///
    /// `started` names the guests whose start prompted the refresh and is
    /// only used for logging; the rule set always covers every guest.
    /// Returns the installed rules, or an empty set when the bridge is not
    /// up yet and nothing was touched.
    #[instrument(skip_all, fields(bridge = %self.ctx.settings.bridge))]
    pub async fn refresh(&self, started: &[ObjectRef]) -> Result<Vec<FlowRule>, IsolationError> {
        let settings = &self.ctx.settings;
        debug!(started = ?started, "refreshing isolation rules");

        let host_mac = match bridge_mac(&settings.sysfs_net_root, &settings.bridge).await {
            Some(mac) => mac,
            None => {
                warn!("bridge MAC unavailable, skipping rule refresh");
                return Ok(Vec::new());
            }
        };

        let paths = self.traffic_paths(&host_mac).await?;
        let mut rules = Vec::with_capacity(paths.len());
        for path in &paths {
            rules.push(self.compile(path).await?);
        }

        if rules.is_empty() {
            debug!("no traffic paths, clearing stale rules");
        }

        let switch = &self.ctx.switch;
        switch.clear_rules(&settings.bridge).await?;
        for rule in &rules {
            switch.add_rule(&settings.bridge, rule).await?;
        }

        info!(rules = rules.len(), "installed isolation rules");
        Ok(rules)
    }

    /// Both directions between the host and every selected guest interface
    /// on the management network
    pub async fn traffic_paths(&self, host_mac: &str) -> Result<Vec<TrafficPath>, IsolationError> {
        let control = self.ctx.control.as_ref();
        let network = internal_management_network(control, &self.ctx.settings.bridge).await?;

        let mut records: Vec<_> = control.vm_records().await?.into_iter().collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));

        let mut paths = Vec::new();
        for (vm, record) in records.into_iter().filter(|(_, rec)| (self.filter)(rec)) {
            for vif in control.vm_vifs(&vm).await? {
                let vif = control.vif_record(&vif).await?;
                if vif.network.as_ref() != Some(&network) {
                    continue;
                }

                debug!(vm = %vm, uuid = %record.uuid, mac = %vif.mac, "adding traffic paths");
                paths.push(TrafficPath {
                    src_mac: vif.mac.clone(),
                    dst_mac: host_mac.to_string(),
                    dst: Endpoint::Host,
                });
                paths.push(TrafficPath {
                    src_mac: host_mac.to_string(),
                    dst_mac: vif.mac,
                    dst: Endpoint::Guest {
                        vm: vm.clone(),
                        device: vif.device,
                    },
                });
            }
        }

        Ok(paths)
    }

    async fn compile(&self, path: &TrafficPath) -> Result<FlowRule, IsolationError> {
        let action = match &path.dst {
            Endpoint::Host => FlowAction::Local,
            Endpoint::Guest { vm, device } => {
                let domid = self.wait_for_domid(vm).await?;
                let iface = format!("vif{}.{}", domid, device);
                let port = self.ctx.switch.port_number(&self.ctx.settings.bridge, &iface).await?;
                FlowAction::Output(port)
            }
        };

        Ok(FlowRule {
            src_mac: path.src_mac.clone(),
            dst_mac: path.dst_mac.clone(),
            action,
        })
    }

    async fn wait_for_domid(&self, vm: &ObjectRef) -> Result<i64, IsolationError> {
        let control = self.ctx.control.as_ref();
        let settings = &self.ctx.settings;

        poll_for(settings.domid_timeout, settings.domid_poll_interval, || async {
            match control.vm_domid(vm).await {
                Ok(domid) if domid != DOMID_NOT_RUNNING => Some(domid),
                Ok(_) => None,
                Err(e) => {
                    warn!(vm = %vm, error = %e, "failed to read domain id");
                    None
                }
            }
        })
        .await
        .ok_or_else(|| IsolationError::NoDomid(vm.to_string()))
    }
}

/// Error raised while refreshing isolation rules
#[derive(Error, Debug)]
pub enum IsolationError {
    /// Destination guest never obtained a domain id
    #[error("Guest {0} has no domain id")]
    NoDomid(String),

    /// Toolstack failure
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Switch programming failure
    #[error(transparent)]
    Switch(#[from] SwitchError),
}
