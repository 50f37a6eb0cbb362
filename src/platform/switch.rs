// src/platform/switch.rs

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::command::{run_tool, CommandError};

static PORT_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"port\s+(\d+):").expect("static regex"));

/// Where matched traffic is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    /// Deliver to the host's own bridge interface
    Local,

    /// Forward to the given switch port
    Output(u32),
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAction::Local => f.write_str("local"),
            FlowAction::Output(port) => write!(f, "output:{}", port),
        }
    }
}

/// A single permitted flow between two MAC endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    /// Source MAC match
    pub src_mac: String,

    /// Destination MAC match
    pub dst_mac: String,

    /// What to do with matching frames
    pub action: FlowAction,
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dl_src={} dl_dst={} actions={}", self.src_mac, self.dst_mac, self.action)
    }
}

/// Flow-table capability of a virtual switch
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwitchBackend: Send + Sync {
    /// Resolves the port number of a named interface on a bridge
    async fn port_number(&self, bridge: &str, iface: &str) -> Result<u32, SwitchError>;

    /// Deletes every flow rule on a bridge
    async fn clear_rules(&self, bridge: &str) -> Result<(), SwitchError>;

    /// Installs one flow rule on a bridge
    async fn add_rule(&self, bridge: &str, rule: &FlowRule) -> Result<(), SwitchError>;
}

/// Open vSwitch, driven through `ovs-ofctl`
#[derive(Debug, Clone)]
pub struct OvsSwitch {
    ofctl: PathBuf,
}

impl OvsSwitch {
    /// Uses the given `ovs-ofctl` binary
    pub fn new(ofctl: impl Into<PathBuf>) -> Self {
        Self { ofctl: ofctl.into() }
    }
}

#[async_trait]
impl SwitchBackend for OvsSwitch {
    async fn port_number(&self, bridge: &str, iface: &str) -> Result<u32, SwitchError> {
        let out = run_tool(&self.ofctl, &["dump-ports", bridge, iface]).await?;
        parse_port_number(&out).ok_or_else(|| SwitchError::PortNotFound {
            iface: iface.to_string(),
            output: out,
        })
    }

    async fn clear_rules(&self, bridge: &str) -> Result<(), SwitchError> {
        debug!(bridge = %bridge, "deleting all flows");
        run_tool(&self.ofctl, &["del-flows", bridge]).await?;
        Ok(())
    }

    async fn add_rule(&self, bridge: &str, rule: &FlowRule) -> Result<(), SwitchError> {
        let rendered = rule.to_string();
        debug!(bridge = %bridge, rule = %rendered, "adding flow");
        run_tool(&self.ofctl, &["add-flow", bridge, rendered.as_str()]).await?;
        Ok(())
    }
}

/// Extracts the port number from `ovs-ofctl dump-ports` output
pub fn parse_port_number(output: &str) -> Option<u32> {
    PORT_NUMBER
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Reads a bridge's MAC address from sysfs.
///
/// Returns `None` while the bridge is not visible yet, which is normal
/// early in host boot.
pub async fn bridge_mac(sysfs_net_root: &Path, bridge: &str) -> Option<String> {
    let path = sysfs_net_root.join(bridge).join("address");
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let mac = contents.trim().to_string();
            if mac.is_empty() {
                None
            } else {
                Some(mac)
            }
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "bridge MAC not available");
            None
        }
    }
}

/// Error raised by switch programming
#[derive(Error, Debug, Clone)]
pub enum SwitchError {
    /// Interface absent from the bridge
    #[error("Cannot find port number for {iface}: {output}")]
    PortNotFound {
        /// Interface name
        iface: String,
        /// Tool output that was searched
        output: String,
    },

    /// `ovs-ofctl` failed
    #[error("Switch tool failed: {0}")]
    Tool(#[from] CommandError),
}
