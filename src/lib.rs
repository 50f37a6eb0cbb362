// vmchannel - Host-side daemon for isolated host-to-guest channels
//
// Licensed under the GNU General Public License v3.0

//! vmchannel maintains a private key/value channel between a virtualization
//! host and each of its guests.
//!
//! Every guest that opts in gets a dedicated interface on the host-internal
//! management network. A configuration store subtree tells the guest-resident
//! service how to bind to it, and switch rules keep guests from reaching each
//! other over that network. Key/value records then travel over HTTP to the
//! guest service. The daemon serves those operations to local callers and
//! re-establishes channels whenever guests reboot.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Per-guest channel lifecycle and record operations
pub mod channel;

/// Configuration subsystem
pub mod config;

/// Shared daemon context
pub mod context;

/// Switch rules isolating guests from each other
pub mod isolation;

/// Toolstack, configuration store and switch adapters
pub mod platform;

/// Bounded polling helpers
pub mod readiness;

/// HTTP control service
pub mod service;

/// Guest-start event loop
pub mod trigger;

#[cfg(test)]
mod testing;

// Re-export common types
pub use channel::{ChannelClient, ChannelError, ChannelRecord};
pub use config::{ConfigManager, DaemonConfig};
pub use context::DaemonContext;
pub use service::ControlService;
pub use trigger::TriggerLoop;
