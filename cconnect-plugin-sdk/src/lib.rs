//! SDK for building CConnect feature plugins.
//!
//! Plugin authors implement the [`Plugin`] trait and declare, via a
//! [`PluginBinding`], which packet types they handle and which they emit.
//! The core routes inbound packets to every enabled plugin whose binding
//! lists the packet's type, and rejects outbound packets whose type the
//! sending plugin never declared.
//!
//! The core never inspects packet bodies beyond the `type` string; body
//! semantics are entirely the plugin's.
//!
//! # Example
//!
//! ```
//! use cconnect_plugin_sdk::{Plugin, PluginBinding};
//! use cconnect_types::Packet;
//!
//! struct PingPlugin {
//!     binding: PluginBinding,
//! }
//!
//! impl PingPlugin {
//!     fn new() -> Self {
//!         Self {
//!             binding: PluginBinding::new("ping")
//!                 .with_supported(["cconnect.ping"])
//!                 .with_outgoing(["cconnect.ping"]),
//!         }
//!     }
//! }
//!
//! impl Plugin for PingPlugin {
//!     fn binding(&self) -> &PluginBinding {
//!         &self.binding
//!     }
//!
//!     fn on_packet_received(&self, _packet: &Packet) -> bool {
//!         true
//!     }
//! }
//! ```

use cconnect_types::Packet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Declares a plugin's key and the packet types it consumes and produces.
///
/// Registered once at construction; the core builds its route table from
/// these bindings when a plugin is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginBinding {
    /// Unique plugin key within a device (e.g. `"ping"`, `"clipboard"`).
    pub plugin_key: String,
    /// Packet types delivered to this plugin's handler.
    pub supported_packet_types: BTreeSet<String>,
    /// Packet types this plugin is allowed to send.
    pub outgoing_packet_types: BTreeSet<String>,
}

impl PluginBinding {
    /// Creates an empty binding for the given plugin key.
    pub fn new(plugin_key: impl Into<String>) -> Self {
        Self {
            plugin_key: plugin_key.into(),
            supported_packet_types: BTreeSet::new(),
            outgoing_packet_types: BTreeSet::new(),
        }
    }

    /// Adds packet types this plugin handles.
    pub fn with_supported<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_packet_types
            .extend(types.into_iter().map(Into::into));
        self
    }

    /// Adds packet types this plugin may send.
    pub fn with_outgoing<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outgoing_packet_types
            .extend(types.into_iter().map(Into::into));
        self
    }

    /// Whether this plugin handles the given packet type.
    pub fn handles(&self, packet_type: &str) -> bool {
        self.supported_packet_types.contains(packet_type)
    }

    /// Whether this plugin declared the given type as outgoing.
    pub fn declares_outgoing(&self, packet_type: &str) -> bool {
        self.outgoing_packet_types.contains(packet_type)
    }
}

/// A feature plugin scoped to one device.
///
/// Implementations must be thread-safe: handlers may run on any worker
/// thread, though packets from a single link arrive in order.
pub trait Plugin: Send + Sync {
    /// The plugin's packet-type binding. Must be stable for the plugin's
    /// lifetime.
    fn binding(&self) -> &PluginBinding;

    /// Called when the plugin is enabled on a device. Returning `false`
    /// aborts the enable.
    fn on_create(&self) -> bool {
        true
    }

    /// Called when the plugin is disabled or its device is torn down.
    fn on_destroy(&self) {}

    /// Handles an inbound packet whose type this plugin declared support
    /// for. Returns whether the packet was consumed; the core keeps
    /// dispatching to other matching plugins either way.
    fn on_packet_received(&self, packet: &Packet) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_membership() {
        let binding = PluginBinding::new("clipboard")
            .with_supported(["cconnect.clipboard"])
            .with_outgoing(["cconnect.clipboard", "cconnect.clipboard.connect"]);

        assert!(binding.handles("cconnect.clipboard"));
        assert!(!binding.handles("cconnect.ping"));
        assert!(binding.declares_outgoing("cconnect.clipboard.connect"));
        assert!(!binding.declares_outgoing("cconnect.ping"));
    }
}
