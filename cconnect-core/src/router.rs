//! Packet-type to plugin dispatch, scoped to one device.
//!
//! The route table is rebuilt when a plugin is enabled or disabled and read
//! through a copy-on-write snapshot: dispatch clones the current `Arc` and
//! never holds the lock while handlers run, so a configuration change can
//! land while a link thread is mid-dispatch. A briefly stale snapshot is
//! acceptable; a lost update is not.

use crate::error::{CoreError, CoreResult};
use cconnect_plugin_sdk::Plugin;
use cconnect_types::Packet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

#[derive(Default)]
struct RouteTable {
    /// Enabled plugins by key.
    plugins: HashMap<String, Arc<dyn Plugin>>,
    /// Packet type to subscribed plugin keys, built at enable time.
    by_type: HashMap<String, Vec<String>>,
}

impl RouteTable {
    fn rebuild(plugins: HashMap<String, Arc<dyn Plugin>>) -> Self {
        let mut by_type: HashMap<String, Vec<String>> = HashMap::new();
        for (key, plugin) in &plugins {
            for packet_type in &plugin.binding().supported_packet_types {
                by_type
                    .entry(packet_type.clone())
                    .or_default()
                    .push(key.clone());
            }
        }
        // Deterministic dispatch order.
        for keys in by_type.values_mut() {
            keys.sort();
        }
        Self { plugins, by_type }
    }
}

/// Stateless dispatch between packet types and plugin instances.
pub struct PluginRouter {
    table: RwLock<Arc<RouteTable>>,
    unhandled: AtomicU64,
}

impl Default for PluginRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRouter {
    /// Creates a router with no plugins enabled.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(RouteTable::default())),
            unhandled: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> Arc<RouteTable> {
        Arc::clone(&self.table.read().unwrap())
    }

    /// Enables a plugin. Runs its `on_create` hook first; a `false` return
    /// aborts the enable. Returns whether the plugin ended up enabled.
    ///
    /// The presence check, the hook and the insert happen under the table
    /// lock, so concurrent enables for one key run `on_create` exactly once.
    /// Hooks must not call back into the router.
    pub fn enable_plugin(&self, plugin: Arc<dyn Plugin>) -> bool {
        let key = plugin.binding().plugin_key.clone();
        let mut table = self.table.write().unwrap();
        if table.plugins.contains_key(&key) {
            return true;
        }
        if !plugin.on_create() {
            warn!(plugin = %key, "plugin refused to initialize");
            return false;
        }

        let mut plugins = table.plugins.clone();
        plugins.insert(key, plugin);
        *table = Arc::new(RouteTable::rebuild(plugins));
        true
    }

    /// Disables a plugin and runs its `on_destroy` hook. Returns whether it
    /// was enabled.
    pub fn disable_plugin(&self, plugin_key: &str) -> bool {
        let removed = {
            let mut table = self.table.write().unwrap();
            let mut plugins = table.plugins.clone();
            let removed = plugins.remove(plugin_key);
            if removed.is_some() {
                *table = Arc::new(RouteTable::rebuild(plugins));
            }
            removed
        };
        match removed {
            Some(plugin) => {
                plugin.on_destroy();
                true
            }
            None => false,
        }
    }

    /// Whether a plugin is currently enabled.
    pub fn is_enabled(&self, plugin_key: &str) -> bool {
        self.snapshot().plugins.contains_key(plugin_key)
    }

    /// Keys of all enabled plugins, sorted.
    pub fn enabled_plugins(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.snapshot().plugins.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Delivers an inbound packet to every enabled plugin subscribed to its
    /// type. All matches are invoked regardless of individual consumed
    /// results. Returns the number of handlers invoked; zero matches is
    /// counted as unhandled, not an error.
    pub fn dispatch_inbound(&self, packet: &Packet) -> usize {
        let table = self.snapshot();
        let Some(keys) = table.by_type.get(packet.packet_type()) else {
            self.unhandled.fetch_add(1, Ordering::Relaxed);
            debug!(packet_type = %packet.packet_type(), "no plugin subscribed, packet dropped");
            return 0;
        };

        let mut invoked = 0;
        for key in keys {
            if let Some(plugin) = table.plugins.get(key) {
                let consumed = plugin.on_packet_received(packet);
                debug!(plugin = %key, packet_type = %packet.packet_type(), consumed, "dispatched");
                invoked += 1;
            }
        }
        if invoked == 0 {
            self.unhandled.fetch_add(1, Ordering::Relaxed);
        }
        invoked
    }

    /// Validates an outbound packet against the sending plugin's declared
    /// outgoing types. An undeclared type is a contract violation, never
    /// silently forwarded.
    pub fn validate_outbound(&self, plugin_key: &str, packet: &Packet) -> CoreResult<()> {
        let table = self.snapshot();
        let Some(plugin) = table.plugins.get(plugin_key) else {
            return Err(CoreError::UnknownPlugin(plugin_key.to_string()));
        };
        if !plugin.binding().declares_outgoing(packet.packet_type()) {
            return Err(CoreError::DispatchContractViolation {
                plugin_key: plugin_key.to_string(),
                packet_type: packet.packet_type().to_string(),
            });
        }
        Ok(())
    }

    /// Number of inbound packets dropped because no plugin matched.
    pub fn unhandled_count(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }
}
