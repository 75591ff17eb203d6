//! Plugins
//!
//! All device functionality beyond pairing lives in plugins. A plugin
//! declares the packet types it consumes and produces; when a device
//! appears, each compatible factory instantiates one plugin for it, and
//! incoming packets are routed to every plugin that claims the type.
//!
//! Registration is a static table ([`builtin_factories`]); there is no
//! runtime scanning.

pub mod ping;

use crate::discovery::DeviceInfo;
use crate::link::LinkHandle;
use crate::{Packet, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// A plugin instance bound to one device
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once when the plugin is instantiated for a device
    ///
    /// Returning `Ok(false)` discards the instance without error.
    async fn on_create(&mut self) -> Result<bool> {
        Ok(true)
    }

    /// Called when the device goes away or gets unpaired
    async fn on_destroy(&mut self) {}

    /// Handle a packet addressed to this device
    ///
    /// Returns whether the packet was handled. Other plugins claiming the
    /// same type still see the packet either way.
    async fn handle_packet(&mut self, packet: &Packet, link: &LinkHandle) -> Result<bool>;
}

/// Describes and instantiates one plugin type
pub trait PluginFactory: Send + Sync {
    /// Stable identifier, used in logs and configuration
    fn name(&self) -> &'static str;

    /// Human-readable name
    fn display_name(&self) -> &'static str;

    /// Packet types this plugin consumes
    fn supported_packet_types(&self) -> &'static [&'static str];

    /// Packet types this plugin produces
    fn outgoing_packet_types(&self) -> &'static [&'static str];

    /// Whether packets are delivered before the device is paired
    fn listen_to_unpaired(&self) -> bool {
        false
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    fn create(&self) -> Box<dyn Plugin>;
}

/// All plugins shipped with the crate
pub fn builtin_factories() -> Vec<Arc<dyn PluginFactory>> {
    vec![Arc::new(ping::PingPluginFactory)]
}

/// Whether a factory is worth instantiating for a peer
///
/// True when the plugin can receive something the peer sends, or send
/// something the peer receives.
pub fn is_compatible(factory: &dyn PluginFactory, peer: &DeviceInfo) -> bool {
    let receives = factory
        .supported_packet_types()
        .iter()
        .any(|t| peer.outgoing_capabilities.iter().any(|c| c == t));
    let sends = factory
        .outgoing_packet_types()
        .iter()
        .any(|t| peer.incoming_capabilities.iter().any(|c| c == t));

    receives || sends
}
