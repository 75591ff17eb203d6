//! Ping plugin
//!
//! The smallest possible plugin: receives `peerlink.ping` packets, logs
//! them, and can send one back. Mostly useful to verify that a link and
//! the routing around it actually work.

use super::{Plugin, PluginFactory};
use crate::link::LinkHandle;
use crate::{Packet, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

/// Packet type for pings
pub const PACKET_TYPE_PING: &str = "peerlink.ping";

pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn display_name(&self) -> &'static str {
        "Ping"
    }

    fn supported_packet_types(&self) -> &'static [&'static str] {
        &[PACKET_TYPE_PING]
    }

    fn outgoing_packet_types(&self) -> &'static [&'static str] {
        &[PACKET_TYPE_PING]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PingPlugin::default())
    }
}

#[derive(Default)]
pub struct PingPlugin {
    received: u64,
}

impl PingPlugin {
    /// Number of pings received so far
    pub fn received(&self) -> u64 {
        self.received
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    async fn handle_packet(&mut self, packet: &Packet, _link: &LinkHandle) -> Result<bool> {
        if !packet.is_type(PACKET_TYPE_PING) {
            return Ok(false);
        }

        self.received += 1;
        match packet.get_body_field::<String>("message") {
            Some(message) => info!("Ping: {}", message),
            None => info!("Ping!"),
        }

        Ok(true)
    }
}

/// Send a ping over a link, with an optional message
pub async fn send_ping(link: &LinkHandle, message: Option<&str>) -> Result<()> {
    let body = match message {
        Some(message) => json!({ "message": message }),
        None => json!({}),
    };
    link.send_packet(Packet::new(PACKET_TYPE_PING, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::loopback_link;

    #[test]
    fn test_factory_declares_ping_type() {
        let factory = PingPluginFactory;
        assert_eq!(factory.name(), "ping");
        assert_eq!(factory.supported_packet_types(), &[PACKET_TYPE_PING]);
        assert_eq!(factory.outgoing_packet_types(), &[PACKET_TYPE_PING]);
        assert!(!factory.listen_to_unpaired());
        assert!(factory.enabled_by_default());
    }

    #[tokio::test]
    async fn test_ping_counts_only_ping_packets() {
        let (link, _events, _peer) = loopback_link("local", "remote").await;
        let handle = link.handle();

        let mut plugin = PingPlugin::default();

        let ping = Packet::new(PACKET_TYPE_PING, json!({"message": "hi"}));
        assert!(plugin.handle_packet(&ping, &handle).await.unwrap());
        assert_eq!(plugin.received(), 1);

        let other = Packet::new("peerlink.battery", json!({}));
        assert!(!plugin.handle_packet(&other, &handle).await.unwrap());
        assert_eq!(plugin.received(), 1);
    }

    #[tokio::test]
    async fn test_send_ping() {
        let (link, _events, mut peer) = loopback_link("local", "remote").await;

        send_ping(&link.handle(), Some("hello")).await.unwrap();

        let wire = peer.receive_packet().await.unwrap();
        assert!(wire.is_type(PACKET_TYPE_PING));
        assert_eq!(
            wire.get_body_field::<String>("message"),
            Some("hello".to_string())
        );
    }
}
