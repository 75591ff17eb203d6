//! Peerlink
//!
//! A pure Rust implementation of a LAN device-to-device protocol: devices
//! find each other over UDP broadcast, connect over TCP, authenticate with
//! self-signed certificates pinned on first pairing, and exchange
//! newline-delimited JSON packets routed to capability-matched plugins.

pub mod device;
pub mod discovery;
pub mod link;
pub mod packet;
pub mod pairing;
pub mod payload;
pub mod plugins;
pub mod provider;
pub mod registry;
pub mod transport;
pub mod trust;

mod error;
#[cfg(test)]
mod test_util;

pub use device::Device;
pub use discovery::{DeviceInfo, DeviceType, UdpBeacon};
pub use error::{ProtocolError, Result};
pub use link::{DeviceLink, LinkEvent, LinkHandle};
pub use packet::{current_timestamp, Packet};
pub use pairing::{PairStatus, PairingEvent, PairingFailureReason, PairingHandler};
pub use provider::LanLinkProvider;
pub use registry::{DeviceRegistry, DiscoveryToken};
pub use trust::{CertificateInfo, TrustStore};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 7;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 7);
    }
}
