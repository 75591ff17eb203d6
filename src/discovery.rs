//! Device discovery
//!
//! This module implements UDP broadcast-based device discovery. Devices
//! announce themselves by broadcasting identity packets on UDP port 1716.
//!
//! ## Discovery Protocol
//!
//! 1. **Broadcast**: Send identity packet via UDP broadcast on port 1716
//! 2. **Listen**: Listen for identity packets from other devices
//! 3. **Connect**: Establish TCP connection to discovered device's announced port
//!
//! ## Identity Packet Format
//!
//! Identity packets (`peerlink.identity`) contain:
//! - `deviceId`: UUIDv4 with underscores (e.g., `740bd4b9_b418_4ee4_97d6_caf1da8151be`)
//! - `deviceName`: 1-32 character device name
//! - `deviceType`: desktop, laptop, phone, tablet, or tv
//! - `protocolVersion`: Protocol version (currently 7)
//! - `incomingCapabilities`: List of packet types this device can receive
//! - `outgoingCapabilities`: List of packet types this device can send
//! - `tcpPort`: TCP port for establishing connections
//!
//! ## Port Configuration
//!
//! - Primary port: UDP 1716
//! - Fallback range: 1714-1764
//! - Listen on 0.0.0.0 for incoming broadcasts

use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default UDP port for device discovery
pub const DISCOVERY_PORT: u16 = 1716;

/// Port range for fallback when primary port is unavailable
pub const PORT_RANGE_START: u16 = 1714;
pub const PORT_RANGE_END: u16 = 1764;

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Packet type for identity announcements
pub const PACKET_TYPE_IDENTITY: &str = "peerlink.identity";

/// Device types announced in identity packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    /// Convert device type to string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }
}

/// Device identity information
///
/// Contains all information about a device needed for discovery and pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier (UUIDv4 with underscores)
    pub device_id: String,

    /// Human-readable device name (1-32 characters)
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    /// Protocol version (currently 7)
    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for connections
    pub tcp_port: u16,
}

impl DeviceInfo {
    /// Create a new DeviceInfo with a freshly generated device id
    ///
    /// # Examples
    ///
    /// ```
    /// use peerlink::discovery::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::new("My Computer", DeviceType::Desktop, 1716);
    /// ```
    pub fn new(device_name: impl Into<String>, device_type: DeviceType, tcp_port: u16) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.len() > 32 {
            warn!(
                "Device name should be 1-32 characters, got: {}",
                device_name
            );
        }

        Self {
            device_id: Self::generate_device_id(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Generate a UUIDv4 device ID with underscores instead of hyphens
    fn generate_device_id() -> String {
        Uuid::new_v4().to_string().replace('-', "_")
    }

    /// Create a DeviceInfo with explicit device ID
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Set all incoming capabilities at once
    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    /// Set all outgoing capabilities at once
    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    /// Set the advertised TCP port
    pub fn with_tcp_port(mut self, tcp_port: u16) -> Self {
        self.tcp_port = tcp_port;
        self
    }

    /// Convert DeviceInfo to an identity packet
    pub fn to_identity_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
                "tcpPort": self.tcp_port,
            }),
        )
    }

    /// Parse DeviceInfo from an identity packet
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::MalformedPacket(
                "Not an identity packet".to_string(),
            ));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing deviceId".to_string()))?;

        let device_name = packet
            .get_body_field::<String>("deviceName")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing deviceName".to_string()))?;

        let device_type_str = packet
            .get_body_field::<String>("deviceType")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing deviceType".to_string()))?;

        let device_type = match device_type_str.as_str() {
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => {
                return Err(ProtocolError::MalformedPacket(format!(
                    "Unknown device type: {}",
                    device_type_str
                )))
            }
        };

        let protocol_version = packet
            .get_body_field::<u32>("protocolVersion")
            .unwrap_or(PROTOCOL_VERSION);

        let tcp_port = packet
            .get_body_field::<u16>("tcpPort")
            .ok_or_else(|| ProtocolError::MalformedPacket("Missing tcpPort".to_string()))?;

        let incoming_capabilities = packet
            .get_body_field::<Vec<String>>("incomingCapabilities")
            .unwrap_or_default();

        let outgoing_capabilities = packet
            .get_body_field::<Vec<String>>("outgoingCapabilities")
            .unwrap_or_default();

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities,
            outgoing_capabilities,
            tcp_port,
        })
    }
}

/// UDP identity beacon
///
/// Broadcasts our identity and listens for foreign identity packets. One
/// socket serves both directions so the source port of our broadcasts
/// matches the port peers answer to.
pub struct UdpBeacon {
    socket: UdpSocket,
    device_info: DeviceInfo,
}

impl UdpBeacon {
    /// Create a new beacon
    ///
    /// Attempts to bind UDP port 1716, falling back to 1714-1764 if
    /// unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error if no port in the range can be bound
    pub async fn new(device_info: DeviceInfo) -> Result<Self> {
        let socket = Self::bind_with_fallback().await?;
        socket.set_broadcast(true)?;

        Ok(Self {
            socket,
            device_info,
        })
    }

    async fn bind_with_fallback() -> Result<UdpSocket> {
        match UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await {
            Ok(s) => {
                info!("Bound to UDP port {}", DISCOVERY_PORT);
                return Ok(s);
            }
            Err(e) => {
                warn!(
                    "Failed to bind to primary port {}: {}. Trying fallback range...",
                    DISCOVERY_PORT, e
                );

                let mut last_err = e;
                for port in PORT_RANGE_START..=PORT_RANGE_END {
                    if port == DISCOVERY_PORT {
                        continue;
                    }

                    match UdpSocket::bind(("0.0.0.0", port)).await {
                        Ok(s) => {
                            info!("Bound to fallback UDP port {}", port);
                            return Ok(s);
                        }
                        Err(e) => last_err = e,
                    }
                }

                Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!(
                        "Failed to bind to any port in range {}-{}: {}",
                        PORT_RANGE_START, PORT_RANGE_END, last_err
                    ),
                )))
            }
        }
    }

    /// Broadcast one identity packet
    ///
    /// Duplicate broadcasts are harmless, receivers treat identity packets
    /// idempotently.
    pub async fn broadcast_identity(&self) -> Result<()> {
        let packet = self.device_info.to_identity_packet();
        let bytes = packet.to_bytes()?;

        let broadcast_addr = SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), DISCOVERY_PORT);

        debug!(
            "Broadcasting identity packet ({} bytes) to {}",
            bytes.len(),
            broadcast_addr
        );

        self.socket.send_to(&bytes, broadcast_addr).await?;
        Ok(())
    }

    /// Await the next valid foreign identity broadcast
    ///
    /// Self-broadcasts and malformed datagrams are skipped, never fatal.
    pub async fn recv_identity(&self) -> Result<(DeviceInfo, SocketAddr)> {
        let mut buf = [0u8; 4096];

        loop {
            let (size, src_addr) = self.socket.recv_from(&mut buf).await?;
            debug!("Received {} bytes from {}", size, src_addr);

            let packet = match Packet::from_bytes(&buf[..size]) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Failed to parse packet from {}: {}", src_addr, e);
                    continue;
                }
            };

            if !packet.is_type(PACKET_TYPE_IDENTITY) {
                debug!("Ignoring non-identity packet from {}", src_addr);
                continue;
            }

            match DeviceInfo::from_identity_packet(&packet) {
                Ok(device_info) => {
                    if device_info.device_id == self.device_info.device_id {
                        debug!("Ignoring our own broadcast");
                        continue;
                    }

                    info!(
                        "Discovered device: {} ({}) at {}",
                        device_info.device_name,
                        device_info.device_type.as_str(),
                        src_addr
                    );

                    return Ok((device_info, src_addr));
                }
                Err(e) => {
                    warn!("Failed to parse device info from {}: {}", src_addr, e);
                    continue;
                }
            }
        }
    }

    /// Get the local port this beacon is bound to
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Get a reference to this device's info
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }
}
