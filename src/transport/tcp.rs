//! Plaintext TCP framing
//!
//! Used only for the identity exchange that precedes the TLS upgrade.
//! Packets are newline-delimited JSON, read byte-by-byte so no bytes beyond
//! the delimiter are consumed (a buffered reader would swallow the start of
//! the TLS handshake that follows).

use crate::{Packet, ProtocolError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Default timeout for plaintext operations
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum plaintext packet size (1MB); identity packets are small
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Send one newline-terminated packet over a plain TCP stream
pub async fn write_plaintext_packet(stream: &mut TcpStream, packet: &Packet) -> Result<()> {
    let bytes = packet.to_bytes()?;

    debug!("Sending plaintext packet ({} bytes)", bytes.len());

    stream.write_all(&bytes).await?;
    stream.flush().await?;

    Ok(())
}

/// Read one newline-terminated packet from a plain TCP stream
pub async fn read_plaintext_packet(stream: &mut TcpStream) -> Result<Packet> {
    let mut packet_bytes = Vec::new();
    let mut byte_buf = [0u8; 1];

    loop {
        match timeout(TCP_TIMEOUT, stream.read_exact(&mut byte_buf)).await {
            Ok(Ok(_)) => {
                packet_bytes.push(byte_buf[0]);
                if byte_buf[0] == b'\n' {
                    break;
                }
                if packet_bytes.len() > MAX_PACKET_SIZE {
                    warn!("Plaintext packet too large: {} bytes", packet_bytes.len());
                    return Err(ProtocolError::MalformedPacket(format!(
                        "Packet too large: {} bytes (max {})",
                        packet_bytes.len(),
                        MAX_PACKET_SIZE
                    )));
                }
            }
            Ok(Err(e)) => {
                warn!("Error reading plaintext packet: {}", e);
                return Err(ProtocolError::Io(e));
            }
            Err(_) => {
                return Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Read timeout",
                )));
            }
        }
    }

    debug!("Received plaintext packet ({} bytes)", packet_bytes.len());

    Packet::from_bytes(&packet_bytes)
}
