//! TLS transport
//!
//! Encrypted packet stream between two devices. The plaintext identity
//! exchange happens first (see [`super::tcp`]); the TCP stream is then
//! upgraded here with inverted roles: the side that accepted the TCP
//! connection runs the TLS client handshake, the side that initiated TCP
//! runs the server handshake. Both sides present their self-signed
//! certificate and the presented certificate is validated against the
//! pinned copy after the handshake.
//!
//! Uses tokio-openssl for TLS 1.0 compatibility with older mobile peers.

use crate::trust::CertificateInfo;
use crate::{Packet, ProtocolError, Result};
use openssl::ssl::Ssl;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, warn};

use super::tls_config;

/// Timeout for the TLS handshake itself
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle read timeout (5 minutes); no keepalive pings are sent, so this has
/// to be long enough for normal idle periods
const TLS_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum packet size (10MB)
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// TLS connection to a remote device
pub struct TlsConnection {
    /// TLS stream
    stream: SslStream<TcpStream>,
    /// Remote address
    remote_addr: SocketAddr,
    /// Device ID of remote peer
    device_id: String,
}

impl TlsConnection {
    /// Upgrade an accepted TCP connection, acting as TLS client
    ///
    /// Used by the side that accepted the TCP connection (inverted roles).
    pub async fn upgrade_client(
        tcp_stream: TcpStream,
        our_cert: &CertificateInfo,
        device_id: impl Into<String>,
    ) -> Result<Self> {
        let remote_addr = tcp_stream.peer_addr()?;
        debug!("Starting TLS handshake as client with {}", remote_addr);

        let connector = tls_config::create_connector(our_cert)?;
        let ssl = Ssl::new(connector.context())?;
        let mut tls_stream = SslStream::new(ssl, tcp_stream)?;

        timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut tls_stream).connect())
            .await
            .map_err(|_| {
                ProtocolError::HandshakeFailed(format!("TLS handshake timeout with {}", remote_addr))
            })?
            .map_err(|e| {
                warn!("TLS handshake failed with {}: {}", remote_addr, e);
                ProtocolError::HandshakeFailed(format!("TLS handshake failed: {}", e))
            })?;

        debug!("TLS connection established with {}", remote_addr);

        Ok(Self {
            stream: tls_stream,
            remote_addr,
            device_id: device_id.into(),
        })
    }

    /// Upgrade an initiated TCP connection, acting as TLS server
    ///
    /// Used by the side that initiated the TCP connection (inverted roles).
    pub async fn upgrade_server(
        tcp_stream: TcpStream,
        our_cert: &CertificateInfo,
        device_id: impl Into<String>,
    ) -> Result<Self> {
        let remote_addr = tcp_stream.peer_addr()?;
        debug!("Starting TLS handshake as server with {}", remote_addr);

        let acceptor = tls_config::create_acceptor(our_cert)?;
        let ssl = Ssl::new(acceptor.context())?;
        let mut tls_stream = SslStream::new(ssl, tcp_stream)?;

        timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut tls_stream).accept())
            .await
            .map_err(|_| {
                ProtocolError::HandshakeFailed(format!("TLS handshake timeout with {}", remote_addr))
            })?
            .map_err(|e| {
                warn!("TLS handshake failed with {}: {}", remote_addr, e);
                ProtocolError::HandshakeFailed(format!("TLS handshake failed: {}", e))
            })?;

        debug!("TLS connection established with {}", remote_addr);

        Ok(Self {
            stream: tls_stream,
            remote_addr,
            device_id: device_id.into(),
        })
    }

    /// Get the device ID of the remote peer
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Get remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the certificate the peer presented during the handshake (DER)
    pub fn peer_certificate_der(&self) -> Result<Vec<u8>> {
        let cert = self.stream.ssl().peer_certificate().ok_or_else(|| {
            ProtocolError::HandshakeFailed("Peer presented no certificate".to_string())
        })?;
        Ok(cert.to_der()?)
    }

    /// Validate the presented peer certificate against a pinned one
    ///
    /// A mismatch means someone else answers to the claimed device id; the
    /// connection must be dropped without any device-level error.
    pub fn verify_pinned_certificate(&self, pinned_der: &[u8]) -> Result<()> {
        let presented = self.peer_certificate_der()?;
        if presented != pinned_der {
            return Err(ProtocolError::HandshakeFailed(format!(
                "Certificate for {} does not match pinned certificate (presented {})",
                self.device_id,
                CertificateInfo::calculate_fingerprint(&presented)
            )));
        }
        Ok(())
    }

    /// Send a packet over the TLS connection
    pub async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;

        if bytes.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "Packet too large: {} bytes (max {})",
                bytes.len(),
                MAX_PACKET_SIZE
            )));
        }

        debug!(
            "Sending packet '{}' ({} bytes) to {}",
            packet.packet_type,
            bytes.len(),
            self.remote_addr
        );

        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Receive a packet from the TLS connection
    ///
    /// A `MalformedPacket` error means only this packet is bad; the stream
    /// is still aligned on the newline delimiter and the caller may keep
    /// reading. I/O errors mean the connection is gone.
    pub async fn receive_packet(&mut self) -> Result<Packet> {
        // Read until newline (packet delimiter)
        let mut packet_bytes = Vec::new();
        let mut byte_buf = [0u8; 1];

        loop {
            match timeout(TLS_TIMEOUT, self.stream.read_exact(&mut byte_buf)).await {
                Ok(Ok(_)) => {
                    packet_bytes.push(byte_buf[0]);
                    if byte_buf[0] == b'\n' {
                        break;
                    }
                    if packet_bytes.len() > MAX_PACKET_SIZE {
                        warn!("Packet too large: {} bytes", packet_bytes.len());
                        return Err(ProtocolError::MalformedPacket(format!(
                            "Packet too large: {} bytes (max {})",
                            packet_bytes.len(),
                            MAX_PACKET_SIZE
                        )));
                    }
                }
                Ok(Err(e)) => {
                    debug!("Error reading packet from {}: {}", self.remote_addr, e);
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

        let packet = Packet::from_bytes(&packet_bytes)?;
        debug!(
            "Received packet type '{}' from {}",
            packet.packet_type, self.remote_addr
        );

        Ok(packet)
    }

    /// Close the TLS connection
    pub async fn close(mut self) -> Result<()> {
        debug!("Closing TLS connection to {}", self.remote_addr);
        // A peer that already dropped the socket is not an error worth
        // surfacing on close
        if let Err(e) = self.stream.shutdown().await {
            debug!("TLS shutdown with {}: {}", self.remote_addr, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (accepted, connect.await.unwrap())
    }

    #[tokio::test]
    async fn test_tls_send_receive_inverted_roles() {
        let cert_a = CertificateInfo::generate("device_a").unwrap();
        let cert_b = CertificateInfo::generate("device_b").unwrap();

        let (accepted, initiated) = loopback_pair().await;

        // The accepting side runs the client handshake
        let client_task = tokio::spawn(async move {
            let mut conn = TlsConnection::upgrade_client(accepted, &cert_a, "device_b")
                .await
                .unwrap();

            let packet = conn.receive_packet().await.unwrap();
            assert_eq!(packet.packet_type, "test.packet");

            let response = Packet::new("test.response", json!({"status": "ok"}));
            conn.send_packet(&response).await.unwrap();
            conn.close().await.unwrap();
        });

        let mut server = TlsConnection::upgrade_server(initiated, &cert_b, "device_a")
            .await
            .unwrap();

        let test_packet = Packet::new("test.packet", json!({"data": "hello"}));
        server.send_packet(&test_packet).await.unwrap();

        let response = server.receive_packet().await.unwrap();
        assert_eq!(response.packet_type, "test.response");

        server.close().await.unwrap();
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_certificate_exposed() {
        let cert_a = CertificateInfo::generate("device_a").unwrap();
        let cert_b = CertificateInfo::generate("device_b").unwrap();
        let cert_b_der = cert_b.certificate.clone();
        let cert_a_der = cert_a.certificate.clone();
        let cert_a_expected = cert_a.certificate.clone();

        let (accepted, initiated) = loopback_pair().await;

        let client_task = tokio::spawn(async move {
            let conn = TlsConnection::upgrade_client(accepted, &cert_a, "device_b")
                .await
                .unwrap();
            assert_eq!(conn.peer_certificate_der().unwrap(), cert_b_der);
            assert!(conn.verify_pinned_certificate(&cert_b_der).is_ok());
            // Pinning the wrong certificate must fail
            assert!(matches!(
                conn.verify_pinned_certificate(&cert_a_der),
                Err(ProtocolError::HandshakeFailed(_))
            ));
        });

        let server = TlsConnection::upgrade_server(initiated, &cert_b, "device_a")
            .await
            .unwrap();
        let presented = server.peer_certificate_der().unwrap();
        assert_eq!(presented, cert_a_expected);

        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_packet_keeps_stream_aligned() {
        let cert_a = CertificateInfo::generate("device_a").unwrap();
        let cert_b = CertificateInfo::generate("device_b").unwrap();

        let (accepted, initiated) = loopback_pair().await;

        let client_task = tokio::spawn(async move {
            let mut conn = TlsConnection::upgrade_client(accepted, &cert_a, "device_b")
                .await
                .unwrap();

            // First read fails on the garbage line
            let err = conn.receive_packet().await.unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedPacket(_)));

            // Second read still sees the valid packet
            let packet = conn.receive_packet().await.unwrap();
            assert_eq!(packet.packet_type, "test.packet");
        });

        let mut server = TlsConnection::upgrade_server(initiated, &cert_b, "device_a")
            .await
            .unwrap();

        server.stream.write_all(b"this is not json\n").await.unwrap();
        let packet = Packet::new("test.packet", json!({}));
        server.send_packet(&packet).await.unwrap();

        client_task.await.unwrap();
    }
}
