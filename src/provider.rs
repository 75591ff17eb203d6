//! LAN link provider
//!
//! Turns discovery traffic into authenticated device links. The provider
//! runs three loops:
//!
//! - a TCP accept loop for peers that connect to us after hearing our
//!   broadcast
//! - a UDP loop that answers foreign identity broadcasts by connecting out
//! - a beacon timer that re-announces our identity periodically and on
//!   demand
//!
//! Whichever side initiates the TCP connection sends its identity packet in
//! plaintext and then runs the TLS *server* handshake; the accepting side
//! reads the identity and runs the TLS *client* handshake. After the
//! handshake the presented certificate is checked against the trust store
//! pin for already-trusted peers. A failed candidate connection is logged
//! and dropped without affecting the loops.

use crate::discovery::{DeviceInfo, UdpBeacon, PORT_RANGE_END};
use crate::link::{DeviceLink, LinkEvent};
use crate::transport::{self, TlsConnection};
use crate::trust::{CertificateInfo, TrustStore};
use crate::{ProtocolError, Result, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Primary TCP port for incoming connections, same range as discovery
const TCP_PORT: u16 = 1716;

/// Interval between periodic identity broadcasts
const BROADCAST_INTERVAL: Duration = Duration::from_secs(30);

/// Oldest protocol version we still talk to
const MIN_PROTOCOL_VERSION: u32 = 7;

/// Discovers peers on the local network and establishes links to them
pub struct LanLinkProvider {
    device_info: DeviceInfo,
    refresh_tx: mpsc::UnboundedSender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl LanLinkProvider {
    /// Start the provider
    ///
    /// Binds the TCP listener and the UDP beacon, then spawns the accept,
    /// discovery and broadcast loops. Link events arrive on the returned
    /// receiver.
    pub async fn start(
        device_info: DeviceInfo,
        our_cert: CertificateInfo,
        trust_store: Arc<TrustStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        let listener = bind_tcp_with_fallback().await?;
        let tcp_port = listener.local_addr()?.port();
        info!("Listening for connections on TCP port {}", tcp_port);

        // Advertise the port we actually bound
        let device_info = device_info.with_tcp_port(tcp_port);
        let beacon = Arc::new(UdpBeacon::new(device_info.clone()).await?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::new();

        let ctx = Arc::new(ProviderContext {
            device_info: device_info.clone(),
            our_cert,
            trust_store,
            event_tx,
        });

        let accept_ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            accept_loop(listener, accept_ctx).await;
        }));

        let udp_ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            udp_loop(beacon, refresh_rx, udp_ctx).await;
        }));

        Ok((
            Self {
                device_info,
                refresh_tx,
                tasks,
            },
            event_rx,
        ))
    }

    /// Our identity as advertised, including the bound TCP port
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Re-announce our identity immediately
    ///
    /// Called when the network changes or a fresh discovery round is
    /// wanted. Safe to call repeatedly; an extra broadcast is harmless.
    pub fn on_network_change(&self) {
        let _ = self.refresh_tx.send(());
    }

    /// Stop all provider loops
    ///
    /// Existing links keep running; only discovery and accepting stop.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Link provider stopped");
    }
}

impl Drop for LanLinkProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ProviderContext {
    device_info: DeviceInfo,
    our_cert: CertificateInfo,
    trust_store: Arc<TrustStore>,
    event_tx: mpsc::UnboundedSender<LinkEvent>,
}

async fn bind_tcp_with_fallback() -> Result<TcpListener> {
    match TcpListener::bind(("0.0.0.0", TCP_PORT)).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            warn!(
                "Failed to bind TCP port {}: {}. Trying fallback range...",
                TCP_PORT, e
            );

            let mut last_err = e;
            for port in (TCP_PORT + 1)..=PORT_RANGE_END {
                match TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(listener) => return Ok(listener),
                    Err(e) => last_err = e,
                }
            }

            Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!(
                    "Failed to bind any TCP port in range {}-{}: {}",
                    TCP_PORT, PORT_RANGE_END, last_err
                ),
            )))
        }
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ProviderContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                debug!("Accepted TCP connection from {}", remote_addr);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_incoming(stream, remote_addr, ctx).await {
                        warn!("Incoming connection from {} failed: {}", remote_addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("TCP accept failed: {}", e);
            }
        }
    }
}

async fn udp_loop(
    beacon: Arc<UdpBeacon>,
    mut refresh_rx: mpsc::UnboundedReceiver<()>,
    ctx: Arc<ProviderContext>,
) {
    let mut ticker = interval(BROADCAST_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = beacon.broadcast_identity().await {
                    warn!("Identity broadcast failed: {}", e);
                }
            }

            refresh = refresh_rx.recv() => {
                if refresh.is_none() {
                    break;
                }
                debug!("On-demand identity broadcast");
                if let Err(e) = beacon.broadcast_identity().await {
                    warn!("Identity broadcast failed: {}", e);
                }
            }

            result = beacon.recv_identity() => {
                match result {
                    Ok((identity, src_addr)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let remote = src_addr;
                            if let Err(e) = connect_to(identity, src_addr, ctx).await {
                                debug!("Connection to {} failed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Discovery socket error: {}", e);
                        // Socket errors here are usually transient; back off
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

fn check_identity(ctx: &ProviderContext, identity: &DeviceInfo) -> Result<()> {
    if identity.device_id.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "Empty device id in identity".to_string(),
        ));
    }
    if identity.device_id == ctx.device_info.device_id {
        return Err(ProtocolError::HandshakeFailed(
            "Connection to ourselves".to_string(),
        ));
    }
    if identity.protocol_version < MIN_PROTOCOL_VERSION {
        return Err(ProtocolError::HandshakeFailed(format!(
            "Peer protocol version {} is older than minimum {}",
            identity.protocol_version, MIN_PROTOCOL_VERSION
        )));
    }
    if identity.protocol_version > PROTOCOL_VERSION {
        debug!(
            "Peer {} speaks newer protocol version {}",
            identity.device_id, identity.protocol_version
        );
    }
    Ok(())
}

/// Validate a freshly established connection against the pinned certificate
///
/// Unknown peers pass; their certificate is only pinned when pairing
/// completes. Known peers presenting a different certificate are dropped.
fn check_pinned(ctx: &ProviderContext, connection: &TlsConnection) -> Result<()> {
    if let Some(pinned) = ctx.trust_store.pinned(connection.device_id()) {
        connection.verify_pinned_certificate(&pinned)?;
        debug!(
            "Certificate for trusted device {} matches pin",
            connection.device_id()
        );
    }
    Ok(())
}

fn establish(ctx: &ProviderContext, identity: DeviceInfo, connection: TlsConnection) {
    info!(
        "Link established with {} ({}) at {}",
        identity.device_name,
        identity.device_id,
        connection.remote_addr()
    );

    let link = DeviceLink::spawn(connection, ctx.event_tx.clone());
    let _ = ctx
        .event_tx
        .send(LinkEvent::ConnectionEstablished { identity, link });
}

/// Outgoing path: a UDP broadcast told us where a peer listens
///
/// We initiate TCP, send our identity in plaintext, then run the TLS
/// server handshake.
async fn connect_to(
    identity: DeviceInfo,
    src_addr: SocketAddr,
    ctx: Arc<ProviderContext>,
) -> Result<()> {
    check_identity(&ctx, &identity)?;

    let target = SocketAddr::new(src_addr.ip(), identity.tcp_port);
    debug!(
        "Connecting to discovered device {} at {}",
        identity.device_id, target
    );

    let mut stream = TcpStream::connect(target).await.map_err(|e| {
        ProtocolError::NotReachable(format!("TCP connect to {} failed: {}", target, e))
    })?;

    let our_identity = ctx.device_info.to_identity_packet();
    transport::write_plaintext_packet(&mut stream, &our_identity).await?;

    let connection =
        TlsConnection::upgrade_server(stream, &ctx.our_cert, identity.device_id.clone()).await?;

    check_pinned(&ctx, &connection)?;
    establish(&ctx, identity, connection);
    Ok(())
}

/// Incoming path: a peer heard our broadcast and connected to us
///
/// The peer sends its identity in plaintext and runs the TLS server
/// handshake; we run the client handshake.
async fn handle_incoming(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    ctx: Arc<ProviderContext>,
) -> Result<()> {
    let packet = transport::read_plaintext_packet(&mut stream).await?;
    let identity = DeviceInfo::from_identity_packet(&packet)?;

    check_identity(&ctx, &identity)?;
    debug!(
        "Identity from {}: {} ({})",
        remote_addr, identity.device_name, identity.device_id
    );

    let connection =
        TlsConnection::upgrade_client(stream, &ctx.our_cert, identity.device_id.clone()).await?;

    check_pinned(&ctx, &connection)?;
    establish(&ctx, identity, connection);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceType;
    use tempfile::TempDir;

    fn test_ctx(device_id: &str, trust_dir: &TempDir) -> Arc<ProviderContext> {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        Arc::new(ProviderContext {
            device_info: DeviceInfo::with_id(device_id, "Test Device", DeviceType::Desktop, 1716),
            our_cert: CertificateInfo::generate(device_id).unwrap(),
            trust_store: TrustStore::open(trust_dir.path()).unwrap(),
            event_tx,
        })
    }

    #[test]
    fn test_identity_check_rejects_self() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx("device_a", &dir);

        let own = DeviceInfo::with_id("device_a", "Me", DeviceType::Desktop, 1716);
        assert!(check_identity(&ctx, &own).is_err());

        let other = DeviceInfo::with_id("device_b", "Peer", DeviceType::Phone, 1716);
        assert!(check_identity(&ctx, &other).is_ok());
    }

    #[test]
    fn test_identity_check_rejects_old_protocol() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx("device_a", &dir);

        let mut old = DeviceInfo::with_id("device_b", "Old Peer", DeviceType::Phone, 1716);
        old.protocol_version = MIN_PROTOCOL_VERSION - 1;
        assert!(matches!(
            check_identity(&ctx, &old),
            Err(ProtocolError::HandshakeFailed(_))
        ));

        // Newer versions are accepted
        let mut newer = DeviceInfo::with_id("device_c", "New Peer", DeviceType::Phone, 1716);
        newer.protocol_version = PROTOCOL_VERSION + 1;
        assert!(check_identity(&ctx, &newer).is_ok());
    }

    #[test]
    fn test_identity_check_rejects_empty_id() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx("device_a", &dir);

        let bad = DeviceInfo::with_id("", "Anonymous", DeviceType::Phone, 1716);
        assert!(matches!(
            check_identity(&ctx, &bad),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[tokio::test]
    async fn test_incoming_connection_establishes_link() {
        let dir_a = TempDir::new().unwrap();
        let ctx = {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let ctx = Arc::new(ProviderContext {
                device_info: DeviceInfo::with_id(
                    "device_a",
                    "Accepter",
                    DeviceType::Desktop,
                    1716,
                ),
                our_cert: CertificateInfo::generate("device_a").unwrap(),
                trust_store: TrustStore::open(dir_a.path()).unwrap(),
                event_tx,
            });
            (ctx, event_rx)
        };
        let (ctx, mut event_rx) = ctx;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Peer side: initiate TCP, send identity, run server handshake
        let peer_cert = CertificateInfo::generate("device_b").unwrap();
        let peer_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let identity = DeviceInfo::with_id("device_b", "Initiator", DeviceType::Phone, 1716)
                .to_identity_packet();
            transport::write_plaintext_packet(&mut stream, &identity)
                .await
                .unwrap();
            TlsConnection::upgrade_server(stream, &peer_cert, "device_a".to_string())
                .await
                .unwrap()
        });

        let (stream, remote_addr) = listener.accept().await.unwrap();
        handle_incoming(stream, remote_addr, ctx).await.unwrap();

        match event_rx.recv().await.unwrap() {
            LinkEvent::ConnectionEstablished { identity, link } => {
                assert_eq!(identity.device_id, "device_b");
                assert_eq!(link.device_id(), "device_b");
                assert!(link.is_open());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let _peer_conn = peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_incoming_connection_rejects_wrong_pin() {
        let dir_a = TempDir::new().unwrap();
        let trust_store = TrustStore::open(dir_a.path()).unwrap();

        // Pin a certificate that is NOT the one the peer will present
        let impostor_target = CertificateInfo::generate("device_b").unwrap();
        trust_store
            .pin("device_b", &impostor_target.certificate)
            .unwrap();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(ProviderContext {
            device_info: DeviceInfo::with_id("device_a", "Accepter", DeviceType::Desktop, 1716),
            our_cert: CertificateInfo::generate("device_a").unwrap(),
            trust_store,
            event_tx,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer_cert = CertificateInfo::generate("device_b").unwrap();
        let peer_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let identity = DeviceInfo::with_id("device_b", "Impostor", DeviceType::Phone, 1716)
                .to_identity_packet();
            transport::write_plaintext_packet(&mut stream, &identity)
                .await
                .unwrap();
            // Handshake may complete before the pin check drops us
            let _ = TlsConnection::upgrade_server(stream, &peer_cert, "device_a".to_string()).await;
        });

        let (stream, remote_addr) = listener.accept().await.unwrap();
        let result = handle_incoming(stream, remote_addr, ctx).await;

        assert!(matches!(result, Err(ProtocolError::HandshakeFailed(_))));
        assert!(event_rx.try_recv().is_err());

        peer_task.await.unwrap();
    }
}
