//! Device links
//!
//! A [`DeviceLink`] owns one established [`TlsConnection`] and runs it from
//! a dedicated task. Outgoing packets pass through an [`OutgoingQueue`]
//! that preserves send order and coalesces unsent packets sharing a
//! replacement id. Incoming packets and the final connection loss are
//! reported as [`LinkEvent`]s on the channel supplied at spawn time.

use crate::payload::{PayloadClient, PayloadServer};
use crate::transport::TlsConnection;
use crate::{DeviceInfo, Packet, ProtocolError, Result};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events emitted by link providers and running links
#[derive(Debug)]
pub enum LinkEvent {
    /// A handshake completed and a new link is available
    ConnectionEstablished {
        identity: DeviceInfo,
        link: DeviceLink,
    },
    /// A packet arrived on a link
    PacketReceived {
        device_id: String,
        link_id: u64,
        packet: Packet,
    },
    /// A link closed; emitted exactly once per link
    ConnectionLost { device_id: String, link_id: u64 },
}

/// A packet waiting to be flushed
pub struct QueuedPacket {
    pub packet: Packet,
    /// Packets sharing a replacement id supersede one another while queued
    pub replace_id: Option<String>,
    /// Resolved when the packet bytes are flushed (or the link dies)
    pub done: Option<oneshot::Sender<Result<()>>>,
}

struct QueueEntry {
    packet: Packet,
    replace_id: Option<String>,
    done: Vec<oneshot::Sender<Result<()>>>,
}

/// Ordered outgoing packet queue with replacement-id coalescing
///
/// When a packet is pushed with a replacement id that an unsent entry
/// already carries, the two collapse into one: numeric body fields are
/// summed, other fields overwritten, and all completion handles resolve
/// with the single flush. Entries without a replacement id never coalesce.
#[derive(Default)]
pub struct OutgoingQueue {
    entries: VecDeque<QueueEntry>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a packet, coalescing into a pending entry when possible
    pub fn push(&mut self, queued: QueuedPacket) {
        let QueuedPacket {
            packet,
            replace_id,
            done,
        } = queued;

        if let Some(ref rid) = replace_id {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|e| e.replace_id.as_deref() == Some(rid.as_str()))
            {
                debug!("Coalescing queued packet with replacement id '{}'", rid);
                entry.packet.merge_for_replace(packet);
                entry.done.extend(done);
                return;
            }
        }

        self.entries.push_back(QueueEntry {
            packet,
            replace_id,
            done: done.into_iter().collect(),
        });
    }

    /// Take the next packet to flush, with its completion handles
    fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Fail every queued packet; used when the link closes
    fn fail_all(&mut self, reason: &str) {
        for entry in self.entries.drain(..) {
            for done in entry.done {
                let _ = done.send(Err(ProtocolError::NotReachable(reason.to_string())));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum LinkCommand {
    Send(QueuedPacket),
    Close,
}

/// Clonable sending handle for a link
///
/// `send_packet` resolves once the bytes are flushed to the transport,
/// standing in for a delivery-status callback. After the link closes every
/// send fails with [`ProtocolError::NotReachable`].
#[derive(Clone)]
pub struct LinkHandle {
    link_id: u64,
    device_id: String,
    remote_addr: SocketAddr,
    command_tx: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    /// Unique id of the underlying link
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Device id of the remote peer
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the link task is still running
    pub fn is_open(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Send a packet, resolving when it has been flushed
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        self.send_inner(packet, None).await
    }

    /// Send a packet that supersedes any unsent packet with the same
    /// replacement id
    pub async fn send_packet_replacing(
        &self,
        packet: Packet,
        replace_id: impl Into<String>,
    ) -> Result<()> {
        self.send_inner(packet, Some(replace_id.into())).await
    }

    async fn send_inner(&self, packet: Packet, replace_id: Option<String>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(LinkCommand::Send(QueuedPacket {
                packet,
                replace_id,
                done: Some(done_tx),
            }))
            .map_err(|_| ProtocolError::NotReachable(format!("Link to {} closed", self.device_id)))?;

        done_rx.await.map_err(|_| {
            ProtocolError::NotReachable(format!("Link to {} closed mid-send", self.device_id))
        })?
    }

    /// Send a packet whose bulk data travels out-of-band
    ///
    /// A payload server is bound in the payload port range, the packet is
    /// stamped with the size and port, and the bytes are served from a
    /// separate task so the control channel never waits for the transfer.
    /// When no payload port is free the packet still goes out without
    /// transfer info and the port exhaustion is returned after the flush.
    pub async fn send_packet_with_payload(&self, packet: Packet, payload: Vec<u8>) -> Result<()> {
        let size = payload.len() as i64;

        match PayloadServer::new().await {
            Ok(server) => {
                let mut info = HashMap::new();
                info.insert("port".to_string(), Value::from(server.port()));
                let packet = packet
                    .with_payload_size(size)
                    .with_payload_transfer_info(info);

                let device_id = self.device_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.send_bytes(&payload).await {
                        warn!("Payload transfer to {} failed: {}", device_id, e);
                    }
                });

                self.send_packet(packet).await
            }
            Err(e) => {
                self.send_packet(packet).await?;
                Err(e)
            }
        }
    }

    /// Download the out-of-band payload a received packet announces
    ///
    /// Connects back to the sender's address on the advertised payload
    /// port and reads exactly the announced number of bytes.
    pub async fn fetch_payload(&self, packet: &Packet) -> Result<Vec<u8>> {
        let size = packet.payload_size.filter(|s| *s > 0).ok_or_else(|| {
            ProtocolError::PayloadTransferFailed("Packet announces no payload".to_string())
        })?;
        let port = packet
            .payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("port"))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ProtocolError::PayloadTransferFailed(
                    "Packet carries no payload port".to_string(),
                )
            })?;

        let host = self.remote_addr.ip().to_string();
        let client = PayloadClient::new(&host, port as u16).await?;
        client.receive_bytes(size as u64).await
    }

    /// Queue a packet without waiting for the flush
    pub fn queue_packet(&self, packet: Packet) -> Result<()> {
        self.command_tx
            .send(LinkCommand::Send(QueuedPacket {
                packet,
                replace_id: None,
                done: None,
            }))
            .map_err(|_| ProtocolError::NotReachable(format!("Link to {} closed", self.device_id)))
    }
}

/// An established link to a remote device
///
/// Dropping the `DeviceLink` does not close the connection; call
/// [`DeviceLink::close`] or let the peer disconnect.
#[derive(Debug)]
pub struct DeviceLink {
    link_id: u64,
    device_id: String,
    remote_addr: SocketAddr,
    peer_cert_der: Option<Vec<u8>>,
    command_tx: mpsc::UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

impl DeviceLink {
    /// Spawn the connection task for an established TLS connection
    ///
    /// Link events (received packets, connection loss) are delivered on
    /// `event_tx`. Exactly one `ConnectionLost` is emitted when the task
    /// ends, however the connection ends.
    pub fn spawn(
        connection: TlsConnection,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

        let link_id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let device_id = connection.device_id().to_string();
        let remote_addr = connection.remote_addr();
        // Captured here; the connection moves into the task below and the
        // certificate is needed when pairing pins it
        let peer_cert_der = connection.peer_certificate_der().ok();

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let task_device_id = device_id.clone();
        let task = tokio::spawn(async move {
            run_link(connection, link_id, task_device_id, command_rx, event_tx).await;
        });

        Self {
            link_id,
            device_id,
            remote_addr,
            peer_cert_der,
            command_tx,
            task,
        }
    }

    /// Unique id of this link
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Device id of the remote peer
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Remote address of the connection
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Certificate the peer presented during the TLS handshake (DER)
    pub fn peer_certificate_der(&self) -> Option<&[u8]> {
        self.peer_cert_der.as_deref()
    }

    /// Whether the connection task is still running
    pub fn is_open(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Get a sending handle for this link
    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            link_id: self.link_id,
            device_id: self.device_id.clone(),
            remote_addr: self.remote_addr,
            command_tx: self.command_tx.clone(),
        }
    }

    /// Close the link; idempotent
    ///
    /// Queued-but-unsent packets fail with `NotReachable`. The single
    /// `ConnectionLost` event fires when the task finishes.
    pub fn close(&self) {
        let _ = self.command_tx.send(LinkCommand::Close);
    }

    /// Abort the connection task without a graceful shutdown
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("link_id", &self.link_id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

async fn run_link(
    mut connection: TlsConnection,
    link_id: u64,
    device_id: String,
    mut command_rx: mpsc::UnboundedReceiver<LinkCommand>,
    event_tx: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut queue = OutgoingQueue::new();
    let mut closing = false;

    loop {
        if closing {
            break;
        }

        if queue.is_empty() {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(LinkCommand::Send(queued)) => queue.push(queued),
                        Some(LinkCommand::Close) | None => break,
                    }
                }

                result = connection.receive_packet() => {
                    match result {
                        Ok(packet) => {
                            debug!(
                                "Received packet '{}' from {}",
                                packet.packet_type, device_id
                            );
                            let _ = event_tx.send(LinkEvent::PacketReceived {
                                device_id: device_id.clone(),
                                link_id,
                                packet,
                            });
                        }
                        // A packet that fails to decode is dropped; the
                        // stream stays aligned on the newline delimiter
                        Err(ProtocolError::MalformedPacket(e)) => {
                            warn!("Dropping malformed packet from {}: {}", device_id, e);
                        }
                        Err(e) => {
                            debug!("Connection to {} ended: {}", device_id, e);
                            break;
                        }
                    }
                }
            }
        } else {
            // Absorb everything already queued behind us so replacement ids
            // can coalesce before the next flush
            loop {
                match command_rx.try_recv() {
                    Ok(LinkCommand::Send(queued)) => queue.push(queued),
                    Ok(LinkCommand::Close) => {
                        closing = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            if let Some(entry) = queue.pop() {
                match connection.send_packet(&entry.packet).await {
                    Ok(()) => {
                        for done in entry.done {
                            let _ = done.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        warn!("Failed to send packet to {}: {}", device_id, e);
                        for done in entry.done {
                            let _ = done.send(Err(ProtocolError::NotReachable(format!(
                                "Send to {} failed",
                                device_id
                            ))));
                        }
                        break;
                    }
                }
            }
        }
    }

    info!("Link {} to {} stopping", link_id, device_id);

    queue.fail_all("Link closed");
    command_rx.close();
    // Fail anything that raced into the channel after we stopped reading
    while let Ok(LinkCommand::Send(queued)) = command_rx.try_recv() {
        if let Some(done) = queued.done {
            let _ = done.send(Err(ProtocolError::NotReachable("Link closed".to_string())));
        }
    }

    let _ = connection.close().await;

    let _ = event_tx.send(LinkEvent::ConnectionLost { device_id, link_id });
}
