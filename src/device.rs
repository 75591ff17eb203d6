//! Devices
//!
//! A [`Device`] ties together everything known about one remote peer: its
//! advertised identity, the active link to it, its pairing state and the
//! plugin instances serving it. Internals live behind a single async mutex
//! so pairing transitions and link attach/detach for one device never
//! interleave; different devices are fully independent.
//!
//! Packet routing: `peerlink.pair` goes to the pairing handler (which pins
//! or unpins the peer certificate as trust changes); every other type is
//! offered to each plugin that claims it. Untrusted devices only reach
//! plugins that opted into unpaired traffic.

use crate::discovery::DeviceInfo;
use crate::link::{DeviceLink, LinkHandle};
use crate::pairing::{PairStatus, PairingEvent, PairingHandler, PACKET_TYPE_PAIR};
use crate::plugins::{is_compatible, Plugin, PluginFactory};
use crate::trust::TrustStore;
use crate::{Packet, ProtocolError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

struct PluginInstance {
    name: &'static str,
    factory: Arc<dyn PluginFactory>,
    plugin: Box<dyn Plugin>,
}

struct DeviceInner {
    info: DeviceInfo,
    links: Vec<DeviceLink>,
    plugins: Vec<PluginInstance>,
}

/// One known remote device
pub struct Device {
    device_id: String,
    trust_store: Arc<TrustStore>,
    factories: Vec<Arc<dyn PluginFactory>>,
    pairing: PairingHandler,
    inner: Mutex<DeviceInner>,
}

impl Device {
    /// Create a device from its announced identity
    ///
    /// The pairing state starts as `Paired` when the trust store already
    /// pins a certificate for this device id.
    pub fn new(
        info: DeviceInfo,
        trust_store: Arc<TrustStore>,
        factories: Vec<Arc<dyn PluginFactory>>,
        pairing_tx: mpsc::UnboundedSender<PairingEvent>,
    ) -> Self {
        let device_id = info.device_id.clone();
        let pairing = PairingHandler::new(
            device_id.clone(),
            trust_store.is_trusted(&device_id),
            pairing_tx,
        );

        Self {
            device_id,
            trust_store,
            factories,
            pairing,
            inner: Mutex::new(DeviceInner {
                info,
                links: Vec::new(),
                plugins: Vec::new(),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Latest announced identity
    pub async fn info(&self) -> DeviceInfo {
        self.inner.lock().await.info.clone()
    }

    pub fn is_paired(&self) -> bool {
        self.pairing.is_paired()
    }

    pub fn is_pair_requested(&self) -> bool {
        self.pairing.status() == PairStatus::Requested
    }

    pub fn is_pair_requested_by_peer(&self) -> bool {
        self.pairing.status() == PairStatus::RequestedByPeer
    }

    pub fn pair_status(&self) -> PairStatus {
        self.pairing.status()
    }

    /// Whether any link to the device is open
    pub async fn is_reachable(&self) -> bool {
        self.inner.lock().await.links.iter().any(|l| l.is_open())
    }

    /// Attach a freshly established link
    ///
    /// The identity carried by the handshake refreshes the stored one (a
    /// device may rename itself or change capabilities between
    /// connections). The device keeps a single live link: a new link
    /// replaces and closes any previous one, rather than accumulating one
    /// per provider. Plugin instances are reconciled with the new
    /// capability set.
    pub async fn add_link(&self, identity: DeviceInfo, link: DeviceLink) {
        let mut inner = self.inner.lock().await;

        let was_reachable = inner.links.iter().any(|l| l.is_open());
        for old in inner.links.drain(..) {
            debug!("Replacing link {} to {}", old.link_id(), self.device_id);
            old.close();
        }

        inner.info = identity;
        inner.links.push(link);

        if !was_reachable {
            info!("Device {} is now reachable", self.device_id);
        }

        self.reload_plugins(&mut inner).await;
    }

    /// Detach a link after its connection ended
    pub async fn remove_link(&self, link_id: u64) {
        let mut inner = self.inner.lock().await;

        let before = inner.links.len();
        inner.links.retain(|l| l.link_id() != link_id);
        if inner.links.len() == before {
            return;
        }

        if inner.links.is_empty() {
            info!("Device {} is no longer reachable", self.device_id);
            let instances: Vec<_> = inner.plugins.drain(..).collect();
            for mut instance in instances {
                instance.plugin.on_destroy().await;
            }
        }
    }

    /// Reconcile plugin instances with the current capability set
    async fn reload_plugins(&self, inner: &mut DeviceInner) {
        let existing: Vec<_> = inner.plugins.drain(..).collect();
        for mut instance in existing {
            if is_compatible(instance.factory.as_ref(), &inner.info) {
                inner.plugins.push(instance);
            } else {
                debug!(
                    "Dropping plugin '{}' for {}: capabilities no longer match",
                    instance.name, self.device_id
                );
                instance.plugin.on_destroy().await;
            }
        }

        for factory in &self.factories {
            if !factory.enabled_by_default() || !is_compatible(factory.as_ref(), &inner.info) {
                continue;
            }
            if inner.plugins.iter().any(|p| p.name == factory.name()) {
                continue;
            }

            let mut plugin = factory.create();
            match plugin.on_create().await {
                Ok(true) => {
                    debug!(
                        "Instantiated plugin '{}' for {}",
                        factory.name(),
                        self.device_id
                    );
                    inner.plugins.push(PluginInstance {
                        name: factory.name(),
                        factory: factory.clone(),
                        plugin,
                    });
                }
                Ok(false) => {
                    debug!("Plugin '{}' declined device {}", factory.name(), self.device_id);
                }
                Err(e) => {
                    warn!(
                        "Plugin '{}' failed to initialize for {}: {}",
                        factory.name(),
                        self.device_id,
                        e
                    );
                }
            }
        }
    }

    /// Route an incoming packet
    ///
    /// Plugin failures are logged and never stop delivery to the remaining
    /// plugins.
    pub async fn handle_packet(&self, link_id: u64, packet: Packet) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let handle = inner
            .links
            .iter()
            .find(|l| l.link_id() == link_id)
            .or_else(|| inner.links.first())
            .map(|l| l.handle())
            .ok_or_else(|| {
                ProtocolError::NotReachable(format!("No open link to {}", self.device_id))
            })?;

        if packet.is_type(PACKET_TYPE_PAIR) {
            let was_paired = self.pairing.is_paired();
            self.pairing.handle_pair_packet(&packet, &handle).await?;
            let now_paired = self.pairing.is_paired();

            if now_paired && !was_paired {
                self.pin_link_certificate(&inner, link_id)?;
            } else if was_paired && !now_paired {
                self.trust_store.unpin(&self.device_id)?;
            }
            return Ok(());
        }

        let trusted = self.pairing.is_paired();
        let packet_type = packet.packet_type.as_str();
        let mut delivered = false;

        for instance in inner.plugins.iter_mut() {
            if !instance
                .factory
                .supported_packet_types()
                .contains(&packet_type)
            {
                continue;
            }
            if !trusted && !instance.factory.listen_to_unpaired() {
                debug!(
                    "Withholding '{}' from plugin '{}': device {} is not paired",
                    packet_type, instance.name, self.device_id
                );
                continue;
            }

            match instance.plugin.handle_packet(&packet, &handle).await {
                Ok(true) => delivered = true,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Plugin '{}' failed on '{}' from {}: {}",
                        instance.name, packet_type, self.device_id, e
                    );
                }
            }
        }

        if !delivered {
            debug!(
                "No plugin handled '{}' from {}",
                packet_type, self.device_id
            );
        }
        Ok(())
    }

    /// Pin the certificate the given link authenticated with
    fn pin_link_certificate(&self, inner: &DeviceInner, link_id: u64) -> Result<()> {
        let cert = inner
            .links
            .iter()
            .find(|l| l.link_id() == link_id)
            .or_else(|| inner.links.first())
            .and_then(|l| l.peer_certificate_der());

        match cert {
            Some(cert) => {
                info!("Pinning certificate for paired device {}", self.device_id);
                self.trust_store.pin(&self.device_id, cert)
            }
            None => {
                warn!(
                    "Paired with {} but no peer certificate to pin",
                    self.device_id
                );
                Ok(())
            }
        }
    }

    async fn active_link_handle(&self) -> Result<LinkHandle> {
        self.inner
            .lock()
            .await
            .links
            .iter()
            .find(|l| l.is_open())
            .map(|l| l.handle())
            .ok_or_else(|| {
                ProtocolError::NotReachable(format!("No open link to {}", self.device_id))
            })
    }

    /// Send a packet over the first open link
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        let handle = self.active_link_handle().await?;
        handle.send_packet(packet).await
    }

    /// Send a packet whose bulk data travels on the out-of-band payload
    /// channel
    pub async fn send_packet_with_payload(&self, packet: Packet, payload: Vec<u8>) -> Result<()> {
        let handle = self.active_link_handle().await?;
        handle.send_packet_with_payload(packet, payload).await
    }

    /// Send a packet that supersedes any queued packet with the same
    /// replacement id
    pub async fn send_packet_replacing(
        &self,
        packet: Packet,
        replace_id: impl Into<String>,
    ) -> Result<()> {
        let handle = self.active_link_handle().await?;
        handle.send_packet_replacing(packet, replace_id).await
    }

    /// Ask the device to pair with us
    pub async fn request_pair(&self) -> Result<()> {
        let handle = self.active_link_handle().await?;
        self.pairing.request_pairing(&handle).await
    }

    /// Accept a pending pairing request from the device
    ///
    /// Completes the trust exchange by pinning the certificate the current
    /// link authenticated with.
    pub async fn accept_pair(&self) -> Result<()> {
        let handle = self.active_link_handle().await?;
        self.pairing.accept_pairing(&handle).await?;

        if self.pairing.is_paired() {
            let inner = self.inner.lock().await;
            self.pin_link_certificate(&inner, handle.link_id())?;
        }
        Ok(())
    }

    /// Reject a pending pairing request from the device
    pub async fn reject_pair(&self) -> Result<()> {
        let handle = self.active_link_handle().await?;
        self.pairing.reject_pairing(&handle).await
    }

    /// Dissolve the pairing and forget the device's certificate
    ///
    /// Works for unreachable devices too; the notification to the peer is
    /// best-effort.
    pub async fn unpair(&self) -> Result<()> {
        let handle = self.active_link_handle().await.ok();
        self.pairing.unpair(handle.as_ref()).await?;
        self.trust_store.unpin(&self.device_id)?;

        let mut inner = self.inner.lock().await;
        let instances: Vec<_> = inner.plugins.drain(..).collect();
        drop(inner);
        for mut instance in instances {
            instance.plugin.on_destroy().await;
        }
        Ok(())
    }

    /// Close every link to this device
    pub async fn close_links(&self) {
        let inner = self.inner.lock().await;
        for link in &inner.links {
            link.close();
        }
    }

    /// Names of currently instantiated plugins
    pub async fn plugin_names(&self) -> Vec<&'static str> {
        self.inner.lock().await.plugins.iter().map(|p| p.name).collect()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.device_id)
            .field("pair_status", &self.pair_status())
            .finish()
    }
}
