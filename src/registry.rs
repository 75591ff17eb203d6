//! Device registry
//!
//! Owns every known [`Device`] and decides which ones are worth keeping.
//! Link events from providers drive the lifecycle: connections attach
//! links to devices (creating them when needed), lost connections detach
//! them and may evict the device.
//!
//! ## Discovery mode
//!
//! By default only paired devices are retained; an unpaired stranger that
//! connects is dropped immediately. While at least one [`DiscoveryToken`]
//! is held (a device-list UI is open, say), unpaired devices are kept so
//! the user can pick one to pair with. Releasing the last token sweeps
//! them out again.

use crate::device::Device;
use crate::discovery::{DeviceInfo, DeviceType};
use crate::link::{DeviceLink, LinkEvent};
use crate::pairing::PairingEvent;
use crate::plugins::PluginFactory;
use crate::provider::LanLinkProvider;
use crate::trust::TrustStore;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Registry of known devices
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    trust_store: Arc<TrustStore>,
    factories: Vec<Arc<dyn PluginFactory>>,
    pairing_tx: mpsc::UnboundedSender<PairingEvent>,
    providers: Mutex<Vec<LanLinkProvider>>,
    discovery_refs: Mutex<HashSet<u64>>,
    next_token: AtomicU64,
    changed_tx: watch::Sender<u64>,
}

impl DeviceRegistry {
    /// Create a registry
    ///
    /// Pairing events from all devices arrive on the returned receiver.
    pub fn new(
        trust_store: Arc<TrustStore>,
        factories: Vec<Arc<dyn PluginFactory>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PairingEvent>) {
        let (pairing_tx, pairing_rx) = mpsc::unbounded_channel();
        let (changed_tx, _) = watch::channel(0);

        let registry = Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            trust_store,
            factories,
            pairing_tx,
            providers: Mutex::new(Vec::new()),
            discovery_refs: Mutex::new(HashSet::new()),
            next_token: AtomicU64::new(1),
            changed_tx,
        });

        (registry, pairing_rx)
    }

    /// Watch for device-list changes
    ///
    /// The value is a generation counter; every add, removal and
    /// reachability change bumps it.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    fn notify_changed(&self) {
        self.changed_tx.send_modify(|generation| *generation += 1);
    }

    /// Take ownership of a provider so network-change hints reach it
    pub fn add_provider(&self, provider: LanLinkProvider) {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    /// Ask all providers to re-announce our identity
    pub fn on_network_change(&self) {
        for provider in self
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            provider.on_network_change();
        }
    }

    /// Consume link events from a provider
    ///
    /// Spawns a task that runs until the provider's event channel closes.
    pub fn attach_provider(
        self: &Arc<Self>,
        mut event_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    LinkEvent::ConnectionEstablished { identity, link } => {
                        registry.on_connection_established(identity, link).await;
                    }
                    LinkEvent::PacketReceived {
                        device_id,
                        link_id,
                        packet,
                    } => {
                        let device = registry.get(&device_id).await;
                        match device {
                            Some(device) => {
                                if let Err(e) = device.handle_packet(link_id, packet).await {
                                    warn!("Failed to handle packet from {}: {}", device_id, e);
                                }
                            }
                            None => {
                                debug!("Packet from unknown device {}", device_id);
                            }
                        }
                    }
                    LinkEvent::ConnectionLost { device_id, link_id } => {
                        registry.on_connection_lost(&device_id, link_id).await;
                    }
                }
            }
            debug!("Provider event channel closed");
        })
    }

    async fn on_connection_established(&self, identity: DeviceInfo, link: DeviceLink) {
        let device_id = identity.device_id.clone();
        let mut devices = self.devices.write().await;

        if let Some(device) = devices.get(&device_id) {
            device.add_link(identity, link).await;
            drop(devices);
            self.notify_changed();
            return;
        }

        // A stranger: keep it only when someone is actually looking
        if !self.trust_store.is_trusted(&device_id) && !self.discovery_active() {
            debug!(
                "Dropping link to unknown device {}: not trusted and discovery is off",
                device_id
            );
            link.close();
            return;
        }

        let device = Arc::new(Device::new(
            identity.clone(),
            self.trust_store.clone(),
            self.factories.clone(),
            self.pairing_tx.clone(),
        ));
        device.add_link(identity, link).await;

        info!("New device: {}", device_id);
        devices.insert(device_id, device);
        drop(devices);
        self.notify_changed();
    }

    async fn on_connection_lost(&self, device_id: &str, link_id: u64) {
        let device = self.get(device_id).await;
        let Some(device) = device else { return };

        device.remove_link(link_id).await;

        let evict = !device.is_reachable().await
            && !device.is_paired()
            && !device.pair_status().is_pairing();

        if evict {
            info!("Evicting unreachable untrusted device {}", device_id);
            self.devices.write().await.remove(device_id);
        }
        self.notify_changed();
    }

    /// Look up a device by id
    pub async fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// All currently known devices
    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Ids of all currently known devices
    pub async fn device_ids(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Seed paired-but-unreachable devices from the trust store
    ///
    /// Called once at startup so paired devices are listed before they
    /// reconnect. Only the device id is known until a link arrives with a
    /// fresh identity.
    pub async fn load_trusted_devices(&self) {
        let mut devices = self.devices.write().await;
        let mut added = false;

        for device_id in self.trust_store.trusted_ids() {
            if devices.contains_key(&device_id) {
                continue;
            }

            let info =
                DeviceInfo::with_id(device_id.clone(), device_id.clone(), DeviceType::Desktop, 0);
            let device = Arc::new(Device::new(
                info,
                self.trust_store.clone(),
                self.factories.clone(),
                self.pairing_tx.clone(),
            ));

            debug!("Loaded trusted device {}", device_id);
            devices.insert(device_id, device);
            added = true;
        }

        drop(devices);
        if added {
            self.notify_changed();
        }
    }

    fn discovery_active(&self) -> bool {
        !self
            .discovery_refs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Enter discovery mode
    ///
    /// Unpaired devices are retained while any token is alive. The first
    /// acquisition also nudges providers to re-announce.
    pub fn acquire_discovery(self: &Arc<Self>) -> DiscoveryToken {
        let token_id = self.next_token.fetch_add(1, Ordering::Relaxed);

        let first = {
            let mut refs = self
                .discovery_refs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let first = refs.is_empty();
            refs.insert(token_id);
            first
        };

        debug!("Discovery token {} acquired", token_id);
        if first {
            self.on_network_change();
        }

        DiscoveryToken {
            registry: self.clone(),
            token_id: Some(token_id),
        }
    }

    async fn release_discovery(&self, token_id: u64) {
        let last = {
            let mut refs = self
                .discovery_refs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            refs.remove(&token_id) && refs.is_empty()
        };

        debug!("Discovery token {} released", token_id);
        if last {
            self.clean_devices().await;
        }
    }

    /// Sweep out devices no one cares about
    ///
    /// Untrusted devices that are not mid-pairing get evicted when
    /// unreachable; when still reachable their links are closed and the
    /// eviction follows through the resulting `ConnectionLost`.
    async fn clean_devices(&self) {
        let mut devices = self.devices.write().await;
        let mut evicted = Vec::new();

        for (device_id, device) in devices.iter() {
            if device.is_paired() || device.pair_status().is_pairing() {
                continue;
            }

            if device.is_reachable().await {
                debug!("Closing links to untrusted device {}", device_id);
                device.close_links().await;
            } else {
                evicted.push(device_id.clone());
            }
        }

        for device_id in evicted {
            info!("Evicting untrusted device {}", device_id);
            devices.remove(&device_id);
        }

        drop(devices);
        self.notify_changed();
    }
}

/// Keeps discovery mode active while alive
///
/// Dropping the token releases it; [`DiscoveryToken::release`] does the
/// same but lets the caller await the cleanup.
pub struct DiscoveryToken {
    registry: Arc<DeviceRegistry>,
    token_id: Option<u64>,
}

impl DiscoveryToken {
    /// Release the token and wait for any resulting cleanup
    pub async fn release(mut self) {
        if let Some(token_id) = self.token_id.take() {
            self.registry.release_discovery(token_id).await;
        }
    }
}

impl Drop for DiscoveryToken {
    fn drop(&mut self) {
        if let Some(token_id) = self.token_id.take() {
            let registry = self.registry.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    registry.release_discovery(token_id).await;
                });
            }
        }
    }
}
