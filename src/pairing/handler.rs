//! Pairing state machine
//!
//! One handler per device, living as long as the device does. Transitions
//! are driven by local calls and incoming `peerlink.pair` packets; packets
//! go out over whatever link the caller passes in. Outcomes surface as
//! [`PairingEvent`]s.
//!
//! Pending requests expire on a timer. Our own requests wait 30 seconds;
//! requests from the peer expire after 25, shorter than the peer's own
//! timer so local expiry always fires first and neither side gets stuck.
//! Timers capture a state version when armed and do nothing if any
//! transition happened in between, so a timer can never clobber a state it
//! did not observe.

use super::{PairStatus, PairingEvent, PairingFailureReason};
use crate::link::LinkHandle;
use crate::{Packet, ProtocolError, Result};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Packet type for pairing negotiation
pub const PACKET_TYPE_PAIR: &str = "peerlink.pair";

/// How long our own pairing request stays pending
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a request from the peer stays pending
const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(25);

struct PairState {
    status: PairStatus,
    /// Bumped on every transition; armed timers check it before firing
    version: u64,
}

/// Drives the pairing exchange with one device
pub struct PairingHandler {
    device_id: String,
    state: Arc<Mutex<PairState>>,
    event_tx: mpsc::UnboundedSender<PairingEvent>,
    request_timeout: Duration,
    peer_request_timeout: Duration,
}

impl PairingHandler {
    /// Create a handler for a device
    ///
    /// `initially_paired` reflects whether the device is already trusted;
    /// the handler then starts in `Paired`.
    pub fn new(
        device_id: impl Into<String>,
        initially_paired: bool,
        event_tx: mpsc::UnboundedSender<PairingEvent>,
    ) -> Self {
        let status = if initially_paired {
            PairStatus::Paired
        } else {
            PairStatus::NotPaired
        };

        Self {
            device_id: device_id.into(),
            state: Arc::new(Mutex::new(PairState { status, version: 0 })),
            event_tx,
            request_timeout: REQUEST_TIMEOUT,
            peer_request_timeout: PEER_REQUEST_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeouts(mut self, request: Duration, peer_request: Duration) -> Self {
        self.request_timeout = request;
        self.peer_request_timeout = peer_request;
        self
    }

    /// Current pairing status
    pub fn status(&self) -> PairStatus {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Whether the device is currently paired
    pub fn is_paired(&self) -> bool {
        self.status() == PairStatus::Paired
    }

    /// Transition to `status`, invalidating any armed timer
    ///
    /// Returns the new version, for timers armed on this transition.
    fn transition(&self, status: PairStatus) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(
            "Pairing state for {}: {:?} -> {:?}",
            self.device_id, state.status, status
        );
        state.status = status;
        state.version += 1;
        state.version
    }

    fn emit(&self, event: PairingEvent) {
        let _ = self.event_tx.send(event);
    }

    fn pair_packet(pair: bool) -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": pair }))
    }

    /// Arm an expiry timer for the state version `armed_at`
    ///
    /// When it fires, the pending state reverts to `NotPaired`. A
    /// `PairingFailed(Timeout)` is emitted only for our own requests;
    /// an expired peer request just goes away.
    fn arm_expiry(&self, armed_at: u64, duration: Duration, report: bool) {
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let device_id = self.device_id.clone();

        tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.version != armed_at {
                    return;
                }
                state.status = PairStatus::NotPaired;
                state.version += 1;
            }

            info!("Pairing request involving {} expired", device_id);
            if report {
                let _ = event_tx.send(PairingEvent::PairingFailed {
                    device_id,
                    reason: PairingFailureReason::Timeout,
                });
            }
        });
    }

    /// Ask the peer to pair
    ///
    /// Sends `{pair: true}` and enters `Requested` once the packet is
    /// flushed. If the send fails the state is untouched and the failure
    /// is reported as `NotReachable`.
    pub async fn request_pairing(&self, link: &LinkHandle) -> Result<()> {
        match self.status() {
            PairStatus::Paired => {
                debug!("Ignoring pairing request for already-paired {}", self.device_id);
                return Ok(());
            }
            PairStatus::Requested => {
                debug!("Pairing request to {} already pending", self.device_id);
                return Ok(());
            }
            // Both sides want it; answer instead of asking again
            PairStatus::RequestedByPeer => return self.accept_pairing(link).await,
            PairStatus::NotPaired => {}
        }

        info!("Requesting pairing with {}", self.device_id);

        if let Err(e) = link.send_packet(Self::pair_packet(true)).await {
            warn!("Could not deliver pairing request to {}: {}", self.device_id, e);
            self.emit(PairingEvent::PairingFailed {
                device_id: self.device_id.clone(),
                reason: PairingFailureReason::NotReachable,
            });
            return Err(e);
        }

        let version = self.transition(PairStatus::Requested);
        self.arm_expiry(version, self.request_timeout, true);
        Ok(())
    }

    /// Accept a pending request from the peer
    pub async fn accept_pairing(&self, link: &LinkHandle) -> Result<()> {
        if self.status() != PairStatus::RequestedByPeer {
            debug!("No pending request from {} to accept", self.device_id);
            return Ok(());
        }

        match link.send_packet(Self::pair_packet(true)).await {
            Ok(()) => {
                self.transition(PairStatus::Paired);
                info!("Paired with {}", self.device_id);
                self.emit(PairingEvent::PairingDone {
                    device_id: self.device_id.clone(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("Could not deliver pairing acceptance to {}: {}", self.device_id, e);
                self.transition(PairStatus::NotPaired);
                self.emit(PairingEvent::PairingFailed {
                    device_id: self.device_id.clone(),
                    reason: PairingFailureReason::NotReachable,
                });
                Err(e)
            }
        }
    }

    /// Reject a pending request from the peer
    ///
    /// The refusal is sent best-effort; the local state reverts either way.
    pub async fn reject_pairing(&self, link: &LinkHandle) -> Result<()> {
        if self.status() != PairStatus::RequestedByPeer {
            debug!("No pending request from {} to reject", self.device_id);
            return Ok(());
        }

        info!("Rejecting pairing request from {}", self.device_id);
        self.transition(PairStatus::NotPaired);

        if let Err(e) = link.send_packet(Self::pair_packet(false)).await {
            debug!("Could not deliver pairing rejection to {}: {}", self.device_id, e);
        }
        Ok(())
    }

    /// Dissolve the pairing, from any state
    ///
    /// `{pair: false}` goes out best-effort when a link exists; `Unpaired`
    /// is emitted only if the device was actually paired.
    pub async fn unpair(&self, link: Option<&LinkHandle>) -> Result<()> {
        let was_paired = self.status() == PairStatus::Paired;
        self.transition(PairStatus::NotPaired);

        if let Some(link) = link {
            if let Err(e) = link.send_packet(Self::pair_packet(false)).await {
                debug!("Could not deliver unpair to {}: {}", self.device_id, e);
            }
        }

        if was_paired {
            info!("Unpaired from {}", self.device_id);
            self.emit(PairingEvent::Unpaired {
                device_id: self.device_id.clone(),
            });
        }
        Ok(())
    }

    /// Process an incoming `peerlink.pair` packet
    pub async fn handle_pair_packet(&self, packet: &Packet, link: &LinkHandle) -> Result<()> {
        let wants_pair = packet.get_body_field::<bool>("pair").ok_or_else(|| {
            ProtocolError::MalformedPacket("Pair packet without 'pair' field".to_string())
        })?;

        let status = self.status();
        debug!(
            "Pair packet from {} (pair={}, local state {:?})",
            self.device_id, wants_pair, status
        );

        match (wants_pair, status) {
            // Mutual requests accept each other
            (true, PairStatus::Requested) => {
                self.transition(PairStatus::Paired);
                info!("Paired with {} (mutual request)", self.device_id);
                self.emit(PairingEvent::PairingDone {
                    device_id: self.device_id.clone(),
                });
            }

            // Peer re-requests a pairing we already hold; re-accept
            // silently without a second PairingDone
            (true, PairStatus::Paired) => {
                debug!("Re-accepting pairing with {}", self.device_id);
                if let Err(e) = link.send_packet(Self::pair_packet(true)).await {
                    debug!("Could not re-accept pairing with {}: {}", self.device_id, e);
                }
            }

            // A fresh request; the consumer answers via accept or reject
            (true, PairStatus::NotPaired) | (true, PairStatus::RequestedByPeer) => {
                let version = self.transition(PairStatus::RequestedByPeer);
                self.arm_expiry(version, self.peer_request_timeout, false);
                self.emit(PairingEvent::IncomingRequest {
                    device_id: self.device_id.clone(),
                });
            }

            // Peer refused our request or withdrew its own
            (false, PairStatus::Requested) | (false, PairStatus::RequestedByPeer) => {
                self.transition(PairStatus::NotPaired);
                self.emit(PairingEvent::PairingFailed {
                    device_id: self.device_id.clone(),
                    reason: PairingFailureReason::CanceledByPeer,
                });
            }

            // Peer dissolved the pairing
            (false, PairStatus::Paired) => {
                self.transition(PairStatus::NotPaired);
                info!("Unpaired by {}", self.device_id);
                self.emit(PairingEvent::Unpaired {
                    device_id: self.device_id.clone(),
                });
            }

            // Both sides already unpaired; nothing to do
            (false, PairStatus::NotPaired) => {}
        }

        Ok(())
    }
}
