//! Pairing events

/// Why a pairing attempt did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailureReason {
    /// No answer arrived before the request expired
    Timeout,
    /// The peer refused our request or withdrew its own
    CanceledByPeer,
    /// The pair packet could not be delivered
    NotReachable,
}

impl std::fmt::Display for PairingFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairingFailureReason::Timeout => write!(f, "pairing request timed out"),
            PairingFailureReason::CanceledByPeer => write!(f, "canceled by peer"),
            PairingFailureReason::NotReachable => write!(f, "device not reachable"),
        }
    }
}

/// Notifications emitted by a [`super::PairingHandler`]
///
/// `PairingDone` is the only event after which the peer may be trusted;
/// the consumer pins the peer certificate on receiving it and unpins on
/// `Unpaired`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// The peer asked to pair; answer with accept or reject
    IncomingRequest { device_id: String },
    /// Pairing completed in both directions
    PairingDone { device_id: String },
    /// A pairing attempt ended without trust
    PairingFailed {
        device_id: String,
        reason: PairingFailureReason,
    },
    /// An existing pairing was dissolved, by us or by the peer
    Unpaired { device_id: String },
}

impl PairingEvent {
    /// Device the event concerns
    pub fn device_id(&self) -> &str {
        match self {
            PairingEvent::IncomingRequest { device_id }
            | PairingEvent::PairingDone { device_id }
            | PairingEvent::PairingFailed { device_id, .. }
            | PairingEvent::Unpaired { device_id } => device_id,
        }
    }
}
