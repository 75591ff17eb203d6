//! Pairing protocol
//!
//! Pairing establishes mutual trust between two devices over an existing
//! link. Either side may request; the other side accepts or rejects.
//! Requests expire if unanswered. The protocol uses a single packet type,
//! `peerlink.pair`, whose body carries one boolean field `pair`.
//!
//! Trust itself lives in the trust store as a pinned certificate; this
//! module only drives the handshake and reports its outcome as
//! [`PairingEvent`]s.

mod events;
mod handler;

pub use events::{PairingEvent, PairingFailureReason};
pub use handler::{PairingHandler, PACKET_TYPE_PAIR};

/// Pairing state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStatus {
    /// No pairing relationship and no request in flight
    NotPaired,
    /// We sent a request and await the peer's answer
    Requested,
    /// The peer sent a request and awaits ours
    RequestedByPeer,
    /// Mutual trust established
    Paired,
}

impl PairStatus {
    /// Whether a request is pending in either direction
    pub fn is_pairing(&self) -> bool {
        matches!(self, PairStatus::Requested | PairStatus::RequestedByPeer)
    }
}
