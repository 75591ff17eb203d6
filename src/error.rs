//! Error handling for the peerlink protocol
//!
//! This module provides a single error type for all protocol operations.
//! Errors are automatically converted from underlying library errors using
//! `thiserror`.
//!
//! ## Error Categories
//!
//! ### Link errors
//! - `MalformedPacket`: a packet that could not be decoded; the receiver
//!   drops the packet, never the connection
//! - `NotReachable`: no open link to the device, or the link closed while a
//!   send was pending
//! - `HandshakeFailed`: connection establishment failed (TLS failure,
//!   certificate mismatch against the pinned certificate, protocol version
//!   mismatch)
//! - `PayloadTransferFailed`: the out-of-band payload channel failed or
//!   delivered fewer bytes than announced
//!
//! ### Pairing errors
//! - `PairingTimeout`: the peer did not answer a pairing request in time
//! - `CanceledByPeer`: the peer rejected or withdrew a pairing exchange
//!
//! ### Infrastructure errors
//! I/O, JSON, TLS and certificate failures convert automatically from
//! `std::io::Error`, `serde_json::Error`, `openssl::ssl::Error` and
//! `openssl::error::ErrorStack`.

use thiserror::Error;

/// Result type for protocol operations
///
/// Type alias for `Result<T, ProtocolError>` used throughout the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// Most variants automatically convert from underlying library errors using
/// the `From` trait.
///
/// # Examples
///
/// ```rust
/// use peerlink::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("device-123".to_string());
/// assert_eq!(error.to_string(), "Device not found: device-123");
///
/// let error = ProtocolError::PairingTimeout;
/// assert_eq!(error.to_string(), "Pairing request timed out");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    ///
    /// Automatically converted from `std::io::Error`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    ///
    /// Automatically converted from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS/SSL error (secure connections)
    ///
    /// Automatically converted from `openssl::ssl::Error`.
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or management error
    ///
    /// Automatically converted from `openssl::error::ErrorStack`.
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Certificate validation error
    ///
    /// Raised when a stored certificate cannot be parsed or re-encoded.
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// A received packet could not be decoded
    ///
    /// The offending packet is dropped; the connection stays up.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// No open link to the device, or the link closed mid-send
    #[error("Device not reachable: {0}")]
    NotReachable(String),

    /// Connection establishment failed
    ///
    /// Covers TLS handshake failures, identity exchange failures, protocol
    /// version mismatches, and a presented certificate that does not match
    /// the pinned certificate for the claimed device id.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Out-of-band payload transfer failed or was incomplete
    ///
    /// Partial payload data is discarded, never surfaced.
    #[error("Payload transfer failed: {0}")]
    PayloadTransferFailed(String),

    /// The peer did not answer a pairing request within the timeout
    #[error("Pairing request timed out")]
    PairingTimeout,

    /// The peer rejected or withdrew a pairing exchange
    #[error("Pairing canceled by peer")]
    CanceledByPeer,

    /// Device not found in the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation requires a paired device
    #[error("Not paired")]
    NotPaired,

    /// Plugin-specific error
    ///
    /// Raised during plugin lifecycle or packet handling. Plugin errors are
    /// isolated at the device boundary and never tear down the link.
    #[error("Plugin error: {0}")]
    Plugin(String),
}

impl ProtocolError {
    /// Check if this error is recoverable (transient, worth retrying)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peerlink::ProtocolError;
    ///
    /// let error = ProtocolError::NotReachable("no open link".to_string());
    /// assert!(error.is_recoverable());
    ///
    /// let error = ProtocolError::NotPaired;
    /// assert!(!error.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotReachable(_)
                | ProtocolError::PairingTimeout
                | ProtocolError::PayloadTransferFailed(_)
                | ProtocolError::Io(_)
        )
    }
}
