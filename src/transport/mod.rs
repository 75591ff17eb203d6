//! Network transports
//!
//! Connections start as plain TCP for the identity exchange and are then
//! upgraded to TLS. The TLS roles are inverted relative to TCP: the side
//! that accepted the TCP connection runs the TLS client handshake.

pub mod tcp;
pub mod tls;
pub mod tls_config;

pub use tcp::{read_plaintext_packet, write_plaintext_packet};
pub use tls::TlsConnection;
