//! TLS configuration
//!
//! Builds the OpenSSL connector and acceptor used to upgrade connections
//! after the plaintext identity exchange. Certificate verification is
//! disabled at the TLS layer; peers authenticate with self-signed
//! certificates that are validated against the trust store after the
//! handshake completes.

use crate::trust::CertificateInfo;
use crate::{ProtocolError, Result};
use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::sync::Arc;
use tracing::debug;

/// Cipher suites accepted for compatibility with mobile peers
///
/// ECDHE-RSA-AES128-SHA is required for older peers that only speak TLS 1.0.
/// @SECLEVEL=1 is required to allow TLS 1.0 and the weaker suites (security
/// level 2 blocks them).
const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

/// Create a TLS acceptor for the server side of the inverted handshake
///
/// The acceptor presents our certificate and accepts any peer certificate;
/// the caller validates the presented certificate against the pinned one
/// once the handshake is done.
pub fn create_acceptor(our_cert: &CertificateInfo) -> Result<Arc<SslAcceptor>> {
    debug!("Creating TLS acceptor (TLS 1.0+ support)");

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to create SSL acceptor: {}", e))
        })?;

    builder
        .set_min_proto_version(Some(SslVersion::TLS1))
        .map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to set min TLS version: {}", e))
        })?;

    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to set max TLS version: {}", e))
        })?;

    builder.set_cipher_list(CIPHER_LIST).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to set cipher list: {}", e))
    })?;

    // Request the peer certificate but let any certificate through; trust is
    // checked against the pinned copy at the application layer
    builder.set_verify(SslVerifyMode::PEER);
    builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);

    let cert = X509::from_der(&our_cert.certificate).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to parse certificate: {}", e))
    })?;

    let pkey = PKey::private_key_from_der(&our_cert.private_key).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to parse private key: {}", e))
    })?;

    builder.set_certificate(&cert).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to set certificate: {}", e))
    })?;

    builder.set_private_key(&pkey).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to set private key: {}", e))
    })?;

    Ok(Arc::new(builder.build()))
}

/// Create a TLS connector for the client side of the inverted handshake
pub fn create_connector(our_cert: &CertificateInfo) -> Result<Arc<SslConnector>> {
    debug!("Creating TLS connector (TLS 1.0+ support)");

    let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to create SSL connector: {}", e))
    })?;

    builder
        .set_min_proto_version(Some(SslVersion::TLS1))
        .map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to set min TLS version: {}", e))
        })?;

    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to set max TLS version: {}", e))
        })?;

    builder.set_cipher_list(CIPHER_LIST).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to set cipher list: {}", e))
    })?;

    // Peers use self-signed certificates; validation happens against the
    // pinned copy after the handshake
    builder.set_verify(SslVerifyMode::NONE);

    let cert = X509::from_der(&our_cert.certificate).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to parse certificate: {}", e))
    })?;

    let pkey = PKey::private_key_from_der(&our_cert.private_key).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to parse private key: {}", e))
    })?;

    builder.set_certificate(&cert).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to set certificate: {}", e))
    })?;

    builder.set_private_key(&pkey).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to set private key: {}", e))
    })?;

    Ok(Arc::new(builder.build()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_acceptor() {
        let cert = CertificateInfo::generate("test_device").unwrap();
        assert!(create_acceptor(&cert).is_ok());
    }

    #[test]
    fn test_create_connector() {
        let cert = CertificateInfo::generate("device1").unwrap();
        assert!(create_connector(&cert).is_ok());
    }
}
