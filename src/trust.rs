//! Certificates and the trust store
//!
//! Each device owns a long-lived self-signed certificate whose Common Name
//! is the device id. Trust is established on first use: when pairing
//! completes, the peer's certificate is pinned in the [`TrustStore`] and
//! every later handshake is validated against the pinned copy.
//!
//! ## Certificate Requirements
//!
//! - **Algorithm**: RSA 2048-bit
//! - **Organization (O)**: "Peerlink"
//! - **Organizational Unit (OU)**: "Peerlink device"
//! - **Common Name (CN)**: Device UUID
//! - **Validity**: 10 years
//!
//! ## Concurrency
//!
//! The store is single-writer, multiple-reader. Writes happen only on
//! pairing completion and unpair; handshake validation takes read access.

use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Name};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Certificate validity period (10 years)
const CERT_VALIDITY_YEARS: i64 = 10;

/// Organization name in certificate
const CERT_ORG: &str = "Peerlink";

/// Organizational unit in certificate
const CERT_ORG_UNIT: &str = "Peerlink device";

/// Device certificate information
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Device ID (UUID)
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key
    pub private_key: Vec<u8>,

    /// SHA256 fingerprint of certificate (for verification)
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for a device
    ///
    /// # Examples
    ///
    /// ```
    /// use peerlink::trust::CertificateInfo;
    ///
    /// let cert_info = CertificateInfo::generate("test_device_id").unwrap();
    /// println!("Fingerprint: {}", cert_info.fingerprint);
    /// ```
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        // Generate RSA 2048-bit key pair
        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;

        // X509v3
        builder.set_version(2)?;

        // Random serial number
        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;

        // Issuer same as subject for self-signed
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_YEARS as u32 * 365)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;

        // End-entity device certificate, not a CA
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;

        let cert = builder.build();

        let certificate_der = cert.to_der()?;
        let private_key_der = pkey.private_key_to_der()?;

        let fingerprint = Self::calculate_fingerprint(&certificate_der);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate: certificate_der,
            private_key: private_key_der,
            fingerprint,
        })
    }

    /// Calculate SHA256 fingerprint of a certificate
    ///
    /// Returns fingerprint in format: XX:XX:XX:...:XX (hex bytes separated by colons)
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(cert_der);
        let hash = hasher.finalize();

        hash.iter()
            .map(|b| hex::encode_upper([*b]))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Save certificate and private key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let cert = X509::from_der(&self.certificate)?;
        let cert_pem = cert.to_pem()?;
        fs::write(cert_path, cert_pem)?;

        let pkey = PKey::private_key_from_der(&self.private_key)?;
        let key_pem = pkey.private_key_to_pem_pkcs8()?;
        fs::write(key_path, key_pem)?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );

        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let cert_pem = fs::read(cert_path)?;
        let cert = X509::from_pem(&cert_pem)?;
        let certificate = cert.to_der()?;

        let key_pem = fs::read(key_path)?;
        let pkey = PKey::private_key_from_pem(&key_pem)?;
        let private_key = pkey.private_key_to_der()?;

        let device_id = Self::extract_device_id_from_cert(&cert)?;

        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Load the local identity certificate or generate it on first run
    ///
    /// Failure here is fatal for the caller; without an identity certificate
    /// no connection can be authenticated.
    pub fn load_or_generate(device_id: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let device_id = device_id.into();
        let dir = dir.as_ref();
        let cert_path = dir.join("device_cert.pem");
        let key_path = dir.join("device_key.pem");

        if cert_path.exists() && key_path.exists() {
            info!("Loading existing certificate for device {}", device_id);
            Self::load_from_files(&cert_path, &key_path)
        } else {
            info!("Generating new certificate for device {}", device_id);
            let cert = Self::generate(&device_id)?;
            cert.save_to_files(&cert_path, &key_path)?;
            Ok(cert)
        }
    }

    /// Extract device ID from certificate Common Name
    fn extract_device_id_from_cert(cert: &X509) -> Result<String> {
        let subject_name = cert.subject_name();

        for entry in subject_name.entries() {
            if entry.object().nid() == openssl::nid::Nid::COMMONNAME {
                let cn = std::str::from_utf8(entry.data().as_slice())
                    .map_err(|_| {
                        ProtocolError::CertificateValidation(
                            "Certificate Common Name is not valid UTF-8".to_string(),
                        )
                    })?
                    .to_string();
                return Ok(cn);
            }
        }

        Err(ProtocolError::CertificateValidation(
            "Certificate does not contain Common Name".to_string(),
        ))
    }
}

/// Pinned peer certificates
///
/// One PEM file per trusted peer under the store directory. A peer id is
/// trusted exactly when a certificate is pinned for it.
pub struct TrustStore {
    /// Pinned certificates (device_id -> DER)
    pinned: RwLock<HashMap<String, Vec<u8>>>,

    /// Certificate storage directory
    store_dir: PathBuf,
}

impl TrustStore {
    /// Open a trust store, loading previously pinned certificates
    pub fn open(store_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let store_dir = store_dir.into();
        fs::create_dir_all(&store_dir)?;

        let store = Self {
            pinned: RwLock::new(HashMap::new()),
            store_dir,
        };
        store.load()?;

        Ok(Arc::new(store))
    }

    /// Load all pinned certificates from disk
    fn load(&self) -> Result<()> {
        let mut pinned = self
            .pinned
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        for entry in fs::read_dir(&self.store_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) != Some("pem") {
                continue;
            }
            let Some(device_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // The local identity lives in the same directory
            if device_id == "device_cert" || device_id == "device_key" {
                continue;
            }

            let cert_data = fs::read(&path)?;
            match X509::from_pem(&cert_data) {
                Ok(cert) => {
                    let cert_der = cert.to_der()?;
                    pinned.insert(device_id.to_string(), cert_der);
                    debug!("Loaded pinned certificate: {}", device_id);
                }
                Err(e) => {
                    warn!("Failed to parse certificate for {}: {}", device_id, e);
                }
            }
        }

        info!("Loaded {} pinned device certificates", pinned.len());
        Ok(())
    }

    /// Pin a peer certificate (marks the peer trusted)
    pub fn pin(&self, device_id: &str, cert_der: &[u8]) -> Result<()> {
        let cert_path = self.store_dir.join(format!("{}.pem", device_id));
        let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", cert_der.to_vec()));
        fs::write(&cert_path, cert_pem)?;

        self.pinned
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(device_id.to_string(), cert_der.to_vec());
        debug!(
            "Pinned certificate for device {} at {:?}",
            device_id, cert_path
        );

        Ok(())
    }

    /// Remove a pinned certificate (marks the peer untrusted)
    pub fn unpin(&self, device_id: &str) -> Result<()> {
        let cert_path = self.store_dir.join(format!("{}.pem", device_id));
        if cert_path.exists() {
            fs::remove_file(&cert_path)?;
        }

        self.pinned
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(device_id);
        debug!("Removed pinned certificate for device {}", device_id);

        Ok(())
    }

    /// Get the pinned certificate for a peer, if any
    pub fn pinned(&self, device_id: &str) -> Option<Vec<u8>> {
        self.pinned
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    /// Check whether a peer is trusted
    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.pinned
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(device_id)
    }

    /// List all trusted peer ids
    pub fn trusted_ids(&self) -> Vec<String> {
        self.pinned
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_certificate_generation() {
        let cert = CertificateInfo::generate("test_device_123").unwrap();

        assert_eq!(cert.device_id, "test_device_123");
        assert!(!cert.certificate.is_empty());
        assert!(!cert.private_key.is_empty());
        assert!(!cert.fingerprint.is_empty());

        // Fingerprint should be in format XX:XX:XX:...
        assert!(cert.fingerprint.contains(':'));
        assert!(cert.fingerprint.len() > 60); // SHA256 is 64 hex chars + 31 colons
    }

    #[test]
    fn test_certificate_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("cert.pem");
        let key_path = temp_dir.path().join("key.pem");

        let original = CertificateInfo::generate("test_device").unwrap();
        original.save_to_files(&cert_path, &key_path).unwrap();

        assert!(cert_path.exists());
        assert!(key_path.exists());

        let loaded = CertificateInfo::load_from_files(&cert_path, &key_path).unwrap();
        assert_eq!(original.fingerprint, loaded.fingerprint);
        assert_eq!(loaded.device_id, "test_device");
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let temp_dir = TempDir::new().unwrap();

        let first = CertificateInfo::load_or_generate("device_a", temp_dir.path()).unwrap();
        let second = CertificateInfo::load_or_generate("device_a", temp_dir.path()).unwrap();

        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_certificate_fingerprint() {
        let cert1 = CertificateInfo::generate("device1").unwrap();
        let cert2 = CertificateInfo::generate("device2").unwrap();

        // Different devices should have different fingerprints
        assert_ne!(cert1.fingerprint, cert2.fingerprint);

        // Same certificate should have same fingerprint
        let fp1 = CertificateInfo::calculate_fingerprint(&cert1.certificate);
        let fp2 = CertificateInfo::calculate_fingerprint(&cert1.certificate);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn test_fingerprint_format() {
        let cert = CertificateInfo::generate("test").unwrap();
        let parts: Vec<&str> = cert.fingerprint.split(':').collect();

        // SHA256 produces 32 bytes = 32 parts when split by colons
        assert_eq!(parts.len(), 32);

        for part in parts {
            assert_eq!(part.len(), 2);
            assert!(part.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_trust_store_pin_unpin() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path()).unwrap();
        let cert = CertificateInfo::generate("peer_device").unwrap();

        assert!(!store.is_trusted("peer_device"));

        store.pin("peer_device", &cert.certificate).unwrap();
        assert!(store.is_trusted("peer_device"));
        assert_eq!(store.pinned("peer_device"), Some(cert.certificate.clone()));

        store.unpin("peer_device").unwrap();
        assert!(!store.is_trusted("peer_device"));
        assert_eq!(store.pinned("peer_device"), None);
    }

    #[test]
    fn test_trust_store_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let cert = CertificateInfo::generate("peer_device").unwrap();

        {
            let store = TrustStore::open(temp_dir.path()).unwrap();
            store.pin("peer_device", &cert.certificate).unwrap();
        }

        let reopened = TrustStore::open(temp_dir.path()).unwrap();
        assert!(reopened.is_trusted("peer_device"));
        assert_eq!(reopened.pinned("peer_device"), Some(cert.certificate));
        assert_eq!(reopened.trusted_ids(), vec!["peer_device".to_string()]);
    }

    #[test]
    fn test_trust_store_ignores_local_identity_files() {
        let temp_dir = TempDir::new().unwrap();

        // The local identity shares the directory with pinned peers
        CertificateInfo::load_or_generate("local_device", temp_dir.path()).unwrap();

        let store = TrustStore::open(temp_dir.path()).unwrap();
        assert!(store.trusted_ids().is_empty());
    }

    #[test]
    fn test_unpin_unknown_device_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = TrustStore::open(temp_dir.path()).unwrap();

        assert!(store.unpin("never_seen").is_ok());
    }
}
