//! TLS identity for this node.
//!
//! Every node owns a self-signed ECDSA P-256 certificate. The first 32
//! hex characters of SHA-256 over the certificate DER are the node's
//! fingerprint, the stable identity peers key their caches on. The PEM
//! pair is persisted through the configuration file so the fingerprint
//! survives restarts.

use base64::Engine;
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Subject common name on generated certificates.
const CERT_COMMON_NAME: &str = "localsend-localCert";

/// Certificate validity window in days.
const CERT_VALIDITY_DAYS: i64 = 365;

/// Hex length of a fingerprint (first 16 bytes of the digest).
pub const FINGERPRINT_LEN: usize = 32;

/// A node's TLS certificate, private key, and derived fingerprint.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    /// `hex(SHA256(cert DER))[..32]`
    pub fingerprint: String,
}

impl TlsIdentity {
    /// Generate a fresh self-signed identity.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::new(vec!["localhost".to_string()])
            .map_err(|e| Error::Tls(format!("cert params: {e}")))?;
        params
            .distinguished_name
            .push(DnType::CommonName, CERT_COMMON_NAME);
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Tls(format!("key generation: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Tls(format!("self-sign: {e}")))?;

        let fingerprint = fingerprint_of_der(cert.der());
        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            fingerprint,
        })
    }

    /// Rebuild an identity from a persisted PEM pair.
    ///
    /// Fails if the PEM does not contain exactly one still-valid
    /// certificate with a parseable private key; callers regenerate on
    /// failure.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let mut cert_reader = cert_pem.as_bytes();
        let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Tls(format!("certificate PEM: {e}")))?;
        let [cert_der] = certs.as_slice() else {
            return Err(Error::Tls("expected exactly one certificate".to_string()));
        };

        if cert_expired(cert_der.as_ref())? {
            return Err(Error::Tls("certificate expired".to_string()));
        }

        let mut key_reader = key_pem.as_bytes();
        rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| Error::Tls(format!("private key PEM: {e}")))?
            .ok_or_else(|| Error::Tls("no private key in PEM".to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            fingerprint: fingerprint_of_der(cert_der.as_ref()),
        })
    }

    /// Reuse a persisted identity when it is valid and not expired,
    /// else generate.
    ///
    /// Returns the identity and whether it was freshly generated (so the
    /// caller knows to persist the new PEM pair).
    pub fn load_or_generate(persisted: Option<(&str, &str)>) -> Result<(Self, bool)> {
        if let Some((cert_pem, key_pem)) = persisted {
            match Self::from_pem(cert_pem, key_pem) {
                Ok(identity) => return Ok((identity, false)),
                Err(e) => {
                    tracing::warn!("persisted TLS identity unusable, regenerating: {e}");
                }
            }
        }
        Ok((Self::generate()?, true))
    }
}

/// Whether the certificate's validity window has closed.
fn cert_expired(der: &[u8]) -> Result<bool> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Tls(format!("certificate DER: {e}")))?;
    let not_after = cert.validity().not_after.timestamp();
    Ok(not_after <= time::OffsetDateTime::now_utc().unix_timestamp())
}

/// Compute the wire fingerprint of a certificate's DER bytes.
#[must_use]
pub fn fingerprint_of_der(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut hex = String::with_capacity(FINGERPRINT_LEN);
    for byte in &digest[..FINGERPRINT_LEN / 2] {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Random fingerprint for nodes running plain HTTP (no certificate).
///
/// LocalSend clients on HTTP generate a random identity string instead
/// of a certificate digest.
#[must_use]
pub fn random_fingerprint() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes);
    encoded[..FINGERPRINT_LEN].to_string()
}
