//! Trust material: identity provider certificates and the service provider
//! key pair.
//!
//! Everything here is loaded once at startup and shared read-only behind an
//! `Arc` for the lifetime of the process.

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use time::OffsetDateTime;
use url::Url;

/// Errors raised while assembling trust material.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// A certificate could not be parsed or carries a non-RSA key.
    #[error("Invalid certificate: {message}")]
    Certificate {
        /// Description of the failure.
        message: String,
    },

    /// The private key could not be parsed.
    #[error("Invalid private key: {message}")]
    PrivateKey {
        /// Description of the failure.
        message: String,
    },

    /// The service provider certificate does not belong to its private key.
    #[error("Service provider certificate does not match the private key")]
    KeyMismatch,

    /// The identity provider has no usable signing certificate.
    #[error("Identity provider metadata contains no signing certificate")]
    NoIdpCertificates,

    /// Metadata could not be interpreted.
    #[error("Invalid metadata: {message}")]
    Metadata {
        /// Description of the failure.
        message: String,
    },
}

impl TrustError {
    /// Creates a new `Certificate` error.
    #[must_use]
    pub fn certificate(message: impl Into<String>) -> Self {
        Self::Certificate {
            message: message.into(),
        }
    }

    /// Creates a new `Metadata` error.
    #[must_use]
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }
}

// ============================================================================
// Certificates
// ============================================================================

/// An X.509 certificate carrying an RSA public key.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
    public_key: RsaPublicKey,
    subject: String,
    not_after: OffsetDateTime,
}

impl Certificate {
    /// Parses a DER-encoded certificate.
    ///
    /// # Errors
    /// Returns an error for malformed certificates and non-RSA keys.
    pub fn from_der(der: &[u8]) -> Result<Self, TrustError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| TrustError::certificate(e.to_string()))?;
        let public_key = RsaPublicKey::from_public_key_der(cert.public_key().raw)
            .map_err(|e| TrustError::certificate(format!("not an RSA key: {e}")))?;

        Ok(Self {
            der: der.to_vec(),
            public_key,
            subject: cert.subject().to_string(),
            not_after: cert.validity().not_after.to_datetime(),
        })
    }

    /// Parses the first certificate of a PEM bundle.
    ///
    /// # Errors
    /// Returns an error if no certificate block is found or it is invalid.
    pub fn from_pem(pem: &[u8]) -> Result<Self, TrustError> {
        let (_, block) = x509_parser::pem::parse_x509_pem(pem)
            .map_err(|e| TrustError::certificate(e.to_string()))?;
        if block.label != "CERTIFICATE" {
            return Err(TrustError::certificate(format!(
                "expected CERTIFICATE block, found {}",
                block.label
            )));
        }
        Self::from_der(&block.contents)
    }

    /// Parses base64 certificate content as found in metadata `X509Certificate`.
    ///
    /// # Errors
    /// Returns an error for invalid base64 or an invalid certificate.
    pub fn from_base64(text: &str) -> Result<Self, TrustError> {
        let der = crate::xml::dsig::decode_base64(text)
            .map_err(|e| TrustError::certificate(e.to_string()))?;
        Self::from_der(&der)
    }

    /// DER encoding.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The certified RSA public key.
    #[must_use]
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Subject distinguished name.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// End of the certificate validity period.
    #[must_use]
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

// ============================================================================
// Parties
// ============================================================================

/// What the service provider knows about its identity provider.
#[derive(Debug, Clone)]
pub struct IdpDescriptor {
    /// IdP entity ID, expected as the assertion `Issuer`.
    pub entity_id: String,
    /// Single sign-on endpoint for the HTTP-Redirect binding.
    pub sso_url: Option<Url>,
    /// Certificates whose keys may sign responses and assertions.
    pub signing_certificates: Vec<Certificate>,
}

/// The service provider's own signing credentials.
#[derive(Debug, Clone)]
pub struct ServiceProviderKeys {
    private_key: RsaPrivateKey,
    certificate: Certificate,
}

impl ServiceProviderKeys {
    /// Pairs a private key with its certificate.
    ///
    /// # Errors
    /// Returns [`TrustError::KeyMismatch`] if the certificate was issued for a
    /// different key.
    pub fn new(private_key: RsaPrivateKey, certificate: Certificate) -> Result<Self, TrustError> {
        let public = private_key.to_public_key();
        if public.n() != certificate.public_key().n() || public.e() != certificate.public_key().e()
        {
            return Err(TrustError::KeyMismatch);
        }
        Ok(Self {
            private_key,
            certificate,
        })
    }

    /// Parses a PEM private key (PKCS#8 or PKCS#1) and pairs it with a PEM
    /// certificate.
    ///
    /// # Errors
    /// Returns an error if either input is invalid or they do not match.
    pub fn from_pem(key_pem: &str, certificate_pem: &str) -> Result<Self, TrustError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(key_pem))
            .map_err(|e| TrustError::PrivateKey {
                message: e.to_string(),
            })?;
        let certificate = Certificate::from_pem(certificate_pem.as_bytes())?;
        Self::new(private_key, certificate)
    }

    /// The private signing key.
    #[must_use]
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// The published certificate.
    #[must_use]
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }
}

/// All trust material the service provider needs.
#[derive(Debug, Clone)]
pub struct TrustStore {
    idp: IdpDescriptor,
    sp: ServiceProviderKeys,
    idp_keys: Vec<RsaPublicKey>,
}

impl TrustStore {
    /// Assembles the store.
    ///
    /// # Errors
    /// Returns [`TrustError::NoIdpCertificates`] if the IdP has no signing
    /// certificate.
    pub fn new(idp: IdpDescriptor, sp: ServiceProviderKeys) -> Result<Self, TrustError> {
        if idp.signing_certificates.is_empty() {
            return Err(TrustError::NoIdpCertificates);
        }
        let idp_keys = idp
            .signing_certificates
            .iter()
            .map(|c| c.public_key().clone())
            .collect();
        Ok(Self { idp, sp, idp_keys })
    }

    /// The identity provider description.
    #[must_use]
    pub fn idp(&self) -> &IdpDescriptor {
        &self.idp
    }

    /// Public keys trusted to sign assertions.
    #[must_use]
    pub fn idp_signing_keys(&self) -> &[RsaPublicKey] {
        &self.idp_keys
    }

    /// The service provider credentials.
    #[must_use]
    pub fn service_provider(&self) -> &ServiceProviderKeys {
        &self.sp
    }
}
