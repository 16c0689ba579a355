//! Authentication error types.
//!
//! This module defines the errors raised by the SAML protocol engine and the
//! surrounding trust and storage plumbing. Protocol errors are detailed for
//! logging but collapse into a single client-facing response (see
//! [`crate::http`]).

use std::fmt;

/// Errors that can occur while driving the SAML service provider flow.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The SAML response could not be decoded or lacks a required element.
    #[error("Malformed SAML response: {message}")]
    MalformedResponse {
        /// Description of what was wrong with the payload.
        message: String,
    },

    /// No valid XML signature from a trusted IdP certificate covers the assertion.
    #[error("Signature invalid: {message}")]
    SignatureInvalid {
        /// Description of why verification failed.
        message: String,
    },

    /// The IdP answered with a non-success status code.
    #[error("Identity provider returned status {status}")]
    IdpStatus {
        /// The top-level `StatusCode` value.
        status: String,
    },

    /// The assertion issuer is not the configured IdP.
    #[error("Unexpected assertion issuer: {issuer}")]
    IssuerMismatch {
        /// The issuer found in the assertion.
        issuer: String,
    },

    /// The referenced AuthnRequest was never issued or was already consumed.
    #[error("Unknown or replayed request: {request_id}")]
    UnknownOrReplayedRequest {
        /// The `InResponseTo` value.
        request_id: String,
    },

    /// The referenced AuthnRequest was issued but its lifetime has elapsed.
    #[error("Authentication request expired: {request_id}")]
    RequestExpired {
        /// The `InResponseTo` value.
        request_id: String,
    },

    /// The assertion validity window ended before now (minus leeway).
    #[error("Assertion expired")]
    AssertionExpired,

    /// The assertion validity window starts after now (plus leeway).
    #[error("Assertion not yet valid")]
    AssertionNotYetValid,

    /// The audience restriction or recipient does not name this service provider.
    #[error("Audience mismatch: {message}")]
    AudienceMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// Trust material required for the operation is not loaded.
    #[error("Missing trust material: {message}")]
    MissingTrustMaterial {
        /// What is missing.
        message: String,
    },

    /// An error occurred while storing or retrieving pending requests.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `MalformedResponse` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Creates a new `SignatureInvalid` error.
    #[must_use]
    pub fn signature_invalid(message: impl Into<String>) -> Self {
        Self::SignatureInvalid {
            message: message.into(),
        }
    }

    /// Creates a new `UnknownOrReplayedRequest` error.
    #[must_use]
    pub fn unknown_request(request_id: impl Into<String>) -> Self {
        Self::UnknownOrReplayedRequest {
            request_id: request_id.into(),
        }
    }

    /// Creates a new `RequestExpired` error.
    #[must_use]
    pub fn request_expired(request_id: impl Into<String>) -> Self {
        Self::RequestExpired {
            request_id: request_id.into(),
        }
    }

    /// Creates a new `AudienceMismatch` error.
    #[must_use]
    pub fn audience_mismatch(message: impl Into<String>) -> Self {
        Self::AudienceMismatch {
            message: message.into(),
        }
    }

    /// Creates a new `MissingTrustMaterial` error.
    #[must_use]
    pub fn missing_trust(message: impl Into<String>) -> Self {
        Self::MissingTrustMaterial {
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if the error was caused by the content of an inbound
    /// protocol message rather than by local infrastructure.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Returns `true` if this is a server-side failure (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::MissingTrustMaterial { .. } | Self::Storage { .. } | Self::Internal { .. }
        )
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedResponse { .. } => ErrorCategory::Decoding,
            Self::SignatureInvalid { .. } | Self::IssuerMismatch { .. } => ErrorCategory::Trust,
            Self::IdpStatus { .. } => ErrorCategory::Federation,
            Self::UnknownOrReplayedRequest { .. } | Self::RequestExpired { .. } => {
                ErrorCategory::Replay
            }
            Self::AssertionExpired | Self::AssertionNotYetValid => ErrorCategory::Validity,
            Self::AudienceMismatch { .. } => ErrorCategory::Audience,
            Self::MissingTrustMaterial { .. } => ErrorCategory::Configuration,
            Self::Storage { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of authentication errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Payload could not be decoded.
    Decoding,
    /// Signature or issuer trust failures.
    Trust,
    /// The IdP reported a failure.
    Federation,
    /// Request ID bookkeeping (unknown, replayed, expired).
    Replay,
    /// Assertion time window failures.
    Validity,
    /// Audience or recipient failures.
    Audience,
    /// Configuration errors.
    Configuration,
    /// Infrastructure/storage errors.
    Infrastructure,
    /// Internal server errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoding => write!(f, "decoding"),
            Self::Trust => write!(f, "trust"),
            Self::Federation => write!(f, "federation"),
            Self::Replay => write!(f, "replay"),
            Self::Validity => write!(f, "validity"),
            Self::Audience => write!(f, "audience"),
            Self::Configuration => write!(f, "configuration"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
