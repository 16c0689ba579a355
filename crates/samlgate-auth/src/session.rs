//! Stateless login sessions.
//!
//! A session is an RS256 JWT signed with the service provider key and carried
//! in a cookie. Validation is pure: signature, issuer and expiry are checked
//! against the token alone, and every failure looks the same to the caller.
//! There is no server-side revocation; logout only clears the cookie.

use std::collections::HashSet;

use axum::http::HeaderMap;
use axum_extra::extract::CookieJar;
use cookie::{Cookie, SameSite};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::config::SessionConfig;
use crate::trust::ServiceProviderKeys;

/// Errors that can occur while issuing or validating sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The token is missing, malformed, forged, foreign or expired.
    #[error("Invalid session")]
    Invalid,

    /// The signing key could not be prepared.
    #[error("Session key error: {message}")]
    Key {
        /// Description of the failure.
        message: String,
    },

    /// A token could not be produced.
    #[error("Failed to issue session: {message}")]
    Issue {
        /// Description of the failure.
        message: String,
    },
}

/// A validated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Authenticated subject (`NameID`).
    pub subject: String,
    /// When the session was issued.
    pub issued_at: OffsetDateTime,
    /// First instant at which the session is no longer valid.
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
}

/// Issues and validates session tokens and their cookies.
pub struct SessionManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    lifetime: Duration,
    cookie_name: String,
    secure: bool,
}

impl SessionManager {
    /// Creates a manager signing with the service provider key.
    ///
    /// `secure` controls the cookie `Secure` attribute and should be set when
    /// the gateway is served over HTTPS.
    ///
    /// # Errors
    /// Returns an error if the key cannot be converted for JWT use.
    pub fn new(
        keys: &ServiceProviderKeys,
        issuer: impl Into<String>,
        config: &SessionConfig,
        secure: bool,
    ) -> Result<Self, SessionError> {
        let key_error = |e: &dyn std::fmt::Display| SessionError::Key {
            message: e.to_string(),
        };

        let private_pem = keys
            .private_key()
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| key_error(&e))?;
        let encoding_key =
            EncodingKey::from_rsa_pem(private_pem.as_bytes()).map_err(|e| key_error(&e))?;

        let public_pem = keys
            .private_key()
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| key_error(&e))?;
        let decoding_key =
            DecodingKey::from_rsa_pem(public_pem.as_bytes()).map_err(|e| key_error(&e))?;

        Ok(Self {
            encoding_key,
            decoding_key,
            issuer: issuer.into(),
            lifetime: crate::clock::to_duration(config.lifetime),
            cookie_name: config.cookie_name.clone(),
            secure,
        })
    }

    /// Name of the session cookie.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Issues a token for `subject` valid from `now` for the configured
    /// lifetime.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn issue(&self, subject: &str, now: OffsetDateTime) -> Result<String, SessionError> {
        let claims = SessionClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            iat: now.unix_timestamp(),
            exp: now.saturating_add(self.lifetime).unix_timestamp(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key).map_err(|e| {
            SessionError::Issue {
                message: e.to_string(),
            }
        })
    }

    /// Validates a token at `now`.
    ///
    /// # Errors
    /// Returns [`SessionError::Invalid`] for any failure.
    pub fn validate(&self, token: &str, now: OffsetDateTime) -> Result<Session, SessionError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.required_spec_claims =
            HashSet::from(["exp".to_string(), "iss".to_string(), "sub".to_string()]);
        // Expiry is checked against the caller's clock below.
        validation.validate_exp = false;
        validation.validate_aud = false;

        let claims = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|_| SessionError::Invalid)?
            .claims;

        if claims.sub.is_empty() || now.unix_timestamp() >= claims.exp {
            return Err(SessionError::Invalid);
        }
        Ok(Session {
            subject: claims.sub,
            issued_at: OffsetDateTime::from_unix_timestamp(claims.iat)
                .map_err(|_| SessionError::Invalid)?,
            expires_at: OffsetDateTime::from_unix_timestamp(claims.exp)
                .map_err(|_| SessionError::Invalid)?,
        })
    }

    /// Reads the session token from the request's `Cookie` headers.
    #[must_use]
    pub fn token_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        CookieJar::from_headers(headers)
            .get(&self.cookie_name)
            .map(|c| c.value().to_string())
    }

    /// Cookie carrying a freshly issued token.
    #[must_use]
    pub fn session_cookie(&self, token: String) -> Cookie<'static> {
        Cookie::build((self.cookie_name.clone(), token))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(self.lifetime)
            .build()
    }

    /// Cookie instructing the browser to drop the session.
    #[must_use]
    pub fn removal_cookie(&self) -> Cookie<'static> {
        let mut cookie = Cookie::build((self.cookie_name.clone(), String::new()))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .build();
        cookie.make_removal();
        cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use axum::http::header::COOKIE;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    const ISSUER: &str = "https://sp.example.com/saml/metadata";

    fn manager() -> SessionManager {
        SessionManager::new(
            &testing::sp_service_keys(),
            ISSUER,
            &SessionConfig::default(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_issue_and_validate() {
        let sessions = manager();
        let now = OffsetDateTime::now_utc();
        let token = sessions.issue("alice@example.com", now).unwrap();

        let session = sessions.validate(&token, now).unwrap();
        assert_eq!(session.subject, "alice@example.com");
        assert_eq!(session.issued_at.unix_timestamp(), now.unix_timestamp());
        assert_eq!(
            session.expires_at.unix_timestamp(),
            (now + Duration::hours(8)).unix_timestamp()
        );

        // Validation is pure.
        assert_eq!(sessions.validate(&token, now).unwrap(), session);
    }

    #[test]
    fn test_expiry_boundary() {
        let sessions = manager();
        let now = OffsetDateTime::now_utc();
        let token = sessions.issue("alice", now).unwrap();

        let last_valid = now + Duration::hours(8) - Duration::seconds(1);
        assert!(sessions.validate(&token, last_valid).is_ok());
        assert!(matches!(
            sessions.validate(&token, now + Duration::hours(8)),
            Err(SessionError::Invalid)
        ));
    }

    #[test]
    fn test_tampered_and_foreign_tokens_rejected() {
        let sessions = manager();
        let now = OffsetDateTime::now_utc();
        let token = sessions.issue("alice", now).unwrap();

        // Swap the payload for one naming another subject.
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::json!({"iss": ISSUER, "sub": "mallory", "iat": 0, "exp": i64::MAX / 2})
                .to_string(),
        );
        parts[1] = &forged_payload;
        assert!(sessions.validate(&parts.join("."), now).is_err());

        assert!(sessions.validate("not-a-jwt", now).is_err());
        assert!(sessions.validate("", now).is_err());

        let other_issuer = SessionManager::new(
            &testing::sp_service_keys(),
            "https://elsewhere.example.com",
            &SessionConfig::default(),
            true,
        )
        .unwrap();
        let foreign = other_issuer.issue("alice", now).unwrap();
        assert!(matches!(
            sessions.validate(&foreign, now),
            Err(SessionError::Invalid)
        ));
    }

    #[test]
    fn test_cookie_attributes() {
        let sessions = manager();
        let cookie = sessions.session_cookie("tok".to_string()).to_string();
        assert!(cookie.starts_with("saml_session=tok"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("Max-Age=28800"));

        let removal = sessions.removal_cookie().to_string();
        assert!(removal.contains("Max-Age=0"));

        let plain = SessionManager::new(
            &testing::sp_service_keys(),
            ISSUER,
            &SessionConfig::default(),
            false,
        )
        .unwrap();
        assert!(!plain.session_cookie("tok".to_string()).to_string().contains("Secure"));
    }

    #[test]
    fn test_token_from_headers() {
        let sessions = manager();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "other=1; saml_session=abc.def.ghi".parse().unwrap());
        assert_eq!(
            sessions.token_from_headers(&headers).as_deref(),
            Some("abc.def.ghi")
        );
        assert!(sessions.token_from_headers(&HeaderMap::new()).is_none());
    }
}
