//! SAML 2.0 service provider protocol engine.
//!
//! The engine owns the two halves of browser SSO:
//!
//! - [`ServiceProvider::begin_login`] builds a (signed) AuthnRequest for the
//!   HTTP-Redirect binding and registers it as pending
//! - [`ServiceProvider::handle_response`] validates the IdP's HTTP-POST
//!   response and yields the authenticated subject
//!
//! Validation order is fixed: decode, verify signatures (then status and
//! issuer), consume the pending request, check the time window, check the
//! audience, extract the subject. The first failing step decides the error.

pub mod authn_request;
pub mod response;

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SamlConfig;
use crate::storage::{PendingRequest, RequestTracker};
use crate::trust::TrustStore;
use crate::xml::Element;
use crate::{AuthError, AuthResult};

pub use authn_request::{AuthnRequest, new_relay_state, new_request_id};
pub use response::VerifiedResponse;

/// SAML protocol namespace.
pub const SAML_PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
/// SAML assertion namespace.
pub const SAML_ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
/// SAML metadata namespace.
pub const SAML_METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
/// HTTP-Redirect binding.
pub const BINDING_HTTP_REDIRECT: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
/// HTTP-POST binding.
pub const BINDING_HTTP_POST: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
/// Top-level success status.
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
/// Entity NameID format, used for issuers.
pub const NAME_ID_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";

/// Public URLs of the service provider, derived from the root URL and the
/// protocol path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrls {
    /// Externally visible root of the gateway.
    pub root: Url,
    /// Entity ID, which is also where metadata is served.
    pub entity_id: Url,
    /// Assertion consumer service (HTTP-POST).
    pub acs: Url,
    /// Login entry point.
    pub login: Url,
    /// Logout endpoint.
    pub logout: Url,
}

impl ServiceUrls {
    /// Derives the endpoint URLs.
    ///
    /// # Errors
    /// Returns an error if the joined URLs do not parse.
    pub fn new(root: &Url, path_prefix: &str) -> Result<Self, url::ParseError> {
        let base = format!(
            "{}{}",
            root.as_str().trim_end_matches('/'),
            path_prefix.trim_end_matches('/')
        );
        Ok(Self {
            root: root.clone(),
            entity_id: Url::parse(&format!("{base}/metadata"))?,
            acs: Url::parse(&format!("{base}/acs"))?,
            login: Url::parse(&format!("{base}/login"))?,
            logout: Url::parse(&format!("{base}/logout"))?,
        })
    }

    /// Returns `true` if the gateway is reached over HTTPS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.root.scheme() == "https"
    }
}

/// Result of starting a login.
#[derive(Debug, Clone)]
pub struct LoginRedirect {
    /// Where to send the browser.
    pub url: Url,
    /// ID of the registered AuthnRequest.
    pub request_id: String,
    /// Relay state sent with the request.
    pub relay_state: String,
}

/// Result of a successfully validated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedLogin {
    /// `NameID` of the authenticated subject.
    pub subject: String,
    /// IdP session index, if provided.
    pub session_index: Option<String>,
    /// Local path to continue to.
    pub return_path: String,
}

/// The service provider side of the protocol.
pub struct ServiceProvider {
    trust: Arc<TrustStore>,
    urls: ServiceUrls,
    config: SamlConfig,
    tracker: Arc<dyn RequestTracker>,
}

impl ServiceProvider {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        trust: Arc<TrustStore>,
        urls: ServiceUrls,
        config: SamlConfig,
        tracker: Arc<dyn RequestTracker>,
    ) -> Self {
        Self {
            trust,
            urls,
            config,
            tracker,
        }
    }

    /// Endpoint URLs.
    #[must_use]
    pub fn urls(&self) -> &ServiceUrls {
        &self.urls
    }

    /// Protocol configuration.
    #[must_use]
    pub fn config(&self) -> &SamlConfig {
        &self.config
    }

    /// Trust material.
    #[must_use]
    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    /// The pending request registry.
    #[must_use]
    pub fn tracker(&self) -> &Arc<dyn RequestTracker> {
        &self.tracker
    }

    /// Builds an AuthnRequest and registers it as pending.
    ///
    /// # Errors
    /// Returns [`AuthError::MissingTrustMaterial`] if the IdP has no
    /// HTTP-Redirect SSO endpoint, or an error from signing or storage.
    pub async fn begin_login(
        &self,
        return_path: &str,
        now: OffsetDateTime,
    ) -> AuthResult<LoginRedirect> {
        let idp = self.trust.idp();
        let destination = idp.sso_url.clone().ok_or_else(|| {
            AuthError::missing_trust("identity provider has no HTTP-Redirect SSO endpoint")
        })?;
        if idp.signing_certificates.is_empty() {
            return Err(AuthError::missing_trust(
                "identity provider has no signing certificate",
            ));
        }

        let request = AuthnRequest::new(
            self.urls.entity_id.as_str(),
            destination,
            self.urls.acs.clone(),
            &self.config.name_id_format,
            now,
        );
        let relay_state = new_relay_state();
        let signing_key = self
            .config
            .sign_requests
            .then(|| self.trust.service_provider().private_key());
        let url = request.redirect_url(&relay_state, signing_key)?;

        self.tracker
            .register(PendingRequest {
                request_id: request.id.clone(),
                relay_state: relay_state.clone(),
                return_path: return_path.to_string(),
                issued_at: now,
                expires_at: now
                    .saturating_add(crate::clock::to_duration(self.config.request_lifetime)),
            })
            .await?;

        debug!(request_id = %request.id, return_path, "issued authentication request");
        Ok(LoginRedirect {
            url,
            request_id: request.id,
            relay_state,
        })
    }

    /// Validates an HTTP-POST `SAMLResponse`.
    ///
    /// On failure the referenced pending request (if any) is invalidated so
    /// it cannot be retried.
    ///
    /// # Errors
    /// Returns the first failed check; see the module documentation for the
    /// order.
    pub async fn handle_response(
        &self,
        encoded_response: &str,
        relay_state: Option<&str>,
        now: OffsetDateTime,
    ) -> AuthResult<AuthenticatedLogin> {
        let document = response::decode_response(encoded_response)?;

        match self.validate(&document, relay_state, now).await {
            Ok(login) => {
                info!(subject = %login.subject, "authenticated subject");
                Ok(login)
            }
            Err(err) => {
                if let Some(request_id) = response::claimed_request_id(&document)
                    && let Err(e) = self.tracker.invalidate(&request_id, now).await
                {
                    warn!(request_id, error = %e, "failed to invalidate pending request");
                }
                Err(err)
            }
        }
    }

    async fn validate(
        &self,
        document: &Element,
        relay_state: Option<&str>,
        now: OffsetDateTime,
    ) -> AuthResult<AuthenticatedLogin> {
        let verified = VerifiedResponse::verify(document, self.trust.idp_signing_keys())?;
        verified.check_status()?;
        verified.check_issuer(&self.trust.idp().entity_id)?;

        let request_id = verified.request_id()?;
        let pending = self.tracker.consume(&request_id, relay_state, now).await?;

        verified.check_time_window(now, crate::clock::to_duration(self.config.clock_skew))?;
        verified.check_audience(self.urls.entity_id.as_str(), self.urls.acs.as_str())?;
        let subject = verified.subject()?;

        Ok(AuthenticatedLogin {
            subject,
            session_index: verified.session_index(),
            return_path: pending.return_path,
        })
    }

    /// Service provider metadata document.
    #[must_use]
    pub fn metadata(&self, now: OffsetDateTime) -> String {
        crate::metadata::render_sp_metadata(
            &self.urls,
            self.trust.service_provider().certificate(),
            self.config.sign_requests,
            &self.config.name_id_format,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryRequestTracker;
    use crate::testing::{self, ResponseBuilder, SignMode};
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;
    use time::Duration;

    fn provider() -> ServiceProvider {
        ServiceProvider::new(
            Arc::new(testing::trust_store()),
            testing::service_urls(),
            SamlConfig::default(),
            Arc::new(InMemoryRequestTracker::new(StdDuration::from_secs(300))),
        )
    }

    async fn login(sp: &ServiceProvider, now: OffsetDateTime) -> LoginRedirect {
        sp.begin_login("/app?x=1", now).await.unwrap()
    }

    #[test]
    fn test_service_urls() {
        let root = Url::parse("https://gw.example.com/").unwrap();
        let urls = ServiceUrls::new(&root, "/saml").unwrap();
        assert_eq!(urls.entity_id.as_str(), "https://gw.example.com/saml/metadata");
        assert_eq!(urls.acs.as_str(), "https://gw.example.com/saml/acs");
        assert_eq!(urls.login.as_str(), "https://gw.example.com/saml/login");
        assert!(urls.is_secure());

        let root = Url::parse("http://gw.example.com/base").unwrap();
        let urls = ServiceUrls::new(&root, "/sso").unwrap();
        assert_eq!(urls.acs.as_str(), "http://gw.example.com/base/sso/acs");
        assert!(!urls.is_secure());
    }

    #[tokio::test]
    async fn test_begin_login_registers_signed_request() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;

        assert!(redirect.url.as_str().starts_with(testing::IDP_SSO_URL));
        let params: HashMap<_, _> = redirect.url.query_pairs().into_owned().collect();
        assert_eq!(params["RelayState"], redirect.relay_state);
        assert!(params.contains_key("Signature"));
        assert_eq!(sp.tracker().pending_count(now).await, 1);
    }

    #[tokio::test]
    async fn test_begin_login_without_sso_endpoint() {
        let mut idp = testing::idp_descriptor();
        idp.sso_url = None;
        let trust = crate::trust::TrustStore::new(idp, testing::sp_service_keys()).unwrap();
        let sp = ServiceProvider::new(
            Arc::new(trust),
            testing::service_urls(),
            SamlConfig::default(),
            Arc::new(InMemoryRequestTracker::new(StdDuration::from_secs(300))),
        );
        let err = sp
            .begin_login("/", OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingTrustMaterial { .. }));
    }

    #[tokio::test]
    async fn test_valid_response_authenticates() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;

        let response = ResponseBuilder::new(&redirect.request_id, now).build();
        let login = sp
            .handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap();

        assert_eq!(login.subject, testing::SUBJECT);
        assert_eq!(login.return_path, "/app?x=1");
        assert_eq!(login.session_index.as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn test_signed_response_and_both_accepted() {
        for mode in [SignMode::Response, SignMode::Both] {
            let sp = provider();
            let now = OffsetDateTime::now_utc();
            let redirect = login(&sp, now).await;
            let response = ResponseBuilder::new(&redirect.request_id, now)
                .sign(mode)
                .build();
            sp.handle_response(&response, Some(&redirect.relay_state), now)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;
        let response = ResponseBuilder::new(&redirect.request_id, now).build();

        sp.handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap();
        let err = sp
            .handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownOrReplayedRequest { .. }));
    }

    #[tokio::test]
    async fn test_unsigned_response_rejected_and_request_burned() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;

        let unsigned = ResponseBuilder::new(&redirect.request_id, now)
            .sign(SignMode::None)
            .build();
        let err = sp
            .handle_response(&unsigned, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SignatureInvalid { .. }));

        // The pending request was invalidated by the failure.
        let valid = ResponseBuilder::new(&redirect.request_id, now).build();
        let err = sp
            .handle_response(&valid, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownOrReplayedRequest { .. }));
    }

    #[tokio::test]
    async fn test_untrusted_signer_rejected() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;
        let forged = ResponseBuilder::new(&redirect.request_id, now)
            .signing_keys(testing::sp_keys())
            .build();
        let err = sp
            .handle_response(&forged, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SignatureInvalid { .. }));
    }

    #[tokio::test]
    async fn test_tampered_subject_rejected() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;
        let xml = ResponseBuilder::new(&redirect.request_id, now)
            .build_xml()
            .replace(testing::SUBJECT, "mallory@example.com");
        let err = sp
            .handle_response(&testing::encode(&xml), Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SignatureInvalid { .. }));
    }

    #[tokio::test]
    async fn test_wrapped_assertion_rejected() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;
        let xml = ResponseBuilder::new(&redirect.request_id, now).build_xml();

        // Inject a second, unsigned assertion next to the signed one.
        let evil = xml.replacen(
            "<saml:Assertion ",
            "<saml:Assertion ID=\"evil\" Version=\"2.0\"></saml:Assertion><saml:Assertion ",
            1,
        );
        let err = sp
            .handle_response(&testing::encode(&evil), Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_wrong_issuer_rejected() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;
        let response = ResponseBuilder::new(&redirect.request_id, now)
            .issuer("https://evil.example.com")
            .build();
        let err = sp
            .handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::IssuerMismatch { .. }));
    }

    #[tokio::test]
    async fn test_idp_error_status() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;
        let response = ResponseBuilder::new(&redirect.request_id, now)
            .status("urn:oasis:names:tc:SAML:2.0:status:Responder")
            .without_assertion()
            .sign(SignMode::Response)
            .build();
        let err = sp
            .handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::IdpStatus { .. }));
    }

    #[tokio::test]
    async fn test_unknown_request_rejected() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let response = ResponseBuilder::new("id-never-issued", now).build();
        let err = sp
            .handle_response(&response, Some("whatever"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownOrReplayedRequest { .. }));

        let unsolicited = ResponseBuilder::new("", now).build();
        let err = sp.handle_response(&unsolicited, None, now).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownOrReplayedRequest { .. }));
    }

    #[tokio::test]
    async fn test_expired_request_rejected() {
        let sp = provider();
        let issued = OffsetDateTime::now_utc();
        let redirect = login(&sp, issued).await;

        let later = issued + Duration::minutes(6);
        let response = ResponseBuilder::new(&redirect.request_id, later).build();
        let err = sp
            .handle_response(&response, Some(&redirect.relay_state), later)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RequestExpired { .. }));
    }

    #[tokio::test]
    async fn test_relay_state_mismatch_rejected() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;
        let response = ResponseBuilder::new(&redirect.request_id, now).build();
        let err = sp
            .handle_response(&response, Some("forged"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownOrReplayedRequest { .. }));
    }

    #[tokio::test]
    async fn test_time_window_with_skew() {
        let now = OffsetDateTime::now_utc();

        // Within the 60 s leeway on both ends.
        for (not_before, not_on_or_after) in [
            (now + Duration::seconds(50), now + Duration::minutes(5)),
            (now - Duration::minutes(5), now - Duration::seconds(50)),
        ] {
            let sp = provider();
            let redirect = login(&sp, now).await;
            let response = ResponseBuilder::new(&redirect.request_id, now)
                .validity(not_before, not_on_or_after)
                .build();
            sp.handle_response(&response, Some(&redirect.relay_state), now)
                .await
                .unwrap();
        }

        let sp = provider();
        let redirect = login(&sp, now).await;
        let response = ResponseBuilder::new(&redirect.request_id, now)
            .validity(now + Duration::seconds(90), now + Duration::minutes(5))
            .build();
        let err = sp
            .handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AssertionNotYetValid));

        let sp = provider();
        let redirect = login(&sp, now).await;
        let response = ResponseBuilder::new(&redirect.request_id, now)
            .validity(now - Duration::minutes(5), now - Duration::seconds(61))
            .build();
        let err = sp
            .handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AssertionExpired));
    }

    #[tokio::test]
    async fn test_audience_and_recipient_checked() {
        let now = OffsetDateTime::now_utc();

        let sp = provider();
        let redirect = login(&sp, now).await;
        let response = ResponseBuilder::new(&redirect.request_id, now)
            .audience("https://other-sp.example.com/saml/metadata")
            .build();
        let err = sp
            .handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AudienceMismatch { .. }));

        let sp = provider();
        let redirect = login(&sp, now).await;
        let response = ResponseBuilder::new(&redirect.request_id, now)
            .recipient("https://other-sp.example.com/saml/acs")
            .build();
        let err = sp
            .handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AudienceMismatch { .. }));
    }

    #[tokio::test]
    async fn test_missing_name_id_rejected() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let redirect = login(&sp, now).await;
        let response = ResponseBuilder::new(&redirect.request_id, now)
            .subject("")
            .build();
        let err = sp
            .handle_response(&response, Some(&redirect.relay_state), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        let sp = provider();
        let now = OffsetDateTime::now_utc();
        let not_xml = testing::encode("<not-xml");
        let wrong_root = testing::encode("<a/>");
        for input in ["%%%", not_xml.as_str(), wrong_root.as_str()] {
            let err = sp.handle_response(input, None, now).await.unwrap_err();
            assert!(matches!(err, AuthError::MalformedResponse { .. }));
        }
        let doctype = testing::encode(
            "<!DOCTYPE x [<!ENTITY e \"e\">]><samlp:Response xmlns:samlp=\"urn:oasis:names:tc:SAML:2.0:protocol\"/>",
        );
        let err = sp.handle_response(&doctype, None, now).await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse { .. }));
    }

    #[test]
    fn test_metadata_lists_acs() {
        let sp = provider();
        let metadata = sp.metadata(OffsetDateTime::now_utc());
        assert!(metadata.contains("https://sp.example.com/saml/acs"));
        assert!(metadata.contains("entityID=\"https://sp.example.com/saml/metadata\""));
    }
}
