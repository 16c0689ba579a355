//! Fixtures for tests: generated key material, IdP metadata and a builder
//! for signed `Response` documents.
//!
//! Compiled for unit tests and behind the `test-support` feature for
//! integration tests of dependent crates.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DnType, KeyPair};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use time::{Duration, OffsetDateTime};
use url::Url;

use crate::clock::format_instant;
use crate::metadata::parse_idp_metadata;
use crate::saml::{
    BINDING_HTTP_POST, BINDING_HTTP_REDIRECT, SAML_ASSERTION_NS, SAML_METADATA_NS,
    SAML_PROTOCOL_NS, STATUS_SUCCESS, ServiceUrls, new_request_id,
};
use crate::trust::{IdpDescriptor, ServiceProviderKeys, TrustStore};
use crate::xml::dsig::{self, DSIG_NS};
use crate::xml::{Element, root_scope};

/// Identity provider entity ID.
pub const IDP_ENTITY_ID: &str = "https://idp.example.com/metadata";
/// Identity provider HTTP-Redirect SSO endpoint.
pub const IDP_SSO_URL: &str = "https://idp.example.com/sso";
/// Public root of the service provider.
pub const SP_ROOT_URL: &str = "https://sp.example.com";
/// Subject asserted by default.
pub const SUBJECT: &str = "alice@example.com";

/// A generated RSA key with a self-signed certificate.
pub struct TestKeys {
    pub private_key: RsaPrivateKey,
    pub private_key_pem: String,
    pub certificate_pem: String,
    pub certificate_der: Vec<u8>,
}

impl TestKeys {
    fn generate(common_name: &str) -> Self {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate RSA key");
        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode private key")
            .to_string();

        let key_pair = KeyPair::from_pem(&private_key_pem).expect("load key into rcgen");
        let mut params =
            CertificateParams::new(vec![common_name.to_string()]).expect("certificate params");
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        let certificate = params.self_signed(&key_pair).expect("self-sign certificate");

        Self {
            private_key,
            private_key_pem,
            certificate_pem: certificate.pem(),
            certificate_der: certificate.der().to_vec(),
        }
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }
}

/// Identity provider keys, generated once per process.
pub fn idp_keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| TestKeys::generate("idp.example.com"))
}

/// Service provider keys, generated once per process.
pub fn sp_keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| TestKeys::generate("sp.example.com"))
}

/// IdP metadata advertising [`IDP_SSO_URL`] and the [`idp_keys`] certificate.
pub fn idp_metadata_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="{md}" xmlns:ds="{ds}" entityID="{entity_id}">
  <md:IDPSSODescriptor protocolSupportEnumeration="{protocol}">
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo><ds:X509Data><ds:X509Certificate>{certificate}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>
    </md:KeyDescriptor>
    <md:SingleSignOnService Binding="{post}" Location="https://idp.example.com/sso/post"/>
    <md:SingleSignOnService Binding="{redirect}" Location="{sso}"/>
  </md:IDPSSODescriptor>
</md:EntityDescriptor>
"#,
        md = SAML_METADATA_NS,
        ds = DSIG_NS,
        entity_id = IDP_ENTITY_ID,
        protocol = SAML_PROTOCOL_NS,
        certificate = BASE64.encode(&idp_keys().certificate_der),
        post = BINDING_HTTP_POST,
        redirect = BINDING_HTTP_REDIRECT,
        sso = IDP_SSO_URL,
    )
}

pub fn idp_descriptor() -> IdpDescriptor {
    parse_idp_metadata(&idp_metadata_xml()).expect("parse test IdP metadata")
}

pub fn sp_service_keys() -> ServiceProviderKeys {
    let keys = sp_keys();
    ServiceProviderKeys::from_pem(&keys.private_key_pem, &keys.certificate_pem)
        .expect("load test SP keys")
}

pub fn trust_store() -> TrustStore {
    TrustStore::new(idp_descriptor(), sp_service_keys()).expect("build test trust store")
}

/// Endpoints under [`SP_ROOT_URL`] with the default `/saml` prefix.
pub fn service_urls() -> ServiceUrls {
    ServiceUrls::new(&Url::parse(SP_ROOT_URL).unwrap(), "/saml").unwrap()
}

/// Base64-encodes a document the way the HTTP-POST binding carries it.
pub fn encode(xml: &str) -> String {
    BASE64.encode(xml)
}

/// Which parts of a built response carry a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMode {
    Assertion,
    Response,
    Both,
    None,
}

/// Builds IdP responses. Defaults describe a valid login of [`SUBJECT`]
/// answering `request_id`, with a signed assertion.
pub struct ResponseBuilder {
    request_id: String,
    now: OffsetDateTime,
    sign: SignMode,
    keys: &'static TestKeys,
    issuer: String,
    audience: String,
    recipient: String,
    destination: String,
    subject: String,
    not_before: OffsetDateTime,
    not_on_or_after: OffsetDateTime,
    status: String,
    with_assertion: bool,
}

impl ResponseBuilder {
    /// An empty `request_id` produces an unsolicited response.
    pub fn new(request_id: &str, now: OffsetDateTime) -> Self {
        let urls = service_urls();
        Self {
            request_id: request_id.to_string(),
            now,
            sign: SignMode::Assertion,
            keys: idp_keys(),
            issuer: IDP_ENTITY_ID.to_string(),
            audience: urls.entity_id.to_string(),
            recipient: urls.acs.to_string(),
            destination: urls.acs.to_string(),
            subject: SUBJECT.to_string(),
            not_before: now - Duration::seconds(30),
            not_on_or_after: now + Duration::minutes(5),
            status: STATUS_SUCCESS.to_string(),
            with_assertion: true,
        }
    }

    pub fn sign(mut self, mode: SignMode) -> Self {
        self.sign = mode;
        self
    }

    pub fn signing_keys(mut self, keys: &'static TestKeys) -> Self {
        self.keys = keys;
        self
    }

    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = issuer.to_string();
        self
    }

    pub fn audience(mut self, audience: &str) -> Self {
        self.audience = audience.to_string();
        self
    }

    pub fn recipient(mut self, recipient: &str) -> Self {
        self.recipient = recipient.to_string();
        self
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = destination.to_string();
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn validity(mut self, not_before: OffsetDateTime, not_on_or_after: OffsetDateTime) -> Self {
        self.not_before = not_before;
        self.not_on_or_after = not_on_or_after;
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn without_assertion(mut self) -> Self {
        self.with_assertion = false;
        self
    }

    /// Addresses the response to another service provider's endpoints.
    pub fn service_provider(mut self, urls: &ServiceUrls) -> Self {
        self.audience = urls.entity_id.to_string();
        self.recipient = urls.acs.to_string();
        self.destination = urls.acs.to_string();
        self
    }

    pub fn build_xml(&self) -> String {
        let instant = format_instant(self.now);

        let mut response = samlp("Response")
            .with_namespace_decl(Some("samlp"), SAML_PROTOCOL_NS)
            .with_namespace_decl(Some("saml"), SAML_ASSERTION_NS)
            .with_attr("ID", &format!("_{}", new_request_id()))
            .with_attr("Version", "2.0")
            .with_attr("IssueInstant", &instant)
            .with_attr("Destination", &self.destination);
        if !self.request_id.is_empty() {
            response.set_attr("InResponseTo", &self.request_id);
        }
        response = response
            .with_child(saml("Issuer").with_text(&self.issuer))
            .with_child(
                samlp("Status").with_child(samlp("StatusCode").with_attr("Value", &self.status)),
            );
        if self.with_assertion {
            response = response.with_child(self.assertion(&instant));
        }
        response
            .resolve_namespaces(&root_scope())
            .expect("resolve response namespaces");

        let key = &self.keys.private_key;
        let certificate = Some(self.keys.certificate_der.as_slice());
        if matches!(self.sign, SignMode::Assertion | SignMode::Both)
            && let Some(assertion) = response.child_mut(SAML_ASSERTION_NS, "Assertion")
        {
            dsig::sign_enveloped(assertion, key, certificate).expect("sign assertion");
        }
        if matches!(self.sign, SignMode::Response | SignMode::Both) {
            dsig::sign_enveloped(&mut response, key, certificate).expect("sign response");
        }
        response.to_xml()
    }

    pub fn build(&self) -> String {
        encode(&self.build_xml())
    }

    fn assertion(&self, instant: &str) -> Element {
        let mut confirmation_data = saml("SubjectConfirmationData")
            .with_attr("Recipient", &self.recipient)
            .with_attr("NotOnOrAfter", &format_instant(self.not_on_or_after));
        if !self.request_id.is_empty() {
            confirmation_data.set_attr("InResponseTo", &self.request_id);
        }

        saml("Assertion")
            .with_attr("ID", &format!("_{}", new_request_id()))
            .with_attr("Version", "2.0")
            .with_attr("IssueInstant", instant)
            .with_child(saml("Issuer").with_text(&self.issuer))
            .with_child(
                saml("Subject")
                    .with_child(
                        saml("NameID")
                            .with_attr(
                                "Format",
                                "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress",
                            )
                            .with_text(&self.subject),
                    )
                    .with_child(
                        saml("SubjectConfirmation")
                            .with_attr("Method", "urn:oasis:names:tc:SAML:2.0:cm:bearer")
                            .with_child(confirmation_data),
                    ),
            )
            .with_child(
                saml("Conditions")
                    .with_attr("NotBefore", &format_instant(self.not_before))
                    .with_attr("NotOnOrAfter", &format_instant(self.not_on_or_after))
                    .with_child(
                        saml("AudienceRestriction")
                            .with_child(saml("Audience").with_text(&self.audience)),
                    ),
            )
            .with_child(
                saml("AuthnStatement")
                    .with_attr("AuthnInstant", instant)
                    .with_attr("SessionIndex", "session-1")
                    .with_child(saml("AuthnContext").with_child(
                        saml("AuthnContextClassRef").with_text(
                            "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport",
                        ),
                    )),
            )
    }
}

fn samlp(name: &str) -> Element {
    Element::new(Some("samlp"), name, SAML_PROTOCOL_NS)
}

fn saml(name: &str) -> Element {
    Element::new(Some("saml"), name, SAML_ASSERTION_NS)
}
