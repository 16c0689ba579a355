//! Outbound `AuthnRequest` messages and the HTTP-Redirect binding.

use std::io::Write;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use rand::RngCore;
use rsa::RsaPrivateKey;
use time::OffsetDateTime;
use url::Url;

use super::{BINDING_HTTP_POST, NAME_ID_FORMAT_ENTITY, SAML_ASSERTION_NS, SAML_PROTOCOL_NS};
use crate::clock::format_instant;
use crate::xml::dsig::SignatureAlgorithm;
use crate::xml::{escape_attr, escape_text};
use crate::{AuthError, AuthResult};

/// Generates a request ID: `id-` followed by 20 random bytes in hex.
///
/// IDs must not start with a digit (`xs:ID`), hence the prefix.
#[must_use]
pub fn new_request_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("id-{}", hex::encode(bytes))
}

/// Generates an opaque relay state token.
#[must_use]
pub fn new_relay_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// An authentication request addressed to the identity provider.
#[derive(Debug, Clone)]
pub struct AuthnRequest {
    /// Request ID, later echoed as `InResponseTo`.
    pub id: String,
    /// When the request was created.
    pub issue_instant: OffsetDateTime,
    /// IdP single sign-on endpoint.
    pub destination: Url,
    /// Service provider entity ID.
    pub issuer: String,
    /// Where the IdP should post the response.
    pub assertion_consumer_service_url: Url,
    /// Requested NameID format.
    pub name_id_format: String,
}

impl AuthnRequest {
    /// Creates a request with a fresh ID.
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        destination: Url,
        assertion_consumer_service_url: Url,
        name_id_format: impl Into<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: new_request_id(),
            issue_instant: now,
            destination,
            issuer: issuer.into(),
            assertion_consumer_service_url,
            name_id_format: name_id_format.into(),
        }
    }

    /// Serializes the request.
    #[must_use]
    pub fn to_xml(&self) -> String {
        format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="{protocol}" xmlns:saml="{assertion}""#,
                r#" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}""#,
                r#" ProtocolBinding="{binding}" AssertionConsumerServiceURL="{acs}">"#,
                r#"<saml:Issuer Format="{entity_format}">{issuer}</saml:Issuer>"#,
                r#"<samlp:NameIDPolicy Format="{name_id_format}" AllowCreate="true"/>"#,
                r#"</samlp:AuthnRequest>"#
            ),
            protocol = SAML_PROTOCOL_NS,
            assertion = SAML_ASSERTION_NS,
            id = escape_attr(&self.id),
            instant = format_instant(self.issue_instant),
            destination = escape_attr(self.destination.as_str()),
            binding = BINDING_HTTP_POST,
            acs = escape_attr(self.assertion_consumer_service_url.as_str()),
            entity_format = NAME_ID_FORMAT_ENTITY,
            issuer = escape_text(&self.issuer),
            name_id_format = escape_attr(&self.name_id_format),
        )
    }

    /// Builds the HTTP-Redirect binding URL.
    ///
    /// The message is DEFLATE-compressed and base64-encoded. When a signing
    /// key is given, the query string `SAMLRequest=..&RelayState=..&SigAlg=..`
    /// is signed with RSA-SHA256 and the signature appended as `Signature`.
    ///
    /// # Errors
    /// Returns an error if compression or signing fails.
    pub fn redirect_url(
        &self,
        relay_state: &str,
        signing_key: Option<&RsaPrivateKey>,
    ) -> AuthResult<Url> {
        let encoded = deflate_and_encode(&self.to_xml())?;

        let mut query = format!(
            "SAMLRequest={}&RelayState={}",
            urlencoding::encode(&encoded),
            urlencoding::encode(relay_state)
        );
        if let Some(key) = signing_key {
            let algorithm = SignatureAlgorithm::RsaSha256;
            query.push_str("&SigAlg=");
            query.push_str(&urlencoding::encode(algorithm.uri()));
            let signature = algorithm
                .sign(key, query.as_bytes())
                .map_err(|e| AuthError::internal(e.to_string()))?;
            query.push_str("&Signature=");
            query.push_str(&urlencoding::encode(&BASE64.encode(signature)));
        }

        let mut url = self.destination.clone();
        let combined = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
            _ => query,
        };
        url.set_query(Some(&combined));
        Ok(url)
    }
}

fn deflate_and_encode(xml: &str) -> AuthResult<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(|e| AuthError::internal(format!("deflate failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| AuthError::internal(format!("deflate failed: {e}")))?;
    Ok(BASE64.encode(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::xml::{self, dsig::decode_base64};
    use flate2::read::DeflateDecoder;
    use std::collections::HashMap;
    use std::io::Read;
    use time::macros::datetime;

    fn request() -> AuthnRequest {
        AuthnRequest::new(
            "https://sp.example.com/saml/metadata",
            Url::parse("https://idp.example.com/sso?tenant=a").unwrap(),
            Url::parse("https://sp.example.com/saml/acs").unwrap(),
            crate::config::NAME_ID_FORMAT_TRANSIENT,
            datetime!(2024-05-01 09:30:15.250 UTC),
        )
    }

    fn query_map(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn test_request_id_format() {
        let id = new_request_id();
        assert!(id.starts_with("id-"));
        assert_eq!(id.len(), 43);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_request_id(), id);
        assert_ne!(new_relay_state(), new_relay_state());
    }

    #[test]
    fn test_request_xml() {
        let request = request();
        let root = xml::parse(&request.to_xml()).unwrap();

        assert!(root.is(SAML_PROTOCOL_NS, "AuthnRequest"));
        assert_eq!(root.attr("ID"), Some(request.id.as_str()));
        assert_eq!(root.attr("IssueInstant"), Some("2024-05-01T09:30:15Z"));
        assert_eq!(root.attr("ProtocolBinding"), Some(BINDING_HTTP_POST));
        assert_eq!(
            root.attr("AssertionConsumerServiceURL"),
            Some("https://sp.example.com/saml/acs")
        );
        assert_eq!(
            root.child(SAML_ASSERTION_NS, "Issuer").unwrap().text(),
            "https://sp.example.com/saml/metadata"
        );
        assert_eq!(
            root.child(SAML_PROTOCOL_NS, "NameIDPolicy")
                .unwrap()
                .attr("Format"),
            Some(crate::config::NAME_ID_FORMAT_TRANSIENT)
        );
    }

    #[test]
    fn test_redirect_url_unsigned() {
        let request = request();
        let url = request.redirect_url("state-1", None).unwrap();
        let params = query_map(&url);

        assert_eq!(params.get("tenant").map(String::as_str), Some("a"));
        assert_eq!(params.get("RelayState").map(String::as_str), Some("state-1"));
        assert!(!params.contains_key("Signature"));

        let compressed = decode_base64(&params["SAMLRequest"]).unwrap();
        let mut inflated = String::new();
        DeflateDecoder::new(compressed.as_slice())
            .read_to_string(&mut inflated)
            .unwrap();
        assert_eq!(inflated, request.to_xml());
    }

    #[test]
    fn test_redirect_url_signature_covers_query() {
        let keys = testing::sp_keys();
        let url = request()
            .redirect_url("state-1", Some(&keys.private_key))
            .unwrap();
        let query = url.query().unwrap();

        let signed_part = query
            .split("&Signature=")
            .next()
            .and_then(|q| q.strip_prefix("tenant=a&"))
            .unwrap();
        assert!(signed_part.starts_with("SAMLRequest="));
        assert!(signed_part.contains("&SigAlg="));

        let params = query_map(&url);
        assert_eq!(params["SigAlg"], SignatureAlgorithm::RsaSha256.uri());
        let signature = decode_base64(&params["Signature"]).unwrap();
        assert!(SignatureAlgorithm::RsaSha256.verify(
            &keys.public_key(),
            signed_part.as_bytes(),
            &signature
        ));
    }
}
