//! SAML metadata: reading the identity provider's, publishing our own.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use time::{Duration, OffsetDateTime};
use url::Url;

use crate::clock::format_instant;
use crate::saml::{
    BINDING_HTTP_POST, BINDING_HTTP_REDIRECT, SAML_METADATA_NS, SAML_PROTOCOL_NS, ServiceUrls,
};
use crate::trust::{Certificate, IdpDescriptor, TrustError};
use crate::xml::dsig::DSIG_NS;
use crate::xml::{self, Element, escape_attr, escape_text};

/// How long published metadata stays valid.
const METADATA_VALIDITY: Duration = Duration::hours(48);

/// Extracts entity ID, HTTP-Redirect SSO endpoint and signing certificates
/// from IdP metadata.
///
/// Accepts either an `EntityDescriptor` root or an `EntitiesDescriptor`
/// containing one entity with an `IDPSSODescriptor`. Key descriptors marked
/// `use="encryption"` are ignored.
///
/// # Errors
/// Returns [`TrustError::Metadata`] for unusable documents and
/// [`TrustError::Certificate`] for unparseable certificates.
pub fn parse_idp_metadata(document: &str) -> Result<IdpDescriptor, TrustError> {
    let root = xml::parse(document).map_err(|e| TrustError::metadata(e.to_string()))?;

    let entity = if root.is(SAML_METADATA_NS, "EntityDescriptor") {
        &root
    } else if root.is(SAML_METADATA_NS, "EntitiesDescriptor") {
        root.children_named(SAML_METADATA_NS, "EntityDescriptor")
            .find(|e| e.child(SAML_METADATA_NS, "IDPSSODescriptor").is_some())
            .ok_or_else(|| TrustError::metadata("no entity with an IDPSSODescriptor"))?
    } else {
        return Err(TrustError::metadata(format!(
            "unexpected root element {}",
            root.name
        )));
    };

    let entity_id = entity
        .attr("entityID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| TrustError::metadata("EntityDescriptor has no entityID"))?
        .to_string();
    let idp = entity
        .child(SAML_METADATA_NS, "IDPSSODescriptor")
        .ok_or_else(|| TrustError::metadata("entity has no IDPSSODescriptor"))?;

    let sso_url = idp
        .children_named(SAML_METADATA_NS, "SingleSignOnService")
        .find(|s| s.attr("Binding") == Some(BINDING_HTTP_REDIRECT))
        .and_then(|s| s.attr("Location"))
        .map(|location| {
            Url::parse(location.trim())
                .map_err(|e| TrustError::metadata(format!("invalid SSO location: {e}")))
        })
        .transpose()?;

    let signing_certificates = idp
        .children_named(SAML_METADATA_NS, "KeyDescriptor")
        .filter(|kd| matches!(kd.attr("use"), None | Some("signing")))
        .flat_map(certificate_elements)
        .map(|c| Certificate::from_base64(&c.text()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(IdpDescriptor {
        entity_id,
        sso_url,
        signing_certificates,
    })
}

fn certificate_elements(key_descriptor: &Element) -> impl Iterator<Item = &Element> {
    key_descriptor
        .child(DSIG_NS, "KeyInfo")
        .into_iter()
        .flat_map(|ki| ki.children_named(DSIG_NS, "X509Data"))
        .flat_map(|data| data.children_named(DSIG_NS, "X509Certificate"))
}

/// Renders the service provider's `EntityDescriptor`.
#[must_use]
pub fn render_sp_metadata(
    urls: &ServiceUrls,
    certificate: &Certificate,
    authn_requests_signed: bool,
    name_id_format: &str,
    now: OffsetDateTime,
) -> String {
    format!(
        concat!(
            r#"<md:EntityDescriptor xmlns:md="{md}" xmlns:ds="{ds}" entityID="{entity_id}" validUntil="{valid_until}">"#,
            r#"<md:SPSSODescriptor AuthnRequestsSigned="{signed}" WantAssertionsSigned="true" protocolSupportEnumeration="{protocol}">"#,
            r#"<md:KeyDescriptor use="signing"><ds:KeyInfo><ds:X509Data>"#,
            r#"<ds:X509Certificate>{certificate}</ds:X509Certificate>"#,
            r#"</ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#,
            r#"<md:SingleLogoutService Binding="{redirect}" Location="{logout}"/>"#,
            r#"<md:NameIDFormat>{name_id_format}</md:NameIDFormat>"#,
            r#"<md:AssertionConsumerService Binding="{post}" Location="{acs}" index="1"/>"#,
            r#"</md:SPSSODescriptor></md:EntityDescriptor>"#
        ),
        md = SAML_METADATA_NS,
        ds = DSIG_NS,
        entity_id = escape_attr(urls.entity_id.as_str()),
        valid_until = format_instant(now.saturating_add(METADATA_VALIDITY)),
        signed = authn_requests_signed,
        protocol = SAML_PROTOCOL_NS,
        certificate = BASE64.encode(certificate.der()),
        redirect = BINDING_HTTP_REDIRECT,
        logout = escape_attr(urls.logout.as_str()),
        name_id_format = escape_text(name_id_format),
        post = BINDING_HTTP_POST,
        acs = escape_attr(urls.acs.as_str()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use time::macros::datetime;

    #[test]
    fn test_parse_idp_metadata() {
        let idp = parse_idp_metadata(&testing::idp_metadata_xml()).unwrap();
        assert_eq!(idp.entity_id, testing::IDP_ENTITY_ID);
        assert_eq!(idp.sso_url.unwrap().as_str(), testing::IDP_SSO_URL);
        assert_eq!(idp.signing_certificates.len(), 1);
        assert_eq!(
            idp.signing_certificates[0].der(),
            testing::idp_keys().certificate_der.as_slice()
        );
    }

    #[test]
    fn test_entities_descriptor_and_encryption_keys() {
        let cert = BASE64.encode(&testing::idp_keys().certificate_der);
        let document = format!(
            r#"<EntitiesDescriptor xmlns="{md}" xmlns:ds="{ds}">
                 <EntityDescriptor entityID="https://sp-only.example.com"><SPSSODescriptor/></EntityDescriptor>
                 <EntityDescriptor entityID="https://idp.example.org">
                   <IDPSSODescriptor protocolSupportEnumeration="{protocol}">
                     <KeyDescriptor use="encryption"><ds:KeyInfo><ds:X509Data><ds:X509Certificate>bm90IGEgY2VydA==</ds:X509Certificate></ds:X509Data></ds:KeyInfo></KeyDescriptor>
                     <KeyDescriptor><ds:KeyInfo><ds:X509Data><ds:X509Certificate>
                       {cert}
                     </ds:X509Certificate></ds:X509Data></ds:KeyInfo></KeyDescriptor>
                     <SingleSignOnService Binding="{post}" Location="https://idp.example.org/post"/>
                   </IDPSSODescriptor>
                 </EntityDescriptor>
               </EntitiesDescriptor>"#,
            md = SAML_METADATA_NS,
            ds = DSIG_NS,
            protocol = SAML_PROTOCOL_NS,
            post = BINDING_HTTP_POST,
        );

        let idp = parse_idp_metadata(&document).unwrap();
        assert_eq!(idp.entity_id, "https://idp.example.org");
        assert!(idp.sso_url.is_none());
        assert_eq!(idp.signing_certificates.len(), 1);
    }

    #[test]
    fn test_invalid_metadata() {
        assert!(matches!(
            parse_idp_metadata("<nope/>"),
            Err(TrustError::Metadata { .. })
        ));
        let no_id = format!(r#"<EntityDescriptor xmlns="{SAML_METADATA_NS}"/>"#);
        assert!(matches!(
            parse_idp_metadata(&no_id),
            Err(TrustError::Metadata { .. })
        ));
    }

    #[test]
    fn test_render_sp_metadata() {
        let urls = testing::service_urls();
        let keys = testing::sp_service_keys();
        let rendered = render_sp_metadata(
            &urls,
            keys.certificate(),
            true,
            crate::config::NAME_ID_FORMAT_TRANSIENT,
            datetime!(2024-01-01 00:00 UTC),
        );

        let root = xml::parse(&rendered).unwrap();
        assert!(root.is(SAML_METADATA_NS, "EntityDescriptor"));
        assert_eq!(root.attr("entityID"), Some(urls.entity_id.as_str()));
        assert_eq!(root.attr("validUntil"), Some("2024-01-03T00:00:00Z"));

        let sp = root.child(SAML_METADATA_NS, "SPSSODescriptor").unwrap();
        assert_eq!(sp.attr("AuthnRequestsSigned"), Some("true"));
        assert_eq!(sp.attr("WantAssertionsSigned"), Some("true"));
        let acs = sp
            .child(SAML_METADATA_NS, "AssertionConsumerService")
            .unwrap();
        assert_eq!(acs.attr("Binding"), Some(BINDING_HTTP_POST));
        assert_eq!(acs.attr("Location"), Some(urls.acs.as_str()));

        let cert = sp
            .child(SAML_METADATA_NS, "KeyDescriptor")
            .and_then(|kd| certificate_elements(kd).next())
            .unwrap();
        assert_eq!(
            Certificate::from_base64(&cert.text()).unwrap().der(),
            keys.certificate().der()
        );
    }
}
