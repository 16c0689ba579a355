//! Enveloped XML signatures (XML-DSig).
//!
//! Verification accepts the profile SAML identity providers emit in practice:
//! a single `Reference` to the signed element's own `ID`, the
//! enveloped-signature transform followed by exclusive canonicalization,
//! SHA-256/512 digests and RSA PKCS#1 v1.5 signatures.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};

use super::c14n::{self, EXC_C14N};
use super::{Element, Node};

/// XML-DSig namespace.
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
/// Enveloped-signature transform.
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
/// RSA PKCS#1 v1.5 with SHA-256.
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
/// RSA PKCS#1 v1.5 with SHA-512.
pub const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
/// SHA-256 digest.
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
/// SHA-512 digest.
pub const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

/// Errors raised while signing or verifying.
#[derive(Debug, thiserror::Error)]
pub enum DsigError {
    /// The element carries no `Signature` child.
    #[error("Element is not signed")]
    MissingSignature,

    /// The signature structure is incomplete or ambiguous.
    #[error("Malformed signature: {message}")]
    Malformed {
        /// What is wrong.
        message: String,
    },

    /// An algorithm outside the supported profile is used.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm {
        /// The algorithm URI.
        algorithm: String,
    },

    /// The reference does not point at the enclosing element.
    #[error("Reference mismatch: {message}")]
    ReferenceMismatch {
        /// What is wrong.
        message: String,
    },

    /// The signed content was altered.
    #[error("Digest mismatch")]
    DigestMismatch,

    /// No trusted key validates the signature value.
    #[error("Signature value not valid for any trusted key")]
    SignatureMismatch,

    /// The signing operation failed.
    #[error("Signing failed: {message}")]
    Signing {
        /// Underlying error.
        message: String,
    },
}

impl DsigError {
    fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    fn unsupported(algorithm: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }
}

/// Digest algorithms accepted in references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl DigestAlgorithm {
    /// Looks up an algorithm by URI.
    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            DIGEST_SHA256 => Some(Self::Sha256),
            DIGEST_SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Returns the algorithm URI.
    #[must_use]
    pub fn uri(self) -> &'static str {
        match self {
            Self::Sha256 => DIGEST_SHA256,
            Self::Sha512 => DIGEST_SHA512,
        }
    }

    /// Hashes `data`.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Signature algorithms accepted in `SignedInfo` and on redirect bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// RSA PKCS#1 v1.5 with SHA-256.
    RsaSha256,
    /// RSA PKCS#1 v1.5 with SHA-512.
    RsaSha512,
}

impl SignatureAlgorithm {
    /// Looks up an algorithm by URI.
    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            RSA_SHA256 => Some(Self::RsaSha256),
            RSA_SHA512 => Some(Self::RsaSha512),
            _ => None,
        }
    }

    /// Returns the algorithm URI.
    #[must_use]
    pub fn uri(self) -> &'static str {
        match self {
            Self::RsaSha256 => RSA_SHA256,
            Self::RsaSha512 => RSA_SHA512,
        }
    }

    /// Signs `data` with `key`.
    ///
    /// # Errors
    /// Returns an error if the key cannot produce a signature for this hash.
    pub fn sign(self, key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, DsigError> {
        let signature = match self {
            Self::RsaSha256 => SigningKey::<Sha256>::new(key.clone()).try_sign(data),
            Self::RsaSha512 => SigningKey::<Sha512>::new(key.clone()).try_sign(data),
        }
        .map_err(|e| DsigError::Signing {
            message: e.to_string(),
        })?;
        Ok(signature.to_vec())
    }

    /// Returns `true` if `signature` over `data` verifies with `key`.
    #[must_use]
    pub fn verify(self, key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        match self {
            Self::RsaSha256 => VerifyingKey::<Sha256>::new(key.clone())
                .verify(data, &signature)
                .is_ok(),
            Self::RsaSha512 => VerifyingKey::<Sha512>::new(key.clone())
                .verify(data, &signature)
                .is_ok(),
        }
    }
}

/// Returns the element's direct `Signature` child, if any.
///
/// # Errors
/// Returns an error if more than one signature is present.
pub fn find_signature(element: &Element) -> Result<Option<&Element>, DsigError> {
    let mut signatures = element.children_named(DSIG_NS, "Signature");
    let first = signatures.next();
    if signatures.next().is_some() {
        return Err(DsigError::malformed("multiple signatures on one element"));
    }
    Ok(first)
}

/// Verifies the enveloped signature of `element` against `keys`.
///
/// The signature must reference the element's own `ID`, so a successful
/// result vouches for exactly the element object passed in.
///
/// # Errors
/// Returns the first check that failed.
pub fn verify_enveloped(element: &Element, keys: &[RsaPublicKey]) -> Result<(), DsigError> {
    let signature = find_signature(element)?.ok_or(DsigError::MissingSignature)?;
    let signed_info = required(signature, "SignedInfo")?;

    let c14n_method = required(signed_info, "CanonicalizationMethod")?;
    let c14n_uri = c14n_method.attr("Algorithm").unwrap_or_default();
    if c14n_uri != EXC_C14N {
        return Err(DsigError::unsupported(c14n_uri));
    }
    let signature_uri = required(signed_info, "SignatureMethod")?
        .attr("Algorithm")
        .unwrap_or_default();
    let signature_algorithm = SignatureAlgorithm::from_uri(signature_uri)
        .ok_or_else(|| DsigError::unsupported(signature_uri))?;

    let mut references = signed_info.children_named(DSIG_NS, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| DsigError::malformed("missing Reference"))?;
    if references.next().is_some() {
        return Err(DsigError::malformed("multiple references"));
    }

    let id = element
        .attr("ID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| DsigError::ReferenceMismatch {
            message: "signed element has no ID".to_string(),
        })?;
    let uri = reference.attr("URI").unwrap_or_default();
    if uri.strip_prefix('#') != Some(id) {
        return Err(DsigError::ReferenceMismatch {
            message: format!("reference {uri} does not point at #{id}"),
        });
    }

    let mut enveloped = false;
    let mut prefixes: Option<Vec<String>> = None;
    if let Some(transforms) = reference.child(DSIG_NS, "Transforms") {
        for transform in transforms.children_named(DSIG_NS, "Transform") {
            match transform.attr("Algorithm").unwrap_or_default() {
                ENVELOPED_SIGNATURE => enveloped = true,
                EXC_C14N => prefixes = Some(inclusive_prefixes(transform)),
                other => return Err(DsigError::unsupported(other)),
            }
        }
    }
    if !enveloped {
        return Err(DsigError::malformed("enveloped-signature transform missing"));
    }
    let prefixes = prefixes
        .ok_or_else(|| DsigError::malformed("exclusive canonicalization transform missing"))?;

    let digest_uri = required(reference, "DigestMethod")?
        .attr("Algorithm")
        .unwrap_or_default();
    let digest_algorithm =
        DigestAlgorithm::from_uri(digest_uri).ok_or_else(|| DsigError::unsupported(digest_uri))?;
    let expected_digest = decode_base64(&required(reference, "DigestValue")?.text())?;

    let canonical = c14n::canonicalize(element, &prefixes, Some(signature));
    if digest_algorithm.digest(canonical.as_bytes()) != expected_digest {
        return Err(DsigError::DigestMismatch);
    }

    let signature_value = decode_base64(&required(signature, "SignatureValue")?.text())?;
    let canonical_signed_info =
        c14n::canonicalize(signed_info, &inclusive_prefixes(c14n_method), None);

    let signed_bytes = canonical_signed_info.as_bytes();
    if keys
        .iter()
        .any(|key| signature_algorithm.verify(key, signed_bytes, &signature_value))
    {
        Ok(())
    } else {
        Err(DsigError::SignatureMismatch)
    }
}

/// Signs `element` in place with an enveloped RSA-SHA256 signature over its `ID`.
///
/// The `Signature` element is inserted after a leading `Issuer` child, where
/// the SAML schema expects it, or as the first child otherwise. When
/// `certificate_der` is given it is embedded in `KeyInfo`.
///
/// # Errors
/// Returns an error if the element has no `ID`, is already signed, or the key
/// cannot sign.
pub fn sign_enveloped(
    element: &mut Element,
    key: &RsaPrivateKey,
    certificate_der: Option<&[u8]>,
) -> Result<(), DsigError> {
    let id = element
        .attr("ID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| DsigError::malformed("element to sign has no ID"))?
        .to_string();
    if find_signature(element)?.is_some() {
        return Err(DsigError::malformed("element is already signed"));
    }

    let digest = DigestAlgorithm::Sha256.digest(c14n::canonicalize(element, &[], None).as_bytes());

    let mut signature = ds("Signature")
        .with_namespace_decl(Some("ds"), DSIG_NS)
        .with_child(
            ds("SignedInfo")
                .with_child(ds("CanonicalizationMethod").with_attr("Algorithm", EXC_C14N))
                .with_child(ds("SignatureMethod").with_attr("Algorithm", RSA_SHA256))
                .with_child(
                    ds("Reference")
                        .with_attr("URI", &format!("#{id}"))
                        .with_child(
                            ds("Transforms")
                                .with_child(
                                    ds("Transform").with_attr("Algorithm", ENVELOPED_SIGNATURE),
                                )
                                .with_child(ds("Transform").with_attr("Algorithm", EXC_C14N)),
                        )
                        .with_child(ds("DigestMethod").with_attr("Algorithm", DIGEST_SHA256))
                        .with_child(ds("DigestValue").with_text(&BASE64.encode(digest))),
                ),
        )
        .with_child(ds("SignatureValue"));
    if let Some(der) = certificate_der {
        signature = signature.with_child(
            ds("KeyInfo").with_child(
                ds("X509Data").with_child(ds("X509Certificate").with_text(&BASE64.encode(der))),
            ),
        );
    }
    signature
        .resolve_namespaces(element.in_scope())
        .map_err(|e| DsigError::malformed(e.to_string()))?;

    let signed_info = required(&signature, "SignedInfo")?;
    let value = SignatureAlgorithm::RsaSha256.sign(
        key,
        c14n::canonicalize(signed_info, &[], None).as_bytes(),
    )?;
    if let Some(signature_value) = signature.child_mut(DSIG_NS, "SignatureValue") {
        signature_value.children.push(Node::Text(BASE64.encode(value)));
    }

    let first_element = element
        .children
        .iter()
        .position(|n| matches!(n, Node::Element(_)));
    let position = match first_element {
        Some(i) if matches!(&element.children[i], Node::Element(e) if e.name == "Issuer") => i + 1,
        _ => 0,
    };
    element.children.insert(position, Node::Element(signature));
    Ok(())
}

/// Decodes base64 content that may be wrapped across lines.
///
/// # Errors
/// Returns an error for invalid base64.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, DsigError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|e| DsigError::malformed(format!("invalid base64: {e}")))
}

fn ds(name: &str) -> Element {
    Element::new(Some("ds"), name, DSIG_NS)
}

fn required<'a>(parent: &'a Element, name: &str) -> Result<&'a Element, DsigError> {
    parent
        .child(DSIG_NS, name)
        .ok_or_else(|| DsigError::malformed(format!("missing {name}")))
}

fn inclusive_prefixes(method: &Element) -> Vec<String> {
    method
        .child(EXC_C14N, "InclusiveNamespaces")
        .and_then(|inc| inc.attr("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::xml::parse;

    const DOC: &str = r#"<p:Root xmlns:p="urn:p" ID="root"><p:Issuer>me</p:Issuer><p:Body ID="body">hello</p:Body></p:Root>"#;

    fn signed(id_target: bool) -> String {
        let mut root = parse(DOC).unwrap();
        let keys = testing::idp_keys();
        if id_target {
            let body = root.child_mut("urn:p", "Body").unwrap();
            sign_enveloped(body, &keys.private_key, Some(&keys.certificate_der)).unwrap();
        } else {
            sign_enveloped(&mut root, &keys.private_key, None).unwrap();
        }
        root.to_xml()
    }

    #[test]
    fn test_sign_then_verify() {
        let root = parse(&signed(false)).unwrap();
        let keys = [testing::idp_keys().public_key()];
        verify_enveloped(&root, &keys).unwrap();

        // Signature lands after Issuer.
        let names: Vec<_> = root.elements().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["Issuer", "Signature", "Body"]);
    }

    #[test]
    fn test_nested_signature_survives_reparse() {
        let root = parse(&signed(true)).unwrap();
        let body = root.child("urn:p", "Body").unwrap();
        verify_enveloped(body, &[testing::idp_keys().public_key()]).unwrap();
        assert!(matches!(
            verify_enveloped(&root, &[testing::idp_keys().public_key()]),
            Err(DsigError::MissingSignature)
        ));
    }

    #[test]
    fn test_tampered_content_fails_digest() {
        let xml = signed(false).replace(">hello<", ">hullo<");
        let root = parse(&xml).unwrap();
        assert!(matches!(
            verify_enveloped(&root, &[testing::idp_keys().public_key()]),
            Err(DsigError::DigestMismatch)
        ));
    }

    #[test]
    fn test_untrusted_key_fails() {
        let root = parse(&signed(false)).unwrap();
        assert!(matches!(
            verify_enveloped(&root, &[testing::sp_keys().public_key()]),
            Err(DsigError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_moved_signature_fails_reference() {
        // Re-home the Body signature onto a copy with a different ID.
        let xml = signed(true).replace("ID=\"body\"", "ID=\"other\"");
        let root = parse(&xml).unwrap();
        let body = root.child("urn:p", "Body").unwrap();
        assert!(matches!(
            verify_enveloped(body, &[testing::idp_keys().public_key()]),
            Err(DsigError::ReferenceMismatch { .. })
        ));
    }

    #[test]
    fn test_unsupported_transform_rejected() {
        let xml = signed(false).replace(
            ENVELOPED_SIGNATURE,
            "http://www.w3.org/TR/1999/REC-xslt-19991116",
        );
        let root = parse(&xml).unwrap();
        assert!(matches!(
            verify_enveloped(&root, &[testing::idp_keys().public_key()]),
            Err(DsigError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_double_sign_rejected() {
        let mut root = parse(&signed(false)).unwrap();
        let err = sign_enveloped(&mut root, &testing::idp_keys().private_key, None).unwrap_err();
        assert!(matches!(err, DsigError::Malformed { .. }));
    }

    #[test]
    fn test_redirect_signature_round_trip() {
        let keys = testing::sp_keys();
        let data = b"SAMLRequest=abc&RelayState=xyz&SigAlg=alg";
        let sig = SignatureAlgorithm::RsaSha256
            .sign(&keys.private_key, data)
            .unwrap();
        assert!(SignatureAlgorithm::RsaSha256.verify(&keys.public_key(), data, &sig));
        assert!(!SignatureAlgorithm::RsaSha256.verify(&keys.public_key(), b"other", &sig));
        assert!(!SignatureAlgorithm::RsaSha512.verify(&keys.public_key(), data, &sig));
    }
}
