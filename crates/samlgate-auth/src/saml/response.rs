//! Inbound `Response` decoding and assertion validation.
//!
//! A [`VerifiedResponse`] can only be obtained through signature verification
//! and keeps references to the exact elements the signatures covered. All
//! later checks and the subject extraction read from those elements, never
//! from a fresh lookup by ID.

use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::RsaPublicKey;
use time::{Duration, OffsetDateTime};

use super::{SAML_ASSERTION_NS, SAML_PROTOCOL_NS, STATUS_SUCCESS};
use crate::clock::parse_instant;
use crate::xml::{self, Element, dsig};
use crate::{AuthError, AuthResult};

/// Decodes the `SAMLResponse` form value into a document rooted at
/// `samlp:Response`.
///
/// # Errors
/// Returns [`AuthError::MalformedResponse`] if any decoding layer fails.
pub fn decode_response(encoded: &str) -> AuthResult<Element> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64
        .decode(compact)
        .map_err(|e| AuthError::malformed(format!("invalid base64: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| AuthError::malformed("response is not valid UTF-8"))?;
    let root = xml::parse(&text).map_err(|e| AuthError::malformed(e.to_string()))?;
    if !root.is(SAML_PROTOCOL_NS, "Response") {
        return Err(AuthError::malformed(format!(
            "unexpected root element {}",
            root.name
        )));
    }
    Ok(root)
}

/// Best-effort request ID from a document whose signatures have not been
/// checked. Only used to invalidate the pending request after a failure.
#[must_use]
pub fn claimed_request_id(response: &Element) -> Option<String> {
    response
        .attr("InResponseTo")
        .map(str::to_string)
        .or_else(|| {
            response
                .child(SAML_ASSERTION_NS, "Assertion")
                .and_then(|a| subject_confirmation_data(a).find_map(|d| d.attr("InResponseTo")))
                .map(str::to_string)
        })
        .filter(|id| !id.is_empty())
}

/// Top-level status code of a response.
#[must_use]
pub fn status_code(response: &Element) -> Option<&str> {
    response
        .child(SAML_PROTOCOL_NS, "Status")
        .and_then(|s| s.child(SAML_PROTOCOL_NS, "StatusCode"))
        .and_then(|c| c.attr("Value"))
}

fn subject_confirmation_data(assertion: &Element) -> impl Iterator<Item = &Element> {
    assertion
        .child(SAML_ASSERTION_NS, "Subject")
        .into_iter()
        .flat_map(|s| s.children_named(SAML_ASSERTION_NS, "SubjectConfirmation"))
        .filter_map(|c| c.child(SAML_ASSERTION_NS, "SubjectConfirmationData"))
}

fn parse_time(element: &Element, attr: &str) -> AuthResult<Option<OffsetDateTime>> {
    element
        .attr(attr)
        .map(|value| {
            parse_instant(value)
                .map_err(|e| AuthError::malformed(format!("invalid {attr} {value}: {e}")))
        })
        .transpose()
}

/// A response whose signatures have been verified against the IdP keys.
#[derive(Debug)]
pub struct VerifiedResponse<'a> {
    response: &'a Element,
    assertion: &'a Element,
    response_signed: bool,
}

impl<'a> VerifiedResponse<'a> {
    /// Verifies the signatures of `response`.
    ///
    /// The response must contain exactly one plain `Assertion`. Every
    /// signature present on the Response or the Assertion must verify, and at
    /// least one must exist; either one covers the Assertion.
    ///
    /// # Errors
    /// - [`AuthError::IdpStatus`] for an error response without an assertion
    /// - [`AuthError::MalformedResponse`] for structural problems
    /// - [`AuthError::SignatureInvalid`] if verification fails
    pub fn verify(response: &'a Element, keys: &[RsaPublicKey]) -> AuthResult<Self> {
        if response
            .child(SAML_ASSERTION_NS, "EncryptedAssertion")
            .is_some()
        {
            return Err(AuthError::malformed("encrypted assertions are not supported"));
        }
        let mut assertions = response.children_named(SAML_ASSERTION_NS, "Assertion");
        let assertion = match (assertions.next(), assertions.next()) {
            (Some(a), None) => a,
            (None, _) => {
                return Err(match status_code(response) {
                    Some(status) if status != STATUS_SUCCESS => AuthError::IdpStatus {
                        status: status.to_string(),
                    },
                    _ => AuthError::malformed("response contains no assertion"),
                });
            }
            (Some(_), Some(_)) => {
                return Err(AuthError::malformed("response contains multiple assertions"));
            }
        };
        ensure_unique_ids(response)?;

        let response_signed = dsig::find_signature(response)
            .map_err(|e| AuthError::signature_invalid(e.to_string()))?
            .is_some();
        let assertion_signed = dsig::find_signature(assertion)
            .map_err(|e| AuthError::signature_invalid(e.to_string()))?
            .is_some();
        if !response_signed && !assertion_signed {
            return Err(AuthError::signature_invalid(
                "neither response nor assertion is signed",
            ));
        }
        if response_signed {
            dsig::verify_enveloped(response, keys)
                .map_err(|e| AuthError::signature_invalid(format!("response: {e}")))?;
        }
        if assertion_signed {
            dsig::verify_enveloped(assertion, keys)
                .map_err(|e| AuthError::signature_invalid(format!("assertion: {e}")))?;
        }

        Ok(Self {
            response,
            assertion,
            response_signed,
        })
    }

    /// The verified assertion.
    #[must_use]
    pub fn assertion(&self) -> &'a Element {
        self.assertion
    }

    /// Requires a top-level `Success` status.
    ///
    /// # Errors
    /// Returns [`AuthError::IdpStatus`] otherwise.
    pub fn check_status(&self) -> AuthResult<()> {
        match status_code(self.response) {
            Some(STATUS_SUCCESS) => Ok(()),
            other => Err(AuthError::IdpStatus {
                status: other.unwrap_or("missing").to_string(),
            }),
        }
    }

    /// Requires the assertion (and the response, when it names one) to be
    /// issued by `expected`.
    ///
    /// # Errors
    /// Returns [`AuthError::IssuerMismatch`] or, for a missing assertion
    /// issuer, [`AuthError::MalformedResponse`].
    pub fn check_issuer(&self, expected: &str) -> AuthResult<()> {
        let issuer = self
            .assertion
            .child(SAML_ASSERTION_NS, "Issuer")
            .map(|i| i.text())
            .ok_or_else(|| AuthError::malformed("assertion has no Issuer"))?;
        if issuer.trim() != expected {
            return Err(AuthError::IssuerMismatch { issuer });
        }
        if let Some(response_issuer) = self.response.child(SAML_ASSERTION_NS, "Issuer") {
            let response_issuer = response_issuer.text();
            if response_issuer.trim() != expected {
                return Err(AuthError::IssuerMismatch {
                    issuer: response_issuer,
                });
            }
        }
        Ok(())
    }

    /// The request ID this response answers.
    ///
    /// Taken from the assertion's `SubjectConfirmationData` and from the
    /// Response itself when the Response is signed. Both must agree.
    ///
    /// # Errors
    /// - [`AuthError::UnknownOrReplayedRequest`] for unsolicited responses
    /// - [`AuthError::MalformedResponse`] for conflicting values
    pub fn request_id(&self) -> AuthResult<String> {
        let mut ids: HashSet<&str> = subject_confirmation_data(self.assertion)
            .filter_map(|d| d.attr("InResponseTo"))
            .collect();
        if self.response_signed
            && let Some(id) = self.response.attr("InResponseTo")
        {
            ids.insert(id);
        }
        ids.remove("");

        let mut ids = ids.into_iter();
        match (ids.next(), ids.next()) {
            (Some(id), None) => Ok(id.to_string()),
            (None, _) => Err(AuthError::unknown_request("<unsolicited>")),
            (Some(_), Some(_)) => Err(AuthError::malformed("conflicting InResponseTo values")),
        }
    }

    /// Checks the assertion validity window with `skew` leeway on both ends.
    ///
    /// # Errors
    /// Returns [`AuthError::AssertionNotYetValid`] or
    /// [`AuthError::AssertionExpired`].
    pub fn check_time_window(&self, now: OffsetDateTime, skew: Duration) -> AuthResult<()> {
        let conditions = self
            .assertion
            .child(SAML_ASSERTION_NS, "Conditions")
            .ok_or_else(|| AuthError::malformed("assertion has no Conditions"))?;

        if let Some(not_before) = parse_time(conditions, "NotBefore")?
            && now + skew < not_before
        {
            return Err(AuthError::AssertionNotYetValid);
        }
        if let Some(not_on_or_after) = parse_time(conditions, "NotOnOrAfter")?
            && now - skew >= not_on_or_after
        {
            return Err(AuthError::AssertionExpired);
        }
        for data in subject_confirmation_data(self.assertion) {
            if let Some(not_on_or_after) = parse_time(data, "NotOnOrAfter")?
                && now - skew >= not_on_or_after
            {
                return Err(AuthError::AssertionExpired);
            }
        }
        Ok(())
    }

    /// Requires every `AudienceRestriction` to name `entity_id` and every
    /// recipient or destination to be `acs_url`.
    ///
    /// # Errors
    /// Returns [`AuthError::AudienceMismatch`].
    pub fn check_audience(&self, entity_id: &str, acs_url: &str) -> AuthResult<()> {
        let restrictions: Vec<&Element> = self
            .assertion
            .child(SAML_ASSERTION_NS, "Conditions")
            .into_iter()
            .flat_map(|c| c.children_named(SAML_ASSERTION_NS, "AudienceRestriction"))
            .collect();
        if restrictions.is_empty() {
            return Err(AuthError::audience_mismatch("assertion has no AudienceRestriction"));
        }
        for restriction in restrictions {
            let listed = restriction
                .children_named(SAML_ASSERTION_NS, "Audience")
                .any(|a| a.text().trim() == entity_id);
            if !listed {
                return Err(AuthError::audience_mismatch(format!(
                    "{entity_id} is not an intended audience"
                )));
            }
        }

        for data in subject_confirmation_data(self.assertion) {
            if let Some(recipient) = data.attr("Recipient")
                && recipient != acs_url
            {
                return Err(AuthError::audience_mismatch(format!(
                    "recipient {recipient} is not {acs_url}"
                )));
            }
        }
        if let Some(destination) = self.response.attr("Destination")
            && destination != acs_url
        {
            return Err(AuthError::audience_mismatch(format!(
                "destination {destination} is not {acs_url}"
            )));
        }
        Ok(())
    }

    /// The authenticated subject (`Subject/NameID`).
    ///
    /// # Errors
    /// Returns [`AuthError::MalformedResponse`] if it is missing or empty.
    pub fn subject(&self) -> AuthResult<String> {
        let subject = self
            .assertion
            .child(SAML_ASSERTION_NS, "Subject")
            .ok_or_else(|| AuthError::malformed("assertion has no Subject"))?;
        let name_id = subject
            .child(SAML_ASSERTION_NS, "NameID")
            .map(|n| n.text().trim().to_string())
            .unwrap_or_default();
        if name_id.is_empty() {
            return Err(AuthError::malformed("assertion has no NameID"));
        }
        Ok(name_id)
    }

    /// `SessionIndex` of the first `AuthnStatement`, if present.
    #[must_use]
    pub fn session_index(&self) -> Option<String> {
        self.assertion
            .child(SAML_ASSERTION_NS, "AuthnStatement")
            .and_then(|s| s.attr("SessionIndex"))
            .map(str::to_string)
    }
}

/// Rejects documents in which two elements share an `ID`.
fn ensure_unique_ids(root: &Element) -> AuthResult<()> {
    let mut seen = HashSet::new();
    let mut duplicate = None;
    root.walk(&mut |element| {
        if let Some(id) = element.attr("ID")
            && !seen.insert(id)
        {
            duplicate = Some(id.to_string());
        }
    });
    match duplicate {
        Some(id) => Err(AuthError::malformed(format!("duplicate ID {id}"))),
        None => Ok(()),
    }
}
