//! Inbound message validation.
//!
//! A message moves through `Received → XmlWellFormed → SignatureVerified →
//! ConditionsChecked → Authenticated`. Each transition is a gate; a failing
//! gate ends validation with every problem found at that gate, and no later
//! gate runs.
//!
//! Login responses pass, in order:
//!
//! 1. schema: root, version, IDs, status, exactly one plaintext assertion
//! 2. correlation: `InResponseTo` consumed from the pending store, issuer and
//!    destination checked together
//! 3. top-level status
//! 4. signatures, per the security policy
//! 5. conditions: validity window, audience, bearer subject confirmation,
//!    session expiry
//! 6. NameID extraction and the assertion replay record
//!
//! Rejections are logged at `warn` with the stage and error kinds. Message
//! XML is never logged.

use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use super::format_instant;
use super::response::{extract_attributes, read_status, time_attribute, NameId};
use crate::binding::redirect::verify_query_signature;
use crate::binding::{Binding, DecodedMessage, MessageType};
use crate::crypto::TrustedCertificate;
use crate::error::{ValidationError, ValidationOutcome};
use crate::pending::{AssertionReplayCache, PendingRequestStore, RequestKind};
use crate::settings::Settings;
use crate::xml::{
    self, child, children, dsig, is_element, text_of, CM_BEARER, NS_ASSERTION, NS_PROTOCOL,
    STATUS_PARTIAL_LOGOUT,
};

/// Everything validation reads besides the message itself.
pub struct ValidationContext<'a> {
    pub settings: &'a Settings,
    pub pending: &'a PendingRequestStore,
    pub replay: &'a AssertionReplayCache,
    pub now: DateTime<Utc>,
}

/// How far a message got before it was accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationStage {
    Received,
    XmlWellFormed,
    SignatureVerified,
    ConditionsChecked,
    Authenticated,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::XmlWellFormed => "xml_well_formed",
            Self::SignatureVerified => "signature_verified",
            Self::ConditionsChecked => "conditions_checked",
            Self::Authenticated => "authenticated",
        };
        f.write_str(name)
    }
}

/// A fully validated assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionResult {
    pub name_id: NameId,
    pub session_index: Option<String>,
    pub attributes: HashMap<String, Vec<String>>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    /// Entity ID of the IdP that issued the assertion.
    pub issuer: String,
    pub assertion_id: String,
    pub in_response_to: Option<String>,
}

/// A validated IdP-initiated LogoutRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequestInfo {
    pub id: String,
    pub name_id: NameId,
    pub session_indexes: Vec<String>,
}

/// A validated answer to our LogoutRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutResponseInfo {
    pub in_response_to: Option<String>,
    pub partial: bool,
}

type Rejection = (ValidationStage, Vec<ValidationError>);
type Gate<T> = Result<T, Rejection>;

fn gate(stage: ValidationStage, errors: Vec<ValidationError>) -> Gate<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err((stage, errors))
    }
}

fn fail<T>(stage: ValidationStage, error: ValidationError) -> Gate<T> {
    Err((stage, vec![error]))
}

fn finish<T>(label: &'static str, result: Gate<T>) -> ValidationOutcome<T> {
    match result {
        Ok(value) => ValidationOutcome::Valid(value),
        Err((stage, errors)) => {
            let kinds: Vec<&str> = errors.iter().map(|e| e.kind().as_str()).collect();
            let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
            warn!(
                message_type = label,
                stage = %stage,
                kinds = ?kinds,
                reasons = %reasons.join("; "),
                "SAML message rejected"
            );
            ValidationOutcome::Invalid(errors)
        }
    }
}

/// Validate a login `samlp:Response`.
pub fn validate_response(
    ctx: &ValidationContext<'_>,
    message: &DecodedMessage,
) -> ValidationOutcome<AssertionResult> {
    let outcome = finish("Response", run_response(ctx, message));
    if let ValidationOutcome::Valid(result) = &outcome {
        info!(
            name_id = %result.name_id.value,
            idp = %result.issuer,
            assertion_id = %result.assertion_id,
            attributes = result.attributes.len(),
            "SAML assertion validated"
        );
    }
    outcome
}

fn run_response(ctx: &ValidationContext<'_>, message: &DecodedMessage) -> Gate<AssertionResult> {
    let settings = ctx.settings;
    let policy = &settings.security;
    let mut stage = ValidationStage::Received;

    if message.message_type != MessageType::Response {
        return fail(stage, malformed("expected a SAMLResponse"));
    }
    if message.binding != Binding::HttpPost {
        return fail(stage, malformed("login responses must use HTTP-POST"));
    }

    let doc = xml::parse(&message.xml).map_err(|e| (stage, vec![ValidationError::from(e)]))?;
    let root = doc.root_element();
    let assertion = check_response_schema(&doc).map_err(|errors| (stage, errors))?;
    stage = ValidationStage::XmlWellFormed;

    // Correlation, issuer and destination.
    let mut errors = Vec::new();
    let in_response_to = root
        .attribute("InResponseTo")
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    match &in_response_to {
        Some(id) => {
            if ctx.pending.consume(id, RequestKind::Authn, ctx.now).is_none() {
                errors.push(ValidationError::Replay(format!(
                    "InResponseTo {id} does not match a pending request"
                )));
            }
        }
        None if !policy.allow_unsolicited => errors.push(ValidationError::Replay(
            "unsolicited response without InResponseTo".to_string(),
        )),
        None => debug!("Accepting unsolicited SAML response"),
    }
    if let Some(issuer) = child(root, NS_ASSERTION, "Issuer") {
        check_issuer(settings, &text_of(issuer), &mut errors);
    }
    if let Some(assertion) = assertion {
        if let Some(issuer) = child(assertion, NS_ASSERTION, "Issuer") {
            check_issuer(settings, &text_of(issuer), &mut errors);
        }
    }
    if let Some(destination) = root.attribute("Destination") {
        check_destination(&settings.sp.acs_url, destination, &mut errors);
    }
    gate(stage, errors)?;

    if let Some(status) = read_status(root) {
        if !status.is_success() {
            return fail(stage, status.into_error());
        }
    }
    let Some(assertion) = assertion else {
        return fail(stage, malformed("successful Response carries no Assertion"));
    };

    // Signatures.
    let mut errors = Vec::new();
    let certificates = &settings.idp.certificates;
    let response_sig = embedded_signature(&doc, root, certificates, "Response", &mut errors);
    let assertion_sig = embedded_signature(&doc, assertion, certificates, "Assertion", &mut errors);
    if policy.want_messages_signed && response_sig == SignatureState::Absent {
        errors.push(ValidationError::Signature("Response is not signed".to_string()));
    }
    if policy.want_assertions_signed && assertion_sig == SignatureState::Absent {
        errors.push(ValidationError::Signature("Assertion is not signed".to_string()));
    }
    if response_sig == SignatureState::Absent
        && assertion_sig == SignatureState::Absent
        && !policy.allow_unsigned
    {
        errors.push(ValidationError::Signature(
            "neither Response nor Assertion is signed".to_string(),
        ));
    }
    gate(stage, errors)?;
    stage = ValidationStage::SignatureVerified;

    // Conditions and subject confirmation.
    let mut errors = Vec::new();
    let window = check_conditions(ctx, assertion, &mut errors);
    let subject = child(assertion, NS_ASSERTION, "Subject");
    let bearer_until = subject.and_then(|s| {
        check_bearer_confirmation(ctx, s, in_response_to.as_deref(), &mut errors)
    });
    let authn_statement = child(assertion, NS_ASSERTION, "AuthnStatement");
    let session_not_on_or_after = authn_statement
        .and_then(|s| collect(time_attribute(s, "SessionNotOnOrAfter"), &mut errors).flatten());
    if let Some(session_end) = session_not_on_or_after {
        if ctx.now >= with_skew(session_end, policy.clock_skew) {
            errors.push(ValidationError::Expired(format!(
                "session ended at {}",
                format_instant(session_end)
            )));
        }
    }
    gate(stage, errors)?;
    stage = ValidationStage::ConditionsChecked;

    // Extraction and replay record.
    let name_id = subject
        .and_then(|s| child(s, NS_ASSERTION, "NameID"))
        .and_then(NameId::from_node);
    let Some(name_id) = name_id else {
        return fail(stage, malformed("Assertion has no NameID"));
    };
    let assertion_id = assertion.attribute("ID").unwrap_or_default().to_string();
    let keep_until = with_skew(
        [window.not_on_or_after, bearer_until]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(ctx.now),
        policy.clock_skew,
    );
    if !ctx.replay.record(&assertion_id, keep_until, ctx.now) {
        return fail(
            stage,
            ValidationError::Replay(format!("assertion {assertion_id} was already accepted")),
        );
    }

    Ok(AssertionResult {
        name_id,
        session_index: authn_statement
            .and_then(|s| s.attribute("SessionIndex"))
            .map(str::to_string),
        attributes: extract_attributes(assertion),
        not_before: window.not_before,
        not_on_or_after: window.not_on_or_after,
        session_not_on_or_after,
        issuer: settings.idp.entity_id.clone(),
        assertion_id,
        in_response_to,
    })
}

/// Schema checks for a Response. Returns the assertion, if any.
fn check_response_schema<'a, 'input>(
    doc: &'a Document<'input>,
) -> Result<Option<Node<'a, 'input>>, Vec<ValidationError>> {
    let root = doc.root_element();
    if !is_element(root, NS_PROTOCOL, "Response") {
        return Err(vec![malformed(format!(
            "expected samlp:Response, got {}",
            root.tag_name().name()
        ))]);
    }

    let mut errors = Vec::new();
    check_message_header(root, "Response", &mut errors);
    if read_status(root).is_none() {
        errors.push(malformed("Response has no Status"));
    }
    if doc
        .descendants()
        .any(|n| is_element(n, NS_ASSERTION, "EncryptedAssertion") || is_element(n, NS_ASSERTION, "EncryptedID"))
    {
        errors.push(malformed("encrypted assertions and NameIDs are not supported"));
    }

    let assertions: Vec<Node<'a, 'input>> = doc
        .descendants()
        .filter(|n| is_element(*n, NS_ASSERTION, "Assertion"))
        .collect();
    let assertion = match assertions.as_slice() {
        [] => None,
        [single] if single.parent_element() == Some(root) => Some(*single),
        [_] => {
            errors.push(malformed("Assertion is not a direct child of the Response"));
            None
        }
        many => {
            errors.push(malformed(format!(
                "Response contains {} assertions, expected one",
                many.len()
            )));
            None
        }
    };

    if let Some(assertion) = assertion {
        check_message_header(assertion, "Assertion", &mut errors);
        if child(assertion, NS_ASSERTION, "Issuer").is_none() {
            errors.push(malformed("Assertion has no Issuer"));
        }
        if child(assertion, NS_ASSERTION, "Subject").is_none() {
            errors.push(malformed("Assertion has no Subject"));
        }
        if children(assertion, NS_ASSERTION, "AuthnStatement").count() != 1 {
            errors.push(malformed("Assertion must carry exactly one AuthnStatement"));
        }
    }

    if errors.is_empty() {
        Ok(assertion)
    } else {
        Err(errors)
    }
}

/// `Version`, `ID` and `IssueInstant`, common to every SAML 2.0 message.
fn check_message_header(element: Node<'_, '_>, label: &str, errors: &mut Vec<ValidationError>) {
    if element.attribute("Version") != Some("2.0") {
        errors.push(malformed(format!("{label} Version is not 2.0")));
    }
    if element.attribute("ID").map_or(true, str::is_empty) {
        errors.push(malformed(format!("{label} has no ID")));
    }
    match element.attribute("IssueInstant") {
        None => errors.push(malformed(format!("{label} has no IssueInstant"))),
        Some(_) => {
            collect(time_attribute(element, "IssueInstant"), errors);
        }
    }
}

fn check_issuer(settings: &Settings, actual: &str, errors: &mut Vec<ValidationError>) {
    if actual != settings.idp.entity_id {
        errors.push(ValidationError::IssuerMismatch {
            expected: settings.idp.entity_id.clone(),
            actual: actual.to_string(),
        });
    }
}

fn check_destination(expected: &str, actual: &str, errors: &mut Vec<ValidationError>) {
    if actual != expected {
        errors.push(ValidationError::DestinationMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignatureState {
    Absent,
    Verified,
    Invalid,
}

/// Verify the enveloped signature on `element` if it has one.
fn embedded_signature(
    doc: &Document<'_>,
    element: Node<'_, '_>,
    certificates: &[TrustedCertificate],
    label: &str,
    errors: &mut Vec<ValidationError>,
) -> SignatureState {
    match dsig::signature_of(element) {
        Ok(None) => SignatureState::Absent,
        Ok(Some(_)) => match dsig::verify_enveloped(doc, element, certificates) {
            Ok(algorithm) => {
                debug!(element = label, algorithm = algorithm.uri(), "Signature verified");
                SignatureState::Verified
            }
            Err(e) => {
                errors.push(ValidationError::Signature(format!("{label}: {e}")));
                SignatureState::Invalid
            }
        },
        Err(e) => {
            errors.push(ValidationError::Signature(format!("{label}: {e}")));
            SignatureState::Invalid
        }
    }
}

#[derive(Debug, Default)]
struct ValidityWindow {
    not_before: Option<DateTime<Utc>>,
    not_on_or_after: Option<DateTime<Utc>>,
}

fn check_conditions(
    ctx: &ValidationContext<'_>,
    assertion: Node<'_, '_>,
    errors: &mut Vec<ValidationError>,
) -> ValidityWindow {
    let Some(conditions) = child(assertion, NS_ASSERTION, "Conditions") else {
        errors.push(ValidationError::AudienceMismatch(
            "Assertion has no Conditions".to_string(),
        ));
        return ValidityWindow::default();
    };

    let window = ValidityWindow {
        not_before: collect(time_attribute(conditions, "NotBefore"), errors).flatten(),
        not_on_or_after: collect(time_attribute(conditions, "NotOnOrAfter"), errors).flatten(),
    };
    check_window(ctx, "Conditions", window.not_before, window.not_on_or_after, errors);

    let entity_id = &ctx.settings.sp.entity_id;
    let mut restrictions = children(conditions, NS_ASSERTION, "AudienceRestriction").peekable();
    if restrictions.peek().is_none() {
        errors.push(ValidationError::AudienceMismatch(
            "Conditions carry no AudienceRestriction".to_string(),
        ));
    }
    for restriction in restrictions {
        let listed = children(restriction, NS_ASSERTION, "Audience").any(|a| text_of(a) == *entity_id);
        if !listed {
            errors.push(ValidationError::AudienceMismatch(format!(
                "{entity_id} is not an allowed audience"
            )));
        }
    }

    window
}

/// `instant + skew`, saturating at the end of representable time.
fn with_skew(instant: DateTime<Utc>, skew: chrono::Duration) -> DateTime<Utc> {
    instant
        .checked_add_signed(skew)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time window check with clock skew. `NotOnOrAfter` itself is outside.
fn check_window(
    ctx: &ValidationContext<'_>,
    label: &str,
    not_before: Option<DateTime<Utc>>,
    not_on_or_after: Option<DateTime<Utc>>,
    errors: &mut Vec<ValidationError>,
) {
    let skew = ctx.settings.security.clock_skew;
    if let Some(not_before) = not_before {
        if with_skew(ctx.now, skew) < not_before {
            errors.push(ValidationError::NotYetValid(format!(
                "{label} NotBefore {}",
                format_instant(not_before)
            )));
        }
    }
    if let Some(not_on_or_after) = not_on_or_after {
        if ctx.now >= with_skew(not_on_or_after, skew) {
            errors.push(ValidationError::Expired(format!(
                "{label} NotOnOrAfter {}",
                format_instant(not_on_or_after)
            )));
        }
    }
}

/// At least one bearer confirmation must hold. Returns its `NotOnOrAfter`.
fn check_bearer_confirmation(
    ctx: &ValidationContext<'_>,
    subject: Node<'_, '_>,
    in_response_to: Option<&str>,
    errors: &mut Vec<ValidationError>,
) -> Option<DateTime<Utc>> {
    let mut problems = Vec::new();
    let bearers = children(subject, NS_ASSERTION, "SubjectConfirmation")
        .filter(|c| c.attribute("Method") == Some(CM_BEARER));

    let mut seen = false;
    for confirmation in bearers {
        seen = true;
        let mut own = Vec::new();
        let Some(data) = child(confirmation, NS_ASSERTION, "SubjectConfirmationData") else {
            problems.push(ValidationError::SubjectConfirmation(
                "bearer confirmation has no SubjectConfirmationData".to_string(),
            ));
            continue;
        };

        let not_before = collect(time_attribute(data, "NotBefore"), &mut own).flatten();
        let not_on_or_after = collect(time_attribute(data, "NotOnOrAfter"), &mut own).flatten();
        if not_on_or_after.is_none() {
            own.push(ValidationError::SubjectConfirmation(
                "bearer SubjectConfirmationData has no NotOnOrAfter".to_string(),
            ));
        }
        check_window(ctx, "SubjectConfirmationData", not_before, not_on_or_after, &mut own);

        if let Some(recipient) = data.attribute("Recipient") {
            if recipient != ctx.settings.sp.acs_url {
                own.push(ValidationError::SubjectConfirmation(format!(
                    "Recipient {recipient} is not this SP's ACS URL"
                )));
            }
        }
        if let Some(data_irt) = data.attribute("InResponseTo") {
            if Some(data_irt) != in_response_to {
                own.push(ValidationError::SubjectConfirmation(format!(
                    "SubjectConfirmationData InResponseTo {data_irt} does not match the Response"
                )));
            }
        }

        if own.is_empty() {
            return not_on_or_after;
        }
        problems.extend(own);
    }

    if !seen {
        problems.push(ValidationError::SubjectConfirmation(
            "no bearer SubjectConfirmation".to_string(),
        ));
    }
    errors.extend(problems);
    None
}

/// Validate an IdP-initiated `samlp:LogoutRequest`.
pub fn validate_logout_request(
    ctx: &ValidationContext<'_>,
    message: &DecodedMessage,
) -> ValidationOutcome<LogoutRequestInfo> {
    let outcome = finish("LogoutRequest", run_logout_request(ctx, message));
    if let ValidationOutcome::Valid(info) = &outcome {
        info!(
            name_id = %info.name_id.value,
            session_indexes = info.session_indexes.len(),
            "SAML logout request validated"
        );
    }
    outcome
}

fn run_logout_request(ctx: &ValidationContext<'_>, message: &DecodedMessage) -> Gate<LogoutRequestInfo> {
    let settings = ctx.settings;
    let mut stage = ValidationStage::Received;

    if message.message_type != MessageType::Request {
        return fail(stage, malformed("expected a SAMLRequest"));
    }
    let doc = xml::parse(&message.xml).map_err(|e| (stage, vec![ValidationError::from(e)]))?;
    let root = doc.root_element();
    if !is_element(root, NS_PROTOCOL, "LogoutRequest") {
        return fail(
            stage,
            malformed(format!("expected samlp:LogoutRequest, got {}", root.tag_name().name())),
        );
    }

    let mut errors = Vec::new();
    check_message_header(root, "LogoutRequest", &mut errors);
    if child(root, NS_ASSERTION, "EncryptedID").is_some() {
        errors.push(malformed("encrypted NameIDs are not supported"));
    }
    let name_id = child(root, NS_ASSERTION, "NameID").and_then(NameId::from_node);
    if name_id.is_none() {
        errors.push(malformed("LogoutRequest has no NameID"));
    }
    let not_on_or_after = collect(time_attribute(root, "NotOnOrAfter"), &mut errors).flatten();
    gate(stage, errors)?;
    stage = ValidationStage::XmlWellFormed;

    let mut errors = Vec::new();
    check_logout_envelope(settings, root, &mut errors);
    gate(stage, errors)?;

    let errors = logout_signature(ctx, &doc, root, message, "LogoutRequest");
    gate(stage, errors)?;
    stage = ValidationStage::SignatureVerified;

    let mut errors = Vec::new();
    check_window(ctx, "LogoutRequest", None, not_on_or_after, &mut errors);
    gate(stage, errors)?;

    let Some(name_id) = name_id else {
        return fail(stage, malformed("LogoutRequest has no NameID"));
    };
    Ok(LogoutRequestInfo {
        id: root.attribute("ID").unwrap_or_default().to_string(),
        name_id,
        session_indexes: children(root, NS_PROTOCOL, "SessionIndex")
            .map(text_of)
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

/// Validate the IdP's `samlp:LogoutResponse` to our LogoutRequest.
///
/// An `InResponseTo` that matches nothing pending is logged, not rejected,
/// so a repeated or late logout still completes.
pub fn validate_logout_response(
    ctx: &ValidationContext<'_>,
    message: &DecodedMessage,
) -> ValidationOutcome<LogoutResponseInfo> {
    finish("LogoutResponse", run_logout_response(ctx, message))
}

fn run_logout_response(ctx: &ValidationContext<'_>, message: &DecodedMessage) -> Gate<LogoutResponseInfo> {
    let settings = ctx.settings;
    let mut stage = ValidationStage::Received;

    if message.message_type != MessageType::Response {
        return fail(stage, malformed("expected a SAMLResponse"));
    }
    let doc = xml::parse(&message.xml).map_err(|e| (stage, vec![ValidationError::from(e)]))?;
    let root = doc.root_element();
    if !is_element(root, NS_PROTOCOL, "LogoutResponse") {
        return fail(
            stage,
            malformed(format!("expected samlp:LogoutResponse, got {}", root.tag_name().name())),
        );
    }

    let mut errors = Vec::new();
    check_message_header(root, "LogoutResponse", &mut errors);
    let status = read_status(root);
    if status.is_none() {
        errors.push(malformed("LogoutResponse has no Status"));
    }
    gate(stage, errors)?;
    stage = ValidationStage::XmlWellFormed;

    let in_response_to = root
        .attribute("InResponseTo")
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    match &in_response_to {
        Some(id) if ctx.pending.consume(id, RequestKind::Logout, ctx.now).is_some() => {
            debug!(request_id = %id, "Logout response matched pending request");
        }
        Some(id) => warn!(request_id = %id, "Logout response does not match a pending request"),
        None => debug!("Logout response without InResponseTo"),
    }

    let mut errors = Vec::new();
    check_logout_envelope(settings, root, &mut errors);
    gate(stage, errors)?;

    let Some(status) = status else {
        return fail(stage, malformed("LogoutResponse has no Status"));
    };
    let partial = status.sub_code.as_deref() == Some(STATUS_PARTIAL_LOGOUT);
    if !status.is_success() && !partial {
        return fail(stage, status.into_error());
    }

    let errors = logout_signature(ctx, &doc, root, message, "LogoutResponse");
    gate(stage, errors)?;

    Ok(LogoutResponseInfo {
        in_response_to,
        partial,
    })
}

/// Issuer (if present) and Destination (if present) of a logout message.
fn check_logout_envelope(settings: &Settings, root: Node<'_, '_>, errors: &mut Vec<ValidationError>) {
    if let Some(issuer) = child(root, NS_ASSERTION, "Issuer") {
        check_issuer(settings, &text_of(issuer), errors);
    }
    if let Some(destination) = root.attribute("Destination") {
        let expected = settings.sp.slo_url.as_deref().unwrap_or_default();
        check_destination(expected, destination, errors);
    }
}

/// Logout messages are signed either on the query string (Redirect) or with
/// an enveloped signature.
fn logout_signature(
    ctx: &ValidationContext<'_>,
    doc: &Document<'_>,
    root: Node<'_, '_>,
    message: &DecodedMessage,
    label: &str,
) -> Vec<ValidationError> {
    let policy = &ctx.settings.security;
    let certificates = &ctx.settings.idp.certificates;
    let mut errors = Vec::new();

    let query = match &message.query_signature {
        Some(signature) => match verify_query_signature(signature, certificates) {
            Ok(algorithm) => {
                debug!(message_type = label, algorithm = algorithm.uri(), "Query signature verified");
                SignatureState::Verified
            }
            Err(e) => {
                errors.push(ValidationError::Signature(format!("{label} query: {e}")));
                SignatureState::Invalid
            }
        },
        None => SignatureState::Absent,
    };
    let embedded = embedded_signature(doc, root, certificates, label, &mut errors);

    let signed = query == SignatureState::Verified || embedded == SignatureState::Verified;
    let any_present = query != SignatureState::Absent || embedded != SignatureState::Absent;
    if !any_present && (policy.want_messages_signed || !policy.allow_unsigned) {
        errors.push(ValidationError::Signature(format!("{label} is not signed")));
    }
    if signed {
        debug!(message_type = label, "Logout message signature accepted");
    }
    errors
}

fn collect<T>(result: Result<T, ValidationError>, errors: &mut Vec<ValidationError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            errors.push(e);
            None
        }
    }
}

fn malformed(msg: impl Into<String>) -> ValidationError {
    ValidationError::Malformed(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding;
    use crate::error::ErrorKind;
    use crate::testing::{
        idp_credentials, idp_logout_request, idp_logout_response, redirect_request, rogue_credentials,
        test_settings, IdpResponse,
    };
    use crate::xml::{STATUS_RESPONDER, STATUS_SUCCESS};
    use chrono::Duration;

    struct Fixture {
        settings: Settings,
        pending: PendingRequestStore,
        replay: AssertionReplayCache,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_settings(test_settings())
        }

        fn with_settings(settings: Settings) -> Self {
            Self {
                settings,
                pending: PendingRequestStore::new(),
                replay: AssertionReplayCache::new(),
                now: Utc::now(),
            }
        }

        fn ctx(&self) -> ValidationContext<'_> {
            ValidationContext {
                settings: &self.settings,
                pending: &self.pending,
                replay: &self.replay,
                now: self.now,
            }
        }

        /// Register a pending AuthnRequest and return its ID.
        fn pending_authn(&self) -> String {
            let id = crate::crypto::generate_id();
            self.pending
                .insert(id.clone(), RequestKind::Authn, self.now, std::time::Duration::from_secs(300))
                .unwrap();
            id
        }

        fn response(&self) -> IdpResponse {
            IdpResponse::new(Some(&self.pending_authn()), self.now)
        }

        fn validate(&self, response: &IdpResponse) -> ValidationOutcome<AssertionResult> {
            let message = binding::decode(&response.post_request()).unwrap();
            validate_response(&self.ctx(), &message)
        }
    }

    #[test]
    fn test_valid_response() {
        let fx = Fixture::new();
        let response = fx.response();
        let result = fx.validate(&response).into_result().unwrap();

        assert_eq!(result.name_id.value, "alice@example.com");
        assert_eq!(result.session_index.as_deref(), Some("_session-1"));
        assert_eq!(result.attributes["mail"], vec!["alice@example.com"]);
        assert_eq!(result.attributes["groups"], vec!["admins", "users"]);
        assert_eq!(result.issuer, "https://idp.example.com/metadata");
        assert_eq!(result.assertion_id, response.assertion_id);
        assert_eq!(result.in_response_to, response.in_response_to);
        assert!(fx.pending.is_empty());
        assert_eq!(fx.replay.len(), 1);
    }

    #[test]
    fn test_signed_response_only() {
        let mut settings = test_settings();
        settings.security.want_assertions_signed = false;
        let fx = Fixture::with_settings(settings);
        let mut response = fx.response();
        response.sign_assertion = false;
        response.sign_response = true;
        assert!(fx.validate(&response).is_valid());
    }

    #[test]
    fn test_unsigned_assertion_rejected_when_wanted() {
        let fx = Fixture::new();
        let mut response = fx.response();
        response.sign_assertion = false;
        response.sign_response = true;
        let outcome = fx.validate(&response);
        assert!(outcome.has_kind(ErrorKind::Signature));
    }

    #[test]
    fn test_unsigned_rejected_without_escape_hatch() {
        let mut settings = test_settings();
        settings.security.want_assertions_signed = false;
        let fx = Fixture::with_settings(settings);
        let mut response = fx.response();
        response.sign_assertion = false;
        assert!(fx.validate(&response).has_kind(ErrorKind::Signature));

        let mut settings = test_settings();
        settings.security.want_assertions_signed = false;
        settings.security.allow_unsigned = true;
        let fx = Fixture::with_settings(settings);
        let mut response = fx.response();
        response.sign_assertion = false;
        assert!(fx.validate(&response).is_valid());
    }

    #[test]
    fn test_untrusted_signer() {
        let fx = Fixture::new();
        let mut response = fx.response();
        response.signer = rogue_credentials();
        let outcome = fx.validate(&response);
        assert_eq!(outcome.errors().len(), 1);
        assert!(outcome.has_kind(ErrorKind::Signature));
        assert_eq!(outcome.http_status(), 401);
    }

    #[test]
    fn test_unknown_in_response_to() {
        let fx = Fixture::new();
        let response = IdpResponse::new(Some("_never-sent"), fx.now);
        assert!(fx.validate(&response).has_kind(ErrorKind::Replay));
    }

    #[test]
    fn test_unsolicited_response() {
        let fx = Fixture::new();
        let response = IdpResponse::new(None, fx.now);
        assert!(fx.validate(&response).has_kind(ErrorKind::Replay));

        let mut settings = test_settings();
        settings.security.allow_unsolicited = true;
        let fx = Fixture::with_settings(settings);
        let response = IdpResponse::new(None, fx.now);
        let result = fx.validate(&response).into_result().unwrap();
        assert!(result.in_response_to.is_none());

        // The assertion ID still guards against replay.
        assert!(fx.validate(&response).has_kind(ErrorKind::Replay));
    }

    #[test]
    fn test_replayed_response() {
        let fx = Fixture::new();
        let response = fx.response();
        assert!(fx.validate(&response).is_valid());

        let second = fx.validate(&response);
        assert!(second.has_kind(ErrorKind::Replay));
    }

    #[test]
    fn test_correlation_issuer_destination_collected() {
        let fx = Fixture::new();
        let mut response = IdpResponse::new(Some("_never-sent"), fx.now);
        response.issuer = "https://evil.example.com".to_string();
        response.destination = Some("https://other.example.com/acs".to_string());

        let outcome = fx.validate(&response);
        assert!(outcome.has_kind(ErrorKind::Replay));
        assert!(outcome.has_kind(ErrorKind::IssuerMismatch));
        assert!(outcome.has_kind(ErrorKind::DestinationMismatch));
        // Signature gate never ran.
        assert!(!outcome.has_kind(ErrorKind::Signature));
    }

    #[test]
    fn test_status_failure_consumes_pending_id() {
        let fx = Fixture::new();
        let mut response = fx.response();
        response.status = STATUS_RESPONDER.to_string();
        response.include_assertion = false;

        let outcome = fx.validate(&response);
        assert!(outcome.has_kind(ErrorKind::StatusFailure));
        assert!(fx.pending.is_empty());
    }

    #[test]
    fn test_expired_assertion() {
        let mut settings = test_settings();
        settings.security.clock_skew = Duration::zero();
        let fx = Fixture::with_settings(settings);
        let mut response = fx.response();
        response.not_on_or_after = fx.now - Duration::seconds(1);
        assert!(fx.validate(&response).has_kind(ErrorKind::ExpiredAssertion));

        let mut response = fx.response();
        response.not_on_or_after = fx.now + Duration::hours(1);
        assert!(fx.validate(&response).is_valid());
    }

    #[test]
    fn test_clock_skew_tolerance() {
        let fx = Fixture::new();
        // Within the default 60s skew.
        let mut response = fx.response();
        response.not_before = fx.now + Duration::seconds(30);
        assert!(fx.validate(&response).is_valid());

        let mut response = fx.response();
        response.not_before = fx.now + Duration::seconds(120);
        let outcome = fx.validate(&response);
        assert!(matches!(outcome.errors()[0], ValidationError::NotYetValid(_)));

        let mut response = fx.response();
        response.not_on_or_after = fx.now - Duration::seconds(120);
        assert!(fx.validate(&response).has_kind(ErrorKind::ExpiredAssertion));
    }

    #[test]
    fn test_skew_saturates_at_end_of_time() {
        let end = DateTime::<Utc>::MAX_UTC;
        assert_eq!(with_skew(end - Duration::seconds(10), Duration::days(1)), end);
        assert_eq!(with_skew(end, Duration::zero()), end);

        let now = Utc::now();
        assert_eq!(with_skew(now, Duration::seconds(60)), now + Duration::seconds(60));
    }

    #[test]
    fn test_audience_mismatch() {
        let fx = Fixture::new();
        let mut response = fx.response();
        response.audience = "https://other-sp.example.com".to_string();
        let outcome = fx.validate(&response);
        assert!(outcome.has_kind(ErrorKind::AudienceMismatch));
        assert_eq!(outcome.http_status(), 401);
    }

    #[test]
    fn test_subject_confirmation_checks() {
        let fx = Fixture::new();
        let mut response = fx.response();
        response.recipient = "https://other.example.com/acs".to_string();
        assert!(fx.validate(&response).has_kind(ErrorKind::SubjectConfirmation));

        let mut response = fx.response();
        response.confirmation_method = "urn:oasis:names:tc:SAML:2.0:cm:holder-of-key".to_string();
        assert!(fx.validate(&response).has_kind(ErrorKind::SubjectConfirmation));
    }

    #[test]
    fn test_session_not_on_or_after() {
        let fx = Fixture::new();
        let mut response = fx.response();
        response.session_not_on_or_after = Some(fx.now - Duration::minutes(5));
        assert!(fx.validate(&response).has_kind(ErrorKind::ExpiredAssertion));

        let mut response = fx.response();
        let session_end = fx.now + Duration::hours(8);
        response.session_not_on_or_after = Some(session_end);
        let result = fx.validate(&response).into_result().unwrap();
        assert_eq!(result.session_not_on_or_after.map(|t| t.timestamp()), Some(session_end.timestamp()));
    }

    #[test]
    fn test_second_assertion_is_rejected() {
        let fx = Fixture::new();
        let response = fx.response();
        let xml = response.xml();
        // Append an unsigned copy of the signed assertion with a forged NameID.
        let start = xml.find("<saml:Assertion").unwrap();
        let end = xml.find("</saml:Assertion>").unwrap() + "</saml:Assertion>".len();
        let injected = xml[start..end].replace("alice@example.com", "mallory@example.com");
        let wrapped = xml.replacen("</samlp:Response>", &format!("{injected}</samlp:Response>"), 1);

        let message = binding::decode(&IdpResponse::post_xml(&wrapped)).unwrap();
        let outcome = validate_response(&fx.ctx(), &message);
        assert!(outcome.has_kind(ErrorKind::MalformedMessage));
        assert_eq!(outcome.http_status(), 400);
    }

    #[test]
    fn test_schema_problems_are_collected() {
        let fx = Fixture::new();
        let xml = format!(
            r#"<samlp:Response xmlns:samlp="{NS_PROTOCOL}" Version="1.1"><saml:EncryptedAssertion xmlns:saml="{NS_ASSERTION}"/></samlp:Response>"#
        );
        let message = binding::decode(&IdpResponse::post_xml(&xml)).unwrap();
        let outcome = validate_response(&fx.ctx(), &message);
        // Version, ID, IssueInstant, Status, encryption.
        assert_eq!(outcome.errors().len(), 5, "{:?}", outcome.errors());
        assert!(outcome.errors().iter().all(|e| e.kind() == ErrorKind::MalformedMessage));
    }

    #[test]
    fn test_login_over_redirect_is_malformed() {
        let fx = Fixture::new();
        let response = fx.response();
        let request = redirect_request(&response.xml(), MessageType::Response, None);
        let message = binding::decode(&request).unwrap();
        assert!(validate_response(&fx.ctx(), &message).has_kind(ErrorKind::MalformedMessage));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let fx = Fixture::new();
        let outcome = {
            let message = binding::decode(&IdpResponse::post_xml("<not-closed")).unwrap();
            validate_response(&fx.ctx(), &message)
        };
        assert!(outcome.has_kind(ErrorKind::MalformedMessage));
    }

    #[test]
    fn test_logout_request_redirect_signed() {
        let fx = Fixture::new();
        let (id, xml) = idp_logout_request(&fx.settings, "alice@example.com", Some("_session-1"), fx.now, false);
        let request = redirect_request(&xml, MessageType::Request, Some(&idp_credentials()));
        let message = binding::decode(&request).unwrap();

        let info = validate_logout_request(&fx.ctx(), &message).into_result().unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.name_id.value, "alice@example.com");
        assert_eq!(info.session_indexes, vec!["_session-1"]);
    }

    #[test]
    fn test_logout_request_unsigned_or_rogue() {
        let fx = Fixture::new();
        let (_, xml) = idp_logout_request(&fx.settings, "alice@example.com", None, fx.now, false);

        let unsigned = binding::decode(&redirect_request(&xml, MessageType::Request, None)).unwrap();
        assert!(validate_logout_request(&fx.ctx(), &unsigned).has_kind(ErrorKind::Signature));

        let rogue = binding::decode(&redirect_request(&xml, MessageType::Request, Some(&rogue_credentials()))).unwrap();
        assert!(validate_logout_request(&fx.ctx(), &rogue).has_kind(ErrorKind::Signature));
    }

    #[test]
    fn test_logout_request_embedded_signature_and_expiry() {
        let fx = Fixture::new();
        let (_, xml) = idp_logout_request(&fx.settings, "alice@example.com", None, fx.now, true);
        let message = binding::decode(&IdpResponse::post_request_xml(&xml)).unwrap();
        assert!(validate_logout_request(&fx.ctx(), &message).is_valid());

        let (_, xml) = idp_logout_request(
            &fx.settings,
            "alice@example.com",
            None,
            fx.now - Duration::minutes(30),
            true,
        );
        let message = binding::decode(&IdpResponse::post_request_xml(&xml)).unwrap();
        assert!(validate_logout_request(&fx.ctx(), &message).has_kind(ErrorKind::ExpiredAssertion));
    }

    #[test]
    fn test_logout_request_wrong_destination() {
        let mut settings = test_settings();
        settings.sp.slo_url = Some("https://sp.example.com/other-sls".to_string());
        let fx = Fixture::with_settings(settings);
        let (_, xml) = idp_logout_request(&test_settings(), "alice@example.com", None, fx.now, false);
        let request = redirect_request(&xml, MessageType::Request, Some(&idp_credentials()));
        let message = binding::decode(&request).unwrap();
        assert!(validate_logout_request(&fx.ctx(), &message).has_kind(ErrorKind::DestinationMismatch));
    }

    #[test]
    fn test_logout_response() {
        let fx = Fixture::new();
        fx.pending
            .insert("_logout-1".to_string(), RequestKind::Logout, fx.now, std::time::Duration::from_secs(300))
            .unwrap();
        let xml = idp_logout_response(&fx.settings, Some("_logout-1"), STATUS_SUCCESS, None, fx.now);
        let request = redirect_request(&xml, MessageType::Response, Some(&idp_credentials()));
        let message = binding::decode(&request).unwrap();
        let info = validate_logout_response(&fx.ctx(), &message).into_result().unwrap();
        assert!(!info.partial);
        assert!(fx.pending.is_empty());

        // Same response again: nothing pending, still accepted.
        assert!(validate_logout_response(&fx.ctx(), &message).is_valid());
    }

    #[test]
    fn test_logout_response_partial_and_failure() {
        let fx = Fixture::new();
        let xml = idp_logout_response(
            &fx.settings,
            None,
            STATUS_RESPONDER,
            Some(STATUS_PARTIAL_LOGOUT),
            fx.now,
        );
        let message = binding::decode(&redirect_request(&xml, MessageType::Response, Some(&idp_credentials()))).unwrap();
        assert!(validate_logout_response(&fx.ctx(), &message).into_result().unwrap().partial);

        let xml = idp_logout_response(&fx.settings, None, STATUS_RESPONDER, None, fx.now);
        let message = binding::decode(&redirect_request(&xml, MessageType::Response, Some(&idp_credentials()))).unwrap();
        assert!(validate_logout_response(&fx.ctx(), &message).has_kind(ErrorKind::StatusFailure));
    }

    #[test]
    fn test_stage_ordering() {
        assert!(ValidationStage::Received < ValidationStage::Authenticated);
        assert_eq!(ValidationStage::SignatureVerified.to_string(), "signature_verified");
    }
}
