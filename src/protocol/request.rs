//! Messages the SP sends: AuthnRequest, LogoutRequest, LogoutResponse.

use chrono::{DateTime, Utc};

use super::format_instant;
use super::response::NameId;
use crate::crypto::generate_id;
use crate::error::{SamlError, SamlResult};
use crate::settings::Settings;
use crate::xml::{dsig, escape_attr, escape_text, BINDING_HTTP_POST, NS_ASSERTION, NS_PROTOCOL};

/// Per-login switches passed through to the AuthnRequest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoginOptions {
    pub force_authn: bool,
    pub is_passive: bool,
}

/// A built protocol message and its ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltMessage {
    pub id: String,
    pub xml: String,
}

/// Build an AuthnRequest for the configured IdP.
///
/// `embed_signature` adds an enveloped XML signature; it is only wanted for
/// HTTP-POST, since Redirect signs the query string instead.
pub fn build_authn_request(
    settings: &Settings,
    options: LoginOptions,
    now: DateTime<Utc>,
    embed_signature: bool,
) -> SamlResult<BuiltMessage> {
    let id = generate_id();
    let security = &settings.security;

    let mut flags = String::new();
    if options.force_authn {
        flags.push_str(r#" ForceAuthn="true""#);
    }
    if options.is_passive {
        flags.push_str(r#" IsPassive="true""#);
    }

    let authn_context = if security.requested_authn_context.is_empty() {
        String::new()
    } else {
        let refs: String = security
            .requested_authn_context
            .iter()
            .map(|class| format!("<saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef>", escape_text(class)))
            .collect();
        format!(
            r#"<samlp:RequestedAuthnContext Comparison="{}">{}</samlp:RequestedAuthnContext>"#,
            escape_attr(&security.authn_context_comparison),
            refs
        )
    };

    let xml = format!(
        concat!(
            r#"<samlp:AuthnRequest xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" ProtocolBinding="{binding}" AssertionConsumerServiceURL="{acs}"{flags}>"#,
            "<saml:Issuer>{issuer}</saml:Issuer>",
            r#"<samlp:NameIDPolicy Format="{format}" AllowCreate="true"/>"#,
            "{authn_context}",
            "</samlp:AuthnRequest>",
        ),
        samlp = NS_PROTOCOL,
        saml = NS_ASSERTION,
        id = id,
        instant = format_instant(now),
        destination = escape_attr(&settings.idp.sso_url),
        binding = BINDING_HTTP_POST,
        acs = escape_attr(&settings.sp.acs_url),
        flags = flags,
        issuer = escape_text(&settings.sp.entity_id),
        format = escape_attr(&settings.sp.name_id_format),
        authn_context = authn_context,
    );

    finish(settings, id, xml, embed_signature)
}

/// Build a LogoutRequest for `name_id` addressed to the IdP SLO endpoint.
pub fn build_logout_request(
    settings: &Settings,
    name_id: &NameId,
    session_index: Option<&str>,
    now: DateTime<Utc>,
    embed_signature: bool,
) -> SamlResult<BuiltMessage> {
    let slo = settings
        .idp
        .slo
        .as_ref()
        .ok_or_else(|| SamlError::Internal("IdP has no single logout endpoint".to_string()))?;
    let id = generate_id();

    let session_index = session_index
        .map(|index| format!("<samlp:SessionIndex>{}</samlp:SessionIndex>", escape_text(index)))
        .unwrap_or_default();

    let xml = format!(
        concat!(
            r#"<samlp:LogoutRequest xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}">"#,
            "<saml:Issuer>{issuer}</saml:Issuer>",
            "{name_id}",
            "{session_index}",
            "</samlp:LogoutRequest>",
        ),
        samlp = NS_PROTOCOL,
        saml = NS_ASSERTION,
        id = id,
        instant = format_instant(now),
        destination = escape_attr(&slo.url),
        issuer = escape_text(&settings.sp.entity_id),
        name_id = name_id.to_xml(),
        session_index = session_index,
    );

    finish(settings, id, xml, embed_signature)
}

/// Build a LogoutResponse answering the IdP's LogoutRequest `in_response_to`.
pub fn build_logout_response(
    settings: &Settings,
    in_response_to: &str,
    status_code: &str,
    now: DateTime<Utc>,
    embed_signature: bool,
) -> SamlResult<BuiltMessage> {
    let slo = settings
        .idp
        .slo
        .as_ref()
        .ok_or_else(|| SamlError::Internal("IdP has no single logout endpoint".to_string()))?;
    let id = generate_id();

    let xml = format!(
        concat!(
            r#"<samlp:LogoutResponse xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" InResponseTo="{in_response_to}">"#,
            "<saml:Issuer>{issuer}</saml:Issuer>",
            r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
            "</samlp:LogoutResponse>",
        ),
        samlp = NS_PROTOCOL,
        saml = NS_ASSERTION,
        id = id,
        instant = format_instant(now),
        destination = escape_attr(slo.response_location()),
        in_response_to = escape_attr(in_response_to),
        issuer = escape_text(&settings.sp.entity_id),
        status = escape_attr(status_code),
    );

    finish(settings, id, xml, embed_signature)
}

fn finish(settings: &Settings, id: String, xml: String, embed_signature: bool) -> SamlResult<BuiltMessage> {
    if !embed_signature {
        return Ok(BuiltMessage { id, xml });
    }
    let credentials = settings
        .sp
        .credentials
        .as_ref()
        .ok_or_else(|| SamlError::Internal("signing requested without SP credentials".to_string()))?;
    let xml = dsig::sign_enveloped(&xml, &id, credentials, settings.security.signature_algorithm)?;
    Ok(BuiltMessage { id, xml })
}
