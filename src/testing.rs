//! Test fixtures: key material, settings and a scriptable IdP.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::binding::{self, redirect, HttpRequestData, MessageType, RedirectInstruction};
use crate::crypto::{format_certificate, generate_id, SignatureAlgorithm, SigningCredentials, TrustedCertificate};
use crate::protocol::format_instant;
use crate::settings::{RawSettings, Settings};
use crate::xml::{
    self, dsig, escape_attr, escape_text, AC_PASSWORD_PROTECTED_TRANSPORT, BINDING_HTTP_POST,
    BINDING_HTTP_REDIRECT, CM_BEARER, NS_ASSERTION, NS_PROTOCOL, STATUS_SUCCESS,
};

pub(crate) const IDP_CERT: &str = include_str!("../testdata/idp.crt");
pub(crate) const IDP_KEY: &str = include_str!("../testdata/idp.key");
pub(crate) const SP_CERT: &str = include_str!("../testdata/sp.crt");
pub(crate) const SP_KEY: &str = include_str!("../testdata/sp.key");
pub(crate) const ROGUE_CERT: &str = include_str!("../testdata/rogue.crt");
pub(crate) const ROGUE_KEY: &str = include_str!("../testdata/rogue.key");

pub(crate) const IDP_ENTITY_ID: &str = "https://idp.example.com/metadata";
pub(crate) const SP_ENTITY_ID: &str = "https://sp.example.com/saml/metadata";
pub(crate) const SP_ACS_URL: &str = "https://sp.example.com/saml/acs";
pub(crate) const SP_SLO_URL: &str = "https://sp.example.com/saml/sls";

fn credentials(key: &str, cert: &str) -> SigningCredentials {
    SigningCredentials::new(key, TrustedCertificate::from_pem(cert).unwrap()).unwrap()
}

pub(crate) fn idp_credentials() -> SigningCredentials {
    credentials(IDP_KEY, IDP_CERT)
}

pub(crate) fn rogue_credentials() -> SigningCredentials {
    credentials(ROGUE_KEY, ROGUE_CERT)
}

pub(crate) fn sp_credentials() -> SigningCredentials {
    credentials(SP_KEY, SP_CERT)
}

pub(crate) fn idp_trust() -> Vec<TrustedCertificate> {
    vec![TrustedCertificate::from_pem(IDP_CERT).unwrap()]
}

/// Settings for an SP with a key pair, talking to the test IdP over
/// HTTP-Redirect.
pub(crate) fn raw_settings() -> RawSettings {
    serde_json::from_value(json!({
        "strict": true,
        "debug": false,
        "sp": {
            "entityId": SP_ENTITY_ID,
            "assertionConsumerService": { "url": SP_ACS_URL, "binding": BINDING_HTTP_POST },
            "singleLogoutService": { "url": SP_SLO_URL, "binding": BINDING_HTTP_REDIRECT },
            "x509cert": SP_CERT,
            "privateKey": SP_KEY
        },
        "idp": {
            "entityId": IDP_ENTITY_ID,
            "singleSignOnService": { "url": "https://idp.example.com/sso", "binding": BINDING_HTTP_REDIRECT },
            "singleLogoutService": { "url": "https://idp.example.com/slo", "binding": BINDING_HTTP_REDIRECT },
            "x509cert": IDP_CERT
        }
    }))
    .unwrap()
}

pub(crate) fn test_settings() -> Settings {
    Settings::from_raw(&raw_settings()).unwrap()
}

/// Test settings with every SP signing switch on.
pub(crate) fn signing_settings() -> Settings {
    let mut raw = raw_settings();
    raw.security.authn_requests_signed = true;
    raw.security.logout_request_signed = true;
    raw.security.logout_response_signed = true;
    raw.security.sign_metadata = true;
    Settings::from_raw(&raw).unwrap()
}

/// Metadata for the test IdP.
pub(crate) fn idp_metadata_xml() -> String {
    format!(
        r#"<?xml version="1.0"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" entityID="{IDP_ENTITY_ID}">
  <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>
    </md:KeyDescriptor>
    <md:SingleLogoutService Binding="{BINDING_HTTP_REDIRECT}" Location="https://idp.example.com/slo" ResponseLocation="https://idp.example.com/slo/response"/>
    <md:SingleSignOnService Binding="{BINDING_HTTP_POST}" Location="https://idp.example.com/sso/post"/>
    <md:SingleSignOnService Binding="{BINDING_HTTP_REDIRECT}" Location="https://idp.example.com/sso"/>
  </md:IDPSSODescriptor>
</md:EntityDescriptor>"#,
        cert = format_certificate(IDP_CERT),
    )
}

/// The ID of the AuthnRequest carried by a login redirect.
pub(crate) fn request_id_of(instruction: &RedirectInstruction) -> String {
    let message = match instruction {
        RedirectInstruction::Redirect { url } => {
            let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
            binding::decode(&HttpRequestData::get(Some(query))).unwrap()
        }
        RedirectInstruction::PostForm { html, .. } => {
            let start = html.find(r#"value=""#).unwrap() + r#"value=""#.len();
            let end = start + html[start..].find('"').unwrap();
            let encoded = &html[start..end];
            binding::decode(&HttpRequestData::post(vec![("SAMLRequest".into(), encoded.into())])).unwrap()
        }
    };
    let doc = xml::parse(&message.xml).unwrap();
    doc.root_element().attribute("ID").unwrap().to_string()
}

/// A login Response as the test IdP would send it. Defaults are valid for
/// [`test_settings`].
#[derive(Debug, Clone)]
pub(crate) struct IdpResponse {
    pub response_id: String,
    pub assertion_id: String,
    pub in_response_to: Option<String>,
    pub issue_instant: DateTime<Utc>,
    pub issuer: String,
    pub destination: Option<String>,
    pub status: String,
    pub include_assertion: bool,
    pub name_id: String,
    pub confirmation_method: String,
    pub recipient: String,
    pub audience: String,
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    pub session_index: Option<String>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    pub attributes: Vec<(String, Vec<String>)>,
    pub sign_response: bool,
    pub sign_assertion: bool,
    pub signer: SigningCredentials,
}

impl IdpResponse {
    pub fn new(in_response_to: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            response_id: generate_id(),
            assertion_id: generate_id(),
            in_response_to: in_response_to.map(str::to_string),
            issue_instant: now,
            issuer: IDP_ENTITY_ID.to_string(),
            destination: Some(SP_ACS_URL.to_string()),
            status: STATUS_SUCCESS.to_string(),
            include_assertion: true,
            name_id: "alice@example.com".to_string(),
            confirmation_method: CM_BEARER.to_string(),
            recipient: SP_ACS_URL.to_string(),
            audience: SP_ENTITY_ID.to_string(),
            not_before: now - Duration::seconds(60),
            not_on_or_after: now + Duration::minutes(5),
            session_index: Some("_session-1".to_string()),
            session_not_on_or_after: None,
            attributes: vec![
                ("mail".to_string(), vec!["alice@example.com".to_string()]),
                ("groups".to_string(), vec!["admins".to_string(), "users".to_string()]),
            ],
            sign_response: false,
            sign_assertion: true,
            signer: idp_credentials(),
        }
    }

    pub fn xml(&self) -> String {
        let instant = format_instant(self.issue_instant);
        let in_response_to = self
            .in_response_to
            .as_deref()
            .map(|id| format!(r#" InResponseTo="{}""#, escape_attr(id)))
            .unwrap_or_default();
        let destination = self
            .destination
            .as_deref()
            .map(|d| format!(r#" Destination="{}""#, escape_attr(d)))
            .unwrap_or_default();
        let assertion = if self.include_assertion {
            self.assertion_xml(&instant, &in_response_to)
        } else {
            String::new()
        };

        let mut xml = format!(
            concat!(
                r#"<samlp:Response xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}"{destination}{in_response_to}>"#,
                "<saml:Issuer>{issuer}</saml:Issuer>",
                r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
                "{assertion}",
                "</samlp:Response>",
            ),
            samlp = NS_PROTOCOL,
            saml = NS_ASSERTION,
            id = self.response_id,
            instant = instant,
            destination = destination,
            in_response_to = in_response_to,
            issuer = escape_text(&self.issuer),
            status = self.status,
            assertion = assertion,
        );

        if self.include_assertion && self.sign_assertion {
            xml = dsig::sign_enveloped(&xml, &self.assertion_id, &self.signer, SignatureAlgorithm::RsaSha256).unwrap();
        }
        if self.sign_response {
            xml = dsig::sign_enveloped(&xml, &self.response_id, &self.signer, SignatureAlgorithm::RsaSha256).unwrap();
        }
        xml
    }

    fn assertion_xml(&self, instant: &str, in_response_to: &str) -> String {
        let session_index = self
            .session_index
            .as_deref()
            .map(|s| format!(r#" SessionIndex="{}""#, escape_attr(s)))
            .unwrap_or_default();
        let session_end = self
            .session_not_on_or_after
            .map(|t| format!(r#" SessionNotOnOrAfter="{}""#, format_instant(t)))
            .unwrap_or_default();
        let attributes: String = self
            .attributes
            .iter()
            .map(|(name, values)| {
                let values: String = values
                    .iter()
                    .map(|v| format!("<saml:AttributeValue>{}</saml:AttributeValue>", escape_text(v)))
                    .collect();
                format!(r#"<saml:Attribute Name="{}">{values}</saml:Attribute>"#, escape_attr(name))
            })
            .collect();

        format!(
            concat!(
                r#"<saml:Assertion ID="{id}" Version="2.0" IssueInstant="{instant}">"#,
                "<saml:Issuer>{issuer}</saml:Issuer>",
                "<saml:Subject>",
                r#"<saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">{name_id}</saml:NameID>"#,
                r#"<saml:SubjectConfirmation Method="{method}">"#,
                r#"<saml:SubjectConfirmationData NotOnOrAfter="{not_on_or_after}" Recipient="{recipient}"{in_response_to}/>"#,
                "</saml:SubjectConfirmation>",
                "</saml:Subject>",
                r#"<saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_on_or_after}">"#,
                "<saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>",
                "</saml:Conditions>",
                r#"<saml:AuthnStatement AuthnInstant="{instant}"{session_index}{session_end}>"#,
                "<saml:AuthnContext><saml:AuthnContextClassRef>{context}</saml:AuthnContextClassRef></saml:AuthnContext>",
                "</saml:AuthnStatement>",
                "<saml:AttributeStatement>{attributes}</saml:AttributeStatement>",
                "</saml:Assertion>",
            ),
            id = self.assertion_id,
            instant = instant,
            issuer = escape_text(&self.issuer),
            name_id = escape_text(&self.name_id),
            method = escape_attr(&self.confirmation_method),
            not_on_or_after = format_instant(self.not_on_or_after),
            recipient = escape_attr(&self.recipient),
            in_response_to = in_response_to,
            not_before = format_instant(self.not_before),
            audience = escape_text(&self.audience),
            session_index = session_index,
            session_end = session_end,
            context = AC_PASSWORD_PROTECTED_TRANSPORT,
            attributes = attributes,
        )
    }

    /// The ACS POST a browser would make with this response.
    pub fn post_request(&self) -> HttpRequestData {
        Self::post_xml(&self.xml())
    }

    /// A `SAMLResponse` POST carrying arbitrary XML.
    pub fn post_xml(xml: &str) -> HttpRequestData {
        HttpRequestData::post(vec![("SAMLResponse".to_string(), BASE64.encode(xml))])
    }

    /// A `SAMLRequest` POST carrying arbitrary XML.
    pub fn post_request_xml(xml: &str) -> HttpRequestData {
        HttpRequestData::post(vec![("SAMLRequest".to_string(), BASE64.encode(xml))])
    }
}

/// An IdP-initiated LogoutRequest to the SP. Returns `(id, xml)`.
pub(crate) fn idp_logout_request(
    settings: &Settings,
    name_id: &str,
    session_index: Option<&str>,
    now: DateTime<Utc>,
    sign: bool,
) -> (String, String) {
    let id = generate_id();
    let session_index = session_index
        .map(|s| format!("<samlp:SessionIndex>{}</samlp:SessionIndex>", escape_text(s)))
        .unwrap_or_default();
    let xml = format!(
        concat!(
            r#"<samlp:LogoutRequest xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" NotOnOrAfter="{expiry}" Destination="{destination}">"#,
            "<saml:Issuer>{issuer}</saml:Issuer>",
            "<saml:NameID>{name_id}</saml:NameID>",
            "{session_index}",
            "</samlp:LogoutRequest>",
        ),
        samlp = NS_PROTOCOL,
        saml = NS_ASSERTION,
        id = id,
        instant = format_instant(now),
        expiry = format_instant(now + Duration::minutes(10)),
        destination = settings.sp.slo_url.as_deref().unwrap_or(SP_SLO_URL),
        issuer = IDP_ENTITY_ID,
        name_id = escape_text(name_id),
        session_index = session_index,
    );
    let xml = if sign {
        dsig::sign_enveloped(&xml, &id, &idp_credentials(), SignatureAlgorithm::RsaSha256).unwrap()
    } else {
        xml
    };
    (id, xml)
}

/// The IdP's LogoutResponse to one of our LogoutRequests.
pub(crate) fn idp_logout_response(
    settings: &Settings,
    in_response_to: Option<&str>,
    status: &str,
    sub_status: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    let in_response_to = in_response_to
        .map(|id| format!(r#" InResponseTo="{id}""#))
        .unwrap_or_default();
    let status_code = match sub_status {
        Some(sub) => format!(r#"<samlp:StatusCode Value="{status}"><samlp:StatusCode Value="{sub}"/></samlp:StatusCode>"#),
        None => format!(r#"<samlp:StatusCode Value="{status}"/>"#),
    };
    format!(
        concat!(
            r#"<samlp:LogoutResponse xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}"{in_response_to}>"#,
            "<saml:Issuer>{issuer}</saml:Issuer>",
            "<samlp:Status>{status_code}</samlp:Status>",
            "</samlp:LogoutResponse>",
        ),
        samlp = NS_PROTOCOL,
        saml = NS_ASSERTION,
        id = generate_id(),
        instant = format_instant(now),
        destination = settings.sp.slo_url.as_deref().unwrap_or(SP_SLO_URL),
        in_response_to = in_response_to,
        issuer = IDP_ENTITY_ID,
        status_code = status_code,
    )
}

/// A GET to the SP carrying `xml` over HTTP-Redirect, query-signed when a
/// signer is given.
pub(crate) fn redirect_request(
    xml: &str,
    message_type: MessageType,
    signer: Option<&SigningCredentials>,
) -> HttpRequestData {
    let signer = signer.map(|credentials| redirect::QuerySigner {
        credentials,
        algorithm: SignatureAlgorithm::RsaSha256,
    });
    let url = redirect::encode(xml, message_type, SP_SLO_URL, Some("/bye"), signer).unwrap();
    let query = url.split_once('?').unwrap().1;
    HttpRequestData::get(Some(query))
}
