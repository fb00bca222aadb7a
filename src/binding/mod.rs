//! SAML bindings: how protocol messages travel over HTTP.
//!
//! - **HTTP-Redirect**: raw DEFLATE, base64, URL query parameter; the query
//!   string itself may be signed.
//! - **HTTP-POST**: base64 in a hidden field of a self-submitting form.
//!
//! Decoding is the exact inverse of encoding. Bad base64, bad DEFLATE data
//! or non UTF-8 content fail with [`SamlError::Malformed`].

pub mod post;
pub mod redirect;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SamlError, SamlResult};
use crate::xml::{BINDING_HTTP_POST, BINDING_HTTP_REDIRECT};

/// Transport binding for a SAML endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Binding {
    #[default]
    #[serde(rename = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")]
    HttpRedirect,
    #[serde(rename = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST")]
    HttpPost,
}

impl Binding {
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::HttpRedirect => BINDING_HTTP_REDIRECT,
            Self::HttpPost => BINDING_HTTP_POST,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            BINDING_HTTP_REDIRECT => Some(Self::HttpRedirect),
            BINDING_HTTP_POST => Some(Self::HttpPost),
            _ => None,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpRedirect => f.write_str("HTTP-Redirect"),
            Self::HttpPost => f.write_str("HTTP-POST"),
        }
    }
}

/// Whether a message travels as `SAMLRequest` or `SAMLResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
}

impl MessageType {
    pub const fn param(&self) -> &'static str {
        match self {
            Self::Request => "SAMLRequest",
            Self::Response => "SAMLResponse",
        }
    }
}

/// Where the HTTP layer should send the user agent next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectInstruction {
    /// Answer with a 302/303 to this URL.
    Redirect { url: String },
    /// Answer 200 with this self-submitting HTML form.
    PostForm { action: String, html: String },
}

impl RedirectInstruction {
    pub fn redirect(url: impl Into<String>) -> Self {
        Self::Redirect { url: url.into() }
    }
}

/// HTTP method of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// The parts of an inbound HTTP request the SAML core reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestData {
    pub method: HttpMethod,
    /// Query string exactly as received, without the leading `?`.
    pub raw_query: Option<String>,
    /// Decoded form fields of a POST body.
    pub form: Vec<(String, String)>,
}

impl HttpRequestData {
    pub fn get(raw_query: Option<&str>) -> Self {
        Self {
            method: HttpMethod::Get,
            raw_query: raw_query.map(str::to_string),
            form: Vec::new(),
        }
    }

    pub fn post(form: Vec<(String, String)>) -> Self {
        Self {
            method: HttpMethod::Post,
            raw_query: None,
            form,
        }
    }

    /// Decoded query parameters.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.raw_query
            .as_deref()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First value of `name`, from the form for POST and the query for GET.
    pub fn param(&self, name: &str) -> Option<String> {
        match self.method {
            HttpMethod::Post => self
                .form
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone()),
            HttpMethod::Get => self
                .query_pairs()
                .into_iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v),
        }
    }

    /// True if the request carries a SAML message at all.
    pub fn has_saml_message(&self) -> bool {
        self.param("SAMLRequest").is_some() || self.param("SAMLResponse").is_some()
    }
}

/// A query-string signature received over HTTP-Redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySignature {
    pub sig_alg: String,
    pub signature: Vec<u8>,
    /// The exact octets the sender signed.
    pub signed_octets: String,
}

/// A SAML message recovered from its binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub xml: String,
    pub message_type: MessageType,
    pub binding: Binding,
    pub relay_state: Option<String>,
    pub query_signature: Option<QuerySignature>,
}

/// Decode whichever binding the request used.
pub fn decode(request: &HttpRequestData) -> SamlResult<DecodedMessage> {
    match request.method {
        HttpMethod::Post => post::decode(&request.form),
        HttpMethod::Get => redirect::decode(request.raw_query.as_deref().unwrap_or("")),
    }
}

/// Encode a message for `binding`.
///
/// Query signing only applies to HTTP-Redirect; POST messages carry an
/// embedded XML signature instead.
pub fn encode(
    binding: Binding,
    xml: &str,
    message_type: MessageType,
    destination: &str,
    relay_state: Option<&str>,
    query_signer: Option<redirect::QuerySigner<'_>>,
) -> SamlResult<RedirectInstruction> {
    match binding {
        Binding::HttpRedirect => {
            let url = redirect::encode(xml, message_type, destination, relay_state, query_signer)?;
            Ok(RedirectInstruction::Redirect { url })
        }
        Binding::HttpPost => Ok(RedirectInstruction::PostForm {
            action: destination.to_string(),
            html: post::encode(xml, message_type, destination, relay_state),
        }),
    }
}

pub(crate) fn malformed(msg: impl Into<String>) -> SamlError {
    SamlError::Malformed(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_uris() {
        assert_eq!(Binding::from_uri(BINDING_HTTP_POST), Some(Binding::HttpPost));
        assert_eq!(Binding::HttpRedirect.uri(), BINDING_HTTP_REDIRECT);
        assert_eq!(Binding::from_uri("urn:oasis:names:tc:SAML:2.0:bindings:SOAP"), None);
    }

    #[test]
    fn test_request_params() {
        let get = HttpRequestData::get(Some("SAMLResponse=abc%2B&RelayState=%2Fhome"));
        assert_eq!(get.param("SAMLResponse").as_deref(), Some("abc+"));
        assert_eq!(get.param("RelayState").as_deref(), Some("/home"));
        assert!(get.has_saml_message());

        let post = HttpRequestData::post(vec![("SAMLRequest".into(), "x".into())]);
        assert_eq!(post.param("SAMLRequest").as_deref(), Some("x"));
        assert!(post.param("RelayState").is_none());

        assert!(!HttpRequestData::get(None).has_saml_message());
    }

    #[test]
    fn test_decode_without_message_is_malformed() {
        let err = decode(&HttpRequestData::get(Some("foo=bar"))).unwrap_err();
        assert!(matches!(err, SamlError::Malformed(_)));
    }
}
