//! Settings file layout.
//!
//! The JSON layout follows the familiar `strict`/`debug`/`sp`/`idp`/`security`
//! settings document, plus a `session` section for the web layer. These types
//! only describe the file; [`super::Settings::from_raw`] turns them into
//! validated configuration.

use serde::{Deserialize, Serialize};

use crate::xml::{BINDING_HTTP_POST, BINDING_HTTP_REDIRECT, NAMEID_UNSPECIFIED};

/// Upper bound for `session.ttlSecs`.
pub const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Upper bound for `session.cleanupIntervalSecs`.
pub const MAX_CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// The whole settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSettings {
    /// Must stay true; non-strict mode is not supported.
    #[serde(default = "default_true")]
    pub strict: bool,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub sp: RawServiceProvider,

    #[serde(default)]
    pub idp: RawIdentityProvider,

    #[serde(default)]
    pub security: RawSecurity,

    #[serde(default)]
    pub session: SessionConfig,
}

/// An endpoint: location plus binding URI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawEndpoint {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub binding: Option<String>,

    /// Where LogoutResponses go, when it differs from `url`.
    #[serde(default)]
    pub response_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawServiceProvider {
    #[serde(default)]
    pub entity_id: String,

    #[serde(default)]
    pub assertion_consumer_service: RawEndpoint,

    #[serde(default)]
    pub single_logout_service: Option<RawEndpoint>,

    #[serde(default = "default_name_id_format", rename = "NameIDFormat")]
    pub name_id_format: String,

    /// SP certificate, PEM or bare base64. Empty when the SP does not sign.
    #[serde(default)]
    pub x509cert: String,

    #[serde(default)]
    pub private_key: String,
}

impl Default for RawServiceProvider {
    fn default() -> Self {
        Self {
            entity_id: String::new(),
            assertion_consumer_service: RawEndpoint {
                binding: Some(BINDING_HTTP_POST.to_string()),
                ..RawEndpoint::default()
            },
            single_logout_service: None,
            name_id_format: default_name_id_format(),
            x509cert: String::new(),
            private_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawIdentityProvider {
    #[serde(default)]
    pub entity_id: String,

    #[serde(default)]
    pub single_sign_on_service: Option<RawEndpoint>,

    #[serde(default)]
    pub single_logout_service: Option<RawEndpoint>,

    #[serde(default)]
    pub x509cert: Option<String>,

    /// Additional signing certificates, for key rollover.
    #[serde(default)]
    pub x509cert_multi: Option<RawCertificateSet>,

    /// IdP metadata document, inline.
    #[serde(default)]
    pub metadata_xml: Option<String>,

    /// IdP metadata location; fetched before the settings are built.
    #[serde(default)]
    pub metadata_url: Option<String>,

    /// Metadata refresh interval in seconds when `metadataUrl` is set.
    #[serde(default = "default_metadata_refresh")]
    pub metadata_refresh_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawCertificateSet {
    #[serde(default)]
    pub signing: Vec<String>,

    #[serde(default)]
    pub encryption: Vec<String>,
}

/// `requestedAuthnContext` is either a switch or an explicit class list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAuthnContext {
    Enabled(bool),
    Classes(Vec<String>),
}

impl Default for RawAuthnContext {
    fn default() -> Self {
        Self::Enabled(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawSecurity {
    #[serde(default)]
    pub name_id_encrypted: bool,

    #[serde(default)]
    pub authn_requests_signed: bool,

    #[serde(default)]
    pub logout_request_signed: bool,

    #[serde(default)]
    pub logout_response_signed: bool,

    #[serde(default)]
    pub sign_metadata: bool,

    #[serde(default)]
    pub want_messages_signed: bool,

    #[serde(default = "default_true")]
    pub want_assertions_signed: bool,

    #[serde(default)]
    pub want_name_id_encrypted: bool,

    #[serde(default)]
    pub requested_authn_context: RawAuthnContext,

    #[serde(default = "default_comparison")]
    pub requested_authn_context_comparison: String,

    /// Accept responses with no `InResponseTo` (IdP-initiated SSO).
    #[serde(default)]
    pub allow_unsolicited: bool,

    /// Accept responses where neither message nor assertion is signed.
    #[serde(default)]
    pub allow_unsigned: bool,

    #[serde(default = "default_signature_algorithm")]
    pub signature_algorithm: String,

    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,

    #[serde(default = "default_request_ttl")]
    pub request_ttl_secs: u64,
}

impl Default for RawSecurity {
    fn default() -> Self {
        Self {
            name_id_encrypted: false,
            authn_requests_signed: false,
            logout_request_signed: false,
            logout_response_signed: false,
            sign_metadata: false,
            want_messages_signed: false,
            want_assertions_signed: true,
            want_name_id_encrypted: false,
            requested_authn_context: RawAuthnContext::default(),
            requested_authn_context_comparison: default_comparison(),
            allow_unsolicited: false,
            allow_unsigned: false,
            signature_algorithm: default_signature_algorithm(),
            clock_skew_secs: default_clock_skew(),
            request_ttl_secs: default_request_ttl(),
        }
    }
}

/// Cookie and store settings for the web layer's application session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Cookie domain (optional, defaults to request host).
    #[serde(default)]
    pub cookie_domain: Option<String>,

    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,

    #[serde(default = "default_true")]
    pub cookie_secure: bool,

    #[serde(default = "default_true")]
    pub cookie_http_only: bool,

    #[serde(default = "default_same_site")]
    pub cookie_same_site: String,

    /// Session TTL in seconds (default: 8 hours).
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Session store path (redb database file).
    #[serde(default = "default_store_path")]
    pub store_path: String,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            cookie_domain: None,
            cookie_path: default_cookie_path(),
            cookie_secure: true,
            cookie_http_only: true,
            cookie_same_site: default_same_site(),
            ttl_secs: default_session_ttl(),
            store_path: default_store_path(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl SessionConfig {
    /// Problems with the session section, if any.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.cookie_name.is_empty()
            || !self
                .cookie_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            problems.push(format!("session.cookieName {:?} is not a valid cookie name", self.cookie_name));
        }
        if !self.cookie_path.starts_with('/') {
            problems.push("session.cookiePath must start with '/'".to_string());
        }
        if !matches!(self.cookie_same_site.as_str(), "Strict" | "Lax" | "None") {
            problems.push(format!(
                "session.cookieSameSite must be Strict, Lax or None, got {}",
                self.cookie_same_site
            ));
        }
        if self.cookie_same_site == "None" && !self.cookie_secure {
            problems.push("session.cookieSameSite None requires cookieSecure".to_string());
        }
        if !(1..=MAX_SESSION_TTL_SECS).contains(&self.ttl_secs) {
            problems.push(format!("session.ttlSecs must be between 1 and {MAX_SESSION_TTL_SECS}"));
        }
        if !(1..=MAX_CLEANUP_INTERVAL_SECS).contains(&self.cleanup_interval_secs) {
            problems.push(format!(
                "session.cleanupIntervalSecs must be between 1 and {MAX_CLEANUP_INTERVAL_SECS}"
            ));
        }
        if self.store_path.is_empty() {
            problems.push("session.storePath is empty".to_string());
        }
        problems
    }

    /// Build the `Set-Cookie` value for a new session.
    pub fn build_cookie(&self, session_id: &str) -> String {
        self.cookie_with(session_id, self.ttl_secs)
    }

    /// Build a `Set-Cookie` value that removes the session cookie.
    pub fn clear_cookie(&self) -> String {
        self.cookie_with("", 0)
    }

    fn cookie_with(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{}={}", self.cookie_name, value);

        if let Some(ref domain) = self.cookie_domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }

        cookie.push_str(&format!("; Path={}", self.cookie_path));

        if self.cookie_secure {
            cookie.push_str("; Secure");
        }

        if self.cookie_http_only {
            cookie.push_str("; HttpOnly");
        }

        cookie.push_str(&format!("; SameSite={}", self.cookie_same_site));
        cookie.push_str(&format!("; Max-Age={}", max_age));

        cookie
    }

    /// Parse session ID from cookie header.
    pub fn parse_session_cookie(&self, cookie_header: &str) -> Option<String> {
        let prefix = format!("{}=", self.cookie_name);
        cookie_header
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix(&prefix))
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

fn default_true() -> bool {
    true
}

fn default_name_id_format() -> String {
    NAMEID_UNSPECIFIED.to_string()
}

fn default_metadata_refresh() -> u64 {
    3600
}

fn default_comparison() -> String {
    "exact".to_string()
}

fn default_signature_algorithm() -> String {
    crate::crypto::RSA_SHA256_URI.to_string()
}

fn default_clock_skew() -> i64 {
    60
}

fn default_request_ttl() -> u64 {
    300 // 5 minutes
}

fn default_cookie_name() -> String {
    "saml_sp_session".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_same_site() -> String {
    "Lax".to_string()
}

fn default_session_ttl() -> u64 {
    8 * 60 * 60
}

fn default_store_path() -> String {
    "/var/lib/zentinel-saml-sp/sessions.redb".to_string()
}

fn default_cleanup_interval() -> u64 {
    300
}

/// Default binding for an IdP endpoint without one.
pub(crate) fn default_idp_binding() -> &'static str {
    BINDING_HTTP_REDIRECT
}
