//! Validated, immutable settings.

use chrono::Utc;
use tracing::warn;

use super::config::{default_idp_binding, RawAuthnContext, RawEndpoint, RawSettings, SessionConfig};
use super::idp_metadata::IdpMetadata;
use crate::binding::Binding;
use crate::crypto::{SignatureAlgorithm, SigningCredentials, TrustedCertificate, RSA_SHA1_URI};
use crate::error::ConfigError;
use crate::xml::{AC_PASSWORD_PROTECTED_TRANSPORT, BINDING_HTTP_POST};

/// Upper bound for `security.clockSkewSecs`.
pub const MAX_CLOCK_SKEW_SECS: i64 = 24 * 60 * 60;

/// Upper bound for `security.requestTtlSecs`.
pub const MAX_REQUEST_TTL_SECS: u64 = 24 * 60 * 60;

/// Upper bound for `idp.metadataRefreshSecs`.
pub const MAX_METADATA_REFRESH_SECS: u64 = 7 * 24 * 60 * 60;

/// This SP.
#[derive(Debug, Clone)]
pub struct ServiceProviderConfig {
    pub entity_id: String,
    pub acs_url: String,
    pub slo_url: Option<String>,
    pub slo_binding: Binding,
    pub name_id_format: String,
    /// Key pair used to sign requests and metadata.
    pub credentials: Option<SigningCredentials>,
}

/// An IdP logout endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SloEndpoint {
    pub url: String,
    pub response_url: Option<String>,
    pub binding: Binding,
}

impl SloEndpoint {
    /// Where LogoutResponses are sent.
    pub fn response_location(&self) -> &str {
        self.response_url.as_deref().unwrap_or(&self.url)
    }
}

/// The trusted IdP.
#[derive(Debug, Clone)]
pub struct IdentityProviderConfig {
    pub entity_id: String,
    pub sso_url: String,
    pub sso_binding: Binding,
    pub slo: Option<SloEndpoint>,
    /// Certificates trusted to sign responses. Never taken from messages.
    pub certificates: Vec<TrustedCertificate>,
}

/// Signing requirements and validation tolerances.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub authn_requests_signed: bool,
    pub logout_request_signed: bool,
    pub logout_response_signed: bool,
    pub sign_metadata: bool,
    pub want_messages_signed: bool,
    pub want_assertions_signed: bool,
    /// AuthnContext classes to request; empty sends none.
    pub requested_authn_context: Vec<String>,
    pub authn_context_comparison: String,
    pub allow_unsolicited: bool,
    pub allow_unsigned: bool,
    pub signature_algorithm: SignatureAlgorithm,
    pub clock_skew: chrono::Duration,
    pub request_ttl: std::time::Duration,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            authn_requests_signed: false,
            logout_request_signed: false,
            logout_response_signed: false,
            sign_metadata: false,
            want_messages_signed: false,
            want_assertions_signed: true,
            requested_authn_context: vec![AC_PASSWORD_PROTECTED_TRANSPORT.to_string()],
            authn_context_comparison: "exact".to_string(),
            allow_unsolicited: false,
            allow_unsigned: false,
            signature_algorithm: SignatureAlgorithm::RsaSha256,
            clock_skew: chrono::Duration::seconds(60),
            request_ttl: std::time::Duration::from_secs(300),
        }
    }
}

/// Everything the SP core needs, validated as a whole.
#[derive(Debug, Clone)]
pub struct Settings {
    pub debug: bool,
    pub sp: ServiceProviderConfig,
    pub idp: IdentityProviderConfig,
    pub security: SecurityPolicy,
    pub session: SessionConfig,
}

impl Settings {
    /// Parse and validate a JSON settings document.
    pub fn load(json: &str) -> Result<Self, ConfigError> {
        let raw: RawSettings = serde_json::from_str(json)
            .map_err(|e| ConfigError::single(format!("settings are not valid JSON: {e}")))?;
        Self::from_raw(&raw)
    }

    /// Validate a parsed settings document.
    ///
    /// Every problem is collected before failing.
    pub fn from_raw(raw: &RawSettings) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();

        if !raw.strict {
            problems.push("strict must be true; non-strict validation is not supported".to_string());
        }

        let security = check_security(raw, &mut problems);
        let sp = check_sp(raw, &security, &mut problems);
        let idp = check_idp(raw, &security, &mut problems);
        problems.extend(raw.session.problems());

        match (sp, idp, security) {
            (Some(sp), Some(idp), Some(security)) if problems.is_empty() => Ok(Self {
                debug: raw.debug,
                sp,
                idp,
                security,
                session: raw.session.clone(),
            }),
            _ => Err(ConfigError::new(problems)),
        }
    }
}

fn is_uri(value: &str) -> bool {
    url::Url::parse(value).is_ok()
}

fn is_absolute_http_url(value: &str) -> bool {
    url::Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

fn check_url(field: &str, value: &str, problems: &mut Vec<String>) {
    if value.is_empty() {
        problems.push(format!("{field} is missing"));
    } else if !is_absolute_http_url(value) {
        problems.push(format!("{field} must be an absolute http(s) URL, got {value:?}"));
    }
}

fn check_entity_id(field: &str, value: &str, problems: &mut Vec<String>) {
    if value.is_empty() {
        problems.push(format!("{field} is missing"));
    } else if !is_uri(value) {
        problems.push(format!("{field} must be a URI, got {value:?}"));
    }
}

fn check_binding(field: &str, endpoint: &RawEndpoint, problems: &mut Vec<String>) -> Option<Binding> {
    let uri = endpoint.binding.as_deref().unwrap_or(default_idp_binding());
    let binding = Binding::from_uri(uri);
    if binding.is_none() {
        problems.push(format!("{field} has unsupported binding {uri}"));
    }
    binding
}

fn check_security(raw: &RawSettings, problems: &mut Vec<String>) -> Option<SecurityPolicy> {
    let s = &raw.security;
    let before = problems.len();

    if s.name_id_encrypted || s.want_name_id_encrypted {
        problems.push("security.nameIdEncrypted/wantNameIdEncrypted: NameID encryption is not supported".to_string());
    }

    let signature_algorithm = SignatureAlgorithm::from_uri(&s.signature_algorithm);
    if signature_algorithm.is_none() {
        if s.signature_algorithm == RSA_SHA1_URI {
            problems.push("security.signatureAlgorithm: RSA-SHA1 is refused".to_string());
        } else {
            problems.push(format!(
                "security.signatureAlgorithm {} is not supported",
                s.signature_algorithm
            ));
        }
    }

    if !(0..=MAX_CLOCK_SKEW_SECS).contains(&s.clock_skew_secs) {
        problems.push(format!(
            "security.clockSkewSecs must be between 0 and {MAX_CLOCK_SKEW_SECS}"
        ));
    }
    if !(1..=MAX_REQUEST_TTL_SECS).contains(&s.request_ttl_secs) {
        problems.push(format!(
            "security.requestTtlSecs must be between 1 and {MAX_REQUEST_TTL_SECS}"
        ));
    }

    if !matches!(
        s.requested_authn_context_comparison.as_str(),
        "exact" | "minimum" | "maximum" | "better"
    ) {
        problems.push(format!(
            "security.requestedAuthnContextComparison {} is not one of exact, minimum, maximum, better",
            s.requested_authn_context_comparison
        ));
    }
    let requested_authn_context = match &s.requested_authn_context {
        RawAuthnContext::Enabled(true) => vec![AC_PASSWORD_PROTECTED_TRANSPORT.to_string()],
        RawAuthnContext::Enabled(false) => Vec::new(),
        RawAuthnContext::Classes(classes) => {
            if classes.iter().any(|c| !is_uri(c)) {
                problems.push("security.requestedAuthnContext entries must be URIs".to_string());
            }
            classes.clone()
        }
    };

    if problems.len() != before {
        return None;
    }
    Some(SecurityPolicy {
        authn_requests_signed: s.authn_requests_signed,
        logout_request_signed: s.logout_request_signed,
        logout_response_signed: s.logout_response_signed,
        sign_metadata: s.sign_metadata,
        want_messages_signed: s.want_messages_signed,
        want_assertions_signed: s.want_assertions_signed,
        requested_authn_context,
        authn_context_comparison: s.requested_authn_context_comparison.clone(),
        allow_unsolicited: s.allow_unsolicited,
        allow_unsigned: s.allow_unsigned,
        signature_algorithm: signature_algorithm?,
        clock_skew: chrono::Duration::seconds(s.clock_skew_secs),
        request_ttl: std::time::Duration::from_secs(s.request_ttl_secs),
    })
}

fn check_sp(
    raw: &RawSettings,
    security: &Option<SecurityPolicy>,
    problems: &mut Vec<String>,
) -> Option<ServiceProviderConfig> {
    let sp = &raw.sp;
    let before = problems.len();

    check_entity_id("sp.entityId", &sp.entity_id, problems);

    let acs = &sp.assertion_consumer_service;
    check_url("sp.assertionConsumerService.url", &acs.url, problems);
    if let Some(binding) = acs.binding.as_deref() {
        if binding != BINDING_HTTP_POST {
            problems.push(format!(
                "sp.assertionConsumerService.binding must be HTTP-POST, got {binding}"
            ));
        }
    }

    let mut slo_binding = Binding::HttpRedirect;
    if let Some(slo) = &sp.single_logout_service {
        check_url("sp.singleLogoutService.url", &slo.url, problems);
        slo_binding = check_binding("sp.singleLogoutService", slo, problems).unwrap_or_default();
    }

    if sp.name_id_format.is_empty() {
        problems.push("sp.NameIDFormat is empty".to_string());
    }

    let credentials = match (sp.x509cert.trim().is_empty(), sp.private_key.trim().is_empty()) {
        (true, true) => None,
        (false, true) => {
            problems.push("sp.privateKey is missing while sp.x509cert is set".to_string());
            None
        }
        (true, false) => {
            problems.push("sp.x509cert is missing while sp.privateKey is set".to_string());
            None
        }
        (false, false) => match TrustedCertificate::from_pem(&sp.x509cert) {
            Ok(cert) => match SigningCredentials::new(&sp.private_key, cert) {
                Ok(creds) => Some(creds),
                Err(e) => {
                    problems.push(format!("sp.privateKey: {e}"));
                    None
                }
            },
            Err(e) => {
                problems.push(format!("sp.x509cert: {e}"));
                None
            }
        },
    };
    if let Some(creds) = &credentials {
        warn_if_expired("sp.x509cert", creds.certificate());
    }

    let key_configured = !sp.x509cert.trim().is_empty() && !sp.private_key.trim().is_empty();
    if let Some(security) = security {
        for (flag, enabled) in [
            ("authnRequestsSigned", security.authn_requests_signed),
            ("logoutRequestSigned", security.logout_request_signed),
            ("logoutResponseSigned", security.logout_response_signed),
            ("signMetadata", security.sign_metadata),
        ] {
            if enabled && !key_configured {
                problems.push(format!(
                    "security.{flag} requires sp.x509cert and sp.privateKey"
                ));
            }
        }
    }

    if problems.len() != before {
        return None;
    }
    Some(ServiceProviderConfig {
        entity_id: sp.entity_id.clone(),
        acs_url: acs.url.clone(),
        slo_url: sp.single_logout_service.as_ref().map(|slo| slo.url.clone()),
        slo_binding,
        name_id_format: sp.name_id_format.clone(),
        credentials,
    })
}

fn check_idp(
    raw: &RawSettings,
    security: &Option<SecurityPolicy>,
    problems: &mut Vec<String>,
) -> Option<IdentityProviderConfig> {
    let idp = &raw.idp;
    let before = problems.len();

    let metadata = match idp.metadata_xml.as_deref() {
        Some(xml) => match IdpMetadata::parse(xml) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                problems.push(format!("idp.metadataXml: {e}"));
                None
            }
        },
        None => None,
    };
    if let Some(url) = idp.metadata_url.as_deref() {
        check_url("idp.metadataUrl", url, problems);
        if !(1..=MAX_METADATA_REFRESH_SECS).contains(&idp.metadata_refresh_secs) {
            problems.push(format!(
                "idp.metadataRefreshSecs must be between 1 and {MAX_METADATA_REFRESH_SECS}"
            ));
        }
    }

    // Explicit settings win over metadata.
    let entity_id = if idp.entity_id.is_empty() {
        metadata.as_ref().map(|m| m.entity_id.clone()).unwrap_or_default()
    } else {
        idp.entity_id.clone()
    };
    check_entity_id("idp.entityId", &entity_id, problems);

    let (sso_url, sso_binding) = match &idp.single_sign_on_service {
        Some(sso) => (sso.url.clone(), check_binding("idp.singleSignOnService", sso, problems)),
        None => match metadata.as_ref().and_then(|m| m.sso_endpoint(Binding::HttpRedirect)) {
            Some(ep) => (ep.location.clone(), Some(ep.binding)),
            None => (String::new(), None),
        },
    };
    check_url("idp.singleSignOnService.url", &sso_url, problems);

    let slo = match &idp.single_logout_service {
        Some(slo) => {
            check_url("idp.singleLogoutService.url", &slo.url, problems);
            if let Some(url) = slo.response_url.as_deref() {
                check_url("idp.singleLogoutService.responseUrl", url, problems);
            }
            check_binding("idp.singleLogoutService", slo, problems).map(|binding| SloEndpoint {
                url: slo.url.clone(),
                response_url: slo.response_url.clone(),
                binding,
            })
        }
        None => metadata
            .as_ref()
            .and_then(|m| m.slo_endpoint(Binding::HttpRedirect))
            .map(|ep| SloEndpoint {
                url: ep.location.clone(),
                response_url: ep.response_location.clone(),
                binding: ep.binding,
            }),
    };

    let mut cert_sources: Vec<(String, &str)> = Vec::new();
    if let Some(cert) = idp.x509cert.as_deref().filter(|c| !c.trim().is_empty()) {
        cert_sources.push(("idp.x509cert".to_string(), cert));
    }
    if let Some(multi) = &idp.x509cert_multi {
        for (i, cert) in multi.signing.iter().enumerate() {
            cert_sources.push((format!("idp.x509certMulti.signing[{i}]"), cert));
        }
    }
    if cert_sources.is_empty() {
        if let Some(metadata) = &metadata {
            for (i, cert) in metadata.signing_certificates.iter().enumerate() {
                cert_sources.push((format!("idp.metadataXml certificate {i}"), cert));
            }
        }
    }

    let mut certificates = Vec::new();
    for (field, material) in cert_sources {
        match TrustedCertificate::from_pem(material) {
            Ok(cert) => {
                warn_if_expired(&field, &cert);
                if !certificates.contains(&cert) {
                    certificates.push(cert);
                }
            }
            Err(e) => problems.push(format!("{field}: {e}")),
        }
    }
    let allow_unsigned = security.as_ref().is_some_and(|s| s.allow_unsigned);
    if certificates.is_empty() && !allow_unsigned && problems.len() == before {
        problems.push("idp.x509cert is missing; at least one IdP signing certificate is required".to_string());
    }

    if problems.len() != before {
        return None;
    }
    Some(IdentityProviderConfig {
        entity_id,
        sso_url,
        sso_binding: sso_binding?,
        slo,
        certificates,
    })
}

fn warn_if_expired(field: &str, cert: &TrustedCertificate) {
    if cert.not_after() < Utc::now() {
        warn!(
            field = field,
            subject = cert.subject(),
            not_after = %cert.not_after(),
            "Configured certificate has expired"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{idp_metadata_xml, raw_settings, IDP_CERT, ROGUE_CERT, SP_CERT, SP_KEY};

    #[test]
    fn test_load_valid_settings() {
        let settings = Settings::from_raw(&raw_settings()).unwrap();
        assert_eq!(settings.sp.entity_id, "https://sp.example.com/saml/metadata");
        assert_eq!(settings.sp.acs_url, "https://sp.example.com/saml/acs");
        assert_eq!(settings.idp.sso_binding, Binding::HttpRedirect);
        assert_eq!(settings.idp.certificates.len(), 1);
        assert!(settings.security.want_assertions_signed);
        assert_eq!(settings.security.clock_skew, chrono::Duration::seconds(60));
        assert_eq!(
            settings.idp.slo.as_ref().unwrap().response_location(),
            "https://idp.example.com/slo"
        );
    }

    #[test]
    fn test_load_from_json() {
        let json = serde_json::to_string(&raw_settings()).unwrap();
        assert!(Settings::load(&json).is_ok());

        let err = Settings::load("{not json").unwrap_err();
        assert_eq!(err.problems.len(), 1);
    }

    #[test]
    fn test_all_problems_are_reported() {
        let mut raw = raw_settings();
        raw.strict = false;
        raw.sp.entity_id = String::new();
        raw.sp.assertion_consumer_service.url = "/relative/acs".to_string();
        raw.idp.x509cert = Some("bm90IGEgY2VydGlmaWNhdGU=".to_string());
        raw.security.signature_algorithm = RSA_SHA1_URI.to_string();
        raw.session.ttl_secs = 0;

        let err = Settings::from_raw(&raw).unwrap_err();
        assert_eq!(err.problems.len(), 6, "{err}");
        let text = err.to_string();
        assert!(text.contains("strict"));
        assert!(text.contains("sp.entityId"));
        assert!(text.contains("sp.assertionConsumerService.url"));
        assert!(text.contains("idp.x509cert"));
        assert!(text.contains("RSA-SHA1"));
        assert!(text.contains("session.ttlSecs"));
    }

    #[test]
    fn test_time_bounds_are_enforced() {
        let mut raw = raw_settings();
        raw.security.clock_skew_secs = i64::MAX;
        raw.security.request_ttl_secs = 10_000_000_000_000;

        let err = Settings::from_raw(&raw).unwrap_err();
        assert_eq!(err.problems.len(), 2, "{err}");
        let text = err.to_string();
        assert!(text.contains("security.clockSkewSecs"));
        assert!(text.contains("security.requestTtlSecs"));

        let mut raw = raw_settings();
        raw.security.clock_skew_secs = -1;
        assert!(Settings::from_raw(&raw).is_err());

        let mut raw = raw_settings();
        raw.security.clock_skew_secs = MAX_CLOCK_SKEW_SECS;
        raw.security.request_ttl_secs = MAX_REQUEST_TTL_SECS;
        let settings = Settings::from_raw(&raw).unwrap();
        assert_eq!(settings.security.clock_skew, chrono::Duration::days(1));
    }

    #[test]
    fn test_signing_flags_require_key() {
        let mut raw = raw_settings();
        raw.sp.x509cert = String::new();
        raw.sp.private_key = String::new();
        raw.security.authn_requests_signed = true;
        raw.security.sign_metadata = true;

        let err = Settings::from_raw(&raw).unwrap_err();
        assert_eq!(err.problems.len(), 2);
        assert!(err.problems.iter().all(|p| p.contains("requires sp.x509cert")));
    }

    #[test]
    fn test_mismatched_sp_key_is_rejected() {
        let mut raw = raw_settings();
        raw.sp.x509cert = ROGUE_CERT.to_string();
        let err = Settings::from_raw(&raw).unwrap_err();
        assert!(err.to_string().contains("does not match"));

        raw.sp.x509cert = SP_CERT.to_string();
        raw.sp.private_key = SP_KEY.to_string();
        assert!(Settings::from_raw(&raw).unwrap().sp.credentials.is_some());
    }

    #[test]
    fn test_unsupported_features_are_rejected() {
        let mut raw = raw_settings();
        raw.security.want_name_id_encrypted = true;
        raw.sp.assertion_consumer_service.binding =
            Some("urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect".to_string());
        raw.idp.single_sign_on_service.as_mut().unwrap().binding =
            Some("urn:oasis:names:tc:SAML:2.0:bindings:SOAP".to_string());

        let err = Settings::from_raw(&raw).unwrap_err();
        assert_eq!(err.problems.len(), 3, "{err}");
    }

    #[test]
    fn test_idp_certificate_required_unless_unsigned_allowed() {
        let mut raw = raw_settings();
        raw.idp.x509cert = None;
        assert!(Settings::from_raw(&raw).is_err());

        raw.security.allow_unsigned = true;
        assert!(Settings::from_raw(&raw).unwrap().idp.certificates.is_empty());
    }

    #[test]
    fn test_idp_from_metadata() {
        let mut raw = raw_settings();
        raw.idp = Default::default();
        raw.idp.metadata_xml = Some(idp_metadata_xml());

        let settings = Settings::from_raw(&raw).unwrap();
        assert_eq!(settings.idp.entity_id, "https://idp.example.com/metadata");
        assert_eq!(settings.idp.sso_url, "https://idp.example.com/sso");
        assert_eq!(settings.idp.sso_binding, Binding::HttpRedirect);
        assert_eq!(
            settings.idp.slo.as_ref().unwrap().response_location(),
            "https://idp.example.com/slo/response"
        );
        assert_eq!(
            settings.idp.certificates,
            vec![TrustedCertificate::from_pem(IDP_CERT).unwrap()]
        );
    }

    #[test]
    fn test_authn_context_disabled() {
        let mut raw = raw_settings();
        raw.security.requested_authn_context = RawAuthnContext::Enabled(false);
        let settings = Settings::from_raw(&raw).unwrap();
        assert!(settings.security.requested_authn_context.is_empty());
    }
}
