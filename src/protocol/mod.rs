//! SAML 2.0 protocol messages: building what the SP sends and validating
//! what the IdP sends back.

pub mod request;
pub mod response;
pub mod validator;

pub use request::{build_authn_request, build_logout_request, build_logout_response, BuiltMessage, LoginOptions};
pub use response::{NameId, StatusInfo};
pub use validator::{
    validate_logout_request, validate_logout_response, validate_response, AssertionResult,
    LogoutRequestInfo, LogoutResponseInfo, ValidationContext, ValidationStage,
};

use chrono::{DateTime, SecondsFormat, Utc};

/// Format an instant as SAML `xs:dateTime` in UTC.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an `xs:dateTime`. Offsets are normalised to UTC.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
