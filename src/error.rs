//! Error types for the SAML service provider.
//!
//! Validation failures never escape as errors: they are collected into a
//! [`ValidationOutcome`] so the caller can log the reason and show the user a
//! generic message. [`SamlError`] covers everything else (configuration,
//! encoding, key material).

use std::fmt;
use thiserror::Error;

/// Result alias for non-validation operations.
pub type SamlResult<T> = Result<T, SamlError>;

/// Configuration problems found while loading settings.
///
/// Loading is exhaustive, so this carries every problem found in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ConfigError {
    pub problems: Vec<String>,
}

impl ConfigError {
    pub fn new(problems: Vec<String>) -> Self {
        Self { problems }
    }

    pub fn single(problem: impl Into<String>) -> Self {
        Self {
            problems: vec![problem.into()],
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid SAML settings: {}", self.problems.join("; "))
    }
}

/// Errors raised outside the validation pipeline.
#[derive(Debug, Error)]
pub enum SamlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SamlError {
    /// Error kind used for logging and HTTP status mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Malformed(_) => ErrorKind::MalformedMessage,
            Self::Signature(_) => ErrorKind::Signature,
            Self::Internal(_) => ErrorKind::UnexpectedInternal,
        }
    }
}

impl From<base64::DecodeError> for SamlError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Malformed(format!("invalid base64: {err}"))
    }
}

impl From<roxmltree::Error> for SamlError {
    fn from(err: roxmltree::Error) -> Self {
        Self::Malformed(format!("invalid XML: {err}"))
    }
}

/// A single reason a SAML message was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("replay or unknown correlation: {0}")]
    Replay(String),

    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch { expected: String, actual: String },

    #[error("destination mismatch: expected {expected}, got {actual}")]
    DestinationMismatch { expected: String, actual: String },

    #[error("signature error: {0}")]
    Signature(String),

    #[error("assertion not yet valid: {0}")]
    NotYetValid(String),

    #[error("assertion expired: {0}")]
    Expired(String),

    #[error("audience mismatch: {0}")]
    AudienceMismatch(String),

    #[error("subject confirmation failed: {0}")]
    SubjectConfirmation(String),

    #[error("IdP returned status {code}{}", status_suffix(.message))]
    Status {
        code: String,
        message: Option<String>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_) => ErrorKind::MalformedMessage,
            Self::Replay(_) => ErrorKind::Replay,
            Self::IssuerMismatch { .. } => ErrorKind::IssuerMismatch,
            Self::DestinationMismatch { .. } => ErrorKind::DestinationMismatch,
            Self::Signature(_) => ErrorKind::Signature,
            // Not-yet-valid is a timing failure in the same family as expiry.
            Self::NotYetValid(_) | Self::Expired(_) => ErrorKind::ExpiredAssertion,
            Self::AudienceMismatch(_) => ErrorKind::AudienceMismatch,
            Self::SubjectConfirmation(_) => ErrorKind::SubjectConfirmation,
            Self::Status { .. } => ErrorKind::StatusFailure,
            Self::Internal(_) => ErrorKind::UnexpectedInternal,
        }
    }
}

impl From<SamlError> for ValidationError {
    fn from(err: SamlError) -> Self {
        match err {
            SamlError::Malformed(msg) => Self::Malformed(msg),
            SamlError::Signature(msg) => Self::Signature(msg),
            SamlError::Config(e) => Self::Internal(e.to_string()),
            SamlError::Internal(msg) => Self::Internal(msg),
        }
    }
}

fn status_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(" ({m})"))
        .unwrap_or_default()
}

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    MalformedMessage,
    Signature,
    Replay,
    ExpiredAssertion,
    AudienceMismatch,
    IssuerMismatch,
    DestinationMismatch,
    SubjectConfirmation,
    StatusFailure,
    UnexpectedInternal,
}

impl ErrorKind {
    /// HTTP status the web layer answers with for this kind.
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::MalformedMessage => 400,
            Self::Config | Self::UnexpectedInternal => 500,
            _ => 401,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::MalformedMessage => "malformed_message",
            Self::Signature => "signature",
            Self::Replay => "replay",
            Self::ExpiredAssertion => "expired_assertion",
            Self::AudienceMismatch => "audience_mismatch",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::DestinationMismatch => "destination_mismatch",
            Self::SubjectConfirmation => "subject_confirmation",
            Self::StatusFailure => "status_failure",
            Self::UnexpectedInternal => "unexpected_internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of validating an inbound SAML message. Never partially valid.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome<T> {
    Valid(T),
    Invalid(Vec<ValidationError>),
}

impl<T> ValidationOutcome<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn errors(&self) -> &[ValidationError] {
        match self {
            Self::Valid(_) => &[],
            Self::Invalid(errors) => errors,
        }
    }

    /// True if any rejection reason has the given kind.
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.errors().iter().any(|e| e.kind() == kind)
    }

    /// Status the web layer should answer with on rejection.
    ///
    /// The most severe kind wins: internal over malformed over auth failure.
    pub fn http_status(&self) -> u16 {
        self.errors()
            .iter()
            .map(|e| e.kind().http_status())
            .max_by_key(|status| match status {
                500 => 2,
                400 => 1,
                _ => 0,
            })
            .unwrap_or(200)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ValidationOutcome<U> {
        match self {
            Self::Valid(v) => ValidationOutcome::Valid(f(v)),
            Self::Invalid(errors) => ValidationOutcome::Invalid(errors),
        }
    }

    pub fn into_result(self) -> Result<T, Vec<ValidationError>> {
        match self {
            Self::Valid(v) => Ok(v),
            Self::Invalid(errors) => Err(errors),
        }
    }
}
