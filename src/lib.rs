//! SAML 2.0 Service Provider.
//!
//! The core builds AuthnRequests and LogoutRequests, encodes them for the
//! HTTP-Redirect and HTTP-POST bindings, and validates what the IdP sends
//! back: Responses carrying a bearer assertion, LogoutRequests and
//! LogoutResponses. Every inbound message ends in a [`ValidationOutcome`];
//! nothing is partially accepted.
//!
//! [`sso::ServiceProvider`] is the entry point. [`http`] mounts it on an
//! axum router with a redb-backed application session.

pub mod binding;
pub mod crypto;
pub mod error;
pub mod http;
pub mod pending;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod sso;
pub mod xml;

#[cfg(test)]
mod testing;

pub use binding::{Binding, HttpRequestData, RedirectInstruction};
pub use error::{ConfigError, ErrorKind, SamlError, SamlResult, ValidationError, ValidationOutcome};
pub use protocol::{AssertionResult, LoginOptions, NameId};
pub use settings::Settings;
pub use sso::{LogoutResult, ServiceProvider};
