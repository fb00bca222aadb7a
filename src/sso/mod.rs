//! SSO/SLO orchestration on top of the protocol and binding layers.

pub mod provider;

pub use crate::protocol::LoginOptions;
pub use provider::{LogoutResult, ServiceProvider};
