//! HTTP surface: SSO and SLO endpoints, SP metadata and a small index page.
//!
//! Handlers translate between axum requests and the core's
//! [`HttpRequestData`](crate::binding::HttpRequestData) /
//! [`RedirectInstruction`](crate::binding::RedirectInstruction) and own the
//! application session cookie.

mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::session::SessionStore;
use crate::sso::ServiceProvider;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<ServiceProvider>,
    pub sessions: Arc<SessionStore>,
}

/// Build the SP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/saml/metadata", get(handlers::metadata))
        .route("/saml/login", get(handlers::login))
        .route("/saml/acs", post(handlers::acs))
        .route("/saml/sls", get(handlers::sls_redirect).post(handlers::sls_post))
        .route("/saml/logout", get(handlers::logout))
        .with_state(state)
}
