//! Endpoint handlers.

use axum::extract::{Query, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Form;
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::binding::{HttpRequestData, RedirectInstruction};
use crate::error::ValidationOutcome;
use crate::protocol::LoginOptions;
use crate::session::{Session, SessionId};
use crate::settings::SessionConfig;
use crate::sso::LogoutResult;
use crate::xml::escape_text;

const AUTHENTICATION_FAILED: &str = "Authentication failed";

pub(super) async fn index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let body = match current_session(&state, &headers) {
        Some(session) => {
            let mut names: Vec<&String> = session.attributes.keys().collect();
            names.sort();
            let rows: String = names
                .into_iter()
                .map(|name| {
                    format!(
                        "<tr><td>{}</td><td>{}</td></tr>",
                        escape_text(name),
                        escape_text(&session.attributes[name].join(", "))
                    )
                })
                .collect();
            format!(
                concat!(
                    "<p>Signed in as <strong>{name_id}</strong></p>",
                    "<table><tr><th>Attribute</th><th>Values</th></tr>{rows}</table>",
                    r#"<p><a href="/saml/logout">Sign out</a></p>"#,
                ),
                name_id = escape_text(&session.name_id),
                rows = rows,
            )
        }
        None => r#"<p>Not signed in.</p><p><a href="/saml/login">Sign in</a></p>"#.to_string(),
    };
    Html(page("SAML Service Provider", &body)).into_response()
}

pub(super) async fn metadata(State(state): State<AppState>) -> Response {
    match state.provider.get_metadata_xml() {
        Ok(xml) => ([(header::CONTENT_TYPE, "text/xml")], xml).into_response(),
        Err(e) => {
            error!(error = %e, "SP metadata generation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Metadata unavailable").into_response()
        }
    }
}

pub(super) async fn login(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let relay_state = params.get("RelayState").or_else(|| params.get("next"));
    let options = LoginOptions {
        force_authn: params.get("forceAuthn").is_some_and(|v| v == "true"),
        is_passive: params.get("isPassive").is_some_and(|v| v == "true"),
    };

    match state.provider.start_login(relay_state.map(String::as_str), options) {
        Ok(instruction) => deliver(instruction),
        Err(e) => {
            error!(error = %e, "Failed to start SAML login");
            internal_error()
        }
    }
}

pub(super) async fn acs(
    State(state): State<AppState>,
    Form(form): Form<Vec<(String, String)>>,
) -> Response {
    let request = HttpRequestData::post(form);
    let assertion = match state.provider.complete_login(&request) {
        ValidationOutcome::Valid(assertion) => assertion,
        invalid => return failure(invalid.http_status()),
    };

    if assertion.name_id.value.is_empty() || assertion.session_index.is_none() {
        warn!("SAML response is missing NameID or SessionIndex");
        return (StatusCode::BAD_REQUEST, "Incomplete SAML response").into_response();
    }

    let Some(cookies) = session_config(&state) else {
        return internal_error();
    };
    let session = Session::from_assertion(&assertion, state.sessions.default_ttl_secs(), Utc::now());
    let session_id = match state.sessions.create(session) {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "Failed to store session");
            return internal_error();
        }
    };

    info!(
        name_id = %assertion.name_id.value,
        idp = %assertion.issuer,
        attributes = assertion.attributes.len(),
        "User signed in"
    );

    let target = safe_relay_state(request.param("RelayState").as_deref());
    with_cookie(
        (StatusCode::SEE_OTHER, [(header::LOCATION, target)]).into_response(),
        &cookies.build_cookie(&session_id.to_hex()),
    )
}

pub(super) async fn sls_redirect(State(state): State<AppState>, headers: HeaderMap, RawQuery(query): RawQuery) -> Response {
    single_logout(&state, &headers, HttpRequestData::get(query.as_deref()))
}

pub(super) async fn sls_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<Vec<(String, String)>>,
) -> Response {
    single_logout(&state, &headers, HttpRequestData::post(form))
}

fn single_logout(state: &AppState, headers: &HeaderMap, request: HttpRequestData) -> Response {
    let Some(cookies) = session_config(state) else {
        return internal_error();
    };

    let response = match state.provider.complete_logout(&request) {
        ValidationOutcome::Valid(LogoutResult::IdpInitiated {
            name_id,
            session_indexes,
            response,
        }) => {
            match state.sessions.delete_by_name_id(&name_id.value, &session_indexes) {
                Ok(count) => info!(name_id = %name_id.value, sessions = count, "IdP-initiated logout"),
                Err(e) => warn!(error = %e, "Failed to drop sessions for IdP-initiated logout"),
            }
            deliver(response)
        }
        ValidationOutcome::Valid(result) => {
            debug!(result = ?result, "Logout finished");
            drop_current_session(state, headers);
            let target = safe_relay_state(request.param("RelayState").as_deref());
            (StatusCode::FOUND, [(header::LOCATION, target)]).into_response()
        }
        invalid => {
            return (
                StatusCode::from_u16(invalid.http_status()).unwrap_or(StatusCode::BAD_REQUEST),
                "Logout failed",
            )
                .into_response()
        }
    };

    with_cookie(response, &cookies.clear_cookie())
}

pub(super) async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(session) = current_session(&state, &headers) else {
        debug!("Logout without a session");
        return (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response();
    };
    let Some(cookies) = session_config(&state) else {
        return internal_error();
    };

    let relay_state = params.get("RelayState").map(String::as_str);
    let instruction = match state.provider.start_logout(
        Some(&session.subject()),
        session.session_index.as_deref(),
        relay_state,
    ) {
        Ok(instruction) => instruction,
        Err(e) => {
            error!(error = %e, "Failed to start SAML logout");
            return internal_error();
        }
    };

    if let Err(e) = state.sessions.delete(session.id) {
        warn!(error = %e, "Failed to delete session on logout");
    }
    with_cookie(deliver(instruction), &cookies.clear_cookie())
}

/// Turn a redirect instruction into a browser response.
fn deliver(instruction: RedirectInstruction) -> Response {
    match instruction {
        RedirectInstruction::Redirect { url } => (StatusCode::FOUND, [(header::LOCATION, url)]).into_response(),
        RedirectInstruction::PostForm { html, .. } => Html(html).into_response(),
    }
}

/// Only same-site paths are followed after SSO and SLO.
///
/// Browsers drop tabs and newlines from URLs, so any control character or
/// whitespace disqualifies the target before it is resolved.
pub(super) fn safe_relay_state(relay_state: Option<&str>) -> String {
    match relay_state {
        Some(target) if is_local_path(target) => target.to_string(),
        _ => "/".to_string(),
    }
}

fn is_local_path(target: &str) -> bool {
    if !target.starts_with('/')
        || target.starts_with("//")
        || target.contains('\\')
        || target.chars().any(|c| c.is_control() || c.is_whitespace())
    {
        return false;
    }
    let Ok(base) = url::Url::parse("http://sp.invalid/") else {
        return false;
    };
    base.join(target)
        .map(|resolved| resolved.origin() == base.origin())
        .unwrap_or(false)
}

fn session_id_from(cookies: &SessionConfig, headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| cookies.parse_session_cookie(value))
        .and_then(|hex| SessionId::from_hex(&hex))
}

fn current_session(state: &AppState, headers: &HeaderMap) -> Option<Session> {
    let cookies = session_config(state)?;
    let id = session_id_from(&cookies, headers)?;
    match state.sessions.get(id) {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Session lookup failed");
            None
        }
    }
}

fn drop_current_session(state: &AppState, headers: &HeaderMap) {
    let Some(cookies) = session_config(state) else {
        return;
    };
    if let Some(id) = session_id_from(&cookies, headers) {
        if let Err(e) = state.sessions.delete(id) {
            warn!(error = %e, "Failed to delete session");
        }
    }
}

fn session_config(state: &AppState) -> Option<SessionConfig> {
    match state.provider.settings() {
        Ok(settings) => Some(settings.session.clone()),
        Err(e) => {
            error!(error = %e, "Settings unavailable");
            None
        }
    }
}

fn with_cookie(mut response: Response, cookie: &str) -> Response {
    match HeaderValue::from_str(cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => warn!(error = %e, "Session cookie is not a valid header value"),
    }
    response
}

fn failure(status: u16) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::UNAUTHORIZED);
    (status, AUTHENTICATION_FAILED).into_response()
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

fn page(title: &str, body: &str) -> String {
    format!(
        concat!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>",
            "<body><h1>{title}</h1>{body}</body></html>",
        ),
        title = escape_text(title),
        body = body,
    )
}
