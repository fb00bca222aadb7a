//! SAML Service Provider: SP-initiated SSO and single logout in both
//! directions.

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::binding::redirect::QuerySigner;
use crate::binding::{self, Binding, HttpRequestData, MessageType, RedirectInstruction};
use crate::error::{SamlError, SamlResult, ValidationError, ValidationOutcome};
use crate::pending::{AssertionReplayCache, PendingRequestStore, RequestKind};
use crate::protocol::{
    build_authn_request, build_logout_request, build_logout_response, validate_logout_request,
    validate_logout_response, validate_response, AssertionResult, LoginOptions, NameId,
    ValidationContext,
};
use crate::settings::{generate_sp_metadata, validate_sp_metadata, Settings};
use crate::xml::STATUS_SUCCESS;

/// What a completed logout exchange amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutResult {
    /// The IdP answered our LogoutRequest.
    Completed { partial: bool },
    /// Nothing to do; the user agent carried no SAML message.
    AlreadyLoggedOut,
    /// The IdP asked us to end the subject's sessions. The caller drops the
    /// matching sessions and sends the user agent to `response`.
    IdpInitiated {
        name_id: NameId,
        session_indexes: Vec<String>,
        response: RedirectInstruction,
    },
}

/// SAML Service Provider.
pub struct ServiceProvider {
    settings: RwLock<Arc<Settings>>,
    pending: Arc<PendingRequestStore>,
    replay: Arc<AssertionReplayCache>,
}

impl ServiceProvider {
    /// Create a provider with validated settings and empty stores.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(Arc::new(settings)),
            pending: Arc::new(PendingRequestStore::new()),
            replay: Arc::new(AssertionReplayCache::new()),
        }
    }

    /// Swap in new settings. In-flight validations finish with the old ones.
    pub fn reconfigure(&self, settings: Settings) -> SamlResult<()> {
        let mut current = self
            .settings
            .write()
            .map_err(|_| SamlError::Internal("settings lock poisoned".to_string()))?;
        info!(
            sp = %settings.sp.entity_id,
            idp = %settings.idp.entity_id,
            certificates = settings.idp.certificates.len(),
            "SAML settings reloaded"
        );
        *current = Arc::new(settings);
        Ok(())
    }

    /// The settings currently in effect.
    pub fn settings(&self) -> SamlResult<Arc<Settings>> {
        self.settings
            .read()
            .map(|s| Arc::clone(&s))
            .map_err(|_| SamlError::Internal("settings lock poisoned".to_string()))
    }

    pub fn pending_requests(&self) -> Arc<PendingRequestStore> {
        Arc::clone(&self.pending)
    }

    pub fn replay_cache(&self) -> Arc<AssertionReplayCache> {
        Arc::clone(&self.replay)
    }

    /// SP metadata. Only returned after it passed schema validation.
    pub fn get_metadata_xml(&self) -> SamlResult<String> {
        let settings = self.settings()?;
        let metadata = generate_sp_metadata(&settings)?;
        validate_sp_metadata(&metadata)?;
        Ok(metadata)
    }

    /// Begin SP-initiated SSO.
    pub fn start_login(
        &self,
        relay_state: Option<&str>,
        options: LoginOptions,
    ) -> SamlResult<RedirectInstruction> {
        let settings = self.settings()?;
        let binding = settings.idp.sso_binding;
        let sign = settings.security.authn_requests_signed;
        let now = Utc::now();

        let request = build_authn_request(&settings, options, now, sign && binding == Binding::HttpPost)?;
        let instruction = binding::encode(
            binding,
            &request.xml,
            MessageType::Request,
            &settings.idp.sso_url,
            relay_state,
            query_signer(&settings, sign && binding == Binding::HttpRedirect)?,
        )?;

        self.pending.insert(
            request.id.clone(),
            RequestKind::Authn,
            now,
            settings.security.request_ttl,
        )?;
        info!(
            request_id = %request.id,
            binding = %binding,
            signed = sign,
            force_authn = options.force_authn,
            "Created SAML AuthnRequest"
        );
        Ok(instruction)
    }

    /// Validate the IdP's answer posted to the ACS.
    pub fn complete_login(&self, request: &HttpRequestData) -> ValidationOutcome<AssertionResult> {
        self.complete_login_at(request, Utc::now())
    }

    /// [`Self::complete_login`] at an explicit instant.
    pub fn complete_login_at(
        &self,
        request: &HttpRequestData,
        now: DateTime<Utc>,
    ) -> ValidationOutcome<AssertionResult> {
        let settings = match self.settings() {
            Ok(settings) => settings,
            Err(e) => return reject(e),
        };
        let message = match binding::decode(request) {
            Ok(message) => message,
            Err(e) => return reject(e),
        };
        let ctx = ValidationContext {
            settings: &settings,
            pending: &self.pending,
            replay: &self.replay,
            now,
        };
        validate_response(&ctx, &message)
    }

    /// Begin SP-initiated single logout.
    ///
    /// Without a session (no NameID) or without an IdP logout endpoint there
    /// is nothing to tell the IdP, and the user agent just goes home.
    pub fn start_logout(
        &self,
        name_id: Option<&NameId>,
        session_index: Option<&str>,
        relay_state: Option<&str>,
    ) -> SamlResult<RedirectInstruction> {
        let Some(name_id) = name_id else {
            debug!("Logout without a session");
            return Ok(RedirectInstruction::redirect("/"));
        };
        let settings = self.settings()?;
        let Some(slo) = settings.idp.slo.as_ref() else {
            warn!("IdP has no single logout endpoint, ending the local session only");
            return Ok(RedirectInstruction::redirect("/"));
        };

        let sign = settings.security.logout_request_signed;
        let now = Utc::now();
        let request = build_logout_request(
            &settings,
            name_id,
            session_index,
            now,
            sign && slo.binding == Binding::HttpPost,
        )?;
        let instruction = binding::encode(
            slo.binding,
            &request.xml,
            MessageType::Request,
            &slo.url,
            relay_state,
            query_signer(&settings, sign && slo.binding == Binding::HttpRedirect)?,
        )?;

        self.pending.insert(
            request.id.clone(),
            RequestKind::Logout,
            now,
            settings.security.request_ttl,
        )?;
        info!(request_id = %request.id, name_id = %name_id.value, "Created SAML LogoutRequest");
        Ok(instruction)
    }

    /// Handle whatever arrived at the SLO endpoint.
    pub fn complete_logout(&self, request: &HttpRequestData) -> ValidationOutcome<LogoutResult> {
        self.complete_logout_at(request, Utc::now())
    }

    /// [`Self::complete_logout`] at an explicit instant.
    pub fn complete_logout_at(
        &self,
        request: &HttpRequestData,
        now: DateTime<Utc>,
    ) -> ValidationOutcome<LogoutResult> {
        if !request.has_saml_message() {
            debug!("Logout endpoint hit without a SAML message");
            return ValidationOutcome::Valid(LogoutResult::AlreadyLoggedOut);
        }
        let settings = match self.settings() {
            Ok(settings) => settings,
            Err(e) => return reject(e),
        };
        let message = match binding::decode(request) {
            Ok(message) => message,
            Err(e) => return reject(e),
        };
        let ctx = ValidationContext {
            settings: &settings,
            pending: &self.pending,
            replay: &self.replay,
            now,
        };

        match message.message_type {
            MessageType::Response => validate_logout_response(&ctx, &message).map(|info| {
                info!(partial = info.partial, "SAML logout completed");
                LogoutResult::Completed {
                    partial: info.partial,
                }
            }),
            MessageType::Request => {
                let info = match validate_logout_request(&ctx, &message) {
                    ValidationOutcome::Valid(info) => info,
                    ValidationOutcome::Invalid(errors) => return ValidationOutcome::Invalid(errors),
                };
                match self.answer_logout_request(&settings, &info.id, message.relay_state.as_deref(), now) {
                    Ok(response) => ValidationOutcome::Valid(LogoutResult::IdpInitiated {
                        name_id: info.name_id,
                        session_indexes: info.session_indexes,
                        response,
                    }),
                    Err(e) => reject(e),
                }
            }
        }
    }

    fn answer_logout_request(
        &self,
        settings: &Settings,
        request_id: &str,
        relay_state: Option<&str>,
        now: DateTime<Utc>,
    ) -> SamlResult<RedirectInstruction> {
        let Some(slo) = settings.idp.slo.as_ref() else {
            warn!("IdP has no single logout endpoint, cannot answer its LogoutRequest");
            return Ok(RedirectInstruction::redirect("/"));
        };
        let sign = settings.security.logout_response_signed;
        let response = build_logout_response(
            settings,
            request_id,
            STATUS_SUCCESS,
            now,
            sign && slo.binding == Binding::HttpPost,
        )?;
        debug!(in_response_to = %request_id, "Answering IdP LogoutRequest");
        binding::encode(
            slo.binding,
            &response.xml,
            MessageType::Response,
            slo.response_location(),
            relay_state,
            query_signer(settings, sign && slo.binding == Binding::HttpRedirect)?,
        )
    }
}

fn query_signer(settings: &Settings, wanted: bool) -> SamlResult<Option<QuerySigner<'_>>> {
    if !wanted {
        return Ok(None);
    }
    let credentials = settings
        .sp
        .credentials
        .as_ref()
        .ok_or_else(|| SamlError::Internal("signing requested without SP credentials".to_string()))?;
    Ok(Some(QuerySigner {
        credentials,
        algorithm: settings.security.signature_algorithm,
    }))
}

fn reject<T>(err: SamlError) -> ValidationOutcome<T> {
    let error = ValidationError::from(err);
    warn!(kind = %error.kind(), reason = %error, "SAML message rejected before validation");
    ValidationOutcome::Invalid(vec![error])
}
