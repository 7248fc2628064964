//! The single entry point per protocol leg.
//!
//! For every request the orchestrator resolves the client, evaluates the
//! authentication level gate, dispatches to the client's consent mode
//! resolver, negotiates claims and hands the granted session to the protocol
//! engine. A grant is committed only after the engine has constructed the
//! response it belongs to. Every failure leaves here protocol-shaped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::LifespanConfig;
use crate::consent::claims::{ClaimsNegotiator, ClaimsRequest, intersect};
use crate::consent::device::DevicePairingBridge;
use crate::consent::level::evaluate_gate;
use crate::consent::protocol::{
    AuthorizeParams, AuthorizeRequest, ClientCredentials, DeviceAuthorizeParams,
    DeviceAuthorizeResponse, Grant, ProtocolEngine, PushedAuthorizeResponse, Rejection,
};
use crate::consent::registry::{
    ClientRegistry, ConsentMode, GRANT_TYPE_DEVICE_CODE, RegisteredClient,
};
use crate::consent::resolver::{
    ConsentModeResolver, Resolution, ResolverContext, approval, bind_or_verify_subject,
    challenge_of, claims_from_form, new_consent_session,
};
use crate::consent::store::{ConsentResponse, ConsentStore};
use crate::consent::{AuthenticationSession, ConsentRequest, Endpoints, UserDetails};
use crate::entity::{consent_preconfiguration, consent_session, join_set};
use crate::error::{ConsentError, ConsentStateError, ErrorCode, ProtocolError};

/// Browser-side submission of a user code, or resumption of a pairing.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DevicePairing {
    pub client_id: String,
    #[serde(default)]
    pub user_code: Option<String>,
    /// Challenge id returned by an earlier pairing of this device
    #[serde(default)]
    pub consent_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    Redirect(String),
    Approved,
}

/// What the consent page shows for a pending session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConsentDetails {
    pub consent_id: Uuid,
    pub client_id: String,
    pub client_description: String,
    pub scopes: Vec<String>,
    pub audience: Vec<String>,
    pub essential_claims: Vec<String>,
    pub voluntary_claims: Vec<String>,
    /// The user may ask for this decision to be remembered
    pub pre_configuration: bool,
}

/// The user's answer on the consent page.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ConsentDecision {
    pub consent_id: Uuid,
    #[serde(default)]
    pub consent: bool,
    /// Remember this decision for identical future requests
    #[serde(default)]
    pub pre_configure: bool,
    /// Voluntary claims the user agreed to; all of them when absent
    #[serde(default)]
    pub claims: Option<Vec<String>>,
}

pub struct Orchestrator {
    store: Arc<dyn ConsentStore>,
    registry: Arc<dyn ClientRegistry>,
    engine: Arc<dyn ProtocolEngine>,
    endpoints: Endpoints,
    lifespans: LifespanConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ConsentStore>,
        registry: Arc<dyn ClientRegistry>,
        engine: Arc<dyn ProtocolEngine>,
        endpoints: Endpoints,
        lifespans: LifespanConfig,
    ) -> Self {
        Self {
            store,
            registry,
            engine,
            endpoints,
            lifespans,
        }
    }

    pub fn store(&self) -> &dyn ConsentStore {
        self.store.as_ref()
    }

    fn client(&self, client_id: &str) -> Result<Arc<RegisteredClient>, ConsentError> {
        self.registry
            .get_registered_client(client_id)
            .ok_or_else(|| ConsentError::validation(ErrorCode::InvalidClient, "Client authentication failed."))
    }

    fn authenticate(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<Arc<RegisteredClient>, ConsentError> {
        let client_id = credentials.client_id.as_deref().ok_or_else(|| {
            ConsentError::validation(ErrorCode::InvalidClient, "Client authentication failed.")
        })?;
        let client = self.client(client_id)?;
        self.engine.authenticate_client(&client, credentials)?;
        Ok(client)
    }

    fn fail(client_id: &str, err: ConsentError) -> ProtocolError {
        err.log(client_id);
        err.to_protocol()
    }

    /// Write a rejection as a redirect to the client when that is safe.
    fn reject(&self, client_id: &str, rejection: Rejection) -> Result<String, ProtocolError> {
        rejection.error.log(client_id);
        let error = rejection.error.to_protocol();
        match rejection.redirect {
            Some(redirect) => {
                let error = error.with_state(redirect.state.clone());
                self.engine
                    .write_error(&redirect, &error)
                    .map_err(|e| Self::fail(client_id, e))
            }
            None => Err(error),
        }
    }

    /// Authorization endpoint. Returns where to send the browser; an error
    /// is only returned when it cannot be delivered to the client.
    #[tracing::instrument(skip_all, fields(client_id = params.client_id.as_deref().unwrap_or_default()))]
    pub async fn authorize(
        &self,
        params: AuthorizeParams,
        auth: &AuthenticationSession,
    ) -> Result<String, ProtocolError> {
        let now = OffsetDateTime::now_utc();
        let client_id = params.client_id.clone().unwrap_or_default();
        let client = self
            .client(&client_id)
            .map_err(|err| Self::fail(&client_id, err))?;

        let request = match self.engine.new_authorize_request(&client, params, now).await {
            Ok(request) => request,
            Err(rejection) => return self.reject(&client.id, rejection),
        };

        match self.authorize_request(&client, &request, auth, now).await {
            Ok(location) => Ok(location),
            Err(err) => self.reject(&client.id, Rejection::redirect(err, request.error_redirect())),
        }
    }

    async fn authorize_request(
        &self,
        client: &RegisteredClient,
        request: &AuthorizeRequest,
        auth: &AuthenticationSession,
        now: OffsetDateTime,
    ) -> Result<String, ConsentError> {
        let claims = request
            .claims
            .as_deref()
            .map(ClaimsRequest::parse)
            .transpose()?;
        if let Some(claims) = &claims {
            claims.validate_scopes(
                &intersect(&request.scopes, &client.scopes),
                &client.claims_policy,
            )?;
        }
        let consent_request = request.consent_request(claims);

        let decision = evaluate_gate(
            &client.authorization_policy,
            auth.username(),
            auth.groups(),
            auth.remote_ip,
            &auth.levels,
        );
        if decision.is_denied() {
            return Err(ConsentError::AccessDenied);
        }
        let Some(user) = auth.user.as_ref().filter(|_| decision.is_satisfied()) else {
            if request.has_prompt("none") {
                return Err(ConsentError::LoginRequired);
            }
            tracing::debug!(
                required = ?decision.required,
                current = ?decision.current,
                "Authentication level insufficient"
            );
            return self
                .login_redirect(&consent_request, request.consent_id, now)
                .await;
        };

        let subject = self
            .store
            .load_or_create_subject(&client.sector_id, &user.username)
            .await?;
        let ctx = ResolverContext {
            store: self.store.as_ref(),
            endpoints: &self.endpoints,
            client,
            request: &consent_request,
            session: auth,
            subject,
            lifespan: self.lifespans.consent(),
            now,
        };
        let session = match ConsentModeResolver::for_client(client)
            .resolve(&ctx, request.consent_id)
            .await?
        {
            Resolution::Redirect(location) => return Ok(location),
            Resolution::Proceed(session) => session,
        };

        self.finish(client, request, &consent_request, session, user, subject, auth, now)
            .await
    }

    /// Send the browser to login, keeping a pending session as the
    /// continuation so the original request resumes afterwards.
    async fn login_redirect(
        &self,
        request: &ConsentRequest,
        challenge_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> Result<String, ConsentError> {
        let challenge_id = match challenge_id {
            Some(id) => id,
            None => {
                let session = new_consent_session(request, None, now, self.lifespans.consent());
                self.store.save_consent_session(&session).await?;
                tracing::info!(
                    target: "audit",
                    challenge_id = %session.challenge_id,
                    client_id = %session.client_id,
                    "Consent session created pending authentication"
                );
                challenge_of(&session)?
            }
        };
        let continuation = request.continuation(&self.endpoints, challenge_id);
        Ok(self.endpoints.login(&continuation))
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        client: &RegisteredClient,
        request: &AuthorizeRequest,
        consent_request: &ConsentRequest,
        session: consent_session::Model,
        user: &UserDetails,
        subject: Uuid,
        auth: &AuthenticationSession,
        now: OffsetDateTime,
    ) -> Result<String, ConsentError> {
        let challenge_id = challenge_of(&session)?;
        // nothing is minted for a session that can no longer be granted
        if !session.can_grant_at(now) {
            return Err(if session.is_expired_at(now) {
                ConsentStateError::Expired.into()
            } else {
                ConsentStateError::AlreadyGranted.into()
            });
        }
        let granted_scopes = session.granted_scopes_list();
        let negotiator = ClaimsNegotiator::new(&client.claims_policy, self.endpoints.issuer());
        if let Some(claims) = &consent_request.claims {
            negotiator.validate(claims, &granted_scopes, &subject.to_string())?;
        }
        let claims = negotiator.hydrate(
            consent_request.claims.as_ref(),
            &granted_scopes,
            &session.granted_claims_list(),
            user,
        );

        let grant = Grant {
            session: &session,
            subject,
            claims: &claims,
            user,
            auth_time: auth.levels.last_authenticated_at(),
        };
        let response = self.engine.new_authorize_response(request, &grant, now).await?;

        let committed = match self.store.grant_consent_session(challenge_id, now).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ConsentStateError::AlreadyGranted.into()),
            Err(err) => Err(ConsentError::from(err)),
        };
        if let Err(err) = committed {
            if let Err(revoke_err) = self.engine.revoke_authorize_response(&response).await {
                tracing::error!(%challenge_id, error = %revoke_err, "Failed to revoke uncommitted authorization response");
            }
            return Err(err);
        }

        Ok(response.redirect_to)
    }

    /// Pushed authorization request endpoint.
    #[tracing::instrument(skip_all, fields(client_id = credentials.client_id.as_deref().unwrap_or_default()))]
    pub async fn pushed_authorize(
        &self,
        params: AuthorizeParams,
        credentials: &ClientCredentials,
    ) -> Result<PushedAuthorizeResponse, ProtocolError> {
        let client_id = credentials.client_id.clone().unwrap_or_default();
        let client = self
            .authenticate(credentials)
            .map_err(|err| Self::fail(&client_id, err))?;

        let response = self
            .engine
            .new_pushed_authorize_request(&client, params, OffsetDateTime::now_utc())
            .await
            .map_err(|err| Self::fail(&client.id, err))?;

        tracing::debug!(client_id = %client.id, request_uri = %response.request_uri, "Authorization request pushed");
        Ok(response)
    }

    /// Device authorization endpoint (called by the device).
    #[tracing::instrument(skip_all, fields(client_id = credentials.client_id.as_deref().unwrap_or_default()))]
    pub async fn device_authorize(
        &self,
        params: DeviceAuthorizeParams,
        credentials: &ClientCredentials,
    ) -> Result<DeviceAuthorizeResponse, ProtocolError> {
        let client_id = credentials.client_id.clone().unwrap_or_default();
        let client = self
            .authenticate(credentials)
            .map_err(|err| Self::fail(&client_id, err))?;

        self.device_authorize_request(&client, &params)
            .await
            .map_err(|err| Self::fail(&client.id, err))
    }

    async fn device_authorize_request(
        &self,
        client: &RegisteredClient,
        params: &DeviceAuthorizeParams,
    ) -> Result<DeviceAuthorizeResponse, ConsentError> {
        if !client.allows_grant_type(GRANT_TYPE_DEVICE_CODE) {
            return Err(ConsentError::validation(
                ErrorCode::UnauthorizedClient,
                "The client is not allowed to use the device authorization grant.",
            ));
        }

        let authorization =
            self.engine
                .new_device_authorize_request(client, params, OffsetDateTime::now_utc())?;
        if let Some(claims) = params.claims.as_deref().map(ClaimsRequest::parse).transpose()? {
            claims.validate_scopes(&authorization.session.scopes_list(), &client.claims_policy)?;
        }

        let id = self.store.save_device_session(&authorization.session).await?;
        tracing::info!(
            target: "audit",
            device_session = id,
            client_id = %client.id,
            "Device code session created"
        );
        Ok(authorization.response)
    }

    /// Device verification (called by the secondary browser).
    #[tracing::instrument(skip_all, fields(client_id = %pairing.client_id))]
    pub async fn device_pair(
        &self,
        pairing: DevicePairing,
        auth: &AuthenticationSession,
    ) -> Result<DeviceOutcome, ProtocolError> {
        let client = self
            .client(&pairing.client_id)
            .map_err(|err| Self::fail(&pairing.client_id, err))?;

        self.device_pair_request(&client, &pairing, auth)
            .await
            .map_err(|err| Self::fail(&client.id, err))
    }

    async fn device_pair_request(
        &self,
        client: &RegisteredClient,
        pairing: &DevicePairing,
        auth: &AuthenticationSession,
    ) -> Result<DeviceOutcome, ConsentError> {
        let now = OffsetDateTime::now_utc();
        let bridge = DevicePairingBridge::new(self.store.as_ref(), self.lifespans.device_consent());

        let decision = evaluate_gate(
            &client.authorization_policy,
            auth.username(),
            auth.groups(),
            auth.remote_ip,
            &auth.levels,
        );
        if decision.is_denied() {
            return Err(ConsentError::AccessDenied);
        }
        let Some(user) = auth.user.as_ref().filter(|_| decision.is_satisfied()) else {
            let continuation = match (pairing.consent_id, pairing.user_code.as_deref()) {
                (Some(challenge_id), _) => self.endpoints.device(challenge_id),
                (None, Some(user_code)) => self.endpoints.device_entry(user_code),
                (None, None) => return Err(ConsentError::invalid_request("The user_code is missing.")),
            };
            return Ok(DeviceOutcome::Redirect(self.endpoints.login(&continuation)));
        };

        let subject = self
            .store
            .load_or_create_subject(&client.sector_id, &user.username)
            .await?;
        let (device, request, challenge_id) = match (pairing.consent_id, pairing.user_code.as_deref()) {
            (Some(challenge_id), _) => {
                let (device, request) = bridge.resume(client, challenge_id, now).await?;
                (device, request, challenge_id)
            }
            (None, Some(user_code)) => {
                let paired = bridge.pair(client, user_code, subject, now).await?;
                (paired.device, paired.request, paired.challenge_id)
            }
            (None, None) => return Err(ConsentError::invalid_request("The user_code is missing.")),
        };

        let ctx = ResolverContext {
            store: self.store.as_ref(),
            endpoints: &self.endpoints,
            client,
            request: &request,
            session: auth,
            subject,
            lifespan: self.lifespans.device_consent(),
            now,
        };
        let resolved = match ConsentModeResolver::for_client(client)
            .resolve(&ctx, Some(challenge_id))
            .await
        {
            Ok(Resolution::Redirect(location)) => return Ok(DeviceOutcome::Redirect(location)),
            Ok(Resolution::Proceed(session)) => {
                self.check_device_claims(client, &request, &session, subject)
            }
            Err(err) => Err(err),
        };

        match resolved {
            Ok(()) => {
                bridge.approve(&device, challenge_id, subject, now).await?;
                Ok(DeviceOutcome::Approved)
            }
            Err(err @ (ConsentError::AccessDenied | ConsentError::Security(_))) => {
                bridge.deny(&device).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn check_device_claims(
        &self,
        client: &RegisteredClient,
        request: &ConsentRequest,
        session: &consent_session::Model,
        subject: Uuid,
    ) -> Result<(), ConsentError> {
        match &request.claims {
            Some(claims) => ClaimsNegotiator::new(&client.claims_policy, self.endpoints.issuer())
                .validate(claims, &session.granted_scopes_list(), &subject.to_string()),
            None => Ok(()),
        }
    }

    /// Load a pending session for the consent page.
    async fn pending_session(
        &self,
        challenge_id: Uuid,
        auth: &AuthenticationSession,
        now: OffsetDateTime,
    ) -> Result<(consent_session::Model, Arc<RegisteredClient>, Uuid), ConsentError> {
        let user = auth.user.as_ref().ok_or(ConsentError::LoginRequired)?;
        if challenge_id.is_nil() {
            return Err(ConsentStateError::ZeroChallenge.into());
        }
        let mut session = self
            .store
            .load_consent_session(challenge_id)
            .await?
            .ok_or(ConsentStateError::NotFound)?;
        let client = self.client(&session.client_id)?;

        let subject = self
            .store
            .load_or_create_subject(&client.sector_id, &user.username)
            .await?;
        bind_or_verify_subject(self.store.as_ref(), &mut session, subject).await?;

        if session.is_expired_at(now) {
            return Err(ConsentStateError::Expired.into());
        }
        if session.is_responded() {
            return Err(ConsentStateError::AlreadyResponded.into());
        }
        Ok((session, client, subject))
    }

    /// Consent page details.
    #[tracing::instrument(skip(self, auth))]
    pub async fn consent_details(
        &self,
        challenge_id: Uuid,
        auth: &AuthenticationSession,
    ) -> Result<ConsentDetails, ProtocolError> {
        self.consent_details_request(challenge_id, auth)
            .await
            .map_err(|err| Self::fail("", err))
    }

    async fn consent_details_request(
        &self,
        challenge_id: Uuid,
        auth: &AuthenticationSession,
    ) -> Result<ConsentDetails, ConsentError> {
        let (session, client, _) = self
            .pending_session(challenge_id, auth, OffsetDateTime::now_utc())
            .await?;
        let claims = claims_from_form(&session.form)?.unwrap_or_default();

        Ok(ConsentDetails {
            consent_id: challenge_id,
            client_id: client.id.clone(),
            client_description: client.name.clone(),
            scopes: session.requested_scopes_list(),
            audience: session.requested_audience_list(),
            essential_claims: claims.essential_claims().into_iter().collect(),
            voluntary_claims: claims.voluntary_claims().into_iter().collect(),
            pre_configuration: client.consent.mode == ConsentMode::PreConfigured,
        })
    }

    /// Record the user's decision. Returns where the browser continues.
    #[tracing::instrument(skip_all, fields(consent_id = %decision.consent_id, consent = decision.consent))]
    pub async fn consent_decision(
        &self,
        decision: ConsentDecision,
        auth: &AuthenticationSession,
    ) -> Result<String, ProtocolError> {
        self.consent_decision_request(&decision, auth)
            .await
            .map_err(|err| Self::fail("", err))
    }

    async fn consent_decision_request(
        &self,
        decision: &ConsentDecision,
        auth: &AuthenticationSession,
    ) -> Result<String, ConsentError> {
        let now = OffsetDateTime::now_utc();
        let challenge_id = decision.consent_id;
        let (session, client, subject) = self.pending_session(challenge_id, auth, now).await?;

        let device = self
            .store
            .load_device_session_by_challenge(challenge_id)
            .await?;
        let continuation = match &device {
            Some(_) => self.endpoints.device(challenge_id),
            None => self.endpoints.authorization(&session.form, challenge_id),
        };

        if !decision.consent {
            if !self
                .store
                .respond_consent_session(challenge_id, &ConsentResponse::rejected(now))
                .await?
            {
                return Err(self.unrespondable(challenge_id, now).await);
            }
            if let Some(device) = &device {
                DevicePairingBridge::new(self.store.as_ref(), self.lifespans.device_consent())
                    .deny(device)
                    .await?;
            }
            return Ok(continuation);
        }

        let claims = claims_from_form(&session.form)?;
        let granted_claims = claims
            .as_ref()
            .map(|claims| chosen_claims(claims, decision.claims.as_deref()))
            .unwrap_or_default();
        let response = approval(&client, &session, join_set(&granted_claims), now);
        if !self
            .store
            .respond_consent_session(challenge_id, &response)
            .await?
        {
            return Err(self.unrespondable(challenge_id, now).await);
        }

        if decision.pre_configure {
            self.remember(&client, &session, subject, claims.as_ref(), &response, now)
                .await?;
        }

        Ok(continuation)
    }

    /// Why a decision could not be recorded on a session that looked pending.
    async fn unrespondable(&self, challenge_id: Uuid, now: OffsetDateTime) -> ConsentError {
        match self.store.load_consent_session(challenge_id).await {
            Ok(Some(session)) if !session.is_responded() && session.is_expired_at(now) => {
                ConsentStateError::Expired.into()
            }
            Ok(Some(_)) => ConsentStateError::AlreadyResponded.into(),
            Ok(None) => ConsentStateError::NotFound.into(),
            Err(err) => err.into(),
        }
    }

    async fn remember(
        &self,
        client: &RegisteredClient,
        session: &consent_session::Model,
        subject: Uuid,
        claims: Option<&ClaimsRequest>,
        response: &ConsentResponse,
        now: OffsetDateTime,
    ) -> Result<(), ConsentError> {
        if client.consent.mode != ConsentMode::PreConfigured {
            tracing::debug!(client_id = %client.id, "Ignoring pre-configuration request for client without pre-configured consent");
            return Ok(());
        }
        let preconfiguration = consent_preconfiguration::Model {
            id: 0,
            client_id: client.id.clone(),
            subject: subject.to_string(),
            scopes: session.requested_scopes.clone(),
            audience: session.requested_audience.clone(),
            granted_claims: response.granted_claims.clone(),
            claims_signature: claims.filter(|c| !c.is_empty()).map(ClaimsRequest::signature),
            created_at: now,
            expires_at: client.consent.duration.map(|duration| now + duration),
            revoked: false,
        };
        self.store.save_preconfiguration(&preconfiguration).await?;
        Ok(())
    }
}

/// Essential claims are always granted; voluntary ones only when chosen.
fn chosen_claims(claims: &ClaimsRequest, chosen: Option<&[String]>) -> BTreeSet<String> {
    let mut granted = claims.essential_claims();
    let voluntary = claims.voluntary_claims();
    match chosen {
        Some(chosen) => granted.extend(voluntary.into_iter().filter(|c| chosen.contains(c))),
        None => granted.extend(voluntary),
    }
    granted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chosen_claims_keep_essentials() {
        let claims = ClaimsRequest::parse(
            r#"{"userinfo": {"email": {"essential": true}, "name": null, "groups": null}}"#,
        )
        .unwrap();

        let all = chosen_claims(&claims, None);
        assert_eq!(all.len(), 3);

        let some = chosen_claims(&claims, Some(&["groups".to_string()][..]));
        assert!(some.contains("email"));
        assert!(some.contains("groups"));
        assert!(!some.contains("name"));

        let none = chosen_claims(&claims, Some(&[][..]));
        assert_eq!(none.into_iter().collect::<Vec<_>>(), vec!["email"]);
    }
}
