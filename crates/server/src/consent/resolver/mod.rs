//! Consent mode resolvers.
//!
//! Each client is served by exactly one [`ConsentModeResolver`]. Every
//! variant answers the same question for one attempt: get, create or
//! validate the consent session, and either proceed with an authorized
//! session or send the browser somewhere else first.

pub mod explicit;
pub mod implicit;
pub mod preconfigured;

use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::consent::claims::{ClaimsRequest, intersect};
use crate::consent::registry::{ConsentMode, RegisteredClient};
use crate::consent::store::{ConsentResponse, ConsentStore};
use crate::consent::{AuthenticationSession, ConsentRequest, Endpoints};
use crate::entity::{consent_session, join_set};
use crate::error::{ConsentError, ConsentStateError, StorageError};

/// Outcome of a resolver that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The session is authorized; finish the current request with it
    Proceed(consent_session::Model),
    /// Processing stops here; send the browser to this location
    Redirect(String),
}

/// Collaborators and inputs shared by all resolvers for one request.
pub struct ResolverContext<'a> {
    pub store: &'a dyn ConsentStore,
    pub endpoints: &'a Endpoints,
    pub client: &'a RegisteredClient,
    pub request: &'a ConsentRequest,
    pub session: &'a AuthenticationSession,
    pub subject: Uuid,
    /// Lifetime of sessions created by the resolver
    pub lifespan: Duration,
    pub now: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentModeResolver {
    Explicit,
    Implicit,
    PreConfigured,
}

impl ConsentModeResolver {
    pub fn for_client(client: &RegisteredClient) -> Self {
        match client.consent.mode {
            ConsentMode::Explicit => ConsentModeResolver::Explicit,
            ConsentMode::Implicit => ConsentModeResolver::Implicit,
            ConsentMode::PreConfigured => ConsentModeResolver::PreConfigured,
        }
    }

    pub async fn resolve(
        &self,
        ctx: &ResolverContext<'_>,
        challenge_id: Option<Uuid>,
    ) -> Result<Resolution, ConsentError> {
        match self {
            ConsentModeResolver::Explicit => explicit::resolve(ctx, challenge_id).await,
            ConsentModeResolver::Implicit => implicit::resolve(ctx, challenge_id).await,
            ConsentModeResolver::PreConfigured => preconfigured::resolve(ctx, challenge_id).await,
        }
    }
}

/// A new pending consent session for `request`.
pub fn new_consent_session(
    request: &ConsentRequest,
    subject: Option<Uuid>,
    now: OffsetDateTime,
    lifespan: Duration,
) -> consent_session::Model {
    consent_session::Model {
        challenge_id: Uuid::new_v4().to_string(),
        client_id: request.client_id.clone(),
        subject: subject.map(|s| s.to_string()),
        requested_scopes: join_set(&request.scopes),
        requested_audience: join_set(&request.audience),
        granted_scopes: String::new(),
        granted_audience: String::new(),
        granted_claims: String::new(),
        form: request.form.clone(),
        requested_at: now,
        responded_at: None,
        expires_at: now + lifespan,
        granted: false,
        authorized: false,
        preconfiguration_id: None,
    }
}

pub fn challenge_of(session: &consent_session::Model) -> Result<Uuid, ConsentError> {
    Uuid::parse_str(&session.challenge_id).map_err(|_| {
        StorageError::Corrupt(format!(
            "consent session challenge id '{}' is not a UUID",
            session.challenge_id
        ))
        .into()
    })
}

/// An approval of everything requested that the client may receive.
pub fn approval(
    client: &RegisteredClient,
    session: &consent_session::Model,
    granted_claims: String,
    now: OffsetDateTime,
) -> ConsentResponse {
    ConsentResponse {
        authorized: true,
        granted_scopes: join_set(intersect(&session.requested_scopes_list(), &client.scopes)),
        granted_audience: join_set(intersect(
            &session.requested_audience_list(),
            &client.audience,
        )),
        granted_claims,
        preconfiguration_id: None,
        responded_at: now,
    }
}

#[derive(Deserialize)]
struct FormClaims {
    #[serde(default)]
    claims: Option<String>,
}

/// The claims request carried by a persisted request form.
pub fn claims_from_form(form: &str) -> Result<Option<ClaimsRequest>, ConsentError> {
    let parsed: FormClaims = serde_urlencoded::from_str(form)
        .map_err(|e| ConsentError::invalid_request(format!("stored request form: {e}")))?;
    parsed.claims.as_deref().map(ClaimsRequest::parse).transpose()
}

/// Bind `subject` to a session that has none, or verify the bound one.
/// A mismatch is always fatal; a bound subject is never replaced.
pub async fn bind_or_verify_subject(
    store: &dyn ConsentStore,
    session: &mut consent_session::Model,
    subject: Uuid,
) -> Result<(), ConsentError> {
    let expected = subject.to_string();
    match session.subject.as_deref() {
        Some(bound) if bound == expected => return Ok(()),
        Some(_) => return Err(ConsentStateError::SubjectMismatch.into()),
        None => {}
    }

    let challenge_id = challenge_of(session)?;
    if store.bind_consent_subject(challenge_id, subject).await? {
        tracing::info!(target: "audit", %challenge_id, "Consent session subject bound");
        session.subject = Some(expected);
        return Ok(());
    }

    // someone else bound it in the meantime
    let stored = store
        .load_consent_session(challenge_id)
        .await?
        .ok_or(ConsentStateError::NotFound)?;
    if stored.subject.as_deref() != Some(expected.as_str()) {
        return Err(ConsentStateError::SubjectMismatch.into());
    }
    *session = stored;
    Ok(())
}

impl ResolverContext<'_> {
    /// Create and persist a pending session bound to the subject.
    pub(crate) async fn create_session(&self) -> Result<consent_session::Model, ConsentError> {
        let session = new_consent_session(self.request, Some(self.subject), self.now, self.lifespan);
        self.store.save_consent_session(&session).await?;

        tracing::info!(
            target: "audit",
            challenge_id = %session.challenge_id,
            client_id = %session.client_id,
            "Consent session created"
        );
        Ok(session)
    }

    /// Load a session and validate it against this attempt, binding the
    /// subject if the session does not carry one yet.
    pub(crate) async fn load_session(
        &self,
        challenge_id: Uuid,
    ) -> Result<consent_session::Model, ConsentError> {
        if challenge_id.is_nil() {
            return Err(ConsentStateError::ZeroChallenge.into());
        }
        let mut session = self
            .store
            .load_consent_session(challenge_id)
            .await?
            .ok_or(ConsentStateError::NotFound)?;

        if session.client_id != self.client.id {
            return Err(ConsentStateError::ClientMismatch.into());
        }
        if !self.is_same_request(&session)? {
            return Err(ConsentError::invalid_request(
                "The consent_id belongs to a different authorization request.",
            ));
        }
        if session.is_expired_at(self.now) {
            return Err(ConsentStateError::Expired.into());
        }

        bind_or_verify_subject(self.store, &mut session, self.subject).await?;

        if session.is_responded() && !session.authorized {
            return Err(ConsentError::AccessDenied);
        }
        if session.granted {
            return Err(ConsentStateError::AlreadyGranted.into());
        }
        Ok(session)
    }

    /// A resumed session only ever covers exactly what it was created for.
    fn is_same_request(&self, session: &consent_session::Model) -> Result<bool, ConsentError> {
        let stored_claims = claims_from_form(&session.form)?
            .filter(|claims| !claims.is_empty())
            .map(|claims| claims.signature());
        Ok(session.requested_scopes == join_set(&self.request.scopes)
            && session.requested_audience == join_set(&self.request.audience)
            && stored_claims == self.request.claims_signature())
    }

    pub(crate) async fn obtain_session(
        &self,
        challenge_id: Option<Uuid>,
    ) -> Result<consent_session::Model, ConsentError> {
        match challenge_id {
            Some(id) => self.load_session(id).await,
            None => self.create_session().await,
        }
    }

    /// Login redirect if the request's freshness requirement is not met.
    pub(crate) fn reauthentication(
        &self,
        session: &consent_session::Model,
    ) -> Result<Option<Resolution>, ConsentError> {
        if !self.request.freshness.requires_reauthentication(
            &self.session.levels,
            session.requested_at,
            self.now,
        ) {
            return Ok(None);
        }
        if self.request.has_prompt("none") {
            return Err(ConsentError::LoginRequired);
        }

        let challenge_id = challenge_of(session)?;
        tracing::debug!(%challenge_id, "Request demands a fresh authentication");
        let continuation = self.request.continuation(self.endpoints, challenge_id);
        Ok(Some(Resolution::Redirect(self.endpoints.login(&continuation))))
    }

    /// Record a decision. The stored decision is authoritative whether or
    /// not this call was the one that wrote it.
    pub(crate) async fn respond(
        &self,
        session: &consent_session::Model,
        response: ConsentResponse,
    ) -> Result<consent_session::Model, ConsentError> {
        let challenge_id = challenge_of(session)?;
        self.store
            .respond_consent_session(challenge_id, &response)
            .await?;

        let stored = self
            .store
            .load_consent_session(challenge_id)
            .await?
            .ok_or(ConsentStateError::NotFound)?;
        // not written and still undecided: it expired underneath us
        if !stored.is_responded() {
            return Err(ConsentStateError::Expired.into());
        }
        if !stored.authorized {
            return Err(ConsentError::AccessDenied);
        }
        Ok(stored)
    }
}
