//! OpenID Connect HTTP endpoints.
//!
//! Thin adapters: each handler reads the wire request and the
//! authentication session, calls the orchestrator and writes its outcome.

use axum::{
    Form, Json,
    extract::{Query, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Redirect, Response},
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};
use uuid::Uuid;

use crate::consent::orchestrator::{ConsentDecision, ConsentDetails, DeviceOutcome, DevicePairing};
use crate::consent::protocol::{
    AuthorizeParams, ClientCredentials, DeviceAuthorizeParams, DeviceAuthorizeResponse,
    PushedAuthorizeResponse,
};
use crate::error::ProtocolError;
use crate::oauth2::OAUTH2_TAG;
use crate::oauth2::session::Session;
use crate::oauth2::state::OAuth2State;

pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(authorize, authorize_form))
        .routes(routes!(pushed_authorization_request))
        .routes(routes!(device_authorization, device_pairing))
        .routes(routes!(consent_details, consent_decision))
        .with_state(state)
}

/// Pushed authorization request body: the request plus client credentials.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PushedAuthorizeForm {
    #[serde(flatten)]
    pub params: AuthorizeParams,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ConsentQuery {
    /// Challenge id of the pending consent session
    pub consent_id: Uuid,
}

/// Where the browser continues after a consent or device decision.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ContinueResponse {
    /// `false` while the user still has to log in or consent
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

/// Client credentials from HTTP Basic authentication, falling back to the
/// form body (`client_secret_basic`, then `client_secret_post`).
fn extract_client_credentials(
    headers: &HeaderMap,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> ClientCredentials {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        && let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(auth)
        && let Ok(creds) = String::from_utf8(decoded)
        && let Some((id, secret)) = creds.split_once(':')
    {
        // RFC 6749 section 2.3.1: both parts are form-urlencoded
        let decode = |v: &str| {
            urlencoding::decode(v)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| v.to_string())
        };
        return ClientCredentials {
            client_id: Some(decode(id)),
            client_secret: Some(decode(secret)),
        };
    }

    ClientCredentials {
        client_id: client_id.map(str::to_string),
        client_secret: client_secret.map(str::to_string),
    }
}

fn redirect_or_error(outcome: Result<String, ProtocolError>) -> Response {
    match outcome {
        Ok(location) => Redirect::to(&location).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Authorization endpoint.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/authorization",
    tag = OAUTH2_TAG,
    operation_id = "OIDC Authorize",
    summary = "Start or resume an authorization request",
    description = "Validates the authorization request, checks the authentication level required by the \
                   client's policy and resolves consent according to the client's consent mode.\n\n\
                   The browser is redirected to the login portal, the consent page, or back to the \
                   client with either an authorization code or an error. `consent_id` resumes a \
                   pending consent session; `request_uri` references a pushed request.",
    params(AuthorizeParams),
    responses(
        (status = 303, description = "Redirect to login, consent, or the client's redirect URI"),
        (status = 400, description = "The request cannot be redirected to the client", body = ProtocolError),
        (status = 401, description = "Unknown client", body = ProtocolError),
    )
)]
pub async fn authorize(
    State(state): State<OAuth2State>,
    Session(session): Session,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    redirect_or_error(state.orchestrator.authorize(params, &session).await)
}

/// Authorization endpoint, form-encoded variant.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/authorization",
    tag = OAUTH2_TAG,
    operation_id = "OIDC Authorize (form)",
    summary = "Start or resume an authorization request (form post)",
    request_body(content = AuthorizeParams, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 303, description = "Redirect to login, consent, or the client's redirect URI"),
        (status = 400, description = "The request cannot be redirected to the client", body = ProtocolError),
    )
)]
pub async fn authorize_form(
    State(state): State<OAuth2State>,
    Session(session): Session,
    Form(params): Form<AuthorizeParams>,
) -> Response {
    redirect_or_error(state.orchestrator.authorize(params, &session).await)
}

/// Pushed authorization request endpoint (RFC 9126).
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/pushed-authorization-request",
    tag = OAUTH2_TAG,
    operation_id = "OIDC Pushed Authorization Request",
    summary = "Push an authorization request",
    description = "Stores an authorization request for a short time and returns a single-use \
                   `request_uri` referencing it. Confidential clients authenticate with \
                   `client_secret_basic` or `client_secret_post`.",
    request_body(content = PushedAuthorizeForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 201, description = "Request stored", body = PushedAuthorizeResponse),
        (status = 400, description = "Invalid request", body = ProtocolError),
        (status = 401, description = "Client authentication failed", body = ProtocolError),
    )
)]
pub async fn pushed_authorization_request(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(form): Form<PushedAuthorizeForm>,
) -> Response {
    let credentials = extract_client_credentials(
        &headers,
        form.params.client_id.as_deref(),
        form.client_secret.as_deref(),
    );
    match state
        .orchestrator
        .pushed_authorize(form.params, &credentials)
        .await
    {
        Ok(response) => (axum::http::StatusCode::CREATED, Json(response)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Device authorization endpoint (RFC 8628), called by the device.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/device-authorization",
    tag = OAUTH2_TAG,
    operation_id = "OIDC Device Authorization",
    summary = "Start a device authorization",
    description = "Issues a device code and a user code. The user enters the user code on a \
                   secondary browser at `verification_uri`.",
    request_body(content = DeviceAuthorizeParams, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Device authorization started", body = DeviceAuthorizeResponse),
        (status = 400, description = "Invalid request", body = ProtocolError),
        (status = 401, description = "Client authentication failed", body = ProtocolError),
    )
)]
pub async fn device_authorization(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(params): Form<DeviceAuthorizeParams>,
) -> Response {
    let credentials = extract_client_credentials(
        &headers,
        params.client_id.as_deref(),
        params.client_secret.as_deref(),
    );
    match state
        .orchestrator
        .device_authorize(params, &credentials)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Device verification, called by the secondary browser.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    put,
    path = "/device-authorization",
    tag = OAUTH2_TAG,
    operation_id = "OIDC Device Pairing",
    summary = "Pair a user code with the current session",
    description = "Pairs the device session identified by `user_code` with a new consent session, \
                   or resumes a pairing by `consent_id`, and resolves consent for it. Returns where \
                   the browser continues when login or consent is still needed.",
    request_body = DevicePairing,
    responses(
        (status = 200, description = "Device approved, or where to continue", body = ContinueResponse),
        (status = 400, description = "Invalid or expired user code", body = ProtocolError),
        (status = 403, description = "Access denied", body = ProtocolError),
    )
)]
pub async fn device_pairing(
    State(state): State<OAuth2State>,
    Session(session): Session,
    Json(pairing): Json<DevicePairing>,
) -> Response {
    match state.orchestrator.device_pair(pairing, &session).await {
        Ok(DeviceOutcome::Approved) => Json(ContinueResponse {
            approved: true,
            redirect_uri: None,
        })
        .into_response(),
        Ok(DeviceOutcome::Redirect(location)) => Json(ContinueResponse {
            approved: false,
            redirect_uri: Some(location),
        })
        .into_response(),
        Err(error) => error.into_response(),
    }
}

/// Consent page details.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/consent",
    tag = OAUTH2_TAG,
    operation_id = "OIDC Consent Details",
    summary = "Describe a pending consent session",
    description = "Returns what the client asks for so the consent page can present it. Only the \
                   subject the session is bound to can read it.",
    params(ConsentQuery),
    responses(
        (status = 200, description = "Pending consent session", body = ConsentDetails),
        (status = 400, description = "Unknown, expired or already answered session", body = ProtocolError),
    )
)]
pub async fn consent_details(
    State(state): State<OAuth2State>,
    Session(session): Session,
    Query(query): Query<ConsentQuery>,
) -> Response {
    match state
        .orchestrator
        .consent_details(query.consent_id, &session)
        .await
    {
        Ok(details) => Json(details).into_response(),
        Err(error) => error.into_response(),
    }
}

/// Record the user's consent decision.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/consent",
    tag = OAUTH2_TAG,
    operation_id = "OIDC Consent Decision",
    summary = "Accept or reject a pending consent session",
    description = "Records the decision and returns where the browser continues: the resumed \
                   authorization request, or the device verification page. Setting \
                   `pre_configure` remembers an approval for identical future requests when the \
                   client supports it.",
    request_body = ConsentDecision,
    responses(
        (status = 200, description = "Decision recorded", body = ContinueResponse),
        (status = 400, description = "Unknown, expired or already answered session", body = ProtocolError),
    )
)]
pub async fn consent_decision(
    State(state): State<OAuth2State>,
    Session(session): Session,
    Json(decision): Json<ConsentDecision>,
) -> Response {
    let approved = decision.consent;
    match state.orchestrator.consent_decision(decision, &session).await {
        Ok(location) => Json(ContinueResponse {
            approved,
            redirect_uri: Some(location),
        })
        .into_response(),
        Err(error) => error.into_response(),
    }
}
