//! Seam to the OAuth 2.0 / OpenID Connect wire protocol.
//!
//! The orchestrator only talks to the protocol through [`ProtocolEngine`]:
//! request parsing, authorization/device response construction and error
//! responses. The bundled implementation lives in `oauth2::engine`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::consent::claims::{ClaimsRequest, NegotiatedClaims};
use crate::consent::level::Freshness;
use crate::consent::registry::RegisteredClient;
use crate::consent::{ConsentRequest, Flow, RESPONSE_TYPE_CODE, UserDetails};
use crate::entity::{consent_session, device_code_session, split_set};
use crate::error::{ConsentError, ProtocolError};

/// Authorization request parameters as received on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    /// JSON encoded OpenID Connect claims request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    /// Reference to a pushed authorization request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_uri: Option<String>,
    /// Challenge id of the consent session this request resumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent_id: Option<String>,
}

impl AuthorizeParams {
    /// Form persisted as the continuation; never carries the challenge id.
    pub fn to_form(&self) -> String {
        let mut form = self.clone();
        form.consent_id = None;
        form.request_uri = None;
        serde_urlencoded::to_string(&form).unwrap_or_default()
    }
}

/// A validated authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_types: Vec<String>,
    pub scopes: Vec<String>,
    pub audience: Vec<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub prompts: Vec<String>,
    pub max_age: Option<Duration>,
    /// Raw `claims` parameter; parsed by the claims negotiator
    pub claims: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub consent_id: Option<Uuid>,
    pub form: String,
}

impl AuthorizeRequest {
    pub fn has_prompt(&self, prompt: &str) -> bool {
        self.prompts.iter().any(|p| p == prompt)
    }

    pub fn freshness(&self) -> Freshness {
        Freshness {
            prompt_login: self.has_prompt("login"),
            max_age: self.max_age,
        }
    }

    pub fn error_redirect(&self) -> ErrorRedirect {
        ErrorRedirect {
            redirect_uri: self.redirect_uri.clone(),
            state: self.state.clone(),
        }
    }

    pub fn consent_request(&self, claims: Option<ClaimsRequest>) -> ConsentRequest {
        ConsentRequest {
            flow: Flow::Authorization,
            client_id: self.client_id.clone(),
            scopes: self.scopes.clone(),
            audience: self.audience.clone(),
            response_types: self.response_types.clone(),
            prompts: self.prompts.clone(),
            freshness: self.freshness(),
            claims,
            form: self.form.clone(),
        }
    }
}

/// Device authorization request parameters (RFC 8628 section 3.1).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceAuthorizeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<String>,
}

impl DeviceAuthorizeParams {
    pub fn to_form(&self) -> String {
        let mut form = self.clone();
        form.client_secret = None;
        serde_urlencoded::to_string(&form).unwrap_or_default()
    }

    /// Rebuild the consent request from a persisted device session.
    pub fn consent_request(
        session: &device_code_session::Model,
    ) -> Result<ConsentRequest, ConsentError> {
        let params: DeviceAuthorizeParams = serde_urlencoded::from_str(&session.form)
            .map_err(|e| ConsentError::invalid_request(format!("stored device form: {e}")))?;
        let claims = params
            .claims
            .as_deref()
            .map(ClaimsRequest::parse)
            .transpose()?;
        Ok(ConsentRequest {
            flow: Flow::Device,
            client_id: session.client_id.clone(),
            scopes: session.scopes_list(),
            audience: session.audience_list(),
            response_types: Vec::new(),
            prompts: Vec::new(),
            freshness: Freshness::default(),
            claims,
            form: session.form.clone(),
        })
    }
}

/// Device authorization response (RFC 8628 section 3.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceAuthorizeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: i64,
}

/// A device authorization that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub session: device_code_session::Model,
    pub response: DeviceAuthorizeResponse,
}

/// Pushed authorization response (RFC 9126 section 2.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PushedAuthorizeResponse {
    pub request_uri: String,
    pub expires_in: i64,
}

/// Client credentials presented at the back-channel endpoints.
#[derive(Debug, Clone, Default)]
pub struct ClientCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Where an authorization error may be delivered by redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRedirect {
    pub redirect_uri: String,
    pub state: Option<String>,
}

/// A rejected authorization request.
#[derive(Debug)]
pub struct Rejection {
    pub error: ConsentError,
    /// `None` until the client and redirect URI have been validated
    pub redirect: Option<ErrorRedirect>,
}

impl Rejection {
    pub fn direct(error: impl Into<ConsentError>) -> Self {
        Self {
            error: error.into(),
            redirect: None,
        }
    }

    pub fn redirect(error: impl Into<ConsentError>, redirect: ErrorRedirect) -> Self {
        Self {
            error: error.into(),
            redirect: Some(redirect),
        }
    }
}

/// Everything the engine needs to mint an authorization response.
#[derive(Debug)]
pub struct Grant<'a> {
    pub session: &'a consent_session::Model,
    pub subject: Uuid,
    pub claims: &'a NegotiatedClaims,
    pub user: &'a UserDetails,
    pub auth_time: Option<OffsetDateTime>,
}

impl Grant<'_> {
    pub fn scopes(&self) -> Vec<String> {
        self.session.granted_scopes_list()
    }

    pub fn audience(&self) -> Vec<String> {
        self.session.granted_audience_list()
    }
}

/// A constructed authorization response.
#[derive(Debug, Clone)]
pub struct AuthorizeResponse {
    pub redirect_to: String,
    /// Signature of the issued code, used to revoke it if the grant is not
    /// committed
    pub code_signature: String,
}

#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Validate an authorization request, resolving `request_uri` if given.
    async fn new_authorize_request(
        &self,
        client: &RegisteredClient,
        params: AuthorizeParams,
        now: OffsetDateTime,
    ) -> Result<AuthorizeRequest, Rejection>;

    /// Persist a pushed authorization request.
    async fn new_pushed_authorize_request(
        &self,
        client: &RegisteredClient,
        params: AuthorizeParams,
        now: OffsetDateTime,
    ) -> Result<PushedAuthorizeResponse, ConsentError>;

    /// Construct the authorization response for a granted session.
    async fn new_authorize_response(
        &self,
        request: &AuthorizeRequest,
        grant: &Grant<'_>,
        now: OffsetDateTime,
    ) -> Result<AuthorizeResponse, ConsentError>;

    /// Invalidate a response whose grant could not be committed.
    async fn revoke_authorize_response(
        &self,
        response: &AuthorizeResponse,
    ) -> Result<(), ConsentError>;

    /// Generate device and user codes for a device authorization request.
    fn new_device_authorize_request(
        &self,
        client: &RegisteredClient,
        params: &DeviceAuthorizeParams,
        now: OffsetDateTime,
    ) -> Result<DeviceAuthorization, ConsentError>;

    fn authenticate_client(
        &self,
        client: &RegisteredClient,
        credentials: &ClientCredentials,
    ) -> Result<(), ConsentError>;

    /// Location of an error redirect to the client.
    fn write_error(
        &self,
        redirect: &ErrorRedirect,
        error: &ProtocolError,
    ) -> Result<String, ConsentError>;
}

/// Split a space separated request parameter.
pub fn split_param(value: Option<&str>) -> Vec<String> {
    value.map(split_set).unwrap_or_default()
}

pub fn is_code_flow(response_types: &[String]) -> bool {
    response_types.len() == 1 && response_types[0] == RESPONSE_TYPE_CODE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_drops_continuation_parameters() {
        let params = AuthorizeParams {
            client_id: Some("app".into()),
            scope: Some("openid profile".into()),
            consent_id: Some(Uuid::new_v4().to_string()),
            request_uri: Some("urn:ietf:params:oauth:request_uri:x".into()),
            ..Default::default()
        };
        let form = params.to_form();
        assert_eq!(form, "client_id=app&scope=openid+profile");

        let back: AuthorizeParams = serde_urlencoded::from_str(&form).unwrap();
        assert_eq!(back.scope.as_deref(), Some("openid profile"));
        assert!(back.consent_id.is_none());
    }

    #[test]
    fn device_form_never_keeps_the_secret() {
        let params = DeviceAuthorizeParams {
            client_id: Some("tv".into()),
            client_secret: Some("hunter2".into()),
            scope: Some("openid".into()),
            ..Default::default()
        };
        assert!(!params.to_form().contains("hunter2"));
    }
}
