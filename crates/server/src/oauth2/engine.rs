//! Bundled protocol engine: authorization code flow, pushed authorization
//! requests and device authorization.
//!
//! Codes are random 256-bit values encoded base64url; only their SHA-256
//! signatures are persisted.

use async_trait::async_trait;
use base64::Engine;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, sea_query::Expr,
};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::LifespanConfig;
use crate::consent::device::{code_signature, user_code_signature};
use crate::consent::protocol::{
    AuthorizeParams, AuthorizeRequest, AuthorizeResponse, ClientCredentials, DeviceAuthorization,
    DeviceAuthorizeParams, DeviceAuthorizeResponse, ErrorRedirect, Grant, ProtocolEngine,
    PushedAuthorizeResponse, Rejection, is_code_flow, split_param,
};
use crate::consent::registry::RegisteredClient;
use crate::consent::{Endpoints, RESPONSE_TYPE_CODE};
use crate::entity::device_code_session::DeviceCodeStatus;
use crate::entity::{authorization_code, device_code_session, join_set, pushed_authorization_request};
use crate::error::{ConsentError, ErrorCode, ProtocolError};

pub const REQUEST_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";

/// Consonants only, so user codes never spell words and survive retyping.
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";
const USER_CODE_LENGTH: usize = 8;
/// Seconds a device should wait between token polls
const DEVICE_POLL_INTERVAL: i64 = 5;

#[derive(Clone)]
pub struct CodeFlowEngine {
    db: Arc<DatabaseConnection>,
    endpoints: Endpoints,
    lifespans: LifespanConfig,
}

impl CodeFlowEngine {
    pub fn new(db: Arc<DatabaseConnection>, endpoints: Endpoints, lifespans: LifespanConfig) -> Self {
        Self {
            db,
            endpoints,
            lifespans,
        }
    }

    /// Replace a `request_uri` by the request it references. Each pushed
    /// request is consumed by the first authorization that uses it.
    async fn resolve_pushed(
        &self,
        client: &RegisteredClient,
        params: AuthorizeParams,
        now: OffsetDateTime,
    ) -> Result<AuthorizeParams, Rejection> {
        let Some(request_uri) = params.request_uri.clone() else {
            return Ok(params);
        };
        let invalid = || {
            Rejection::direct(ConsentError::validation(
                ErrorCode::InvalidRequestUri,
                ErrorCode::InvalidRequestUri.description(),
            ))
        };
        if !request_uri.starts_with(REQUEST_URI_PREFIX) {
            return Err(invalid());
        }

        let pushed = pushed_authorization_request::Entity::find_by_id(request_uri.clone())
            .one(self.db.as_ref())
            .await
            .map_err(|e| Rejection::direct(ConsentError::from(e)))?
            .filter(|p| p.client_id == client.id && !p.used)
            .ok_or_else(invalid)?;
        if pushed.is_expired_at(now) {
            return Err(invalid());
        }

        let consumed = pushed_authorization_request::Entity::update_many()
            .col_expr(pushed_authorization_request::Column::Used, Expr::value(true))
            .filter(pushed_authorization_request::Column::RequestUri.eq(request_uri.as_str()))
            .filter(pushed_authorization_request::Column::Used.eq(false))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| Rejection::direct(ConsentError::from(e)))?;
        if consumed.rows_affected == 0 {
            return Err(invalid());
        }

        let mut stored: AuthorizeParams = serde_urlencoded::from_str(&pushed.form)
            .map_err(|e| Rejection::direct(ConsentError::invalid_request(format!("stored pushed request: {e}"))))?;
        stored.consent_id = params.consent_id;
        tracing::debug!(%request_uri, client_id = %client.id, "Pushed authorization request consumed");
        Ok(stored)
    }

    /// Validate the wire parameters of an authorization request. Errors are
    /// only redirectable once the redirect URI is known to be registered.
    fn validate(
        &self,
        client: &RegisteredClient,
        mut params: AuthorizeParams,
    ) -> Result<AuthorizeRequest, Rejection> {
        if params.client_id.as_deref().is_some_and(|id| id != client.id) {
            return Err(Rejection::direct(ConsentError::invalid_request(
                "The client_id does not match the authenticated client.",
            )));
        }
        params.client_id = Some(client.id.clone());

        let redirect_uri = match params.redirect_uri.as_deref() {
            Some(uri) if client.allows_redirect_uri(uri) => uri.to_string(),
            Some(_) => {
                return Err(Rejection::direct(ConsentError::invalid_request(
                    "The redirect_uri is not registered for this client.",
                )));
            }
            None => match client.redirect_uris.as_slice() {
                [only] => only.clone(),
                _ => {
                    return Err(Rejection::direct(ConsentError::invalid_request(
                        "The redirect_uri is missing.",
                    )));
                }
            },
        };
        let redirect = ErrorRedirect {
            redirect_uri: redirect_uri.clone(),
            state: params.state.clone(),
        };
        let reject = |err: ConsentError| Rejection::redirect(err, redirect.clone());

        let response_types = split_param(params.response_type.as_deref());
        if response_types.is_empty() {
            return Err(reject(ConsentError::invalid_request("The response_type is missing.")));
        }
        if !is_code_flow(&response_types) {
            return Err(reject(ConsentError::validation(
                ErrorCode::UnsupportedResponseType,
                "Only the 'code' response type is supported.",
            )));
        }
        if !client.allows_response_type(RESPONSE_TYPE_CODE) {
            return Err(reject(ConsentError::validation(
                ErrorCode::UnauthorizedClient,
                "The client is not allowed to use the 'code' response type.",
            )));
        }

        let scopes = split_param(params.scope.as_deref());
        let audience = split_param(params.audience.as_deref());
        check_allowed(&scopes, &client.scopes, ErrorCode::InvalidScope, "scope").map_err(reject)?;
        check_allowed(&audience, &client.audience, ErrorCode::InvalidRequest, "audience")
            .map_err(reject)?;

        let max_age = params
            .max_age
            .as_deref()
            .map(|v| v.parse::<u32>().map(|s| Duration::seconds(s.into())))
            .transpose()
            .map_err(|_| reject(ConsentError::invalid_request("The max_age must be a non-negative integer.")))?;
        let consent_id = params
            .consent_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|_| reject(ConsentError::invalid_request("The consent_id is malformed.")))?;

        let code_challenge_method = match (
            params.code_challenge.as_deref(),
            params.code_challenge_method.as_deref(),
        ) {
            (None, None) => None,
            (None, Some(_)) => {
                return Err(reject(ConsentError::invalid_request(
                    "The code_challenge_method requires a code_challenge.",
                )));
            }
            (Some(_), None) => Some("plain".to_string()),
            (Some(_), Some(method @ ("S256" | "plain"))) => Some(method.to_string()),
            (Some(_), Some(_)) => {
                return Err(reject(ConsentError::invalid_request(
                    "The code_challenge_method must be 'S256' or 'plain'.",
                )));
            }
        };

        Ok(AuthorizeRequest {
            client_id: client.id.clone(),
            redirect_uri,
            response_types,
            scopes,
            audience,
            state: params.state.clone(),
            nonce: params.nonce.clone(),
            prompts: split_param(params.prompt.as_deref()),
            max_age,
            claims: params.claims.clone(),
            code_challenge: params.code_challenge.clone(),
            code_challenge_method,
            consent_id,
            form: params.to_form(),
        })
    }
}

#[async_trait]
impl ProtocolEngine for CodeFlowEngine {
    async fn new_authorize_request(
        &self,
        client: &RegisteredClient,
        params: AuthorizeParams,
        now: OffsetDateTime,
    ) -> Result<AuthorizeRequest, Rejection> {
        let params = self.resolve_pushed(client, params, now).await?;
        self.validate(client, params)
    }

    async fn new_pushed_authorize_request(
        &self,
        client: &RegisteredClient,
        params: AuthorizeParams,
        now: OffsetDateTime,
    ) -> Result<PushedAuthorizeResponse, ConsentError> {
        if params.request_uri.is_some() || params.consent_id.is_some() {
            return Err(ConsentError::invalid_request(
                "A pushed request must not reference another request.",
            ));
        }
        let request = self.validate(client, params).map_err(|rejection| rejection.error)?;

        let request_uri = format!("{REQUEST_URI_PREFIX}{}", random_token()?);
        let lifespan = self.lifespans.pushed_request();
        pushed_authorization_request::ActiveModel {
            request_uri: Set(request_uri.clone()),
            client_id: Set(client.id.clone()),
            form: Set(request.form),
            used: Set(false),
            expires_at: Set(now + lifespan),
            created_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await?;

        Ok(PushedAuthorizeResponse {
            request_uri,
            expires_in: lifespan.whole_seconds(),
        })
    }

    async fn new_authorize_response(
        &self,
        request: &AuthorizeRequest,
        grant: &Grant<'_>,
        now: OffsetDateTime,
    ) -> Result<AuthorizeResponse, ConsentError> {
        let code = random_token()?;
        let signature = code_signature(&code);
        let claims = serde_json::to_string(grant.claims).map_err(|e| {
            ConsentError::validation(ErrorCode::ServerError, format!("negotiated claims: {e}"))
        })?;

        authorization_code::ActiveModel {
            signature: Set(signature.clone()),
            challenge_id: Set(grant.session.challenge_id.clone()),
            client_id: Set(request.client_id.clone()),
            subject: Set(grant.subject.to_string()),
            redirect_uri: Set(request.redirect_uri.clone()),
            scope: Set(join_set(grant.scopes())),
            audience: Set(join_set(grant.audience())),
            nonce: Set(request.nonce.clone()),
            claims: Set(claims),
            code_challenge: Set(request.code_challenge.clone()),
            code_challenge_method: Set(request.code_challenge_method.clone()),
            active: Set(true),
            expires_at: Set(now + self.lifespans.authorize_code()),
            created_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await?;

        let mut query = vec![("code", code.as_str())];
        if let Some(state) = request.state.as_deref().filter(|s| !s.is_empty()) {
            query.push(("state", state));
        }
        query.push(("iss", self.endpoints.issuer()));

        tracing::info!(
            target: "audit",
            challenge_id = %grant.session.challenge_id,
            client_id = %request.client_id,
            "Authorization code issued"
        );
        Ok(AuthorizeResponse {
            redirect_to: append_query(&request.redirect_uri, &query)?,
            code_signature: signature,
        })
    }

    async fn revoke_authorize_response(
        &self,
        response: &AuthorizeResponse,
    ) -> Result<(), ConsentError> {
        authorization_code::Entity::update_many()
            .col_expr(authorization_code::Column::Active, Expr::value(false))
            .filter(authorization_code::Column::Signature.eq(response.code_signature.as_str()))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    fn new_device_authorize_request(
        &self,
        client: &RegisteredClient,
        params: &DeviceAuthorizeParams,
        now: OffsetDateTime,
    ) -> Result<DeviceAuthorization, ConsentError> {
        let scopes = split_param(params.scope.as_deref());
        let audience = split_param(params.audience.as_deref());
        check_allowed(&scopes, &client.scopes, ErrorCode::InvalidScope, "scope")?;
        check_allowed(&audience, &client.audience, ErrorCode::InvalidRequest, "audience")?;

        let device_code = random_token()?;
        let user_code = generate_user_code()?;
        let lifespan = self.lifespans.device_code();

        let form = DeviceAuthorizeParams {
            client_id: Some(client.id.clone()),
            ..params.clone()
        }
        .to_form();
        let session = device_code_session::Model {
            id: 0,
            client_id: client.id.clone(),
            device_code_signature: code_signature(&device_code),
            user_code_signature: user_code_signature(&user_code),
            request_id: Uuid::new_v4().to_string(),
            challenge_id: None,
            status: DeviceCodeStatus::New.to_string(),
            active: true,
            revoked: false,
            subject: None,
            scopes: join_set(&scopes),
            audience: join_set(&audience),
            form,
            requested_at: now,
            expires_at: now + lifespan,
        };

        let response = DeviceAuthorizeResponse {
            device_code,
            verification_uri: self.endpoints.device_verification(),
            verification_uri_complete: self.endpoints.device_entry(&user_code),
            user_code,
            expires_in: lifespan.whole_seconds(),
            interval: DEVICE_POLL_INTERVAL,
        };
        Ok(DeviceAuthorization { session, response })
    }

    fn authenticate_client(
        &self,
        client: &RegisteredClient,
        credentials: &ClientCredentials,
    ) -> Result<(), ConsentError> {
        let failed = || ConsentError::validation(ErrorCode::InvalidClient, ErrorCode::InvalidClient.description());
        if credentials.client_id.as_deref() != Some(client.id.as_str()) {
            return Err(failed());
        }
        if client.public {
            return Ok(());
        }
        match credentials.client_secret.as_deref() {
            Some(secret) if client.verify_secret(secret) => Ok(()),
            _ => Err(failed()),
        }
    }

    fn write_error(
        &self,
        redirect: &ErrorRedirect,
        error: &ProtocolError,
    ) -> Result<String, ConsentError> {
        let mut query = vec![("error", error.error.as_str())];
        if let Some(description) = error.error_description.as_deref() {
            query.push(("error_description", description));
        }
        if let Some(state) = error.state.as_deref() {
            query.push(("state", state));
        }
        query.push(("iss", self.endpoints.issuer()));
        append_query(&redirect.redirect_uri, &query)
    }
}

fn check_allowed(
    requested: &[String],
    allowed: &[String],
    code: ErrorCode,
    parameter: &str,
) -> Result<(), ConsentError> {
    match requested.iter().find(|r| !allowed.contains(r)) {
        Some(value) => Err(ConsentError::validation(
            code,
            format!("The {parameter} '{value}' is not allowed for this client."),
        )),
        None => Ok(()),
    }
}

/// `uri` with `pairs` added to its query, ahead of any fragment.
fn append_query(uri: &str, pairs: &[(&str, &str)]) -> Result<String, ConsentError> {
    let mut url = url::Url::parse(uri).map_err(|e| {
        ConsentError::validation(
            ErrorCode::ServerError,
            format!("redirect_uri '{uri}' is not a URL: {e}"),
        )
    })?;
    {
        let mut query = url.query_pairs_mut();
        for (name, value) in pairs {
            query.append_pair(name, value);
        }
    }
    Ok(url.into())
}

fn random_bytes<const N: usize>() -> Result<[u8; N], ConsentError> {
    let mut bytes = [0u8; N];
    getrandom::fill(&mut bytes).map_err(|e| {
        ConsentError::validation(ErrorCode::ServerError, format!("random generator failed: {e}"))
    })?;
    Ok(bytes)
}

fn random_token() -> Result<String, ConsentError> {
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes::<32>()?))
}

/// `XXXX-XXXX` drawn uniformly from [`USER_CODE_ALPHABET`].
fn generate_user_code() -> Result<String, ConsentError> {
    // largest multiple of the alphabet size that fits in a byte
    let limit = 256 - 256 % USER_CODE_ALPHABET.len();
    let mut code = Vec::with_capacity(USER_CODE_LENGTH);
    while code.len() < USER_CODE_LENGTH {
        for byte in random_bytes::<16>()? {
            if (byte as usize) < limit && code.len() < USER_CODE_LENGTH {
                code.push(USER_CODE_ALPHABET[byte as usize % USER_CODE_ALPHABET.len()]);
            }
        }
    }
    let (head, tail) = code.split_at(USER_CODE_LENGTH / 2);
    Ok(format!(
        "{}-{}",
        String::from_utf8_lossy(head),
        String::from_utf8_lossy(tail)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::device::normalize_user_code;

    #[test]
    fn user_codes_use_the_restricted_alphabet() {
        for _ in 0..50 {
            let code = generate_user_code().unwrap();
            assert_eq!(code.len(), USER_CODE_LENGTH + 1);
            assert_eq!(code.as_bytes()[4], b'-');
            let normalized = normalize_user_code(&code);
            assert!(normalized.bytes().all(|b| USER_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let a = random_token().unwrap();
        let b = random_token().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(!a.contains(['+', '/', '=']));
    }

    #[test]
    fn query_is_appended_to_existing_query() {
        assert_eq!(
            append_query("https://app.example.com/cb", &[("code", "a b")]).unwrap(),
            "https://app.example.com/cb?code=a+b"
        );
        assert_eq!(
            append_query("https://app.example.com/cb?x=1", &[("error", "access_denied")]).unwrap(),
            "https://app.example.com/cb?x=1&error=access_denied"
        );
    }

    #[test]
    fn query_is_placed_before_the_fragment() {
        assert_eq!(
            append_query("https://app.example.com/cb#done", &[("error", "access_denied")]).unwrap(),
            "https://app.example.com/cb?error=access_denied#done"
        );
    }

    #[test]
    fn unparseable_redirect_uri_is_a_server_error() {
        let err = append_query("/relative/cb", &[("code", "x")]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerError);
    }

    #[test]
    fn disallowed_scope_is_named() {
        let err = check_allowed(
            &["openid".into(), "admin".into()],
            &["openid".into()],
            ErrorCode::InvalidScope,
            "scope",
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScope);
        assert!(err.to_string().contains("admin"));
    }
}
