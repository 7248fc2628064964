//! Error taxonomy for the consent engine.
//!
//! Every failure is classified as a validation, consent-state, storage or
//! security error, and each maps onto exactly one OAuth 2.0 / OpenID Connect
//! error code so responses stay protocol-shaped.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use utoipa::ToSchema;

/// OAuth 2.0 and OpenID Connect error codes written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidClient,
    UnauthorizedClient,
    AccessDenied,
    UnsupportedResponseType,
    InvalidScope,
    ServerError,
    LoginRequired,
    ConsentRequired,
    InvalidRequestUri,
    ExpiredToken,
    InvalidGrant,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidClient => "invalid_client",
            ErrorCode::UnauthorizedClient => "unauthorized_client",
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::UnsupportedResponseType => "unsupported_response_type",
            ErrorCode::InvalidScope => "invalid_scope",
            ErrorCode::ServerError => "server_error",
            ErrorCode::LoginRequired => "login_required",
            ErrorCode::ConsentRequired => "consent_required",
            ErrorCode::InvalidRequestUri => "invalid_request_uri",
            ErrorCode::ExpiredToken => "expired_token",
            ErrorCode::InvalidGrant => "invalid_grant",
        }
    }

    /// Status used when the error is written as JSON rather than redirected.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidClient => StatusCode::UNAUTHORIZED,
            ErrorCode::AccessDenied | ErrorCode::UnauthorizedClient => StatusCode::FORBIDDEN,
            ErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Generic description; never discloses which record failed to match.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => {
                "The request is missing a required parameter, includes an invalid parameter value, or is otherwise malformed."
            }
            ErrorCode::InvalidClient => "Client authentication failed.",
            ErrorCode::UnauthorizedClient => {
                "The client is not authorized to request an authorization code using this method."
            }
            ErrorCode::AccessDenied => {
                "The resource owner or authorization server denied the request."
            }
            ErrorCode::UnsupportedResponseType => {
                "The authorization server does not support obtaining a token using this method."
            }
            ErrorCode::InvalidScope => "The requested scope is invalid, unknown, or malformed.",
            ErrorCode::ServerError => {
                "The authorization server encountered an unexpected condition that prevented it from fulfilling the request."
            }
            ErrorCode::LoginRequired => "The authorization server requires end-user authentication.",
            ErrorCode::ConsentRequired => "The authorization server requires end-user consent.",
            ErrorCode::InvalidRequestUri => "The request_uri is invalid or has expired.",
            ErrorCode::ExpiredToken => "The code has expired.",
            ErrorCode::InvalidGrant => "The provided authorization grant is invalid.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-shaped error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProtocolError {
    pub error: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl ProtocolError {
    pub fn new(error: ErrorCode) -> Self {
        Self {
            error,
            error_description: Some(error.description().to_string()),
            state: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }

    pub fn with_state(mut self, state: Option<String>) -> Self {
        self.state = state.filter(|s| !s.is_empty());
        self
    }
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        (self.error.status(), Json(self)).into_response()
    }
}

/// Failures of the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("storage call exceeded {0:?}")]
    Timeout(std::time::Duration),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

/// Consent session state that forbids the requested transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsentStateError {
    #[error("consent session not found")]
    NotFound,
    #[error("challenge id is the nil UUID")]
    ZeroChallenge,
    #[error("consent session belongs to another client")]
    ClientMismatch,
    #[error("consent session is bound to another subject")]
    SubjectMismatch,
    #[error("consent session has expired")]
    Expired,
    #[error("consent session was already responded to")]
    AlreadyResponded,
    #[error("consent session was already granted")]
    AlreadyGranted,
    #[error("device code session is not pending")]
    DeviceNotPending,
    #[error("device code session has expired")]
    DeviceExpired,
}

/// Conditions treated as potential attacks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecurityViolation {
    #[error("claims request asserts issuer '{requested}'")]
    IssuerMismatch { requested: String },
    #[error("claims request asserts a different subject")]
    SubjectMismatch,
    #[error("device code session is already paired")]
    DeviceAlreadyPaired,
    #[error("device code session belongs to another client")]
    DeviceClientMismatch,
    #[error("user code does not match any device session")]
    UnknownUserCode,
}

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("validation failed: {message}")]
    Validation { code: ErrorCode, message: String },
    #[error(transparent)]
    State(#[from] ConsentStateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("security violation: {0}")]
    Security(#[from] SecurityViolation),
    #[error("the end-user denied the request")]
    AccessDenied,
    #[error("interactive consent required but prompt=none was requested")]
    ConsentRequired,
    #[error("interactive login required but prompt=none was requested")]
    LoginRequired,
}

impl From<sea_orm::DbErr> for ConsentError {
    fn from(err: sea_orm::DbErr) -> Self {
        ConsentError::Storage(StorageError::Db(err))
    }
}

impl ConsentError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        ConsentError::Validation {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn validation(code: ErrorCode, message: impl Into<String>) -> Self {
        ConsentError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ConsentError::Validation { code, .. } => *code,
            ConsentError::State(ConsentStateError::DeviceExpired) => ErrorCode::ExpiredToken,
            ConsentError::State(ConsentStateError::DeviceNotPending) => ErrorCode::InvalidGrant,
            ConsentError::State(_) => ErrorCode::InvalidRequest,
            ConsentError::Storage(_) => ErrorCode::ServerError,
            ConsentError::Security(SecurityViolation::UnknownUserCode)
            | ConsentError::Security(SecurityViolation::DeviceAlreadyPaired)
            | ConsentError::Security(SecurityViolation::DeviceClientMismatch) => {
                ErrorCode::InvalidGrant
            }
            ConsentError::Security(_) | ConsentError::AccessDenied => ErrorCode::AccessDenied,
            ConsentError::ConsentRequired => ErrorCode::ConsentRequired,
            ConsentError::LoginRequired => ErrorCode::LoginRequired,
        }
    }

    /// The wire error. Only validation messages are echoed back; every other
    /// class gets the generic description of its code.
    pub fn to_protocol(&self) -> ProtocolError {
        let error = ProtocolError::new(self.code());
        match self {
            ConsentError::Validation { message, .. } => error.with_description(message.clone()),
            _ => error,
        }
    }

    /// Emit the error at the severity of its class.
    pub fn log(&self, client_id: &str) {
        match self {
            ConsentError::Validation { .. } => {
                tracing::debug!(client_id, error = %self, "Request validation failed");
            }
            ConsentError::State(_) => {
                tracing::warn!(target: "audit", client_id, error = %self, "Consent state rejected the request");
            }
            ConsentError::Storage(_) => {
                tracing::error!(client_id, error = %self, "Consent store failure");
            }
            ConsentError::Security(_) => {
                tracing::error!(target: "audit", client_id, error = %self, "Security violation");
            }
            ConsentError::AccessDenied
            | ConsentError::ConsentRequired
            | ConsentError::LoginRequired => {
                tracing::info!(target: "audit", client_id, error = %self, "Authorization refused");
            }
        }
    }
}
