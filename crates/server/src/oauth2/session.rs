//! Reader for the authentication front-end's session.
//!
//! The front-end stores an HS256 JWT in a cookie. Anything missing, expired
//! or forged reads as an anonymous session; the engine then redirects to
//! login rather than failing the request.

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, header, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use time::OffsetDateTime;

use crate::AppResources;
use crate::config::SessionConfig;
use crate::consent::level::AuthenticationLevelSnapshot;
use crate::consent::{AuthenticationSession, UserDetails};
use crate::error::{ErrorCode, ProtocolError};

/// Claims of the session token issued by the authentication front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub exp: usize,
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Unix time of the first factor authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_factor_at: Option<i64>,
    /// Unix time of the second factor authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_factor_at: Option<i64>,
}

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn timestamp(value: Option<i64>) -> Option<OffsetDateTime> {
    value.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

/// Read the authentication session carried by `headers`.
pub fn read_session(
    config: &SessionConfig,
    headers: &HeaderMap,
    remote_ip: Option<IpAddr>,
) -> AuthenticationSession {
    let Some(token) = cookie(headers, &config.cookie_name) else {
        return AuthenticationSession::anonymous(remote_ip);
    };

    let validation = Validation::new(Algorithm::HS256);
    let claims = match decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => data.claims,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring invalid session cookie");
            return AuthenticationSession::anonymous(remote_ip);
        }
    };

    let levels = AuthenticationLevelSnapshot {
        first_factor_at: timestamp(claims.first_factor_at),
        second_factor_at: timestamp(claims.second_factor_at),
    };
    let user = (!claims.username.is_empty()).then(|| UserDetails {
        display_name: claims.display_name,
        emails: claims.emails,
        groups: claims.groups,
        username: claims.username,
    });

    AuthenticationSession {
        user,
        levels,
        remote_ip,
    }
}

/// Extractor yielding the current [`AuthenticationSession`].
pub struct Session(pub AuthenticationSession);

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = ProtocolError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = parts.extensions.get::<AppResources>().ok_or_else(|| {
            tracing::error!("AppResources not found in extensions");
            ProtocolError::new(ErrorCode::ServerError)
        })?;
        let remote_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(Session(read_session(
            &resources.config.session,
            &parts.headers,
            remote_ip,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn config() -> SessionConfig {
        SessionConfig {
            cookie_name: "authn_session".into(),
            secret: SECRET.into(),
        }
    }

    fn token(claims: &SessionClaims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims() -> SessionClaims {
        SessionClaims {
            exp: (OffsetDateTime::now_utc().unix_timestamp() + 600) as usize,
            username: "john".into(),
            display_name: "John Doe".into(),
            emails: vec!["john@example.com".into()],
            groups: vec!["admins".into()],
            first_factor_at: Some(1_700_000_000),
            second_factor_at: None,
        }
    }

    fn headers(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn valid_cookie_yields_user_and_levels() {
        let cookie = format!("theme=dark; authn_session={}", token(&claims(), SECRET));
        let session = read_session(&config(), &headers(&cookie), None);

        assert_eq!(session.username(), Some("john"));
        assert_eq!(session.groups(), ["admins".to_string()]);
        assert!(session.levels.first_factor_at.is_some());
        assert!(session.levels.second_factor_at.is_none());
    }

    #[test]
    fn forged_cookie_is_anonymous() {
        let cookie = format!(
            "authn_session={}",
            token(&claims(), "ffffffffffffffffffffffffffffffff")
        );
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let session = read_session(&config(), &headers(&cookie), Some(ip));

        assert!(session.user.is_none());
        assert_eq!(session.remote_ip, Some(ip));
    }

    #[test]
    fn expired_cookie_is_anonymous() {
        let mut expired = claims();
        expired.exp = 1_000;
        let cookie = format!("authn_session={}", token(&expired, SECRET));
        assert!(read_session(&config(), &headers(&cookie), None).user.is_none());
    }

    #[test]
    fn missing_cookie_is_anonymous() {
        assert!(read_session(&config(), &HeaderMap::new(), None).user.is_none());
    }
}
