//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use config::{Config, File, FileFormat};
use consent_engine::AppResources;
use consent_engine::config::AppConfig;
use consent_engine::consent::level::AuthenticationLevelSnapshot;
use consent_engine::consent::orchestrator::Orchestrator;
use consent_engine::consent::protocol::AuthorizeParams;
use consent_engine::consent::store::{ConsentStore, DbConsentStore};
use consent_engine::consent::{AuthenticationSession, UserDetails};
use consent_engine::entity::consent_session;
use consent_engine::oauth2::OAuth2State;
use consent_engine::oauth2::session::SessionClaims;
use jsonwebtoken::{EncodingKey, Header, encode};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

pub const SESSION_SECRET: &str = "0123456789abcdef0123456789abcdef";

pub const CONFIG: &str = r#"
database_url: "sqlite::memory:"
issuer_url: "https://auth.example.com"
portal_url: "https://login.example.com"
session:
  secret: "0123456789abcdef0123456789abcdef"
clients:
  - id: explicit-app
    name: Explicit App
    secret: explicit-secret
    redirect_uris: ["https://app.example.com/cb"]
    scopes: [openid, profile, email, groups, offline_access]
    consent_mode: explicit
    authorization_policy:
      default_policy: one_factor
  - id: implicit-app
    secret: implicit-secret
    redirect_uris: ["https://implicit.example.com/cb"]
    scopes: [openid, profile, email, groups, offline_access]
    consent_mode: implicit
    authorization_policy:
      default_policy: one_factor
  - id: remembered-app
    secret: remembered-secret
    redirect_uris: ["https://remembered.example.com/cb"]
    consent_mode: pre-configured
    pre_configured_consent_duration: 3600
    authorization_policy:
      default_policy: one_factor
  - id: strict-app
    secret: strict-secret
    redirect_uris: ["https://strict.example.com/cb"]
    consent_mode: implicit
    authorization_policy:
      default_policy: two_factor
      rules:
        - policy: deny
          subject: ["group:contractors"]
  - id: tv
    public: true
    grant_types: ["urn:ietf:params:oauth:grant-type:device_code"]
    response_types: []
    consent_mode: explicit
    authorization_policy:
      default_policy: one_factor
"#;

pub fn test_config() -> AppConfig {
    let cfg = Config::builder()
        .add_source(File::from_str(CONFIG, FileFormat::Yaml))
        .build()
        .expect("build config");
    let config: AppConfig = cfg.try_deserialize().expect("deserialize config");
    config.validate().expect("valid config");
    config
}

/// In-memory SQLite database with every migration applied.
pub async fn test_db() -> Arc<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await.expect("connect");
    Migrator::up(&db, None).await.expect("migrate");
    Arc::new(db)
}

pub fn test_store(db: Arc<DatabaseConnection>) -> DbConsentStore {
    DbConsentStore::new(db, std::time::Duration::from_secs(5))
}

pub struct Harness {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub state: OAuth2State,
}

impl Harness {
    pub async fn new() -> Self {
        let db = test_db().await;
        let config = Arc::new(test_config());
        let state = OAuth2State::new(db.clone(), &config);
        Self { db, config, state }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.state.orchestrator
    }

    pub fn store(&self) -> &dyn ConsentStore {
        self.state.store()
    }

    pub fn resources(&self) -> AppResources {
        AppResources {
            db: self.db.clone(),
            config: self.config.clone(),
        }
    }

    pub async fn consent_session(&self, challenge_id: Uuid) -> consent_session::Model {
        self.store()
            .load_consent_session(challenge_id)
            .await
            .expect("load consent session")
            .expect("consent session exists")
    }
}

pub fn anonymous() -> AuthenticationSession {
    AuthenticationSession::anonymous(Some("192.0.2.10".parse().expect("ip")))
}

/// A session authenticated a minute ago with `factors` factors.
pub fn user_session(username: &str, factors: usize) -> AuthenticationSession {
    user_in_groups(username, factors, &[])
}

pub fn user_in_groups(username: &str, factors: usize, groups: &[&str]) -> AuthenticationSession {
    let at = OffsetDateTime::now_utc() - Duration::minutes(1);
    AuthenticationSession {
        user: Some(UserDetails {
            username: username.to_string(),
            display_name: format!("{username} example"),
            emails: vec![format!("{username}@example.com")],
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }),
        levels: AuthenticationLevelSnapshot {
            first_factor_at: Some(at),
            second_factor_at: (factors > 1).then_some(at),
        },
        remote_ip: Some("192.0.2.10".parse().expect("ip")),
    }
}

/// Session cookie as the authentication portal would set it.
pub fn session_cookie(username: &str) -> String {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let claims = SessionClaims {
        exp: (now + 600) as usize,
        username: username.to_string(),
        display_name: format!("{username} example"),
        emails: vec![format!("{username}@example.com")],
        groups: vec![],
        first_factor_at: Some(now - 60),
        second_factor_at: None,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SESSION_SECRET.as_bytes()),
    )
    .expect("encode session");
    format!("authn_session={token}")
}

pub fn authorize_params(client_id: &str, redirect_uri: &str, scope: &str) -> AuthorizeParams {
    AuthorizeParams {
        response_type: Some("code".into()),
        client_id: Some(client_id.into()),
        redirect_uri: Some(redirect_uri.into()),
        scope: Some(scope.into()),
        state: Some("xyz".into()),
        nonce: Some("n-0S6_WzA2Mj".into()),
        ..Default::default()
    }
}

pub fn resume(params: &AuthorizeParams, challenge_id: Uuid) -> AuthorizeParams {
    AuthorizeParams {
        consent_id: Some(challenge_id.to_string()),
        ..params.clone()
    }
}

/// Challenge id carried by a (possibly nested, encoded) continuation URL.
pub fn consent_id_in(url: &str) -> Uuid {
    let decoded = urlencoding::decode(url).expect("decode url").into_owned();
    let start = decoded.find("consent_id=").expect("consent_id in url") + "consent_id=".len();
    Uuid::parse_str(&decoded[start..start + 36]).expect("uuid")
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    pairs.into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

pub fn pending_session(client_id: &str, now: OffsetDateTime) -> consent_session::Model {
    consent_session::Model {
        challenge_id: Uuid::new_v4().to_string(),
        client_id: client_id.to_string(),
        subject: None,
        requested_scopes: "openid profile".into(),
        requested_audience: String::new(),
        granted_scopes: String::new(),
        granted_audience: String::new(),
        granted_claims: String::new(),
        form: format!("client_id={client_id}"),
        requested_at: now,
        responded_at: None,
        expires_at: now + Duration::minutes(10),
        granted: false,
        authorized: false,
        preconfiguration_id: None,
    }
}
