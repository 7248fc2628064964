use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

use crate::consent::claims::ClaimsPolicy;
use crate::consent::level::PolicyLevel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Issuer identifier, also the base URL of the OIDC endpoints
    pub issuer_url: String,
    /// Base URL of the authentication portal hosting the login and consent UI
    pub portal_url: String,
    pub session: SessionConfig,
    #[serde(default)]
    pub lifespans: LifespanConfig,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// How the authentication front-end's session is read.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// HS256 secret shared with the authentication front-end
    pub secret: String,
}

/// Lifetimes in seconds.
#[derive(Clone, Debug, Deserialize)]
pub struct LifespanConfig {
    #[serde(default = "default_consent_lifespan")]
    pub consent: u64,
    #[serde(default = "default_device_consent_lifespan")]
    pub device_consent: u64,
    #[serde(default = "default_device_code_lifespan")]
    pub device_code: u64,
    #[serde(default = "default_authorize_code_lifespan")]
    pub authorize_code: u64,
    #[serde(default = "default_pushed_request_lifespan")]
    pub pushed_request: u64,
    #[serde(default = "default_storage_timeout")]
    pub storage_timeout: u64,
    #[serde(default = "default_purge_interval")]
    pub purge_interval: u64,
}

impl Default for LifespanConfig {
    fn default() -> Self {
        Self {
            consent: default_consent_lifespan(),
            device_consent: default_device_consent_lifespan(),
            device_code: default_device_code_lifespan(),
            authorize_code: default_authorize_code_lifespan(),
            pushed_request: default_pushed_request_lifespan(),
            storage_timeout: default_storage_timeout(),
            purge_interval: default_purge_interval(),
        }
    }
}

impl LifespanConfig {
    pub fn consent(&self) -> time::Duration {
        seconds(self.consent)
    }

    pub fn device_consent(&self) -> time::Duration {
        seconds(self.device_consent)
    }

    pub fn device_code(&self) -> time::Duration {
        seconds(self.device_code)
    }

    pub fn authorize_code(&self) -> time::Duration {
        seconds(self.authorize_code)
    }

    pub fn pushed_request(&self) -> time::Duration {
        seconds(self.pushed_request)
    }

    pub fn storage_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.storage_timeout)
    }

    pub fn purge_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.purge_interval)
    }
}

fn seconds(value: u64) -> time::Duration {
    time::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

/// A registered OpenID Connect client.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Client secret (None for public clients)
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub audience: Vec<String>,
    #[serde(default)]
    pub consent_mode: ConsentModeConfig,
    /// Seconds a remembered consent stays valid; enables pre-configured consent
    #[serde(default)]
    pub pre_configured_consent_duration: Option<u64>,
    #[serde(default)]
    pub authorization_policy: AuthorizationPolicyConfig,
    #[serde(default)]
    pub sector_identifier_uri: Option<String>,
    #[serde(default)]
    pub claims_policy: ClaimsPolicy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsentModeConfig {
    #[default]
    Auto,
    Explicit,
    Implicit,
    PreConfigured,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthorizationPolicyConfig {
    #[serde(default = "default_policy_level")]
    pub default_policy: PolicyLevel,
    #[serde(default)]
    pub rules: Vec<PolicyRuleConfig>,
}

impl Default for AuthorizationPolicyConfig {
    fn default() -> Self {
        Self {
            default_policy: default_policy_level(),
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PolicyRuleConfig {
    pub policy: PolicyLevel,
    /// `user:<name>` or `group:<name>`; empty matches everyone
    #[serde(default)]
    pub subject: Vec<String>,
    /// CIDR networks; empty matches every origin
    #[serde(default)]
    pub networks: Vec<IpNet>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNet {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(a) & mask) == (u32::from(*b) & mask)
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let a_bytes = a.octets();
                let b_bytes = b.octets();
                let full_bytes = (self.prefix / 8) as usize;
                let rem_bits = self.prefix % 8;
                if full_bytes > 16 {
                    return false;
                }
                if a_bytes[..full_bytes] != b_bytes[..full_bytes] {
                    return false;
                }
                if rem_bits == 0 {
                    return true;
                }
                let mask = (!0u8) << (8 - rem_bits);
                (a_bytes[full_bytes] & mask) == (b_bytes[full_bytes] & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpNet {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A bare address is a single-host network
        let (ip_part, prefix_part) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };
        let addr = IpAddr::from_str(ip_part).map_err(|e| format!("Invalid IP: {e}"))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix: u8 = match prefix_part {
            Some(p) => p.parse().map_err(|e| format!("Invalid prefix: {e}"))?,
            None => max,
        };
        if prefix > max {
            return Err("Prefix out of range".into());
        }
        Ok(IpNet { addr, prefix })
    }
}

impl TryFrom<String> for IpNet {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_cookie_name() -> String {
    "authn_session".to_string()
}

fn default_consent_lifespan() -> u64 {
    600
}

fn default_device_consent_lifespan() -> u64 {
    300
}

fn default_device_code_lifespan() -> u64 {
    600
}

fn default_authorize_code_lifespan() -> u64 {
    60
}

fn default_pushed_request_lifespan() -> u64 {
    90
}

fn default_storage_timeout() -> u64 {
    5
}

fn default_purge_interval() -> u64 {
    300
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".to_string()]
}

fn default_scopes() -> Vec<String> {
    ["openid", "profile", "email", "groups"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_policy_level() -> PolicyLevel {
    PolicyLevel::TwoFactor
}

impl AppConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.secret.len() < 32 {
            return Err(ConfigError::Validation(
                "session.secret must be at least 32 characters".into(),
            ));
        }
        if self.clients.is_empty() {
            return Err(ConfigError::Validation(
                "at least one client must be configured".into(),
            ));
        }
        if self.lifespans.consent == 0 || self.lifespans.device_consent == 0 {
            return Err(ConfigError::Validation(
                "consent lifespans must be greater than zero".into(),
            ));
        }
        if self.lifespans.device_consent > self.lifespans.consent {
            return Err(ConfigError::Validation(
                "lifespans.device_consent must not exceed lifespans.consent".into(),
            ));
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            if client.id.is_empty() {
                return Err(ConfigError::Validation("client id must not be empty".into()));
            }
            if !seen.insert(client.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate client id '{}'",
                    client.id
                )));
            }
            if !client.public && client.secret.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::Validation(format!(
                    "client '{}' is confidential but has no secret",
                    client.id
                )));
            }
            if client.consent_mode == ConsentModeConfig::PreConfigured
                && client.pre_configured_consent_duration.is_none()
            {
                return Err(ConfigError::Validation(format!(
                    "client '{}' uses pre-configured consent without a duration",
                    client.id
                )));
            }
            for uri in &client.redirect_uris {
                match url::Url::parse(uri) {
                    Ok(parsed) if parsed.fragment().is_none() => {}
                    _ => {
                        return Err(ConfigError::Validation(format!(
                            "client '{}' has redirect URI '{uri}' that is not an absolute URI without a fragment",
                            client.id
                        )));
                    }
                }
            }
            if let Some(uri) = client.sector_identifier_uri.as_deref()
                && crate::consent::registry::sector_host(uri).is_none()
            {
                return Err(ConfigError::Validation(format!(
                    "client '{}' has sector identifier URI '{uri}' without a host",
                    client.id
                )));
            }
            for rule in &client.authorization_policy.rules {
                for subject in &rule.subject {
                    if !(subject.starts_with("user:") || subject.starts_with("group:")) {
                        return Err(ConfigError::Validation(format!(
                            "client '{}' has an invalid policy subject '{subject}'",
                            client.id
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any environment variable matching the key path separated by double
/// underscores (e.g. `SESSION__SECRET`) overrides the file value. A `.env`
/// file is read first when present.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};

    let _ = dotenvy::dotenv();

    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml"))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;

    Ok(app)
}
