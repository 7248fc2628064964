//! Client registry.
//!
//! Turns the configured clients into [`RegisteredClient`]s once at startup:
//! consent mode `auto` is resolved, authorization policies are compiled and
//! the pairwise sector is derived from the sector identifier URI.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use time::Duration;

use crate::config::{ClientConfig, ConsentModeConfig};
use crate::consent::claims::ClaimsPolicy;
use crate::consent::level::AuthorizationPolicy;

pub const GRANT_TYPE_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Consent mode after `auto` has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentMode {
    Explicit,
    Implicit,
    PreConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentPolicy {
    pub mode: ConsentMode,
    /// Lifetime of remembered decisions; only meaningful for pre-configured
    pub duration: Option<Duration>,
}

impl ConsentPolicy {
    fn from_config(mode: ConsentModeConfig, duration: Option<u64>) -> Self {
        let duration = duration.map(|secs| Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)));
        let mode = match mode {
            ConsentModeConfig::Explicit => ConsentMode::Explicit,
            ConsentModeConfig::Implicit => ConsentMode::Implicit,
            ConsentModeConfig::PreConfigured => ConsentMode::PreConfigured,
            ConsentModeConfig::Auto if duration.is_some() => ConsentMode::PreConfigured,
            ConsentModeConfig::Auto => ConsentMode::Explicit,
        };
        Self { mode, duration }
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub id: String,
    pub name: String,
    secret: Option<String>,
    pub public: bool,
    pub redirect_uris: Vec<String>,
    pub response_types: Vec<String>,
    pub grant_types: Vec<String>,
    /// Scopes the client may be granted
    pub scopes: Vec<String>,
    /// Audiences the client may be granted
    pub audience: Vec<String>,
    pub consent: ConsentPolicy,
    pub authorization_policy: AuthorizationPolicy,
    pub claims_policy: ClaimsPolicy,
    /// Pairwise sector; empty when the client has no sector identifier
    pub sector_id: String,
}

impl RegisteredClient {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            secret: config.secret.clone(),
            public: config.public,
            redirect_uris: config.redirect_uris.clone(),
            response_types: config.response_types.clone(),
            grant_types: config.grant_types.clone(),
            scopes: config.scopes.clone(),
            audience: config.audience.clone(),
            consent: ConsentPolicy::from_config(
                config.consent_mode,
                config.pre_configured_consent_duration,
            ),
            authorization_policy: AuthorizationPolicy::from(&config.authorization_policy),
            claims_policy: config.claims_policy.clone(),
            sector_id: config
                .sector_identifier_uri
                .as_deref()
                .and_then(sector_host)
                .unwrap_or_default(),
        }
    }

    pub fn allows_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == uri)
    }

    pub fn allows_response_type(&self, response_type: &str) -> bool {
        self.response_types.iter().any(|r| r == response_type)
    }

    pub fn allows_grant_type(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    /// Check a presented secret. Public clients never authenticate with one.
    pub fn verify_secret(&self, presented: &str) -> bool {
        match (&self.secret, self.public) {
            (Some(secret), false) => {
                // compare digests so timing does not depend on the common prefix
                Sha256::digest(secret.as_bytes()) == Sha256::digest(presented.as_bytes())
            }
            _ => false,
        }
    }
}

/// Host part of a sector identifier URI.
pub fn sector_host(uri: &str) -> Option<String> {
    let url = url::Url::parse(uri).ok()?;
    match url.host()? {
        url::Host::Domain(domain) => Some(domain.to_ascii_lowercase()),
        url::Host::Ipv4(addr) => Some(addr.to_string()),
        url::Host::Ipv6(addr) => Some(addr.to_string()),
    }
}

/// Lookup of registered clients by id.
pub trait ClientRegistry: Send + Sync {
    fn get_registered_client(&self, id: &str) -> Option<Arc<RegisteredClient>>;
}

/// Registry backed by the static client list from configuration.
#[derive(Debug, Default, Clone)]
pub struct ConfigClientRegistry {
    clients: HashMap<String, Arc<RegisteredClient>>,
}

impl ConfigClientRegistry {
    pub fn new(configs: &[ClientConfig]) -> Self {
        let clients = configs
            .iter()
            .map(|c| (c.id.clone(), Arc::new(RegisteredClient::from_config(c))))
            .collect();
        Self { clients }
    }
}

impl ClientRegistry for ConfigClientRegistry {
    fn get_registered_client(&self, id: &str) -> Option<Arc<RegisteredClient>> {
        self.clients.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};

    fn client(yaml: &str) -> ClientConfig {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn auto_mode_resolves_by_duration() {
        let remembered = RegisteredClient::from_config(&client(
            "id: a\npublic: true\npre_configured_consent_duration: 600\n",
        ));
        assert_eq!(remembered.consent.mode, ConsentMode::PreConfigured);
        assert_eq!(remembered.consent.duration, Some(Duration::seconds(600)));

        let plain = RegisteredClient::from_config(&client("id: b\npublic: true\n"));
        assert_eq!(plain.consent.mode, ConsentMode::Explicit);
    }

    #[test]
    fn explicit_mode_is_kept() {
        let c = RegisteredClient::from_config(&client(
            "id: a\npublic: true\nconsent_mode: implicit\npre_configured_consent_duration: 600\n",
        ));
        assert_eq!(c.consent.mode, ConsentMode::Implicit);
    }

    #[test]
    fn sector_is_host_of_identifier_uri() {
        assert_eq!(
            sector_host("https://Sector.Example.com/path.json").as_deref(),
            Some("sector.example.com")
        );
        assert_eq!(
            sector_host("https://user@example.com:8443/x?a=b#c").as_deref(),
            Some("example.com")
        );
        assert_eq!(sector_host("https://[::1]:8443/x").as_deref(), Some("::1"));
        assert_eq!(sector_host("not a uri"), None);

        let c = RegisteredClient::from_config(&client(
            "id: a\npublic: true\nsector_identifier_uri: https://apps.example.com/sector.json\n",
        ));
        assert_eq!(c.sector_id, "apps.example.com");
    }

    #[test]
    fn public_clients_never_verify_secrets() {
        let public = RegisteredClient::from_config(&client("id: a\npublic: true\nsecret: s\n"));
        assert!(!public.verify_secret("s"));

        let confidential = RegisteredClient::from_config(&client("id: b\nsecret: s3cret\n"));
        assert!(confidential.verify_secret("s3cret"));
        assert!(!confidential.verify_secret("s3cre"));
    }

    #[test]
    fn registry_lookup() {
        let registry = ConfigClientRegistry::new(&[client("id: app\npublic: true\n")]);
        assert!(registry.get_registered_client("app").is_some());
        assert!(registry.get_registered_client("other").is_none());
    }
}
