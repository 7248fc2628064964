//! Consent and authorization decision core.
//!
//! The orchestrator sequences the authentication level gate, the client's
//! consent mode resolver and the claims negotiator for every protocol leg,
//! and hands granted sessions to the protocol engine. All cross-request state
//! lives in the consent store.

pub mod claims;
pub mod device;
pub mod level;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod store;

use std::net::IpAddr;
use uuid::Uuid;

use crate::consent::claims::ClaimsRequest;
use crate::consent::level::{AuthenticationLevelSnapshot, Freshness};
use crate::entity::join_set;

pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";
pub const RESPONSE_TYPE_CODE: &str = "code";

/// User details read from the authentication session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDetails {
    pub username: String,
    pub display_name: String,
    pub emails: Vec<String>,
    pub groups: Vec<String>,
}

/// Read-only view of the external authentication session.
#[derive(Debug, Clone, Default)]
pub struct AuthenticationSession {
    /// `None` for anonymous sessions
    pub user: Option<UserDetails>,
    pub levels: AuthenticationLevelSnapshot,
    pub remote_ip: Option<IpAddr>,
}

impl AuthenticationSession {
    pub fn anonymous(remote_ip: Option<IpAddr>) -> Self {
        Self {
            user: None,
            levels: AuthenticationLevelSnapshot::default(),
            remote_ip,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.username.as_str())
    }

    pub fn groups(&self) -> &[String] {
        self.user.as_ref().map(|u| u.groups.as_slice()).unwrap_or(&[])
    }
}

/// URLs of the legs a browser is sent between.
#[derive(Debug, Clone)]
pub struct Endpoints {
    issuer: String,
    portal: String,
}

impl Endpoints {
    pub fn new(issuer: impl Into<String>, portal: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into().trim_end_matches('/').to_string(),
            portal: portal.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Login page; `continuation` is where the portal sends the user after.
    pub fn login(&self, continuation: &str) -> String {
        format!(
            "{}/?rd={}",
            self.portal,
            urlencoding::encode(continuation)
        )
    }

    /// Interactive consent page.
    pub fn consent(&self, challenge_id: Uuid) -> String {
        format!("{}/consent?consent_id={challenge_id}", self.portal)
    }

    /// Authorization endpoint resumed with the persisted request form.
    pub fn authorization(&self, form: &str, challenge_id: Uuid) -> String {
        if form.is_empty() {
            format!(
                "{}/api/oidc/authorization?consent_id={challenge_id}",
                self.issuer
            )
        } else {
            format!(
                "{}/api/oidc/authorization?{form}&consent_id={challenge_id}",
                self.issuer
            )
        }
    }

    /// Device verification page resumed after login or consent.
    pub fn device(&self, challenge_id: Uuid) -> String {
        format!("{}/device?consent_id={challenge_id}", self.portal)
    }

    /// Where a device tells its user to go.
    pub fn device_verification(&self) -> String {
        format!("{}/device", self.portal)
    }

    /// Device verification page for a user code not yet paired.
    pub fn device_entry(&self, user_code: &str) -> String {
        format!(
            "{}/device?user_code={}",
            self.portal,
            urlencoding::encode(user_code)
        )
    }
}

/// Protocol leg a consent session was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Authorization,
    Device,
}

/// What the consent resolvers need to know about one request, independent
/// of whether it came from a browser or a paired device.
#[derive(Debug, Clone)]
pub struct ConsentRequest {
    pub flow: Flow,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub audience: Vec<String>,
    pub response_types: Vec<String>,
    pub prompts: Vec<String>,
    pub freshness: Freshness,
    pub claims: Option<ClaimsRequest>,
    /// URL-encoded original request, persisted as the continuation
    pub form: String,
}

impl ConsentRequest {
    pub fn has_prompt(&self, prompt: &str) -> bool {
        self.prompts.iter().any(|p| p == prompt)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn has_response_type(&self, response_type: &str) -> bool {
        self.response_types.iter().any(|r| r == response_type)
    }

    pub fn claims_signature(&self) -> Option<String> {
        self.claims
            .as_ref()
            .filter(|c| !c.is_empty())
            .map(ClaimsRequest::signature)
    }

    /// Claim names requested individually, in storage form.
    pub fn requested_claims(&self) -> String {
        self.claims
            .as_ref()
            .map(|c| join_set(c.claim_names()))
            .unwrap_or_default()
    }

    /// Where to resume this request once `challenge_id` exists.
    pub fn continuation(&self, endpoints: &Endpoints, challenge_id: Uuid) -> String {
        match self.flow {
            Flow::Authorization => endpoints.authorization(&self.form, challenge_id),
            Flow::Device => endpoints.device(challenge_id),
        }
    }
}
