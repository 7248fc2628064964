//! Authentication level gate.
//!
//! Decides which authentication level a client's policy demands for a given
//! user and network origin, whether the session currently satisfies it, and
//! whether `prompt=login` / `max_age` force a fresh authentication. The
//! freshness predicates are evaluated separately and AND-composed with level
//! sufficiency by the callers; they never stand in for it.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use time::{Duration, OffsetDateTime};

use crate::config::{AuthorizationPolicyConfig, IpNet};

/// Strength of the authentication recorded on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationLevel {
    NotAuthenticated,
    OneFactor,
    TwoFactor,
}

/// Outcome of an authorization policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLevel {
    OneFactor,
    TwoFactor,
    Deny,
}

impl PolicyLevel {
    /// Minimum level this policy requires; `None` when nothing is sufficient.
    pub fn required_level(&self) -> Option<AuthenticationLevel> {
        match self {
            PolicyLevel::OneFactor => Some(AuthenticationLevel::OneFactor),
            PolicyLevel::TwoFactor => Some(AuthenticationLevel::TwoFactor),
            PolicyLevel::Deny => None,
        }
    }
}

/// First/second factor timestamps read from the authentication session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthenticationLevelSnapshot {
    pub first_factor_at: Option<OffsetDateTime>,
    pub second_factor_at: Option<OffsetDateTime>,
}

impl AuthenticationLevelSnapshot {
    pub fn level(&self) -> AuthenticationLevel {
        match (self.first_factor_at, self.second_factor_at) {
            (Some(_), Some(_)) => AuthenticationLevel::TwoFactor,
            (Some(_), None) => AuthenticationLevel::OneFactor,
            // a second factor without a first one is not an authentication
            (None, _) => AuthenticationLevel::NotAuthenticated,
        }
    }

    /// Time of the most recent factor, if the session is authenticated at all.
    pub fn last_authenticated_at(&self) -> Option<OffsetDateTime> {
        let first = self.first_factor_at?;
        Some(match self.second_factor_at {
            Some(second) if second > first => second,
            _ => first,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectMatcher {
    User(String),
    Group(String),
}

impl FromStr for SubjectMatcher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(user) = s.strip_prefix("user:") {
            Ok(SubjectMatcher::User(user.to_string()))
        } else if let Some(group) = s.strip_prefix("group:") {
            Ok(SubjectMatcher::Group(group.to_string()))
        } else {
            Err(format!("invalid subject matcher '{s}'"))
        }
    }
}

impl SubjectMatcher {
    fn matches(&self, username: &str, groups: &[String]) -> bool {
        match self {
            SubjectMatcher::User(user) => user == username,
            SubjectMatcher::Group(group) => groups.iter().any(|g| g == group),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub policy: PolicyLevel,
    pub subjects: Vec<SubjectMatcher>,
    pub networks: Vec<IpNet>,
}

impl PolicyRule {
    fn matches(&self, username: Option<&str>, groups: &[String], ip: Option<IpAddr>) -> bool {
        let subject_ok = self.subjects.is_empty()
            || username.is_some_and(|user| self.subjects.iter().any(|s| s.matches(user, groups)));
        let network_ok = self.networks.is_empty()
            || ip.is_some_and(|ip| self.networks.iter().any(|net| net.contains(&ip)));
        subject_ok && network_ok
    }
}

/// A client's authorization policy: first matching rule wins.
#[derive(Debug, Clone)]
pub struct AuthorizationPolicy {
    pub default_policy: PolicyLevel,
    pub rules: Vec<PolicyRule>,
}

impl Default for AuthorizationPolicy {
    fn default() -> Self {
        Self {
            default_policy: PolicyLevel::TwoFactor,
            rules: Vec::new(),
        }
    }
}

impl From<&AuthorizationPolicyConfig> for AuthorizationPolicy {
    fn from(config: &AuthorizationPolicyConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| PolicyRule {
                policy: rule.policy,
                subjects: rule
                    .subject
                    .iter()
                    .filter_map(|s| s.parse().ok())
                    .collect(),
                networks: rule.networks.clone(),
            })
            .collect();
        Self {
            default_policy: config.default_policy,
            rules,
        }
    }
}

impl AuthorizationPolicy {
    pub fn evaluate(
        &self,
        username: Option<&str>,
        groups: &[String],
        ip: Option<IpAddr>,
    ) -> PolicyLevel {
        self.rules
            .iter()
            .find(|rule| rule.matches(username, groups, ip))
            .map(|rule| rule.policy)
            .unwrap_or(self.default_policy)
    }
}

/// Result of checking a session against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub required: PolicyLevel,
    pub current: AuthenticationLevel,
}

impl GateDecision {
    pub fn is_denied(&self) -> bool {
        self.required == PolicyLevel::Deny
    }

    /// An anonymous session never satisfies any policy.
    pub fn is_satisfied(&self) -> bool {
        match self.required.required_level() {
            Some(required) => {
                self.current != AuthenticationLevel::NotAuthenticated && self.current >= required
            }
            None => false,
        }
    }
}

pub fn evaluate_gate(
    policy: &AuthorizationPolicy,
    username: Option<&str>,
    groups: &[String],
    ip: Option<IpAddr>,
    snapshot: &AuthenticationLevelSnapshot,
) -> GateDecision {
    GateDecision {
        required: policy.evaluate(username, groups, ip),
        current: snapshot.level(),
    }
}

/// `prompt=login` and `max_age` requirements of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Freshness {
    pub prompt_login: bool,
    pub max_age: Option<Duration>,
}

impl Freshness {
    pub fn is_required(&self) -> bool {
        self.prompt_login || self.max_age.is_some()
    }

    /// Whether the user must authenticate again before this request can be
    /// served. `requested_at` is when the request was first observed.
    pub fn requires_reauthentication(
        &self,
        snapshot: &AuthenticationLevelSnapshot,
        requested_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> bool {
        if !self.is_required() {
            return false;
        }
        let Some(last) = snapshot.last_authenticated_at() else {
            return true;
        };
        if self.prompt_login && last <= requested_at {
            return true;
        }
        // an authentication performed for this very request satisfies max_age
        self.max_age
            .is_some_and(|max_age| last <= requested_at && now - last > max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn one_factor_at(at: OffsetDateTime) -> AuthenticationLevelSnapshot {
        AuthenticationLevelSnapshot {
            first_factor_at: Some(at),
            second_factor_at: None,
        }
    }

    #[test]
    fn snapshot_levels() {
        let at = datetime!(2026-01-01 12:00 UTC);
        assert_eq!(
            AuthenticationLevelSnapshot::default().level(),
            AuthenticationLevel::NotAuthenticated
        );
        assert_eq!(one_factor_at(at).level(), AuthenticationLevel::OneFactor);
        let second_only = AuthenticationLevelSnapshot {
            first_factor_at: None,
            second_factor_at: Some(at),
        };
        assert_eq!(second_only.level(), AuthenticationLevel::NotAuthenticated);
        assert_eq!(second_only.last_authenticated_at(), None);
    }

    #[test]
    fn anonymous_never_satisfies() {
        let policy = AuthorizationPolicy {
            default_policy: PolicyLevel::OneFactor,
            rules: vec![],
        };
        let decision = evaluate_gate(
            &policy,
            None,
            &[],
            None,
            &AuthenticationLevelSnapshot::default(),
        );
        assert!(!decision.is_satisfied());
    }

    #[test]
    fn one_factor_does_not_satisfy_two_factor() {
        let at = datetime!(2026-01-01 12:00 UTC);
        let policy = AuthorizationPolicy::default();
        let decision = evaluate_gate(&policy, Some("john"), &[], None, &one_factor_at(at));
        assert_eq!(decision.required, PolicyLevel::TwoFactor);
        assert!(!decision.is_satisfied());
    }

    #[test]
    fn deny_is_never_satisfied() {
        let at = datetime!(2026-01-01 12:00 UTC);
        let snapshot = AuthenticationLevelSnapshot {
            first_factor_at: Some(at),
            second_factor_at: Some(at),
        };
        let policy = AuthorizationPolicy {
            default_policy: PolicyLevel::Deny,
            rules: vec![],
        };
        let decision = evaluate_gate(&policy, Some("john"), &[], None, &snapshot);
        assert!(decision.is_denied());
        assert!(!decision.is_satisfied());
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = AuthorizationPolicy {
            default_policy: PolicyLevel::TwoFactor,
            rules: vec![
                PolicyRule {
                    policy: PolicyLevel::Deny,
                    subjects: vec!["user:mallory".parse().unwrap()],
                    networks: vec![],
                },
                PolicyRule {
                    policy: PolicyLevel::OneFactor,
                    subjects: vec!["group:staff".parse().unwrap()],
                    networks: vec!["10.0.0.0/8".parse().unwrap()],
                },
            ],
        };
        let internal: IpAddr = "10.1.2.3".parse().unwrap();
        let external: IpAddr = "203.0.113.9".parse().unwrap();

        assert_eq!(
            policy.evaluate(Some("mallory"), &groups(&["staff"]), Some(internal)),
            PolicyLevel::Deny
        );
        assert_eq!(
            policy.evaluate(Some("john"), &groups(&["staff"]), Some(internal)),
            PolicyLevel::OneFactor
        );
        assert_eq!(
            policy.evaluate(Some("john"), &groups(&["staff"]), Some(external)),
            PolicyLevel::TwoFactor
        );
        // network rules never match an unknown origin
        assert_eq!(
            policy.evaluate(Some("john"), &groups(&["staff"]), None),
            PolicyLevel::TwoFactor
        );
    }

    #[test]
    fn prompt_login_requires_authentication_after_request() {
        let requested_at = datetime!(2026-01-01 12:00 UTC);
        let now = datetime!(2026-01-01 12:05 UTC);
        let freshness = Freshness {
            prompt_login: true,
            max_age: None,
        };

        let before = one_factor_at(datetime!(2026-01-01 11:00 UTC));
        assert!(freshness.requires_reauthentication(&before, requested_at, now));

        let same_instant = one_factor_at(requested_at);
        assert!(freshness.requires_reauthentication(&same_instant, requested_at, now));

        let after = one_factor_at(datetime!(2026-01-01 12:01 UTC));
        assert!(!freshness.requires_reauthentication(&after, requested_at, now));
    }

    #[test]
    fn max_age_counts_from_last_factor() {
        let now = datetime!(2026-01-01 12:00 UTC);
        let freshness = Freshness {
            prompt_login: false,
            max_age: Some(Duration::minutes(10)),
        };
        let snapshot = AuthenticationLevelSnapshot {
            first_factor_at: Some(datetime!(2026-01-01 11:00 UTC)),
            second_factor_at: Some(datetime!(2026-01-01 11:55 UTC)),
        };
        assert!(!freshness.requires_reauthentication(&snapshot, now, now));

        let stale = one_factor_at(datetime!(2026-01-01 11:49 UTC));
        assert!(freshness.requires_reauthentication(&stale, now, now));
    }

    #[test]
    fn max_age_zero_is_satisfied_by_login_for_the_request() {
        let requested_at = datetime!(2026-01-01 12:00 UTC);
        let now = datetime!(2026-01-01 12:02 UTC);
        let freshness = Freshness {
            prompt_login: false,
            max_age: Some(Duration::ZERO),
        };
        let before = one_factor_at(datetime!(2026-01-01 11:59 UTC));
        assert!(freshness.requires_reauthentication(&before, requested_at, now));

        let after = one_factor_at(datetime!(2026-01-01 12:01 UTC));
        assert!(!freshness.requires_reauthentication(&after, requested_at, now));
    }

    #[test]
    fn no_freshness_requirement_never_forces_login() {
        let now = datetime!(2026-01-01 12:00 UTC);
        assert!(!Freshness::default().requires_reauthentication(
            &AuthenticationLevelSnapshot::default(),
            now,
            now
        ));
    }
}
