//! Claims negotiation.
//!
//! Parses the OpenID Connect `claims` request parameter, checks that every
//! requested claim is covered by a scope, rejects issuer/subject assertions
//! that do not match, and hydrates the claim values finally disclosed in the
//! ID token and at the userinfo endpoint.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::consent::UserDetails;
use crate::error::{ConsentError, SecurityViolation};

/// Claims that describe the token itself; always permitted.
const PROTOCOL_CLAIMS: &[&str] = &[
    "iss",
    "sub",
    "aud",
    "exp",
    "iat",
    "auth_time",
    "nonce",
    "acr",
    "amr",
    "azp",
    "jti",
    "sid",
    "at_hash",
    "c_hash",
];

const PROFILE_CLAIMS: &[&str] = &[
    "name",
    "family_name",
    "given_name",
    "middle_name",
    "nickname",
    "preferred_username",
    "profile",
    "picture",
    "website",
    "gender",
    "birthdate",
    "zoneinfo",
    "locale",
    "updated_at",
];

const EMAIL_CLAIMS: &[&str] = &["email", "email_verified", "alt_emails"];
const PHONE_CLAIMS: &[&str] = &["phone_number", "phone_number_verified"];
const ADDRESS_CLAIMS: &[&str] = &["address"];
const GROUPS_CLAIMS: &[&str] = &["groups"];

/// Per-client claims policy.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ClaimsPolicy {
    /// Claims placed in the ID token whenever their scope is granted
    #[serde(default)]
    pub id_token: Vec<String>,
    /// Additional scopes and the claims they release
    #[serde(default)]
    pub custom_scopes: BTreeMap<String, Vec<String>>,
}

impl ClaimsPolicy {
    fn scope_claims<'a>(&'a self, scope: &str) -> Vec<&'a str> {
        let standard: &[&str] = match scope {
            "profile" => PROFILE_CLAIMS,
            "email" => EMAIL_CLAIMS,
            "phone" => PHONE_CLAIMS,
            "address" => ADDRESS_CLAIMS,
            "groups" => GROUPS_CLAIMS,
            _ => &[],
        };
        let mut claims: Vec<&str> = standard.to_vec();
        if let Some(custom) = self.custom_scopes.get(scope) {
            claims.extend(custom.iter().map(String::as_str));
        }
        claims
    }

    /// Claims released by a set of scopes.
    pub fn claims_for_scopes(&self, scopes: &[String]) -> BTreeSet<String> {
        scopes
            .iter()
            .flat_map(|scope| self.scope_claims(scope))
            .map(String::from)
            .collect()
    }

    fn is_covered(&self, claim: &str, scopes: &[String]) -> bool {
        PROTOCOL_CLAIMS.contains(&claim)
            || scopes
                .iter()
                .any(|scope| self.scope_claims(scope).contains(&claim))
    }
}

/// Constraints on one individually requested claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub essential: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

impl ClaimRequest {
    fn is_essential(&self) -> bool {
        self.essential.unwrap_or(false)
    }

    fn accepts(&self, actual: &Value) -> bool {
        if let Some(expected) = &self.value {
            return expected == actual;
        }
        if let Some(expected) = &self.values {
            return expected.contains(actual);
        }
        true
    }

    /// Whether an asserted value (via `value` or `values`) excludes `actual`.
    fn asserts_other_than(&self, actual: &str) -> Option<String> {
        let actual = Value::String(actual.to_string());
        match (&self.value, &self.values) {
            (Some(value), _) if *value != actual => Some(value.to_string()),
            (None, Some(values)) if !values.contains(&actual) => {
                Some(Value::Array(values.clone()).to_string())
            }
            _ => None,
        }
    }
}

type ClaimSection = BTreeMap<String, Option<ClaimRequest>>;

/// The parsed `claims` request parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimsRequest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub id_token: ClaimSection,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub userinfo: ClaimSection,
}

impl ClaimsRequest {
    /// Parse the raw parameter. Malformed input is always an error.
    pub fn parse(raw: &str) -> Result<Self, ConsentError> {
        let request: ClaimsRequest = serde_json::from_str(raw).map_err(|e| {
            ConsentError::invalid_request(format!("The claims parameter is malformed: {e}"))
        })?;

        for (name, constraint) in request.id_token.iter().chain(request.userinfo.iter()) {
            if name.trim().is_empty() {
                return Err(ConsentError::invalid_request(
                    "The claims parameter contains an empty claim name.",
                ));
            }
            if let Some(ClaimRequest {
                value: Some(_),
                values: Some(_),
                ..
            }) = constraint
            {
                return Err(ConsentError::invalid_request(format!(
                    "The claims parameter specifies both value and values for '{name}'."
                )));
            }
        }

        Ok(request)
    }

    pub fn is_empty(&self) -> bool {
        self.id_token.is_empty() && self.userinfo.is_empty()
    }

    /// Canonical signature; identical requests always produce the same value
    /// regardless of the key order they were submitted in.
    pub fn signature(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
    }

    fn sections(&self) -> impl Iterator<Item = (&String, &Option<ClaimRequest>)> {
        self.id_token.iter().chain(self.userinfo.iter())
    }

    /// Every claim name mentioned in either section.
    pub fn claim_names(&self) -> BTreeSet<String> {
        self.sections().map(|(name, _)| name.clone()).collect()
    }

    pub fn essential_claims(&self) -> BTreeSet<String> {
        self.sections()
            .filter(|(_, c)| c.as_ref().is_some_and(ClaimRequest::is_essential))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn voluntary_claims(&self) -> BTreeSet<String> {
        let essential = self.essential_claims();
        self.claim_names()
            .into_iter()
            .filter(|name| !essential.contains(name))
            .collect()
    }

    /// Reject any requested claim no scope in `scopes` releases.
    pub fn validate_scopes(
        &self,
        scopes: &[String],
        policy: &ClaimsPolicy,
    ) -> Result<(), ConsentError> {
        match self
            .sections()
            .find(|(name, _)| !policy.is_covered(name, scopes))
        {
            Some((name, _)) => Err(ConsentError::validation(
                crate::error::ErrorCode::InvalidScope,
                format!("The claim '{name}' was requested without a scope that releases it."),
            )),
            None => Ok(()),
        }
    }

    /// Compare asserted `iss` and `sub` values exactly.
    pub fn check_assertions(&self, issuer: &str, subject: &str) -> Result<(), ConsentError> {
        for (name, constraint) in self.sections() {
            let Some(constraint) = constraint else {
                continue;
            };
            match name.as_str() {
                "iss" => {
                    if let Some(requested) = constraint.asserts_other_than(issuer) {
                        return Err(SecurityViolation::IssuerMismatch { requested }.into());
                    }
                }
                "sub" => {
                    if constraint.asserts_other_than(subject).is_some() {
                        return Err(SecurityViolation::SubjectMismatch.into());
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Claim values finally disclosed for one grant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NegotiatedClaims {
    pub id_token: BTreeMap<String, Value>,
    pub userinfo: BTreeMap<String, Value>,
}

/// Intersection of what was requested with what the client may receive,
/// preserving the requested order.
pub fn intersect(requested: &[String], allowed: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|item| allowed.contains(item))
        .cloned()
        .collect()
}

/// Negotiates the disclosed claims of one grant.
pub struct ClaimsNegotiator<'a> {
    pub policy: &'a ClaimsPolicy,
    pub issuer: &'a str,
}

impl<'a> ClaimsNegotiator<'a> {
    pub fn new(policy: &'a ClaimsPolicy, issuer: &'a str) -> Self {
        Self { policy, issuer }
    }

    /// Validate a parsed request against scopes and the resolved subject.
    pub fn validate(
        &self,
        request: &ClaimsRequest,
        scopes: &[String],
        subject: &str,
    ) -> Result<(), ConsentError> {
        request.validate_scopes(scopes, self.policy)?;
        request.check_assertions(self.issuer, subject)
    }

    /// Build the claim maps for token hydration.
    ///
    /// Scope-implied claims go to userinfo; the ID token carries the policy's
    /// claims plus whatever the request asked for explicitly. Individually
    /// requested claims are disclosed only if they are in `granted_claims`.
    pub fn hydrate(
        &self,
        request: Option<&ClaimsRequest>,
        granted_scopes: &[String],
        granted_claims: &[String],
        user: &UserDetails,
    ) -> NegotiatedClaims {
        let mut negotiated = NegotiatedClaims::default();
        let scope_claims = self.policy.claims_for_scopes(granted_scopes);

        for claim in &scope_claims {
            if let Some(value) = claim_value(claim, user) {
                negotiated.userinfo.insert(claim.clone(), value);
            }
        }
        for claim in self
            .policy
            .id_token
            .iter()
            .filter(|claim| scope_claims.contains(*claim))
        {
            if let Some(value) = claim_value(claim, user) {
                negotiated.id_token.insert(claim.clone(), value);
            }
        }

        let Some(request) = request else {
            return negotiated;
        };
        let sections = [
            (&request.id_token, &mut negotiated.id_token),
            (&request.userinfo, &mut negotiated.userinfo),
        ];
        for (section, target) in sections {
            for (claim, constraint) in section {
                if PROTOCOL_CLAIMS.contains(&claim.as_str())
                    || !granted_claims.iter().any(|g| g == claim)
                    || !self.policy.is_covered(claim, granted_scopes)
                {
                    continue;
                }
                let Some(value) = claim_value(claim, user) else {
                    continue;
                };
                if constraint.as_ref().is_none_or(|c| c.accepts(&value)) {
                    target.insert(claim.clone(), value);
                } else {
                    target.remove(claim);
                }
            }
        }

        negotiated
    }
}

fn claim_value(claim: &str, user: &UserDetails) -> Option<Value> {
    match claim {
        "preferred_username" => Some(Value::String(user.username.clone())),
        "name" if !user.display_name.is_empty() => Some(Value::String(user.display_name.clone())),
        "email" => user.emails.first().cloned().map(Value::String),
        "email_verified" => user.emails.first().map(|_| Value::Bool(true)),
        "alt_emails" if user.emails.len() > 1 => Some(Value::Array(
            user.emails[1..].iter().cloned().map(Value::String).collect(),
        )),
        "groups" => Some(Value::Array(
            user.groups.iter().cloned().map(Value::String).collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const ISSUER: &str = "https://auth.example.com";
    const SUBJECT: &str = "0f5f7a0c-3a4e-4c5e-9d7b-2b0f6c7e8a11";

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn user() -> UserDetails {
        UserDetails {
            username: "john".into(),
            display_name: "John Doe".into(),
            emails: vec!["john@example.com".into(), "jd@example.org".into()],
            groups: vec!["admins".into(), "dev".into()],
        }
    }

    #[test]
    fn malformed_claims_are_rejected() {
        assert!(ClaimsRequest::parse("not json").is_err());
        assert!(ClaimsRequest::parse(r#"{"id_token": []}"#).is_err());
        assert!(ClaimsRequest::parse(r#"{"userinfo": {"email": {"essential": "yes"}}}"#).is_err());
        assert!(
            ClaimsRequest::parse(r#"{"userinfo": {"email": {"value": "a", "values": ["a"]}}}"#)
                .is_err()
        );
    }

    #[test]
    fn null_constraints_are_accepted() {
        let request =
            ClaimsRequest::parse(r#"{"userinfo": {"email": null, "name": {"essential": true}}}"#)
                .unwrap();
        assert_eq!(request.claim_names().len(), 2);
        assert_eq!(
            request.essential_claims().into_iter().collect::<Vec<_>>(),
            vec!["name"]
        );
        assert_eq!(
            request.voluntary_claims().into_iter().collect::<Vec<_>>(),
            vec!["email"]
        );
    }

    #[test]
    fn signature_ignores_key_order() {
        let a = ClaimsRequest::parse(
            r#"{"userinfo": {"email": null, "name": {"essential": true}}, "id_token": {"groups": null}}"#,
        )
        .unwrap();
        let b = ClaimsRequest::parse(
            r#"{"id_token": {"groups": null}, "userinfo": {"name": {"essential": true}, "email": null}}"#,
        )
        .unwrap();
        assert_eq!(a.signature(), b.signature());

        let c = ClaimsRequest::parse(r#"{"userinfo": {"email": null}}"#).unwrap();
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn uncovered_claims_are_rejected_not_dropped() {
        let policy = ClaimsPolicy::default();
        let request = ClaimsRequest::parse(r#"{"userinfo": {"email": null}}"#).unwrap();
        let err = request
            .validate_scopes(&scopes(&["openid", "profile"]), &policy)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScope);

        assert!(
            request
                .validate_scopes(&scopes(&["openid", "email"]), &policy)
                .is_ok()
        );
    }

    #[test]
    fn custom_scopes_cover_their_claims() {
        let policy = ClaimsPolicy {
            id_token: vec![],
            custom_scopes: BTreeMap::from([("org".to_string(), vec!["department".to_string()])]),
        };
        let request = ClaimsRequest::parse(r#"{"id_token": {"department": null}}"#).unwrap();
        assert!(request.validate_scopes(&scopes(&["openid"]), &policy).is_err());
        assert!(
            request
                .validate_scopes(&scopes(&["openid", "org"]), &policy)
                .is_ok()
        );
    }

    #[test]
    fn subject_mismatch_is_access_denied() {
        let request = ClaimsRequest::parse(
            r#"{"id_token": {"sub": {"value": "11111111-1111-1111-1111-111111111111"}}}"#,
        )
        .unwrap();
        let err = request.check_assertions(ISSUER, SUBJECT).unwrap_err();
        assert!(matches!(
            err,
            ConsentError::Security(SecurityViolation::SubjectMismatch)
        ));
        assert_eq!(err.code(), ErrorCode::AccessDenied);

        let matching =
            ClaimsRequest::parse(&format!(r#"{{"id_token": {{"sub": {{"value": "{SUBJECT}"}}}}}}"#))
                .unwrap();
        assert!(matching.check_assertions(ISSUER, SUBJECT).is_ok());
    }

    #[test]
    fn issuer_mismatch_is_access_denied() {
        let request = ClaimsRequest::parse(
            r#"{"userinfo": {"iss": {"values": ["https://other.example.com"]}}}"#,
        )
        .unwrap();
        let err = request.check_assertions(ISSUER, SUBJECT).unwrap_err();
        assert!(matches!(
            err,
            ConsentError::Security(SecurityViolation::IssuerMismatch { .. })
        ));

        let listed = ClaimsRequest::parse(&format!(
            r#"{{"userinfo": {{"iss": {{"values": ["https://other.example.com", "{ISSUER}"]}}}}}}"#
        ))
        .unwrap();
        assert!(listed.check_assertions(ISSUER, SUBJECT).is_ok());
    }

    #[test]
    fn hydrate_uses_scopes_policy_and_request() {
        let policy = ClaimsPolicy {
            id_token: vec!["email".into(), "groups".into()],
            custom_scopes: BTreeMap::new(),
        };
        let negotiator = ClaimsNegotiator::new(&policy, ISSUER);
        let request = ClaimsRequest::parse(
            r#"{"id_token": {"preferred_username": {"essential": true}, "name": {"value": "Someone Else"}}}"#,
        )
        .unwrap();

        let claims = negotiator.hydrate(
            Some(&request),
            &scopes(&["openid", "profile", "email"]),
            &scopes(&["preferred_username", "name"]),
            &user(),
        );

        assert_eq!(claims.userinfo["email"], "john@example.com");
        assert_eq!(claims.userinfo["alt_emails"][0], "jd@example.org");
        assert_eq!(claims.userinfo["name"], "John Doe");
        assert!(!claims.userinfo.contains_key("groups"));

        assert_eq!(claims.id_token["email"], "john@example.com");
        assert_eq!(claims.id_token["preferred_username"], "john");
        // groups scope not granted, value constraint on name not met
        assert!(!claims.id_token.contains_key("groups"));
        assert!(!claims.id_token.contains_key("name"));
    }

    #[test]
    fn hydrate_skips_claims_not_granted() {
        let policy = ClaimsPolicy::default();
        let negotiator = ClaimsNegotiator::new(&policy, ISSUER);
        let request = ClaimsRequest::parse(r#"{"id_token": {"email": null}}"#).unwrap();
        let claims = negotiator.hydrate(
            Some(&request),
            &scopes(&["openid", "email"]),
            &[],
            &user(),
        );
        assert!(claims.id_token.is_empty());
        assert_eq!(claims.userinfo["email_verified"], true);
    }

    #[test]
    fn intersect_keeps_requested_order() {
        assert_eq!(
            intersect(
                &scopes(&["profile", "openid", "admin"]),
                &scopes(&["openid", "profile", "email"])
            ),
            scopes(&["profile", "openid"])
        );
    }
}
