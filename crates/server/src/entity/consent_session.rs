//! Consent session entity - one authorization decision per challenge id.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::split_set;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "consent_session")]
pub struct Model {
    /// Opaque challenge id (hyphenated UUID), immutable once issued
    #[sea_orm(primary_key, auto_increment = false)]
    pub challenge_id: String,
    pub client_id: String,
    /// Pairwise subject; `None` until bound, never changed afterwards
    pub subject: Option<String>,
    /// Normalized space-separated scope set
    pub requested_scopes: String,
    pub requested_audience: String,
    pub granted_scopes: String,
    pub granted_audience: String,
    /// Space-separated claim names granted alongside the scopes
    pub granted_claims: String,
    /// URL-encoded form of the original authorization request
    pub form: String,
    pub requested_at: OffsetDateTime,
    pub responded_at: Option<OffsetDateTime>,
    pub expires_at: OffsetDateTime,
    pub granted: bool,
    pub authorized: bool,
    pub preconfiguration_id: Option<i32>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn is_responded(&self) -> bool {
        self.responded_at.is_some()
    }

    /// The session carries an approval that has not yet been turned into a
    /// delivered authorization response.
    pub fn can_grant_at(&self, now: OffsetDateTime) -> bool {
        self.is_responded() && self.authorized && !self.granted && !self.is_expired_at(now)
    }

    pub fn requested_scopes_list(&self) -> Vec<String> {
        split_set(&self.requested_scopes)
    }

    pub fn requested_audience_list(&self) -> Vec<String> {
        split_set(&self.requested_audience)
    }

    pub fn granted_scopes_list(&self) -> Vec<String> {
        split_set(&self.granted_scopes)
    }

    pub fn granted_audience_list(&self) -> Vec<String> {
        split_set(&self.granted_audience)
    }

    pub fn granted_claims_list(&self) -> Vec<String> {
        split_set(&self.granted_claims)
    }
}
