//! Pre-configured consent entity - a remembered "always allow" decision.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "consent_preconfiguration")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub client_id: String,
    pub subject: String,
    /// Normalized space-separated scope set
    pub scopes: String,
    pub audience: String,
    pub granted_claims: String,
    /// Signature of the claims request this decision was made for
    pub claims_signature: Option<String>,
    pub created_at: OffsetDateTime,
    /// `None` means the decision never expires
    pub expires_at: Option<OffsetDateTime>,
    pub revoked: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_usable_at(&self, now: OffsetDateTime) -> bool {
        !self.revoked && self.expires_at.is_none_or(|expires| now < expires)
    }
}
