//! Pushed authorization request entity (RFC 9126).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pushed_authorization_request")]
pub struct Model {
    /// `urn:ietf:params:oauth:request_uri:<id>`
    #[sea_orm(primary_key, auto_increment = false)]
    pub request_uri: String,
    pub client_id: String,
    pub form: String,
    pub used: bool,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}
