//! Authorization code entity - codes issued at the end of the consent flow.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "authorization_code")]
pub struct Model {
    /// SHA-256 signature of the code; the raw code is never stored
    #[sea_orm(primary_key, auto_increment = false)]
    pub signature: String,
    pub challenge_id: String,
    pub client_id: String,
    pub subject: String,
    pub redirect_uri: String,
    pub scope: String,
    pub audience: String,
    /// OpenID Connect nonce
    pub nonce: Option<String>,
    /// JSON object of negotiated claims for token hydration
    pub claims: String,
    /// PKCE code challenge
    pub code_challenge: Option<String>,
    /// PKCE code challenge method (S256 or plain)
    pub code_challenge_method: Option<String>,
    pub active: bool,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
