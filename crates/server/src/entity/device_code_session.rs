//! Device code session entity - RFC 8628 device authorization state.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use super::split_set;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device_code_session")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub client_id: String,
    /// One-way signature of the device code polled by the device
    #[sea_orm(unique)]
    pub device_code_signature: String,
    /// One-way signature of the user code typed on the secondary browser
    #[sea_orm(unique)]
    pub user_code_signature: String,
    pub request_id: String,
    /// Consent challenge this session was paired with (one-shot)
    pub challenge_id: Option<String>,
    /// See [`DeviceCodeStatus`]
    pub status: String,
    pub active: bool,
    pub revoked: bool,
    pub subject: Option<String>,
    pub scopes: String,
    pub audience: String,
    /// URL-encoded form of the device authorization request
    pub form: String,
    pub requested_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle of a device code session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCodeStatus {
    New,
    Approved,
    Denied,
}

impl DeviceCodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCodeStatus::New => "new",
            DeviceCodeStatus::Approved => "approved",
            DeviceCodeStatus::Denied => "denied",
        }
    }
}

impl fmt::Display for DeviceCodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceCodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(DeviceCodeStatus::New),
            "approved" => Ok(DeviceCodeStatus::Approved),
            "denied" => Ok(DeviceCodeStatus::Denied),
            other => Err(format!("unknown device code status '{other}'")),
        }
    }
}

impl Model {
    /// Unknown status strings are treated as denied.
    pub fn status(&self) -> DeviceCodeStatus {
        self.status.parse().unwrap_or(DeviceCodeStatus::Denied)
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn is_paired(&self) -> bool {
        self.challenge_id.is_some()
    }

    /// The session may be paired with a new consent challenge.
    pub fn is_pairable_at(&self, now: OffsetDateTime) -> bool {
        self.active
            && !self.revoked
            && self.status() == DeviceCodeStatus::New
            && !self.is_paired()
            && !self.is_expired_at(now)
    }

    pub fn scopes_list(&self) -> Vec<String> {
        split_set(&self.scopes)
    }

    pub fn audience_list(&self) -> Vec<String> {
        split_set(&self.audience)
    }
}
