//! Authorization and consent engine for an OpenID Connect provider.
//!
//! Decides, for each authorization or device authorization attempt, whether
//! the end-user is sufficiently authenticated, whether consent exists or must
//! be obtained, and which claims may be released to the client.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;

pub mod api;
pub mod config;
pub mod consent;
pub mod entity;
pub mod error;
pub mod oauth2;

#[derive(Clone, Debug)]
pub struct AppResources {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
}
