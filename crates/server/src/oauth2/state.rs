//! Shared state of the OpenID Connect endpoints.

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::consent::Endpoints;
use crate::consent::orchestrator::Orchestrator;
use crate::consent::registry::ConfigClientRegistry;
use crate::consent::store::{ConsentStore, DbConsentStore};
use crate::oauth2::engine::CodeFlowEngine;

#[derive(Clone)]
pub struct OAuth2State {
    pub orchestrator: Arc<Orchestrator>,
}

impl OAuth2State {
    /// Wire the orchestrator to the database-backed store, the configured
    /// clients and the bundled protocol engine.
    pub fn new(db: Arc<DatabaseConnection>, config: &AppConfig) -> Self {
        let endpoints = Endpoints::new(config.issuer_url.clone(), config.portal_url.clone());
        let store = Arc::new(DbConsentStore::new(
            db.clone(),
            config.lifespans.storage_timeout(),
        ));
        let registry = Arc::new(ConfigClientRegistry::new(&config.clients));
        let engine = Arc::new(CodeFlowEngine::new(
            db,
            endpoints.clone(),
            config.lifespans.clone(),
        ));

        Self {
            orchestrator: Arc::new(Orchestrator::new(
                store,
                registry,
                engine,
                endpoints,
                config.lifespans.clone(),
            )),
        }
    }

    pub fn store(&self) -> &dyn ConsentStore {
        self.orchestrator.store()
    }
}
