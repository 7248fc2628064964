use consent_engine::AppResources;
use consent_engine::api::start_webserver;
use consent_engine::config::load_config;
use consent_engine::consent::store::{DbConsentStore, spawn_purge_task};
use consent_engine::oauth2::OAuth2State;
use sea_orm::Database;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_standard_tracing() {
    let default_directives = "consent_engine=info,audit=info,sea_orm=info,tower_http=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    initialize_standard_tracing();

    let config = Arc::new(load_config()?);
    tracing::info!(
        issuer = %config.issuer_url,
        portal = %config.portal_url,
        clients = config.clients.len(),
        "Configuration loaded"
    );

    let db = Arc::new(Database::connect(&config.database_url).await?);

    // Expired sessions, pushed requests and codes
    spawn_purge_task(
        Arc::new(DbConsentStore::new(
            db.clone(),
            config.lifespans.storage_timeout(),
        )),
        config.lifespans.purge_interval(),
    );

    let oauth2_state = OAuth2State::new(db.clone(), &config);
    let resources = AppResources { db, config };

    start_webserver(oauth2_state, resources).await?;
    Ok(())
}
