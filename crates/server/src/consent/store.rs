//! Consent store.
//!
//! [`ConsentStore`] is the only way the decision core touches persistent
//! state. Every state transition that two concurrent requests could race on
//! (subject binding, responding, granting, device pairing) is a single
//! conditional update whose affected row count tells the caller whether it
//! won.

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Set, ColumnTrait, DatabaseConnection,
    DbErr, EntityTrait, QueryFilter, sea_query::Expr,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entity::{
    authorization_code, consent_preconfiguration, consent_session, device_code_session,
    device_code_session::DeviceCodeStatus, pushed_authorization_request, user_opaque_identifier,
};
use crate::error::StorageError;

/// Service name pairwise identifiers are issued for.
pub const OPENID_SERVICE: &str = "openid";

/// The decision recorded when a consent session is responded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentResponse {
    pub authorized: bool,
    pub granted_scopes: String,
    pub granted_audience: String,
    pub granted_claims: String,
    pub preconfiguration_id: Option<i32>,
    pub responded_at: OffsetDateTime,
}

impl ConsentResponse {
    pub fn rejected(responded_at: OffsetDateTime) -> Self {
        Self {
            authorized: false,
            granted_scopes: String::new(),
            granted_audience: String::new(),
            granted_claims: String::new(),
            preconfiguration_id: None,
            responded_at,
        }
    }
}

#[async_trait]
pub trait ConsentStore: Send + Sync {
    async fn save_consent_session(
        &self,
        session: &consent_session::Model,
    ) -> Result<(), StorageError>;

    async fn load_consent_session(
        &self,
        challenge_id: Uuid,
    ) -> Result<Option<consent_session::Model>, StorageError>;

    /// Bind the subject of a session that has none. Returns `false` if the
    /// session was already bound (to any subject).
    async fn bind_consent_subject(
        &self,
        challenge_id: Uuid,
        subject: Uuid,
    ) -> Result<bool, StorageError>;

    /// Record a decision. Returns `false` if the session had already been
    /// responded to or had expired by `response.responded_at`.
    async fn respond_consent_session(
        &self,
        challenge_id: Uuid,
        response: &ConsentResponse,
    ) -> Result<bool, StorageError>;

    /// Mark an authorized session granted. Returns `false` if it was already
    /// granted, was never authorized or has expired.
    async fn grant_consent_session(
        &self,
        challenge_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<bool, StorageError>;

    async fn save_preconfiguration(
        &self,
        preconfiguration: &consent_preconfiguration::Model,
    ) -> Result<i32, StorageError>;

    /// Unrevoked, unexpired pre-configurations of a client and subject.
    async fn find_preconfigurations(
        &self,
        client_id: &str,
        subject: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<consent_preconfiguration::Model>, StorageError>;

    async fn revoke_preconfiguration(&self, id: i32) -> Result<bool, StorageError>;

    async fn save_device_session(
        &self,
        session: &device_code_session::Model,
    ) -> Result<i32, StorageError>;

    async fn load_device_session_by_user_code(
        &self,
        user_code_signature: &str,
    ) -> Result<Option<device_code_session::Model>, StorageError>;

    async fn load_device_session_by_challenge(
        &self,
        challenge_id: Uuid,
    ) -> Result<Option<device_code_session::Model>, StorageError>;

    /// Attach a consent challenge to an unpaired pending session. Returns
    /// `false` if another request paired it first.
    async fn pair_device_session(&self, id: i32, challenge_id: Uuid)
    -> Result<bool, StorageError>;

    async fn approve_device_session(
        &self,
        id: i32,
        challenge_id: Uuid,
        subject: Uuid,
    ) -> Result<bool, StorageError>;

    async fn deny_device_session(&self, id: i32) -> Result<bool, StorageError>;

    /// Pairwise subject of a user within a sector, created on first use.
    async fn load_or_create_subject(
        &self,
        sector_id: &str,
        username: &str,
    ) -> Result<Uuid, StorageError>;

    /// Delete expired records. Returns the number of rows removed.
    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StorageError>;
}

/// [`ConsentStore`] backed by SeaORM. Every call is bounded by `timeout`.
#[derive(Clone)]
pub struct DbConsentStore {
    db: Arc<DatabaseConnection>,
    timeout: Duration,
}

impl DbConsentStore {
    pub fn new(db: Arc<DatabaseConnection>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, DbErr>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(StorageError::from),
            Err(_) => Err(StorageError::Timeout(self.timeout)),
        }
    }

    async fn find_subject(
        &self,
        sector_id: &str,
        username: &str,
    ) -> Result<Option<Uuid>, StorageError> {
        let row = self
            .bounded(
                user_opaque_identifier::Entity::find()
                    .filter(user_opaque_identifier::Column::Service.eq(OPENID_SERVICE))
                    .filter(user_opaque_identifier::Column::SectorId.eq(sector_id))
                    .filter(user_opaque_identifier::Column::Username.eq(username))
                    .one(self.db.as_ref()),
            )
            .await?;

        row.map(|row| match Uuid::parse_str(&row.identifier) {
            Ok(id) if !id.is_nil() => Ok(id),
            _ => Err(StorageError::Corrupt(format!(
                "opaque identifier {} is not a usable subject",
                row.id
            ))),
        })
        .transpose()
    }
}

#[async_trait]
impl ConsentStore for DbConsentStore {
    async fn save_consent_session(
        &self,
        session: &consent_session::Model,
    ) -> Result<(), StorageError> {
        let active = consent_session::ActiveModel {
            challenge_id: Set(session.challenge_id.clone()),
            client_id: Set(session.client_id.clone()),
            subject: Set(session.subject.clone()),
            requested_scopes: Set(session.requested_scopes.clone()),
            requested_audience: Set(session.requested_audience.clone()),
            granted_scopes: Set(session.granted_scopes.clone()),
            granted_audience: Set(session.granted_audience.clone()),
            granted_claims: Set(session.granted_claims.clone()),
            form: Set(session.form.clone()),
            requested_at: Set(session.requested_at),
            responded_at: Set(session.responded_at),
            expires_at: Set(session.expires_at),
            granted: Set(session.granted),
            authorized: Set(session.authorized),
            preconfiguration_id: Set(session.preconfiguration_id),
        };
        self.bounded(consent_session::Entity::insert(active).exec(self.db.as_ref()))
            .await?;
        Ok(())
    }

    async fn load_consent_session(
        &self,
        challenge_id: Uuid,
    ) -> Result<Option<consent_session::Model>, StorageError> {
        self.bounded(
            consent_session::Entity::find_by_id(challenge_id.to_string()).one(self.db.as_ref()),
        )
        .await
    }

    async fn bind_consent_subject(
        &self,
        challenge_id: Uuid,
        subject: Uuid,
    ) -> Result<bool, StorageError> {
        let result = self
            .bounded(
                consent_session::Entity::update_many()
                    .col_expr(
                        consent_session::Column::Subject,
                        Expr::value(subject.to_string()),
                    )
                    .filter(consent_session::Column::ChallengeId.eq(challenge_id.to_string()))
                    .filter(consent_session::Column::Subject.is_null())
                    .exec(self.db.as_ref()),
            )
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn respond_consent_session(
        &self,
        challenge_id: Uuid,
        response: &ConsentResponse,
    ) -> Result<bool, StorageError> {
        let result = self
            .bounded(
                consent_session::Entity::update_many()
                    .col_expr(
                        consent_session::Column::RespondedAt,
                        Expr::value(response.responded_at),
                    )
                    .col_expr(
                        consent_session::Column::Authorized,
                        Expr::value(response.authorized),
                    )
                    .col_expr(
                        consent_session::Column::GrantedScopes,
                        Expr::value(response.granted_scopes.clone()),
                    )
                    .col_expr(
                        consent_session::Column::GrantedAudience,
                        Expr::value(response.granted_audience.clone()),
                    )
                    .col_expr(
                        consent_session::Column::GrantedClaims,
                        Expr::value(response.granted_claims.clone()),
                    )
                    .col_expr(
                        consent_session::Column::PreconfigurationId,
                        Expr::value(response.preconfiguration_id),
                    )
                    .filter(consent_session::Column::ChallengeId.eq(challenge_id.to_string()))
                    .filter(consent_session::Column::RespondedAt.is_null())
                    .filter(consent_session::Column::ExpiresAt.gt(response.responded_at))
                    .exec(self.db.as_ref()),
            )
            .await?;

        if result.rows_affected == 1 {
            tracing::info!(
                target: "audit",
                %challenge_id,
                authorized = response.authorized,
                preconfiguration_id = ?response.preconfiguration_id,
                "Consent session responded"
            );
        }
        Ok(result.rows_affected == 1)
    }

    async fn grant_consent_session(
        &self,
        challenge_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        let result = self
            .bounded(
                consent_session::Entity::update_many()
                    .col_expr(consent_session::Column::Granted, Expr::value(true))
                    .filter(consent_session::Column::ChallengeId.eq(challenge_id.to_string()))
                    .filter(consent_session::Column::Granted.eq(false))
                    .filter(consent_session::Column::Authorized.eq(true))
                    .filter(consent_session::Column::RespondedAt.is_not_null())
                    .filter(consent_session::Column::ExpiresAt.gt(now))
                    .exec(self.db.as_ref()),
            )
            .await?;

        if result.rows_affected == 1 {
            tracing::info!(target: "audit", %challenge_id, "Consent session granted");
        }
        Ok(result.rows_affected == 1)
    }

    async fn save_preconfiguration(
        &self,
        preconfiguration: &consent_preconfiguration::Model,
    ) -> Result<i32, StorageError> {
        let active = consent_preconfiguration::ActiveModel {
            id: NotSet,
            client_id: Set(preconfiguration.client_id.clone()),
            subject: Set(preconfiguration.subject.clone()),
            scopes: Set(preconfiguration.scopes.clone()),
            audience: Set(preconfiguration.audience.clone()),
            granted_claims: Set(preconfiguration.granted_claims.clone()),
            claims_signature: Set(preconfiguration.claims_signature.clone()),
            created_at: Set(preconfiguration.created_at),
            expires_at: Set(preconfiguration.expires_at),
            revoked: Set(false),
        };
        let saved = self.bounded(active.insert(self.db.as_ref())).await?;

        tracing::info!(
            target: "audit",
            id = saved.id,
            client_id = %saved.client_id,
            "Consent pre-configuration created"
        );
        Ok(saved.id)
    }

    async fn find_preconfigurations(
        &self,
        client_id: &str,
        subject: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<consent_preconfiguration::Model>, StorageError> {
        let rows = self
            .bounded(
                consent_preconfiguration::Entity::find()
                    .filter(consent_preconfiguration::Column::ClientId.eq(client_id))
                    .filter(consent_preconfiguration::Column::Subject.eq(subject.to_string()))
                    .filter(consent_preconfiguration::Column::Revoked.eq(false))
                    .all(self.db.as_ref()),
            )
            .await?;
        Ok(rows.into_iter().filter(|p| p.is_usable_at(now)).collect())
    }

    async fn revoke_preconfiguration(&self, id: i32) -> Result<bool, StorageError> {
        let result = self
            .bounded(
                consent_preconfiguration::Entity::update_many()
                    .col_expr(consent_preconfiguration::Column::Revoked, Expr::value(true))
                    .filter(consent_preconfiguration::Column::Id.eq(id))
                    .filter(consent_preconfiguration::Column::Revoked.eq(false))
                    .exec(self.db.as_ref()),
            )
            .await?;

        if result.rows_affected == 1 {
            tracing::info!(target: "audit", id, "Consent pre-configuration revoked");
        }
        Ok(result.rows_affected == 1)
    }

    async fn save_device_session(
        &self,
        session: &device_code_session::Model,
    ) -> Result<i32, StorageError> {
        let active = device_code_session::ActiveModel {
            id: NotSet,
            client_id: Set(session.client_id.clone()),
            device_code_signature: Set(session.device_code_signature.clone()),
            user_code_signature: Set(session.user_code_signature.clone()),
            request_id: Set(session.request_id.clone()),
            challenge_id: Set(session.challenge_id.clone()),
            status: Set(session.status.clone()),
            active: Set(session.active),
            revoked: Set(session.revoked),
            subject: Set(session.subject.clone()),
            scopes: Set(session.scopes.clone()),
            audience: Set(session.audience.clone()),
            form: Set(session.form.clone()),
            requested_at: Set(session.requested_at),
            expires_at: Set(session.expires_at),
        };
        let saved = self.bounded(active.insert(self.db.as_ref())).await?;
        Ok(saved.id)
    }

    async fn load_device_session_by_user_code(
        &self,
        user_code_signature: &str,
    ) -> Result<Option<device_code_session::Model>, StorageError> {
        self.bounded(
            device_code_session::Entity::find()
                .filter(device_code_session::Column::UserCodeSignature.eq(user_code_signature))
                .one(self.db.as_ref()),
        )
        .await
    }

    async fn load_device_session_by_challenge(
        &self,
        challenge_id: Uuid,
    ) -> Result<Option<device_code_session::Model>, StorageError> {
        self.bounded(
            device_code_session::Entity::find()
                .filter(device_code_session::Column::ChallengeId.eq(challenge_id.to_string()))
                .one(self.db.as_ref()),
        )
        .await
    }

    async fn pair_device_session(
        &self,
        id: i32,
        challenge_id: Uuid,
    ) -> Result<bool, StorageError> {
        let result = self
            .bounded(
                device_code_session::Entity::update_many()
                    .col_expr(
                        device_code_session::Column::ChallengeId,
                        Expr::value(challenge_id.to_string()),
                    )
                    .filter(device_code_session::Column::Id.eq(id))
                    .filter(device_code_session::Column::ChallengeId.is_null())
                    .filter(device_code_session::Column::Active.eq(true))
                    .filter(device_code_session::Column::Revoked.eq(false))
                    .filter(device_code_session::Column::Status.eq(DeviceCodeStatus::New.as_str()))
                    .exec(self.db.as_ref()),
            )
            .await?;

        if result.rows_affected == 1 {
            tracing::info!(target: "audit", id, %challenge_id, "Device code session paired");
        }
        Ok(result.rows_affected == 1)
    }

    async fn approve_device_session(
        &self,
        id: i32,
        challenge_id: Uuid,
        subject: Uuid,
    ) -> Result<bool, StorageError> {
        let result = self
            .bounded(
                device_code_session::Entity::update_many()
                    .col_expr(
                        device_code_session::Column::Status,
                        Expr::value(DeviceCodeStatus::Approved.as_str()),
                    )
                    .col_expr(
                        device_code_session::Column::Subject,
                        Expr::value(subject.to_string()),
                    )
                    .filter(device_code_session::Column::Id.eq(id))
                    .filter(device_code_session::Column::ChallengeId.eq(challenge_id.to_string()))
                    .filter(device_code_session::Column::Active.eq(true))
                    .filter(device_code_session::Column::Status.eq(DeviceCodeStatus::New.as_str()))
                    .exec(self.db.as_ref()),
            )
            .await?;

        if result.rows_affected == 1 {
            tracing::info!(target: "audit", id, %challenge_id, "Device code session approved");
        }
        Ok(result.rows_affected == 1)
    }

    async fn deny_device_session(&self, id: i32) -> Result<bool, StorageError> {
        let result = self
            .bounded(
                device_code_session::Entity::update_many()
                    .col_expr(
                        device_code_session::Column::Status,
                        Expr::value(DeviceCodeStatus::Denied.as_str()),
                    )
                    .col_expr(device_code_session::Column::Active, Expr::value(false))
                    .filter(device_code_session::Column::Id.eq(id))
                    .filter(device_code_session::Column::Status.eq(DeviceCodeStatus::New.as_str()))
                    .exec(self.db.as_ref()),
            )
            .await?;

        if result.rows_affected == 1 {
            tracing::info!(target: "audit", id, "Device code session denied");
        }
        Ok(result.rows_affected == 1)
    }

    async fn load_or_create_subject(
        &self,
        sector_id: &str,
        username: &str,
    ) -> Result<Uuid, StorageError> {
        if let Some(subject) = self.find_subject(sector_id, username).await? {
            return Ok(subject);
        }

        let subject = Uuid::new_v4();
        let row = user_opaque_identifier::ActiveModel {
            id: NotSet,
            service: Set(OPENID_SERVICE.to_string()),
            sector_id: Set(sector_id.to_string()),
            username: Set(username.to_string()),
            identifier: Set(subject.to_string()),
        };

        match self.bounded(row.insert(self.db.as_ref())).await {
            Ok(_) => {
                tracing::info!(target: "audit", sector_id, username, "Pairwise subject created");
                Ok(subject)
            }
            // a concurrent first login may have inserted the row
            Err(StorageError::Db(err)) => match self.find_subject(sector_id, username).await? {
                Some(existing) => Ok(existing),
                None => Err(StorageError::Db(err)),
            },
            Err(err) => Err(err),
        }
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StorageError> {
        let db = self.db.as_ref();
        let consent = self
            .bounded(
                consent_session::Entity::delete_many()
                    .filter(consent_session::Column::ExpiresAt.lt(now))
                    .exec(db),
            )
            .await?;
        let device = self
            .bounded(
                device_code_session::Entity::delete_many()
                    .filter(device_code_session::Column::ExpiresAt.lt(now))
                    .exec(db),
            )
            .await?;
        let pushed = self
            .bounded(
                pushed_authorization_request::Entity::delete_many()
                    .filter(pushed_authorization_request::Column::ExpiresAt.lt(now))
                    .exec(db),
            )
            .await?;
        let codes = self
            .bounded(
                authorization_code::Entity::delete_many()
                    .filter(authorization_code::Column::ExpiresAt.lt(now))
                    .exec(db),
            )
            .await?;

        Ok(consent.rows_affected + device.rows_affected + pushed.rows_affected + codes.rows_affected)
    }
}

/// Periodically delete expired sessions, pushed requests and codes.
pub fn spawn_purge_task(store: Arc<dyn ConsentStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.purge_expired(OffsetDateTime::now_utc()).await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "Purged expired consent records"),
                Err(e) => tracing::warn!(error = %e, "Failed to purge expired consent records"),
            }
        }
    });
}
