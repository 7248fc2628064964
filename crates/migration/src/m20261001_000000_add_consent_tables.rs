//! Migration creating the Consent Store tables.
//!
//! Creates tables for:
//! - consent_session: one authorization decision per challenge id
//! - consent_preconfiguration: remembered ("pre-configured") consent grants
//! - device_code_session: RFC 8628 device authorization sessions
//! - user_opaque_identifier: pairwise subject identifiers per sector

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 1. Consent sessions
        manager
            .create_table(
                Table::create()
                    .table(ConsentSession::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConsentSession::ChallengeId)
                            .string_len(36)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ConsentSession::ClientId).string().not_null())
                    .col(ColumnDef::new(ConsentSession::Subject).string_len(36).null())
                    .col(
                        ColumnDef::new(ConsentSession::RequestedScopes)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentSession::RequestedAudience)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentSession::GrantedScopes)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(ConsentSession::GrantedAudience)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(ConsentSession::GrantedClaims)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(ConsentSession::Form).text().not_null())
                    .col(
                        ColumnDef::new(ConsentSession::RequestedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentSession::RespondedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ConsentSession::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentSession::Granted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ConsentSession::Authorized)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ConsentSession::PreconfigurationId)
                            .integer()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_consent_session_expires_at")
                    .table(ConsentSession::Table)
                    .col(ConsentSession::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // 2. Pre-configured consent
        manager
            .create_table(
                Table::create()
                    .table(ConsentPreconfiguration::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::ClientId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::Subject)
                            .string_len(36)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::Scopes)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::Audience)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::GrantedClaims)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::ClaimsSignature)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ConsentPreconfiguration::Revoked)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_consent_preconfiguration_lookup")
                    .table(ConsentPreconfiguration::Table)
                    .col(ConsentPreconfiguration::ClientId)
                    .col(ConsentPreconfiguration::Subject)
                    .to_owned(),
            )
            .await?;

        // 3. Device code sessions
        manager
            .create_table(
                Table::create()
                    .table(DeviceCodeSession::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceCodeSession::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::ClientId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::DeviceCodeSignature)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::UserCodeSignature)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::RequestId)
                            .string_len(36)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::ChallengeId)
                            .string_len(36)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::Status)
                            .string_len(16)
                            .not_null()
                            .default("new"),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::Revoked)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::Subject)
                            .string_len(36)
                            .null(),
                    )
                    .col(ColumnDef::new(DeviceCodeSession::Scopes).text().not_null())
                    .col(
                        ColumnDef::new(DeviceCodeSession::Audience)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeviceCodeSession::Form).text().not_null())
                    .col(
                        ColumnDef::new(DeviceCodeSession::RequestedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodeSession::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // 4. Pairwise subject identifiers
        manager
            .create_table(
                Table::create()
                    .table(UserOpaqueIdentifier::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserOpaqueIdentifier::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(UserOpaqueIdentifier::Service)
                            .string_len(20)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserOpaqueIdentifier::SectorId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserOpaqueIdentifier::Username)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UserOpaqueIdentifier::Identifier)
                            .string_len(36)
                            .not_null()
                            .unique_key(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_user_opaque_identifier_lookup")
                    .table(UserOpaqueIdentifier::Table)
                    .col(UserOpaqueIdentifier::Service)
                    .col(UserOpaqueIdentifier::SectorId)
                    .col(UserOpaqueIdentifier::Username)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_user_opaque_identifier_lookup")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_consent_preconfiguration_lookup")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(Index::drop().name("idx_consent_session_expires_at").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(UserOpaqueIdentifier::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DeviceCodeSession::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ConsentPreconfiguration::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ConsentSession::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum ConsentSession {
    Table,
    ChallengeId,
    ClientId,
    Subject,
    RequestedScopes,
    RequestedAudience,
    GrantedScopes,
    GrantedAudience,
    GrantedClaims,
    Form,
    RequestedAt,
    RespondedAt,
    ExpiresAt,
    Granted,
    Authorized,
    PreconfigurationId,
}

#[derive(DeriveIden)]
enum ConsentPreconfiguration {
    Table,
    Id,
    ClientId,
    Subject,
    Scopes,
    Audience,
    GrantedClaims,
    ClaimsSignature,
    CreatedAt,
    ExpiresAt,
    Revoked,
}

#[derive(DeriveIden)]
enum DeviceCodeSession {
    Table,
    Id,
    ClientId,
    DeviceCodeSignature,
    UserCodeSignature,
    RequestId,
    ChallengeId,
    Status,
    Active,
    Revoked,
    Subject,
    Scopes,
    Audience,
    Form,
    RequestedAt,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum UserOpaqueIdentifier {
    Table,
    Id,
    Service,
    SectorId,
    Username,
    Identifier,
}
