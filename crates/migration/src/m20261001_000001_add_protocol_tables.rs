//! Migration creating the tables owned by the bundled protocol engine.
//!
//! Creates tables for:
//! - authorization_code: issued codes, stored by signature only
//! - pushed_authorization_request: PAR payloads addressed by request_uri

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AuthorizationCode::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthorizationCode::Signature)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AuthorizationCode::ChallengeId)
                            .string_len(36)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuthorizationCode::ClientId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuthorizationCode::Subject)
                            .string_len(36)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuthorizationCode::RedirectUri)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AuthorizationCode::Scope).text().not_null())
                    .col(ColumnDef::new(AuthorizationCode::Audience).text().not_null())
                    .col(ColumnDef::new(AuthorizationCode::Nonce).string().null())
                    .col(ColumnDef::new(AuthorizationCode::Claims).text().not_null())
                    .col(
                        ColumnDef::new(AuthorizationCode::CodeChallenge)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AuthorizationCode::CodeChallengeMethod)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AuthorizationCode::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(AuthorizationCode::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuthorizationCode::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PushedAuthorizationRequest::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PushedAuthorizationRequest::RequestUri)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PushedAuthorizationRequest::ClientId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PushedAuthorizationRequest::Form)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PushedAuthorizationRequest::Used)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(PushedAuthorizationRequest::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PushedAuthorizationRequest::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(PushedAuthorizationRequest::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(AuthorizationCode::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum AuthorizationCode {
    Table,
    Signature,
    ChallengeId,
    ClientId,
    Subject,
    RedirectUri,
    Scope,
    Audience,
    Nonce,
    Claims,
    CodeChallenge,
    CodeChallengeMethod,
    Active,
    ExpiresAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum PushedAuthorizationRequest {
    Table,
    RequestUri,
    ClientId,
    Form,
    Used,
    ExpiresAt,
    CreatedAt,
}
