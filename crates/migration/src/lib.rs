pub use sea_orm_migration::prelude::*;

mod m20261001_000000_add_consent_tables;
mod m20261001_000001_add_protocol_tables;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261001_000000_add_consent_tables::Migration),
            Box::new(m20261001_000001_add_protocol_tables::Migration),
        ]
    }
}
