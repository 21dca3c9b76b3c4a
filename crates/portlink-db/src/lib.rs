//! Relational store for the portlink control plane
//!
//! SeaORM entities and migrations for the topology tables (nodes, tunnels,
//! chain nodes, forwards) and the federation tables (bindings we hold on
//! remote panels, shares and runtime leases we grant to remote panels).

pub mod entities;
pub mod migrator;

use migrator::Migrator;
use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;

/// Connect to the database at the given URL (e.g. `sqlite://panel.db?mode=rwc`
/// or a postgres URL; `sqlite::memory:` in tests).
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    tracing::debug!(url = %url, "connecting to database");
    Database::connect(url).await
}

/// Apply all pending migrations.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    Migrator::up(db, None).await
}
