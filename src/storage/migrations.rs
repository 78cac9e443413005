//! Named schema migrations for the PostgreSQL account store.
//!
//! Pending migrations are applied in one transaction under an advisory lock,
//! so several workers started with `--migrate` at once apply each migration
//! exactly once. Applied names are recorded in `_migrations`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use super::schema;

/// Advisory lock key held while migrating ("replaywt").
const MIGRATION_LOCK_KEY: i64 = 0x7265_706c_6179_7774;

const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    name VARCHAR(255) PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {name} failed: {source}")]
    Failed {
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// One schema change, applied at most once.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// Every migration, oldest first. Names are permanent once released.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_tracked_accounts",
        sql: schema::CREATE_TRACKED_ACCOUNTS_TABLE,
    },
    Migration {
        name: "0002_subscriptions",
        sql: schema::CREATE_SUBSCRIPTIONS_TABLE,
    },
    Migration {
        name: "0003_unlocked_checked_index",
        sql: schema::CREATE_UNLOCKED_CHECKED_INDEX,
    },
    Migration {
        name: "0004_locked_at_index",
        sql: schema::CREATE_LOCKED_AT_INDEX,
    },
    Migration {
        name: "0005_subscriptions_account_index",
        sql: schema::CREATE_SUBSCRIPTIONS_ACCOUNT_INDEX,
    },
];

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Migrations from `all` whose name is not in `applied`, in order.
fn pending<'a>(all: &'a [Migration], applied: &HashSet<String>) -> Vec<&'a Migration> {
    all.iter().filter(|m| !applied.contains(m.name)).collect()
}

/// Applies every pending migration. Returns how many ran.
pub async fn apply_pending(pool: &PgPool) -> Result<usize, MigrationError> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    sqlx::query(CREATE_MIGRATIONS_TABLE).execute(&mut *tx).await?;

    let applied: HashSet<String> = sqlx::query_scalar::<_, String>("SELECT name FROM _migrations")
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();

    let todo = pending(MIGRATIONS, &applied);
    for migration in &todo {
        sqlx::query(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|source| MigrationError::Failed {
                name: migration.name,
                source,
            })?;
        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        info!(migration = migration.name, "Applied migration");
    }

    tx.commit().await?;
    Ok(todo.len())
}

/// Lists applied migrations, oldest first.
pub async fn applied(pool: &PgPool) -> Result<Vec<AppliedMigration>, MigrationError> {
    sqlx::query(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let rows: Vec<AppliedMigration> =
        sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY applied_at, name")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let names: HashSet<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
        assert_eq!(names.len(), MIGRATIONS.len());

        let mut sorted: Vec<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
        sorted.sort();
        assert_eq!(sorted, MIGRATIONS.iter().map(|m| m.name).collect::<Vec<_>>());

        // Accounts first; subscriptions reference them
        assert!(MIGRATIONS[0].sql.contains(schema::tables::TRACKED_ACCOUNTS));
        assert!(MIGRATIONS[1].sql.contains(schema::tables::SUBSCRIPTIONS));
        assert!(MIGRATIONS[1].sql.contains("REFERENCES tracked_accounts"));
        assert!(MIGRATIONS[2..].iter().all(|m| m.sql.contains("CREATE INDEX")));
        // Each runs as a single prepared statement
        assert!(MIGRATIONS
            .iter()
            .all(|m| !m.sql.trim().trim_end_matches(';').contains(';')));
    }

    #[test]
    fn test_pending_skips_applied_names() {
        let applied: HashSet<String> = ["0001_tracked_accounts", "0003_unlocked_checked_index"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let names: Vec<&str> = pending(MIGRATIONS, &applied).iter().map(|m| m.name).collect();

        assert_eq!(
            names,
            vec![
                "0002_subscriptions",
                "0004_locked_at_index",
                "0005_subscriptions_account_index"
            ]
        );
        assert!(pending(MIGRATIONS, &HashSet::new()).len() == MIGRATIONS.len());
    }

    #[test]
    fn test_failed_migration_names_itself() {
        let err = MigrationError::Failed {
            name: "0002_subscriptions",
            source: sqlx::Error::RowNotFound,
        };
        assert!(err.to_string().contains("0002_subscriptions"));
    }
}
