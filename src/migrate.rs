//! Schema migrations with a persistent ledger.
//!
//! Scripts are written for Postgres and rewritten on the fly for SQLite, so a
//! single `migrations/` directory serves both backends. Applied script names
//! land in `schema_migrations` and are never run twice.

use chrono::Utc;
use fxhash::FxHashSet;
use thiserror::Error;

use crate::db::{Database, SqlValue, StoreError};

/// One schema script, embedded at compile time.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_create_sync_jobs",
        sql: include_str!("../migrations/0001_create_sync_jobs.sql"),
    },
    Migration {
        name: "0002_create_audit_log",
        sql: include_str!("../migrations/0002_create_audit_log.sql"),
    },
    Migration {
        name: "0003_add_dispatch_indexes",
        sql: include_str!("../migrations/0003_add_dispatch_indexes.sql"),
    },
];

const LEDGER_DDL: &str = "\
    CREATE TABLE IF NOT EXISTS schema_migrations (\n\
        name TEXT PRIMARY KEY,\n\
        applied_at TIMESTAMPTZ NOT NULL DEFAULT now()\n\
    )";

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("migration `{name}` failed")]
    Apply {
        name: &'static str,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies pending schema scripts in ascending name order.
#[derive(Debug, Clone)]
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Migrator {
    pub fn new() -> Self {
        Self {
            migrations: MIGRATIONS.to_vec(),
        }
    }

    #[cfg(test)]
    fn with_migrations(migrations: Vec<Migration>) -> Self {
        Self { migrations }
    }

    /// Applies every script not yet in the ledger and returns how many ran.
    ///
    /// Each script runs in its own transaction together with its ledger
    /// entry, so a failing script leaves nothing behind. The first failure
    /// aborts the run; scripts after it stay pending.
    pub async fn run(&self, db: &Database) -> Result<u32, MigrateError> {
        db.execute_batch(&prepare(LEDGER_DDL, db)).await?;

        let rows = db
            .fetch_all("SELECT name FROM schema_migrations", vec![])
            .await?;
        let applied = rows
            .iter()
            .map(|row| row.get_text("name"))
            .collect::<Result<FxHashSet<_>, _>>()?;

        let mut pending: Vec<Migration> = self
            .migrations
            .iter()
            .filter(|migration| !applied.contains(migration.name))
            .copied()
            .collect();
        pending.sort_by_key(|migration| migration.name);

        let mut count = 0;
        for migration in pending {
            apply(db, migration)
                .await
                .map_err(|source| MigrateError::Apply {
                    name: migration.name,
                    source,
                })?;
            tracing::info!(name = migration.name, "Applied migration {}", migration.name);
            count += 1;
        }
        Ok(count)
    }
}

async fn apply(db: &Database, migration: Migration) -> Result<(), StoreError> {
    let mut tx = db.begin().await?;
    tx.execute_batch(&prepare(migration.sql, db)).await?;
    tx.execute(
        "INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)",
        vec![SqlValue::from(migration.name), SqlValue::from(Utc::now())],
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

fn prepare(sql: &str, db: &Database) -> String {
    match db {
        Database::Sqlite(_) => adapt_for_sqlite(sql),
        Database::Postgres(_) => sql.to_owned(),
    }
}

/// Rewrites a Postgres script into the SQLite dialect.
///
/// Extension setup is dropped, `uuid_generate_v4()` defaults go away (ids are
/// always assigned by the application), and the column types SQLite lacks
/// become `TEXT`. The uuid default is stripped before the `UUID` type rewrite
/// so the case-sensitive replace cannot mangle the function name.
fn adapt_for_sqlite(sql: &str) -> String {
    sql.lines()
        .filter(|line| {
            !line
                .trim_start()
                .to_uppercase()
                .starts_with("CREATE EXTENSION")
        })
        .map(|line| {
            line.replace(" DEFAULT uuid_generate_v4()", "")
                .replace("TIMESTAMPTZ", "TEXT")
                .replace("JSONB", "TEXT")
                .replace("UUID", "TEXT")
                .replace("now()", "CURRENT_TIMESTAMP")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
