//! Dialect-neutral persistence layer.
//!
//! All statements are written once, in SQLite style with `?` placeholders,
//! and rewritten to `$1`-style numbering when running against Postgres.
//! Results come back as [`Row`]s of [`SqlValue`]s so the callers above this
//! module never see a driver type.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Arguments as _, Executor as _, Postgres, Sqlite, Transaction};
use thiserror::Error;

mod placeholder;
mod value;

pub use value::{Row, SqlValue};

use placeholder::number_placeholders;
use value::encode_timestamp;

const SQLITE_TUNING: &str = "\
    PRAGMA journal_mode = WAL;\n\
    PRAGMA synchronous = NORMAL;\n\
    PRAGMA cache_size = -64000;";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported database url `{url}`")]
    UnsupportedUrl { url: String },
    #[error("failed to connect to database at `{url}`")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("query failed: {source}")]
    Query {
        #[from]
        source: sqlx::Error,
    },
    #[error("could not decode column `{column}`: {message}")]
    Decode { column: String, message: String },
}

/// Handle to either supported backend.
///
/// Cloning is cheap; both variants wrap a connection pool.
#[derive(Clone, Debug)]
pub enum Database {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl From<SqlitePool> for Database {
    fn from(pool: SqlitePool) -> Self {
        Self::Sqlite(pool)
    }
}

impl From<PgPool> for Database {
    fn from(pool: PgPool) -> Self {
        Self::Postgres(pool)
    }
}

impl Database {
    /// Connects to the database named by `url`.
    ///
    /// `sqlite:` urls get a file created on demand and a busy timeout;
    /// `postgres:` urls get a standard pool. Anything else is rejected.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let db = if url.starts_with("sqlite:") {
            let options = SqliteConnectOptions::from_str(url)
                .map_err(|source| StoreError::Connect {
                    url: url.to_owned(),
                    source,
                })?
                .create_if_missing(true)
                .busy_timeout(Duration::from_secs(5));
            // A pooled `:memory:` url is a separate empty database per
            // connection, so pin those pools to a single connection.
            let max_connections = if url.contains(":memory:") { 1 } else { 5 };
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await
                .map_err(|source| StoreError::Connect {
                    url: url.to_owned(),
                    source,
                })?;
            Self::Sqlite(pool)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await
                .map_err(|source| StoreError::Connect {
                    url: url.to_owned(),
                    source,
                })?;
            Self::Postgres(pool)
        } else {
            return Err(StoreError::UnsupportedUrl {
                url: url.to_owned(),
            });
        };
        db.tune().await;
        Ok(db)
    }

    async fn tune(&self) {
        if let Self::Sqlite(pool) = self {
            if let Err(err) = pool.execute(SQLITE_TUNING).await {
                tracing::warn!(?err, "Failed to apply SQLite tuning pragmas: {err}");
            }
        }
    }

    pub async fn fetch_all(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<Row>, StoreError> {
        match self {
            Self::Sqlite(pool) => {
                let rows = sqlx::query_with(sql, sqlite_arguments(params))
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(Row::from_sqlite).collect()
            }
            Self::Postgres(pool) => {
                let sql = number_placeholders(sql);
                let rows = sqlx::query_with(&sql, pg_arguments(params))
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(Row::from_pg).collect()
            }
        }
    }

    pub async fn fetch_one(&self, sql: &str, params: Vec<SqlValue>) -> Result<Row, StoreError> {
        match self {
            Self::Sqlite(pool) => {
                let row = sqlx::query_with(sql, sqlite_arguments(params))
                    .fetch_one(pool)
                    .await?;
                Row::from_sqlite(&row)
            }
            Self::Postgres(pool) => {
                let sql = number_placeholders(sql);
                let row = sqlx::query_with(&sql, pg_arguments(params))
                    .fetch_one(pool)
                    .await?;
                Row::from_pg(&row)
            }
        }
    }

    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<Row>, StoreError> {
        match self {
            Self::Sqlite(pool) => {
                let row = sqlx::query_with(sql, sqlite_arguments(params))
                    .fetch_optional(pool)
                    .await?;
                row.as_ref().map(Row::from_sqlite).transpose()
            }
            Self::Postgres(pool) => {
                let sql = number_placeholders(sql);
                let row = sqlx::query_with(&sql, pg_arguments(params))
                    .fetch_optional(pool)
                    .await?;
                row.as_ref().map(Row::from_pg).transpose()
            }
        }
    }

    /// Runs a single statement and returns the number of affected rows.
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, StoreError> {
        match self {
            Self::Sqlite(pool) => Ok(sqlx::query_with(sql, sqlite_arguments(params))
                .execute(pool)
                .await?
                .rows_affected()),
            Self::Postgres(pool) => {
                let sql = number_placeholders(sql);
                Ok(sqlx::query_with(&sql, pg_arguments(params))
                    .execute(pool)
                    .await?
                    .rows_affected())
            }
        }
    }

    /// Runs a multi-statement script without parameters, e.g. schema DDL.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(pool) => {
                pool.execute(sql).await?;
            }
            Self::Postgres(pool) => {
                pool.execute(sql).await?;
            }
        }
        Ok(())
    }

    pub async fn begin(&self) -> Result<DbTransaction, StoreError> {
        Ok(match self {
            Self::Sqlite(pool) => DbTransaction::Sqlite(pool.begin().await?),
            Self::Postgres(pool) => DbTransaction::Postgres(pool.begin().await?),
        })
    }
}

/// An open transaction on either backend.
///
/// Dropping the value without calling [`DbTransaction::commit`] rolls the
/// transaction back.
pub enum DbTransaction {
    Sqlite(Transaction<'static, Sqlite>),
    Postgres(Transaction<'static, Postgres>),
}

impl DbTransaction {
    pub async fn execute(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<u64, StoreError> {
        match self {
            Self::Sqlite(tx) => Ok(sqlx::query_with(sql, sqlite_arguments(params))
                .execute(&mut **tx)
                .await?
                .rows_affected()),
            Self::Postgres(tx) => {
                let sql = number_placeholders(sql);
                Ok(sqlx::query_with(&sql, pg_arguments(params))
                    .execute(&mut **tx)
                    .await?
                    .rows_affected())
            }
        }
    }

    pub async fn execute_batch(&mut self, sql: &str) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(tx) => {
                let conn = &mut **tx;
                conn.execute(sql).await?;
            }
            Self::Postgres(tx) => {
                let conn = &mut **tx;
                conn.execute(sql).await?;
            }
        }
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(tx) => tx.commit().await?,
            Self::Postgres(tx) => tx.commit().await?,
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(tx) => tx.rollback().await?,
            Self::Postgres(tx) => tx.rollback().await?,
        }
        Ok(())
    }
}

fn sqlite_arguments(params: Vec<SqlValue>) -> SqliteArguments<'static> {
    // SQLite has no native uuid, timestamp, or json types; those bind as the
    // text renderings the decoders in `value` understand.
    let mut arguments = SqliteArguments::default();
    for param in params {
        match param {
            SqlValue::Text(value) => arguments.add(value),
            SqlValue::Int(value) => arguments.add(value),
            SqlValue::Float(value) => arguments.add(value),
            SqlValue::Bool(value) => arguments.add(value),
            SqlValue::Uuid(value) => arguments.add(value.map(|uuid| uuid.to_string())),
            SqlValue::Timestamp(value) => arguments.add(value.map(encode_timestamp)),
            SqlValue::Json(value) => arguments.add(value.map(|json| json.to_string())),
        }
    }
    arguments
}

fn pg_arguments(params: Vec<SqlValue>) -> PgArguments {
    let mut arguments = PgArguments::default();
    for param in params {
        match param {
            SqlValue::Text(value) => arguments.add(value),
            SqlValue::Int(value) => arguments.add(value),
            SqlValue::Float(value) => arguments.add(value),
            SqlValue::Bool(value) => arguments.add(value),
            SqlValue::Uuid(value) => arguments.add(value),
            SqlValue::Timestamp(value) => arguments.add(value),
            SqlValue::Json(value) => arguments.add(value),
        }
    }
    arguments
}
