use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use fxhash::FxHashMap;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column as _, Row as _, TypeInfo as _, ValueRef as _};
use uuid::Uuid;

use super::StoreError;

/// A dialect-neutral bound parameter or result cell.
///
/// Every variant wraps an `Option` so that a null bind still carries a
/// concrete SQL type on the wire; Postgres rejects untyped nulls in a number
/// of positions.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
    Bool(Option<bool>),
    Uuid(Option<Uuid>),
    Timestamp(Option<DateTime<Utc>>),
    Json(Option<Value>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(
            self,
            Self::Text(None)
                | Self::Int(None)
                | Self::Float(None)
                | Self::Bool(None)
                | Self::Uuid(None)
                | Self::Timestamp(None)
                | Self::Json(None)
        )
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(Some(value.to_owned()))
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(Some(value))
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        Self::Text(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(Some(value.into()))
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(Some(value))
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(value: Option<i64>) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Float(Some(value))
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(Some(value))
    }
}

impl From<Uuid> for SqlValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(Some(value))
    }
}

impl From<Option<Uuid>> for SqlValue {
    fn from(value: Option<Uuid>) -> Self {
        Self::Uuid(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(Some(value))
    }
}

impl From<Option<DateTime<Utc>>> for SqlValue {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        Self::Json(Some(value))
    }
}

impl From<Option<Value>> for SqlValue {
    fn from(value: Option<Value>) -> Self {
        Self::Json(value)
    }
}

/// Encodes a timestamp the way the SQLite adapter stores it.
///
/// Fixed-width microseconds with a `Z` suffix keep lexicographic comparison
/// in SQL equal to chronological comparison, and match the microsecond
/// precision of a Postgres `TIMESTAMPTZ`.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One result row as a column-name keyed map of [`SqlValue`]s.
///
/// The accessors perform the coercions the two backends need: numbers arrive
/// as native integers or as text depending on the driver, and SQLite returns
/// UUIDs, timestamps, and JSON as the text the adapter stored.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: FxHashMap<String, SqlValue>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    fn value(&self, column: &str) -> Result<&SqlValue, StoreError> {
        self.columns.get(column).ok_or_else(|| StoreError::Decode {
            column: column.to_owned(),
            message: "missing column".to_owned(),
        })
    }

    pub fn get_text(&self, column: &str) -> Result<String, StoreError> {
        match self.value(column)? {
            SqlValue::Text(Some(text)) => Ok(text.clone()),
            other => Err(unexpected(column, "text", other)),
        }
    }

    pub fn opt_text(&self, column: &str) -> Result<Option<String>, StoreError> {
        match self.value(column)? {
            SqlValue::Text(Some(text)) => Ok(Some(text.clone())),
            value if value.is_null() => Ok(None),
            other => Err(unexpected(column, "text", other)),
        }
    }

    /// Reads a column as an integer.
    ///
    /// Nulls and empty strings coerce to 0, numeric strings are parsed,
    /// floats truncate, and booleans map to 0/1, so a `count(*)` reads the
    /// same whichever driver produced it.
    pub fn get_i64(&self, column: &str) -> Result<i64, StoreError> {
        match self.value(column)? {
            SqlValue::Int(Some(value)) => Ok(*value),
            SqlValue::Float(Some(value)) => Ok(*value as i64),
            SqlValue::Bool(Some(value)) => Ok(i64::from(*value)),
            SqlValue::Text(Some(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(0);
                }
                text.parse().map_err(|err| StoreError::Decode {
                    column: column.to_owned(),
                    message: format!("expected a number, got `{text}`: {err}"),
                })
            }
            value if value.is_null() => Ok(0),
            other => Err(unexpected(column, "integer", other)),
        }
    }

    pub fn get_uuid(&self, column: &str) -> Result<Uuid, StoreError> {
        self.opt_uuid(column)?.ok_or_else(|| StoreError::Decode {
            column: column.to_owned(),
            message: "unexpected NULL".to_owned(),
        })
    }

    pub fn opt_uuid(&self, column: &str) -> Result<Option<Uuid>, StoreError> {
        match self.value(column)? {
            SqlValue::Uuid(Some(uuid)) => Ok(Some(*uuid)),
            SqlValue::Text(Some(text)) => {
                Uuid::parse_str(text).map(Some).map_err(|err| StoreError::Decode {
                    column: column.to_owned(),
                    message: format!("invalid uuid `{text}`: {err}"),
                })
            }
            value if value.is_null() => Ok(None),
            other => Err(unexpected(column, "uuid", other)),
        }
    }

    pub fn get_timestamp(&self, column: &str) -> Result<DateTime<Utc>, StoreError> {
        self.opt_timestamp(column)?.ok_or_else(|| StoreError::Decode {
            column: column.to_owned(),
            message: "unexpected NULL".to_owned(),
        })
    }

    pub fn opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.value(column)? {
            SqlValue::Timestamp(Some(value)) => Ok(Some(*value)),
            SqlValue::Text(Some(text)) => parse_timestamp(column, text).map(Some),
            value if value.is_null() => Ok(None),
            other => Err(unexpected(column, "timestamp", other)),
        }
    }

    pub fn opt_json(&self, column: &str) -> Result<Option<Value>, StoreError> {
        match self.value(column)? {
            SqlValue::Json(Some(value)) => Ok(Some(value.clone())),
            SqlValue::Text(Some(text)) => {
                if text.is_empty() {
                    return Ok(None);
                }
                serde_json::from_str(text).map(Some).map_err(|err| StoreError::Decode {
                    column: column.to_owned(),
                    message: format!("invalid json: {err}"),
                })
            }
            value if value.is_null() => Ok(None),
            other => Err(unexpected(column, "json", other)),
        }
    }

    pub(crate) fn from_pg(row: &PgRow) -> Result<Self, StoreError> {
        let mut columns = FxHashMap::default();
        for (i, column) in row.columns().iter().enumerate() {
            let name = column.name().to_owned();
            // The declared column type is stable on Postgres even when the
            // cell itself is NULL.
            let value = match column.type_info().name() {
                "BOOL" => SqlValue::Bool(row.try_get(i).map_err(|err| decode_error(&name, err))?),
                "INT2" => SqlValue::Int(
                    row.try_get::<Option<i16>, _>(i)
                        .map_err(|err| decode_error(&name, err))?
                        .map(i64::from),
                ),
                "INT4" => SqlValue::Int(
                    row.try_get::<Option<i32>, _>(i)
                        .map_err(|err| decode_error(&name, err))?
                        .map(i64::from),
                ),
                "INT8" => SqlValue::Int(row.try_get(i).map_err(|err| decode_error(&name, err))?),
                "FLOAT4" => SqlValue::Float(
                    row.try_get::<Option<f32>, _>(i)
                        .map_err(|err| decode_error(&name, err))?
                        .map(f64::from),
                ),
                "FLOAT8" => {
                    SqlValue::Float(row.try_get(i).map_err(|err| decode_error(&name, err))?)
                }
                "UUID" => SqlValue::Uuid(row.try_get(i).map_err(|err| decode_error(&name, err))?),
                "TIMESTAMPTZ" => {
                    SqlValue::Timestamp(row.try_get(i).map_err(|err| decode_error(&name, err))?)
                }
                "TIMESTAMP" => SqlValue::Timestamp(
                    row.try_get::<Option<NaiveDateTime>, _>(i)
                        .map_err(|err| decode_error(&name, err))?
                        .map(|naive| naive.and_utc()),
                ),
                "JSON" | "JSONB" => {
                    SqlValue::Json(row.try_get(i).map_err(|err| decode_error(&name, err))?)
                }
                "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
                    SqlValue::Text(row.try_get(i).map_err(|err| decode_error(&name, err))?)
                }
                other => {
                    return Err(StoreError::Decode {
                        column: name,
                        message: format!("unsupported column type {other}"),
                    })
                }
            };
            columns.insert(name, value);
        }
        Ok(Self { columns })
    }

    pub(crate) fn from_sqlite(row: &SqliteRow) -> Result<Self, StoreError> {
        let mut columns = FxHashMap::default();
        for (i, column) in row.columns().iter().enumerate() {
            let name = column.name().to_owned();
            let raw = row
                .try_get_raw(i)
                .map_err(|err| decode_error(&name, err))?;
            // SQLite types are per value, not per column; a NULL cell has no
            // usable type at all.
            let value = if raw.is_null() {
                SqlValue::Text(None)
            } else {
                match raw.type_info().name() {
                    "INTEGER" | "BOOLEAN" => {
                        SqlValue::Int(row.try_get(i).map_err(|err| decode_error(&name, err))?)
                    }
                    "REAL" | "NUMERIC" => {
                        SqlValue::Float(row.try_get(i).map_err(|err| decode_error(&name, err))?)
                    }
                    "TEXT" | "DATETIME" | "DATE" | "TIME" => {
                        SqlValue::Text(row.try_get(i).map_err(|err| decode_error(&name, err))?)
                    }
                    other => {
                        return Err(StoreError::Decode {
                            column: name,
                            message: format!("unsupported column type {other}"),
                        })
                    }
                }
            };
            columns.insert(name, value);
        }
        Ok(Self { columns })
    }
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    // Rows the adapter wrote are RFC 3339; SQLite's CURRENT_TIMESTAMP default
    // writes `%Y-%m-%d %H:%M:%S` instead.
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|value| value.and_utc())
        })
        .map_err(|err| StoreError::Decode {
            column: column.to_owned(),
            message: format!("invalid timestamp `{raw}`: {err}"),
        })
}

fn unexpected(column: &str, expected: &str, value: &SqlValue) -> StoreError {
    StoreError::Decode {
        column: column.to_owned(),
        message: format!("expected {expected}, got {value:?}"),
    }
}

fn decode_error(column: &str, err: sqlx::Error) -> StoreError {
    StoreError::Decode {
        column: column.to_owned(),
        message: err.to_string(),
    }
}
