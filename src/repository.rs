//! Generic persistence primitives over mapped entity types.
//!
//! Queries are assembled with [`sqlx::QueryBuilder`] so every value is bound,
//! and field names are checked against the entity's declared columns before
//! they reach the SQL text.

use chrono::{NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use thiserror::Error;
use uuid::Uuid;

use crate::db::Session;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("No {table} row with id {id}")]
    NotFound { table: &'static str, id: Uuid },

    #[error("Unknown field {field} for {table}")]
    UnknownField { table: &'static str, field: String },

    #[error("Database failure: {0}")]
    Database(#[from] sqlx::Error),
}

/// A persisted type with a generated `id` and `created_at`/`updated_at`
/// timestamps, stored in one table.
pub trait Entity: for<'r> FromRow<'r, SqliteRow> + Send + Unpin {
    const TABLE: &'static str;
    /// Columns that may be written and filtered on.
    const FIELDS: &'static [&'static str];

    /// The value of a text column, for matching done outside SQL.
    fn text(&self, field: &str) -> Option<&str>;
}

/// A column value used for inserts and filters.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Date(NaiveDate),
    Id(Uuid),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Id(value)
    }
}

fn push_value(query: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Text(text) => query.push_bind(text.clone()),
        Value::Date(date) => query.push_bind(*date),
        Value::Id(id) => query.push_bind(*id),
    };
}

fn check_field<E: Entity>(field: &str) -> Result<(), RepositoryError> {
    if E::FIELDS.contains(&field) {
        Ok(())
    } else {
        Err(RepositoryError::UnknownField {
            table: E::TABLE,
            field: field.to_string(),
        })
    }
}

/// Inserts a row built from `values` and returns it with its generated id.
#[tracing::instrument(skip(session, values), fields(table = E::TABLE), level = tracing::Level::DEBUG)]
pub async fn create<E: Entity>(
    session: &mut Session,
    values: &[(&str, Value)],
) -> Result<E, RepositoryError> {
    for (field, _) in values {
        check_field::<E>(field)?;
    }
    let now = Utc::now();

    let mut query = QueryBuilder::<Sqlite>::new(format!("insert into {} (id, created_at, updated_at", E::TABLE));
    for (field, _) in values {
        query.push(", ").push(*field);
    }
    query.push(") values (");
    query.push_bind(Uuid::new_v4()).push(", ");
    query.push_bind(now).push(", ");
    query.push_bind(now);
    for (_, value) in values {
        query.push(", ");
        push_value(&mut query, value);
    }
    query.push(") returning *");

    Ok(query
        .build_query_as::<E>()
        .fetch_one(session.connection())
        .await?)
}

pub async fn get_by_id<E: Entity>(session: &mut Session, id: Uuid) -> Result<E, RepositoryError> {
    let mut query = QueryBuilder::<Sqlite>::new(format!("select * from {} where id = ", E::TABLE));
    query.push_bind(id);

    query
        .build_query_as::<E>()
        .fetch_optional(session.connection())
        .await?
        .ok_or(RepositoryError::NotFound { table: E::TABLE, id })
}

/// Rows where every field equals its value exactly, oldest first.
#[tracing::instrument(skip(session, filters), fields(table = E::TABLE), level = tracing::Level::DEBUG)]
pub async fn filter_by<E: Entity>(
    session: &mut Session,
    filters: &[(&str, Value)],
) -> Result<Vec<E>, RepositoryError> {
    let mut query = QueryBuilder::<Sqlite>::new(format!("select * from {} where 1 = 1", E::TABLE));
    for (field, value) in filters {
        check_field::<E>(field)?;
        query.push(" and ").push(*field).push(" = ");
        push_value(&mut query, value);
    }
    query.push(" order by created_at, rowid");

    Ok(query
        .build_query_as::<E>()
        .fetch_all(session.connection())
        .await?)
}

/// Like [`filter_by`], but text values match as case-insensitive substrings
/// and `None` values drop the field from the filter.
///
/// SQLite's `lower()` and `like` only fold ASCII, so text filters are applied
/// to the fetched rows with Unicode lowercasing.
#[tracing::instrument(skip(session, filters), fields(table = E::TABLE), level = tracing::Level::DEBUG)]
pub async fn search_by<E: Entity>(
    session: &mut Session,
    filters: &[(&str, Option<Value>)],
) -> Result<Vec<E>, RepositoryError> {
    let mut query = QueryBuilder::<Sqlite>::new(format!("select * from {} where 1 = 1", E::TABLE));
    let mut text_filters = Vec::new();
    for (field, value) in filters {
        check_field::<E>(field)?;
        match value {
            None => continue,
            Some(Value::Text(text)) => text_filters.push((*field, text.to_lowercase())),
            Some(other) => {
                query.push(" and ").push(*field).push(" = ");
                push_value(&mut query, other);
            }
        }
    }
    query.push(" order by created_at, rowid");

    let mut rows = query
        .build_query_as::<E>()
        .fetch_all(session.connection())
        .await?;
    rows.retain(|row| {
        text_filters.iter().all(|(field, needle)| {
            row.text(field)
                .is_some_and(|value| value.to_lowercase().contains(needle.as_str()))
        })
    });
    Ok(rows)
}
