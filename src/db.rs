use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repository::Entity;

#[derive(Debug, Serialize, Deserialize, FromRow, Clone, PartialEq)]
pub struct StoredBook {
    pub id: Uuid,
    pub isbn: String,
    pub title: String,
    pub category: String,
    pub language: String,
    pub pub_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[sqlx(skip)]
    pub authors: Vec<StoredAuthor>,
}

impl Entity for StoredBook {
    const TABLE: &'static str = "books";
    const FIELDS: &'static [&'static str] = &["id", "isbn", "title", "category", "language", "pub_date"];

    fn text(&self, field: &str) -> Option<&str> {
        match field {
            "isbn" => Some(&self.isbn),
            "title" => Some(&self.title),
            "category" => Some(&self.category),
            "language" => Some(&self.language),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone, PartialEq)]
pub struct StoredAuthor {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for StoredAuthor {
    const TABLE: &'static str = "authors";
    const FIELDS: &'static [&'static str] = &["id", "name"];

    fn text(&self, field: &str) -> Option<&str> {
        match field {
            "name" => Some(&self.name),
            _ => None,
        }
    }
}

pub async fn init_db(db_url: &str) -> Result<SqlitePool> {
    info!("Connecting to database at {}", db_url);
    let options = SqliteConnectOptions::from_str(db_url)
        .context("Invalid database url")?
        .create_if_missing(true)
        .foreign_keys(true);

    // Every connection to an in-memory database is a separate database.
    let pool_options = if db_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
    };

    let con_pool = pool_options
        .connect_with(options)
        .await
        .context("Failed to connect to the database")?;

    debug!("Running migrations");
    sqlx::migrate!()
        .run(&con_pool)
        .await
        .context("Failed to run migrations")?;

    Ok(con_pool)
}

/// Hands out one [`Session`] per logical operation. Sessions share the pool,
/// never a transaction.
#[derive(Clone, Debug)]
pub struct UnitOfWork {
    pool: SqlitePool,
}

impl UnitOfWork {
    pub fn new(pool: SqlitePool) -> Self {
        UnitOfWork { pool }
    }

    pub async fn begin(&self) -> Result<Session, sqlx::Error> {
        Ok(Session {
            tx: self.pool.begin().await?,
        })
    }
}

/// A transaction scoped to one unit of work.
///
/// Callers pass it by `&mut` to every repository call that belongs to the unit
/// and end it with [`Session::finish`]. A session dropped without finishing
/// (the owning future was cancelled, or it panicked) is rolled back and its
/// connection goes back to the pool.
pub struct Session {
    tx: Transaction<'static, Sqlite>,
}

impl Session {
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Commits when `result` is `Ok`, rolls back otherwise, and hands the
    /// result back. A failed commit turns into an error.
    pub async fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<sqlx::Error>,
    {
        match result {
            Ok(value) => {
                self.tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    init_db("sqlite::memory:").await.unwrap()
}

#[cfg(test)]
mod test {
    use super::*;

    async fn count_authors(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("select count(*) from authors")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn insert_author(session: &mut Session, name: &str) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query("insert into authors (id, name, created_at, updated_at) values ($1, $2, $3, $4)")
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(now)
            .bind(now)
            .execute(session.connection())
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn finish_ok_commits() {
        let pool = test_pool().await;
        let uow = UnitOfWork::new(pool.clone());

        let mut session = uow.begin().await.unwrap();
        let result = insert_author(&mut session, "Jane Austen").await;
        session.finish(result).await.unwrap();

        assert_eq!(count_authors(&pool).await, 1);
    }

    #[tokio::test]
    async fn finish_err_rolls_back_partial_writes() {
        let pool = test_pool().await;
        let uow = UnitOfWork::new(pool.clone());

        let mut session = uow.begin().await.unwrap();
        let result = async {
            insert_author(&mut session, "Jane Austen").await?;
            Err::<(), sqlx::Error>(sqlx::Error::RowNotFound)
        }
        .await;
        let err = session.finish(result).await.unwrap_err();

        assert!(matches!(err, sqlx::Error::RowNotFound));
        assert_eq!(count_authors(&pool).await, 0);
    }

    #[tokio::test]
    async fn dropped_session_rolls_back() {
        let pool = test_pool().await;
        let uow = UnitOfWork::new(pool.clone());

        {
            let mut session = uow.begin().await.unwrap();
            insert_author(&mut session, "Jane Austen").await.unwrap();
        }

        assert_eq!(count_authors(&pool).await, 0);
    }
}
