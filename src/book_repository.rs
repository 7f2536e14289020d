use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::db::{Session, StoredAuthor, StoredBook};
use crate::models::Book;
use crate::repository::{self, RepositoryError, Value};

/// Optional filters for [`BookRepository::search`]. Text fields match as
/// case-insensitive substrings, `pub_date` exactly.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct BookSearch {
    pub title: Option<String>,
    pub isbn: Option<String>,
    pub category: Option<String>,
    pub language: Option<String>,
    pub pub_date: Option<NaiveDate>,
}

#[derive(Debug, Default, Clone)]
pub struct BookRepository;

impl BookRepository {
    pub fn new() -> Self {
        BookRepository
    }

    /// Creates the book and a fresh author row for each of its authors.
    /// Existing authors with the same name are not reused.
    #[tracing::instrument(skip(self, session, book), fields(isbn = %book.isbn))]
    pub async fn create_book(&self, session: &mut Session, book: &Book) -> Result<StoredBook, RepositoryError> {
        let mut authors = Vec::with_capacity(book.authors.len());
        for author in &book.authors {
            let stored: StoredAuthor =
                repository::create(session, &[("name", author.name.as_str().into())]).await?;
            authors.push(stored);
        }

        let mut stored: StoredBook = repository::create(
            session,
            &[
                ("isbn", book.isbn.as_str().into()),
                ("title", book.title.as_str().into()),
                ("category", book.category.as_str().into()),
                ("language", book.language.as_str().into()),
                ("pub_date", book.pub_date.into()),
            ],
        )
        .await?;

        for author in &authors {
            sqlx::query("insert into authors_books (author_id, book_id) values ($1, $2)")
                .bind(author.id)
                .bind(stored.id)
                .execute(session.connection())
                .await?;
        }
        debug!(book_id = %stored.id, num_authors = authors.len(), "Created book");

        stored.authors = authors;
        Ok(stored)
    }

    pub async fn get_book_by_id(&self, session: &mut Session, id: Uuid) -> Result<StoredBook, RepositoryError> {
        let book = repository::get_by_id(session, id).await?;
        self.load_authors(session, book).await
    }

    /// Books matching the natural key (isbn, title), oldest first.
    pub async fn filter_by_natural_key(
        &self,
        session: &mut Session,
        isbn: &str,
        title: &str,
    ) -> Result<Vec<StoredBook>, RepositoryError> {
        let books = repository::filter_by(session, &[("isbn", isbn.into()), ("title", title.into())]).await?;
        self.load_all_authors(session, books).await
    }

    #[tracing::instrument(skip(self, session))]
    pub async fn search(&self, session: &mut Session, filters: &BookSearch) -> Result<Vec<StoredBook>, RepositoryError> {
        let books = repository::search_by(
            session,
            &[
                ("title", filters.title.clone().map(Value::from)),
                ("isbn", filters.isbn.clone().map(Value::from)),
                ("category", filters.category.clone().map(Value::from)),
                ("language", filters.language.clone().map(Value::from)),
                ("pub_date", filters.pub_date.map(Value::from)),
            ],
        )
        .await?;
        self.load_all_authors(session, books).await
    }

    async fn load_all_authors(
        &self,
        session: &mut Session,
        books: Vec<StoredBook>,
    ) -> Result<Vec<StoredBook>, RepositoryError> {
        let mut loaded = Vec::with_capacity(books.len());
        for book in books {
            loaded.push(self.load_authors(session, book).await?);
        }
        Ok(loaded)
    }

    async fn load_authors(&self, session: &mut Session, mut book: StoredBook) -> Result<StoredBook, RepositoryError> {
        book.authors = sqlx::query_as::<_, StoredAuthor>(
            "select a.* from authors a
             join authors_books ab on ab.author_id = a.id
             where ab.book_id = $1
             order by a.created_at, a.rowid",
        )
        .bind(book.id)
        .fetch_all(session.connection())
        .await?;
        Ok(book)
    }
}
