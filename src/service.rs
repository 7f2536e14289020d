use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::book_repository::{BookRepository, BookSearch};
use crate::books_source::BooksSource;
use crate::db::{Session, StoredBook, UnitOfWork};
use crate::error::{AppError, ServiceError};
use crate::models::Book;
use crate::repository::RepositoryError;

/// Ingests books from the catalog and queries the stored ones.
///
/// Every call runs in its own [`Session`]. Fetched books are resolved against
/// stored ones by their natural key (isbn, title): the check and the insert
/// are not atomic, so two concurrent fetches of the same book can both insert.
pub struct BookService {
    book_repository: BookRepository,
    unit_of_work: UnitOfWork,
    books_source: Arc<dyn BooksSource>,
}

impl BookService {
    pub fn new(book_repository: BookRepository, unit_of_work: UnitOfWork, books_source: Arc<dyn BooksSource>) -> Self {
        BookService {
            book_repository,
            unit_of_work,
            books_source,
        }
    }

    async fn create_if_not_exists(&self, session: &mut Session, book: &Book) -> Result<StoredBook, RepositoryError> {
        let existing = self
            .book_repository
            .filter_by_natural_key(session, &book.isbn, &book.title)
            .await?;
        if let Some(stored) = existing.into_iter().next() {
            return Ok(stored);
        }

        debug!(isbn = %book.isbn, title = %book.title, "Creating book");
        self.book_repository.create_book(session, book).await
    }

    async fn store_all(&self, books: &[Book]) -> Result<Vec<StoredBook>, ServiceError> {
        let mut session = self.unit_of_work.begin().await?;
        let result: Result<_, RepositoryError> = async {
            let mut stored = Vec::with_capacity(books.len());
            for book in books {
                stored.push(self.create_if_not_exists(&mut session, book).await?);
            }
            Ok(stored)
        }
        .await;
        Ok(session.finish(result).await?)
    }

    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: Uuid) -> Result<StoredBook, ServiceError> {
        let mut session = self.unit_of_work.begin().await?;
        let result = self.book_repository.get_book_by_id(&mut session, id).await;
        session.finish(result).await.map_err(|e| match e {
            RepositoryError::NotFound { .. } => AppError::new("Book not found").into(),
            other => other.into(),
        })
    }

    #[instrument(skip(self))]
    pub async fn fetch_by_id(&self, external_id: &str) -> Result<StoredBook, ServiceError> {
        let book = self.books_source.get_book_by_id(external_id).await?;

        let mut session = self.unit_of_work.begin().await?;
        let result = self.create_if_not_exists(&mut session, &book).await;
        Ok(session.finish(result).await?)
    }

    #[instrument(skip(self))]
    pub async fn fetch_by_isbn(&self, isbn: &str) -> Result<Vec<StoredBook>, ServiceError> {
        let books = self.books_source.get_books_by_isbn(isbn).await?;
        self.store_all(&books).await
    }

    #[instrument(skip(self), fields(num_books))]
    pub async fn fetch_by_category(&self, category: &str) -> Result<Vec<StoredBook>, ServiceError> {
        let books = self.books_source.get_books_by_category(category).await?;
        let stored = self.store_all(&books).await?;
        tracing::Span::current().record("num_books", stored.len());
        debug!(isbns = ?stored.iter().map(|b| b.isbn.as_str()).collect::<Vec<_>>(), "Stored category");
        Ok(stored)
    }

    #[instrument(skip(self))]
    pub async fn search(&self, filters: &BookSearch) -> Result<Vec<StoredBook>, ServiceError> {
        let mut session = self.unit_of_work.begin().await?;
        let result = self.book_repository.search(&mut session, filters).await;
        Ok(session.finish(result).await?)
    }
}
