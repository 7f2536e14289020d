use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Weekday};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::caches::Cache;
use crate::models::{Author, Book};
use crate::reqwest_traced_client::{HttpClient, HttpError};

#[derive(Error, Debug)]
pub enum SourceError {
    /// The catalog answered with an error, or with data that can't be mapped.
    #[error("external value error: {0}")]
    ExternalValue(String),

    #[error(transparent)]
    Transport(#[from] HttpError),
}

/// A remote catalog of books.
#[async_trait]
pub trait BooksSource: Send + Sync {
    async fn get_book_by_id(&self, id: &str) -> Result<Book, SourceError>;

    async fn search_books(&self, query: &str) -> Result<Vec<Book>, SourceError>;

    async fn get_books_by_isbn(&self, isbn: &str) -> Result<Vec<Book>, SourceError> {
        self.search_books(&format!("isbn:{isbn}")).await
    }

    async fn get_books_by_category(&self, category: &str) -> Result<Vec<Book>, SourceError> {
        self.search_books(&format!("subject:{category}")).await
    }
}

#[derive(Debug, Deserialize)]
struct IndustryIdentifier {
    #[serde(rename = "type")]
    kind: String,
    identifier: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeInfo {
    industry_identifiers: Vec<IndustryIdentifier>,
    title: String,
    categories: Vec<String>,
    language: String,
    published_date: String,
    authors: Vec<String>,
}

#[derive(Debug, Error)]
enum MappingError {
    #[error("volume has no volumeInfo")]
    NoVolumeInfo,
    #[error("malformed volumeInfo: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no ISBN_10 identifier")]
    NoIsbn10,
    #[error("no category")]
    NoCategory,
    #[error("unparseable publishedDate {0:?}")]
    BadDate(String),
}

/// Parses an ISO date (or datetime), falling back to a bare four digit year,
/// which maps to the Monday of ISO week 1 of that year.
fn parse_published_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(raw) {
        return Some(datetime.naive_utc().date());
    }
    if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(datetime.date());
    }
    if raw.len() == 4 && raw.bytes().all(|b| b.is_ascii_digit()) {
        let year = raw.parse().ok()?;
        return NaiveDate::from_isoywd_opt(year, 1, Weekday::Mon);
    }
    None
}

fn book_from_volume(volume: &Value) -> Result<Book, MappingError> {
    let info = volume.get("volumeInfo").ok_or(MappingError::NoVolumeInfo)?;
    let info = VolumeInfo::deserialize(info)?;

    let isbn = info
        .industry_identifiers
        .into_iter()
        .find(|id| id.kind == "ISBN_10")
        .ok_or(MappingError::NoIsbn10)?
        .identifier;
    let pub_date =
        parse_published_date(&info.published_date).ok_or(MappingError::BadDate(info.published_date.clone()))?;
    let category = info.categories.into_iter().next().ok_or(MappingError::NoCategory)?;

    Ok(Book {
        isbn,
        title: info.title,
        category,
        language: info.language,
        pub_date,
        authors: info.authors.into_iter().map(|name| Author { name }).collect(),
    })
}

fn upstream_error(response: &Value) -> Option<SourceError> {
    let error = response.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Unknown catalog error");
    Some(SourceError::ExternalValue(message.to_string()))
}

/// Google Books volumes API. Both reads go through the distributed cache.
pub struct GoogleBooksSource {
    http_client: Arc<dyn HttpClient>,
    cache: Cache,
    api_url: String,
    api_key: String,
}

impl GoogleBooksSource {
    pub fn new(http_client: Arc<dyn HttpClient>, cache: Cache, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        GoogleBooksSource {
            http_client,
            cache,
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    async fn fetch_book_by_id(&self, id: &str) -> Result<Book, SourceError> {
        debug!("Cache is empty. Fetching book by id: {}", id);
        let response = self
            .http_client
            .get_json(&format!("{}/{}", self.api_url, id), &[("key", self.api_key.as_str())])
            .await?;
        if let Some(err) = upstream_error(&response) {
            return Err(err);
        }

        book_from_volume(&response).map_err(|e| {
            debug!(error = %e, "Volume could not be mapped");
            SourceError::ExternalValue("No book found".to_string())
        })
    }

    async fn fetch_books(&self, query: &str) -> Result<Vec<Book>, SourceError> {
        debug!("Cache is empty. Fetching books by query: {}", query);
        let response = self
            .http_client
            .get_json(&self.api_url, &[("key", self.api_key.as_str()), ("q", query)])
            .await?;
        if let Some(err) = upstream_error(&response) {
            return Err(err);
        }

        let items = response.get("items").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
        let books: Vec<Book> = items
            .iter()
            .filter_map(|item| match book_from_volume(item) {
                Ok(book) => Some(book),
                Err(e) => {
                    debug!(error = %e, "Skipping volume");
                    None
                }
            })
            .collect();

        if books.is_empty() {
            return Err(SourceError::ExternalValue("No books found".to_string()));
        }
        debug!(num_books = books.len(), num_items = items.len(), "Mapped volumes");
        Ok(books)
    }
}

#[async_trait]
impl BooksSource for GoogleBooksSource {
    #[instrument(skip(self))]
    async fn get_book_by_id(&self, id: &str) -> Result<Book, SourceError> {
        let key = Cache::key("GoogleBooksSource::get_book_by_id", &id);
        self.cache.cached(&key, || self.fetch_book_by_id(id)).await
    }

    #[instrument(skip(self))]
    async fn search_books(&self, query: &str) -> Result<Vec<Book>, SourceError> {
        let key = Cache::key("GoogleBooksSource::search_books", &query);
        self.cache.cached(&key, || self.fetch_books(query)).await
    }
}

/// Serves a fixed list of books, for tests.
#[cfg(test)]
pub(crate) struct StubBooksSource {
    pub(crate) books: Vec<Book>,
}

#[cfg(test)]
#[async_trait]
impl BooksSource for StubBooksSource {
    async fn get_book_by_id(&self, _id: &str) -> Result<Book, SourceError> {
        self.books
            .first()
            .cloned()
            .ok_or_else(|| SourceError::ExternalValue("No book found".to_string()))
    }

    async fn search_books(&self, _query: &str) -> Result<Vec<Book>, SourceError> {
        if self.books.is_empty() {
            return Err(SourceError::ExternalValue("No books found".to_string()));
        }
        Ok(self.books.clone())
    }
}
