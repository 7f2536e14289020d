//! Drives the whole ingestion path against a canned catalog response.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use bookshelf::book_repository::{BookRepository, BookSearch};
use bookshelf::books_source::GoogleBooksSource;
use bookshelf::caches::Caches;
use bookshelf::db::{init_db, UnitOfWork};
use bookshelf::error::ServiceError;
use bookshelf::reqwest_traced_client::{HttpClient, HttpError};
use bookshelf::service::BookService;

struct CannedCatalog {
    response: Value,
    calls: AtomicUsize,
}

#[async_trait]
impl HttpClient for CannedCatalog {
    async fn get_json(&self, _url: &str, _params: &[(&str, &str)]) -> Result<Value, HttpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

fn pride_and_prejudice_volume() -> Value {
    json!({
        "volumeInfo": {
            "industryIdentifiers": [
                {"type": "ISBN_13", "identifier": "9780141439518"},
                {"type": "ISBN_10", "identifier": "0141439513"}
            ],
            "title": "Pride and Prejudice",
            "categories": ["Fiction"],
            "language": "en",
            "publishedDate": "2003-01-01",
            "authors": ["Jane Austen"]
        }
    })
}

async fn service_with(response: Value) -> (BookService, Arc<CannedCatalog>) {
    let pool = init_db("sqlite::memory:").await.unwrap();
    let catalog = Arc::new(CannedCatalog {
        response,
        calls: AtomicUsize::new(0),
    });
    let caches = Caches::from_url("memory://", Some(Duration::from_secs(60)), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let source = GoogleBooksSource::new(catalog.clone(), caches.distributed().clone(), "https://catalog.test", "key");
    let service = BookService::new(BookRepository::new(), UnitOfWork::new(pool), Arc::new(source));
    (service, catalog)
}

#[tokio::test]
async fn fetch_by_id_ingests_once_and_then_reads_from_cache() {
    let (service, catalog) = service_with(pride_and_prejudice_volume()).await;

    let first = service.fetch_by_id("abc123").await.unwrap();
    assert_eq!(first.isbn, "0141439513");
    assert_eq!(first.title, "Pride and Prejudice");
    assert_eq!(first.category, "Fiction");
    assert_eq!(first.language, "en");
    assert_eq!(first.pub_date, NaiveDate::from_ymd_opt(2003, 1, 1).unwrap());
    assert_eq!(first.authors.len(), 1);
    assert_eq!(first.authors[0].name, "Jane Austen");

    let second = service.fetch_by_id("abc123").await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);

    let stored = service.get_by_id(first.id).await.unwrap();
    assert_eq!(stored, first);
}

#[tokio::test]
async fn category_ingestion_is_searchable() {
    let (service, _catalog) = service_with(json!({
        "totalItems": 2,
        "items": [pride_and_prejudice_volume(), {"volumeInfo": {"title": "No identifiers"}}]
    }))
    .await;

    let stored = service.fetch_by_category("Fiction").await.unwrap();
    assert_eq!(stored.len(), 1);

    let hits = service
        .search(&BookSearch {
            isbn: Some("0141439513".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, stored[0].id);
}

#[tokio::test]
async fn upstream_errors_reach_the_caller() {
    let (service, catalog) = service_with(json!({"error": {"code": 403, "message": "API key not valid"}})).await;

    let err = service.fetch_by_isbn("0141439513").await.unwrap_err();
    assert_eq!(err.to_string(), "external value error: API key not valid");
    assert!(matches!(err, ServiceError::Source(_)));

    // Failures are not cached
    service.fetch_by_isbn("0141439513").await.unwrap_err();
    assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
}
