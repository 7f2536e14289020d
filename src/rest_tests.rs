use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use chrono::NaiveDate;
use serde_json::Value;
use tower::ServiceExt;

use crate::auth_middleware::ApiTokens;
use crate::book_repository::BookRepository;
use crate::books_source::{BooksSource, SourceError, StubBooksSource};
use crate::db::{self, UnitOfWork};
use crate::models::{Author, Book};
use crate::reqwest_traced_client::HttpError;
use crate::service::BookService;

const TOKEN: &str = "test-token";

/// A catalog that cannot be reached.
struct UnreachableBooksSource;

#[async_trait]
impl BooksSource for UnreachableBooksSource {
    async fn get_book_by_id(&self, _id: &str) -> Result<Book, SourceError> {
        Err(unreachable_error())
    }

    async fn search_books(&self, _query: &str) -> Result<Vec<Book>, SourceError> {
        Err(unreachable_error())
    }
}

fn unreachable_error() -> SourceError {
    HttpError::Request(reqwest_middleware::Error::Middleware(anyhow::anyhow!("connection refused"))).into()
}

fn pride_and_prejudice() -> Book {
    Book {
        isbn: "0141439513".to_string(),
        title: "Pride and Prejudice".to_string(),
        category: "Fiction".to_string(),
        language: "en".to_string(),
        pub_date: NaiveDate::from_ymd_opt(2003, 1, 1).unwrap(),
        authors: vec![Author {
            name: "Jane Austen".to_string(),
        }],
    }
}

async fn setup_test_app(source: Arc<dyn BooksSource>) -> axum::Router {
    let pool = db::test_pool().await;
    let service = BookService::new(BookRepository::new(), UnitOfWork::new(pool), source);
    crate::rest::router(Arc::new(service), ApiTokens::new([TOKEN.to_string()]))
}

async fn stub_app() -> axum::Router {
    setup_test_app(Arc::new(StubBooksSource {
        books: vec![pride_and_prejudice()],
    }))
    .await
}

fn authorized(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_requires_bearer_token() {
    let app = stub_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/books/fetch_by_id?book_id=abc123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_fetch_by_id() {
    let app = stub_app().await;
    let response = app
        .oneshot(authorized("GET", "/books/fetch_by_id?book_id=abc123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let book = json_body(response).await;
    assert_eq!(book["isbn"], "0141439513");
    assert_eq!(book["pub_date"], "2003-01-01");
    assert_eq!(book["authors"][0]["name"], "Jane Austen");
}

#[tokio::test]
async fn test_fetch_then_get_by_id() {
    let app = stub_app().await;
    let response = app
        .clone()
        .oneshot(authorized("GET", "/books/fetch_by_isbn?book_isbn=0141439513"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let books = json_body(response).await;
    let id = books[0]["id"].as_str().unwrap().to_string();

    let response = app.oneshot(authorized("GET", &format!("/books/{id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["title"], "Pride and Prejudice");
}

#[tokio::test]
async fn test_get_unknown_book() {
    let app = stub_app().await;
    let response = app
        .oneshot(authorized("GET", "/books/00000000-0000-0000-0000-000000000000"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["detail"], "Book not found");
}

#[tokio::test]
async fn test_search_by_title() {
    let app = stub_app().await;
    let response = app
        .clone()
        .oneshot(authorized("GET", "/books/fetch_by_category?category=Fiction"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(authorized("POST", "/books?title=prejudice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);

    let response = app.oneshot(authorized("POST", "/books?title=emma")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(json_body(response).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_no_books_found_is_a_client_error() {
    let app = setup_test_app(Arc::new(StubBooksSource { books: vec![] })).await;
    let response = app
        .oneshot(authorized("GET", "/books/fetch_by_category?category=Poetry"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["detail"], "No books found");
}

#[tokio::test]
async fn test_unreachable_catalog() {
    let app = setup_test_app(Arc::new(UnreachableBooksSource)).await;
    let response = app
        .oneshot(authorized("GET", "/books/fetch_by_id?book_id=abc123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
