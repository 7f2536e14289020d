use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{error, warn};
use uuid::Uuid;

use crate::auth_middleware::{require_bearer_token, ApiTokens};
use crate::book_repository::BookSearch;
use crate::books_source::SourceError;
use crate::db::StoredBook;
use crate::error::ServiceError;
use crate::service::BookService;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ServiceError::App(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ServiceError::Source(SourceError::ExternalValue(message)) => (StatusCode::BAD_REQUEST, message.clone()),
            ServiceError::Source(SourceError::Transport(e)) => {
                warn!("Catalog request failed: {e}");
                (StatusCode::BAD_GATEWAY, "Book catalog unavailable".to_string())
            }
            ServiceError::Repository(e) => {
                error!("Repository failure: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct FetchById {
    book_id: String,
}

#[derive(Debug, Deserialize)]
struct FetchByIsbn {
    book_isbn: String,
}

#[derive(Debug, Deserialize)]
struct FetchByCategory {
    category: String,
}

#[tracing::instrument(skip(service))]
async fn fetch_by_id(
    Extension(service): Extension<Arc<BookService>>,
    Query(params): Query<FetchById>,
) -> Result<Json<StoredBook>, ServiceError> {
    Ok(Json(service.fetch_by_id(&params.book_id).await?))
}

#[tracing::instrument(skip(service))]
async fn fetch_by_isbn(
    Extension(service): Extension<Arc<BookService>>,
    Query(params): Query<FetchByIsbn>,
) -> Result<Json<Vec<StoredBook>>, ServiceError> {
    Ok(Json(service.fetch_by_isbn(&params.book_isbn).await?))
}

#[tracing::instrument(skip(service))]
async fn fetch_by_category(
    Extension(service): Extension<Arc<BookService>>,
    Query(params): Query<FetchByCategory>,
) -> Result<Json<Vec<StoredBook>>, ServiceError> {
    Ok(Json(service.fetch_by_category(&params.category).await?))
}

#[tracing::instrument(skip(service))]
async fn get_book(
    Extension(service): Extension<Arc<BookService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<StoredBook>, ServiceError> {
    Ok(Json(service.get_by_id(id).await?))
}

#[tracing::instrument(skip(service), fields(num_books))]
async fn search_books(
    Extension(service): Extension<Arc<BookService>>,
    Query(filters): Query<BookSearch>,
) -> Result<Json<Vec<StoredBook>>, ServiceError> {
    let books = service.search(&filters).await?;
    tracing::Span::current().record("num_books", books.len());
    Ok(Json(books))
}

pub fn book_service() -> Router {
    Router::new()
        .route("/", post(search_books))
        .route("/fetch_by_id", get(fetch_by_id))
        .route("/fetch_by_isbn", get(fetch_by_isbn))
        .route("/fetch_by_category", get(fetch_by_category))
        .route("/:id", get(get_book))
}

pub fn router(service: Arc<BookService>, tokens: ApiTokens) -> Router {
    Router::new()
        .nest("/books", book_service())
        .layer(axum::middleware::from_fn_with_state(tokens, require_bearer_token))
        .layer(Extension(service))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO)))
}
