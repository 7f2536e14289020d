use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

/// Bearer tokens that identify an authenticated caller.
///
/// An empty set rejects every request.
#[derive(Clone, Debug, Default)]
pub struct ApiTokens {
    tokens: Arc<HashSet<String>>,
}

impl ApiTokens {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        ApiTokens {
            tokens: Arc::new(tokens.into_iter().collect()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn accepts(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

pub async fn require_bearer_token(State(tokens): State<ApiTokens>, req: Request, next: Next) -> Response {
    let presented = bearer_token(&req);
    if presented.is_some_and(|token| tokens.accepts(token)) {
        return next.run(req).await;
    }

    debug!(has_token = presented.is_some(), path = %req.uri().path(), "Rejecting unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({ "detail": "Not authenticated" })),
    )
        .into_response()
}
