use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Extension};
use reqwest_tracing::TracingMiddleware;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),

    #[error("Response was not JSON: {0}")]
    Body(#[from] reqwest::Error),
}

/// Outbound JSON GETs. The source client only ever needs this much.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get_json(&self, url: &str, params: &[(&str, &str)]) -> Result<Value, HttpError>;
}

/// [`HttpClient`] whose requests are recorded as tracing spans.
#[derive(Clone, Debug)]
pub struct TracedHttpClient {
    http_client: ClientWithMiddleware,
}

impl TracedHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let reqwest_client = Client::builder().timeout(timeout).build()?;

        let http_client = ClientBuilder::new(reqwest_client)
            // Name spans after the catalog rather than each volume path
            .with_init(Extension(reqwest_tracing::OtelName("books-catalog".into())))
            .with(TracingMiddleware::default())
            .build();

        Ok(TracedHttpClient { http_client })
    }
}

#[async_trait]
impl HttpClient for TracedHttpClient {
    #[tracing::instrument(skip(self, params))]
    async fn get_json(&self, url: &str, params: &[(&str, &str)]) -> Result<Value, HttpError> {
        let response = self.http_client.get(url).query(params).send().await?;
        tracing::debug!(status = %response.status(), "Catalog responded");

        // Error payloads come with 4xx/5xx statuses and are still JSON.
        Ok(response.json::<Value>().await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use serde_json::json;
    use tracing::Instrument;
    use tracing_subscriber::layer::SubscriberExt;

    /// Serves `/volumes`, answering with the `traceparent` header it received.
    async fn echo_server() -> String {
        let app = Router::new().route(
            "/volumes",
            get(|headers: HeaderMap| async move {
                Json(json!({ "traceparent": headers.get("traceparent").and_then(|v| v.to_str().ok()) }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/volumes")
    }

    #[tokio::test]
    async fn test_requests_carry_trace_context() {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("bookshelf-test")));
        let _guard = tracing::subscriber::set_default(subscriber);

        let url = echo_server().await;
        let client = TracedHttpClient::new(Duration::from_secs(5)).unwrap();
        let body = client
            .get_json(&url, &[])
            .instrument(tracing::info_span!("fetch_volumes"))
            .await
            .unwrap();

        let traceparent = body["traceparent"].as_str().expect("traceparent header was not sent");
        assert!(traceparent.starts_with("00-"), "{traceparent}");
        assert_eq!(traceparent.split('-').count(), 4);
    }
}
