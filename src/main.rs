use std::sync::Arc;

use anyhow::{Context, Result};
use opentelemetry::global;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use bookshelf::auth_middleware::ApiTokens;
use bookshelf::book_repository::BookRepository;
use bookshelf::books_source::GoogleBooksSource;
use bookshelf::caches::Caches;
use bookshelf::config::Settings;
use bookshelf::db::{init_db, UnitOfWork};
use bookshelf::reqwest_traced_client::TracedHttpClient;
use bookshelf::service::BookService;
use bookshelf::{rest, tracing_config};

async fn shutdown_signal() {
    let (mut signal_terminate, mut signal_interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
            _ => {
                warn!("Could not install signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = signal_terminate.recv() => tracing::debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => tracing::debug!("Received SIGINT."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load env vars
    dotenv::dotenv().ok();
    let settings = Settings::from_env()?;

    tracing_config::init_tracing(&settings)?;

    info!("Setting up Database");
    let connection_pool = init_db(&settings.database_url).await?;

    let caches = Caches::from_url(&settings.cache_url, settings.cache_ttl, settings.cache_lock_lease)
        .await
        .context("Failed to set up caches")?;
    let http_client = TracedHttpClient::new(settings.http_timeout).context("Failed to build HTTP client")?;
    let books_source = GoogleBooksSource::new(
        Arc::new(http_client),
        caches.distributed().clone(),
        settings.google_books_url.clone(),
        settings.google_api_key.clone(),
    );
    let service = BookService::new(
        BookRepository::new(),
        UnitOfWork::new(connection_pool),
        Arc::new(books_source),
    );

    if settings.api_tokens.is_empty() {
        warn!("API_TOKENS is empty, every request will be rejected");
    }
    let app = rest::router(Arc::new(service), ApiTokens::new(settings.api_tokens.clone()));

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;

    info!("Starting webserver on {}", settings.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down OpenTelemetry");
    global::shutdown_tracer_provider();

    Ok(())
}
