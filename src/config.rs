use std::time::Duration;

use anyhow::{Context, Result};

pub const GOOGLE_BOOKS_URL: &str = "https://www.googleapis.com/books/v1/volumes";

/// Runtime settings, read from the environment (and `.env` via dotenv).
#[derive(Debug, Clone)]
pub struct Settings {
    pub debug: bool,
    pub database_url: String,
    pub cache_url: String,
    /// `None` keeps cache entries forever.
    pub cache_ttl: Option<Duration>,
    /// `None` disables the distributed fetch lock.
    pub cache_lock_lease: Option<Duration>,
    pub google_api_key: String,
    pub google_books_url: String,
    pub http_timeout: Duration,
    pub api_tokens: Vec<String>,
    pub bind_addr: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let seconds = |name: &str, default: &str| -> Result<u64> {
            var(name, default)
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{name} must be a whole number of seconds"))
        };
        let optional = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

        Ok(Settings {
            debug: var("DEBUG", "false").eq_ignore_ascii_case("true"),
            database_url: var("DATABASE_URL", "sqlite::memory:"),
            cache_url: var("CACHE_URL", ""),
            cache_ttl: optional(seconds("CACHE_TTL", "86400")?),
            cache_lock_lease: optional(seconds("CACHE_LOCK_LEASE", "10")?),
            google_api_key: var("GOOGLE_API_KEY", ""),
            google_books_url: var("GOOGLE_BOOKS_URL", GOOGLE_BOOKS_URL),
            http_timeout: Duration::from_secs(seconds("HTTP_TIMEOUT", "30")?),
            api_tokens: var("API_TOKENS", "")
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect(),
            bind_addr: var("BIND_ADDR", "0.0.0.0:8000"),
        })
    }
}
