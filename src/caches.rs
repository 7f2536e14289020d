//! Read-through caching for idempotent async reads.
//!
//! [`Cache::cached`] wraps a single call: it derives nothing by itself, the
//! caller passes a key built with [`Cache::key`] from the operation name and
//! its arguments. [`Caches`] holds the two tiers: an in-process one and a
//! distributed one that can collapse concurrent fetches of the same key
//! behind a lease-based lock.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// The memory backend drops every expired entry once per this many inserts.
const SWEEP_EVERY: usize = 128;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend failure: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("Cache value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Byte-oriented key/value storage with expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Stores `value` only if `key` is absent. Returns whether it was stored.
    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool, CacheError>;

    /// Deletes `key` only while it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError>;
}

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        MemoryEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_fresh(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// Process-local backend. Expired entries are dropped when read, and swept
/// from the whole map every [`SWEEP_EVERY`] inserts.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, MemoryEntry>,
    inserts: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn note_insert(&self) {
        if self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let before = self.entries.len();
            self.entries.retain(|_, entry| entry.is_fresh());
            debug!(removed = before.saturating_sub(self.entries.len()), "Swept expired cache entries");
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh() => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.entries.remove_if(key, |_, entry| !entry.is_fresh());
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), MemoryEntry::new(value, ttl));
        self.note_insert();
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool, CacheError> {
        let stored = match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_fresh() => false,
            Entry::Occupied(mut occupied) => {
                occupied.insert(MemoryEntry::new(value, ttl));
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value, ttl));
                true
            }
        };
        if stored {
            self.note_insert();
        }
        Ok(stored)
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.value == expected)
            .is_some())
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis backend, shared across processes.
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn new(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Connected to Redis cache");

        Ok(Self { conn })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.pset_ex(key, value, ttl_millis(ttl)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let stored: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(stored.is_some())
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

/// One cache tier: a backend, a TTL, and an optional fetch lock.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    ttl: Option<Duration>,
    lock_lease: Option<Duration>,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Option<Duration>) -> Self {
        Cache {
            backend,
            ttl,
            lock_lease: None,
        }
    }

    /// Lets only one caller per key run the wrapped operation at a time.
    /// Others wait for its result for at most `lease`.
    pub fn with_lock(mut self, lease: Option<Duration>) -> Self {
        self.lock_lease = lease;
        self
    }

    /// Builds the key for a call to `operation` with `args`.
    pub fn key(operation: &str, args: &impl Serialize) -> String {
        let args = serde_json::to_string(args).unwrap_or_else(|_| String::from("?"));
        format!("{operation}:{args}")
    }

    /// Returns the cached value under `key`, or runs `fetch`, stores a
    /// successful result and returns it. Errors from `fetch` are not cached.
    /// Backend failures are logged and treated as misses.
    pub async fn cached<T, E, F, Fut>(&self, key: &str, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup(key).await {
            debug!(key, "Cache hit");
            return Ok(value);
        }

        let Some(lease) = self.lock_lease else {
            return self.fill(key, fetch).await;
        };

        let lock_key = format!("{key}-lock");
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + lease;
        loop {
            match self.backend.add(&lock_key, token.clone().into_bytes(), Some(lease)).await {
                Ok(true) => {
                    // The previous holder may have filled the key since our first lookup.
                    let result = match self.lookup(key).await {
                        Some(value) => {
                            debug!(key, "Cache filled before lock was taken");
                            Ok(value)
                        }
                        None => self.fill(key, fetch).await,
                    };
                    self.release(&lock_key, &token).await;
                    return result;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(key, error = %e, "Could not take cache lock");
                    return self.fill(key, fetch).await;
                }
            }

            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            if let Some(value) = self.lookup(key).await {
                debug!(key, "Cache filled by lock holder");
                return Ok(value);
            }
            if Instant::now() >= deadline {
                debug!(key, "Gave up waiting for cache lock");
                return self.fill(key, fetch).await;
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "Discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    async fn fill<T, E, F, Fut>(&self, key: &str, fetch: F) -> Result<T, E>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        debug!(key, "Cache miss");
        let value = fetch().await?;
        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                if let Err(e) = self.backend.set(key, bytes, self.ttl).await {
                    warn!(key, error = %e, "Cache store failed");
                }
            }
            Err(e) => warn!(key, error = %e, "Cache value not serializable"),
        }
        Ok(value)
    }

    async fn release(&self, lock_key: &str, token: &str) {
        if let Err(e) = self.backend.delete_if_eq(lock_key, token.as_bytes()).await {
            warn!(key = lock_key, error = %e, "Could not release cache lock");
        }
    }

    #[cfg(test)]
    async fn contains(&self, key: &str) -> bool {
        self.backend.exists(key).await.unwrap_or(false)
    }
}

/// The in-process and distributed cache tiers.
#[derive(Clone)]
pub struct Caches {
    memory: Cache,
    distributed: Cache,
}

impl Caches {
    /// Selects the distributed backend from the URL scheme: empty, `memory`
    /// or `nocache` keep everything in process; `redis` uses Redis. `rediss`
    /// is rejected since the Redis client is built without TLS.
    pub async fn from_url(url: &str, ttl: Option<Duration>, lock_lease: Option<Duration>) -> Result<Self, CacheError> {
        let memory = Cache::new(Arc::new(MemoryBackend::new()), ttl);

        let scheme = if url.trim().is_empty() {
            String::new()
        } else {
            Url::parse(url)
                .map_err(|e| CacheError::InvalidUrl {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?
                .scheme()
                .to_ascii_lowercase()
        };

        let backend: Arc<dyn CacheBackend> = match scheme.as_str() {
            "" | "memory" | "nocache" => {
                info!("Using in-memory distributed cache");
                Arc::new(MemoryBackend::new())
            }
            "redis" => Arc::new(RedisBackend::new(url).await?),
            "rediss" => {
                return Err(CacheError::InvalidUrl {
                    url: url.to_string(),
                    reason: "TLS connections to Redis are not supported, use redis://".to_string(),
                })
            }
            other => {
                return Err(CacheError::InvalidUrl {
                    url: url.to_string(),
                    reason: format!("unsupported scheme {other}"),
                })
            }
        };
        let distributed = Cache::new(backend, ttl).with_lock(lock_lease);

        Ok(Caches { memory, distributed })
    }

    pub fn memory(&self) -> &Cache {
        &self.memory
    }

    pub fn distributed(&self) -> &Cache {
        &self.distributed
    }
}
