//! `SQLite`-backed result cache with lazy expiry.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::Result;
use crate::summarizer::truncate_chars;

const KEY_PREFIX: &str = "context_cache:";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Database file, or `:memory:`.
    pub path: PathBuf,
    /// Lifetime of an entry (default: 24h).
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".sift/indexes/cache.db"),
            ttl: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    pool: SqlitePool,
    ttl: Duration,
}

impl ResultCache {
    /// Open (or create) the cache database and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn open(path: &str, ttl: Duration) -> Result<Self> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = std::path::Path::new(path).parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            format!("sqlite:{path}?mode=rwc")
        };

        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(path, "result cache opened");

        Ok(Self { pool, ttl })
    }

    /// Cached value for `key`. Expired entries are deleted on read.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_at(key, unix_now()).await
    }

    async fn get_at(&self, key: &str, now: i64) -> Result<Option<String>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT value, expires_at FROM result_cache WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((_, expires_at)) if expires_at <= now => {
                sqlx::query("DELETE FROM result_cache WHERE key = ?")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.put_at(key, value, unix_now()).await
    }

    async fn put_at(&self, key: &str, value: &str, now: i64) -> Result<()> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO result_cache (key, value, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(now.saturating_add(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete every expired entry. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn sweep(&self) -> Result<u64> {
        self.sweep_at(unix_now()).await
    }

    async fn sweep_at(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM result_cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete every entry. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM result_cache")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Cache that never fails: errors are logged and read as misses.
#[derive(Debug, Clone, Default)]
pub struct BestEffortCache {
    inner: Option<ResultCache>,
}

impl BestEffortCache {
    #[must_use]
    pub fn new(cache: ResultCache) -> Self {
        Self { inner: Some(cache) }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open the cache described by `config`, or a disabled one if it is
    /// turned off or cannot be opened.
    pub async fn from_config(config: &CacheConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        match ResultCache::open(&config.path.to_string_lossy(), config.ttl).await {
            Ok(cache) => Self::new(cache),
            Err(e) => {
                tracing::warn!(error = %e, "result cache unavailable, continuing without it");
                Self::disabled()
            }
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let cache = self.inner.as_ref()?;
        match cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, value: &str) {
        let Some(cache) = &self.inner else {
            return;
        };
        if let Err(e) = cache.put(key, value).await {
            tracing::warn!(error = %e, "cache write failed");
        }
    }
}

/// Cache key of a query over its top results: a hash of the query followed
/// by the first `prefix_chars` characters of each of the first `results` texts.
#[must_use]
pub fn cache_key<'a>(
    query: &str,
    texts: impl IntoIterator<Item = &'a str>,
    results: usize,
    prefix_chars: usize,
) -> String {
    let prefixes: Vec<&str> = texts
        .into_iter()
        .take(results)
        .map(|t| truncate_chars(t, prefix_chars))
        .collect();
    let mut hasher = blake3::Hasher::new();
    hasher.update(query.as_bytes());
    hasher.update(prefixes.join("|").as_bytes());
    format!("{KEY_PREFIX}{}", hasher.finalize().to_hex())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, ResultCache) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let cache = ResultCache::open(path.to_str().unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn put_then_get() {
        let (_dir, cache) = open_temp().await;
        cache.put("k", "answer").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("answer"));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites() {
        let (_dir, cache) = open_temp().await;
        cache.put("k", "one").await.unwrap();
        cache.put("k", "two").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn expired_entries_are_deleted_on_read() {
        let (_dir, cache) = open_temp().await;
        cache.put_at("k", "old", 1_000).await.unwrap();
        assert_eq!(cache.get_at("k", 1_059).await.unwrap().as_deref(), Some("old"));
        assert_eq!(cache.get_at("k", 1_060).await.unwrap(), None);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM result_cache")
            .fetch_one(&cache.pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let (_dir, cache) = open_temp().await;
        cache.put_at("old", "v", 0).await.unwrap();
        cache.put("fresh", "v").await.unwrap();
        assert_eq!(cache.sweep().await.unwrap(), 1);
        assert!(cache.get("fresh").await.unwrap().is_some());
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.get("fresh").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_memory_cache_works() {
        let cache = ResultCache::open(":memory:", Duration::from_secs(60))
            .await
            .unwrap();
        cache.put("k", "v").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.sweep_at(i64::MAX).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disabled_cache_is_inert() {
        let cache = BestEffortCache::disabled();
        cache.put("k", "v").await;
        assert!(!cache.is_enabled());
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn best_effort_cache_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            path: dir.path().join("nested/cache.db"),
            ..CacheConfig::default()
        };
        let cache = BestEffortCache::from_config(&config).await;
        assert!(cache.is_enabled());
        cache.put("k", "v").await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        let off = CacheConfig {
            enabled: false,
            ..config
        };
        assert!(!BestEffortCache::from_config(&off).await.is_enabled());
    }

    #[test]
    fn key_depends_on_query_and_top_results() {
        let texts = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"];
        let base = cache_key("q", texts, 5, 100);
        assert!(base.starts_with("context_cache:"));
        assert_eq!(base, cache_key("q", texts, 5, 100));
        assert_ne!(base, cache_key("other", texts, 5, 100));

        let mut changed = texts;
        changed[4] = "EPSILON";
        assert_ne!(base, cache_key("q", changed, 5, 100));

        let mut beyond = texts;
        beyond[5] = "ignored";
        assert_eq!(base, cache_key("q", beyond, 5, 100));
    }

    #[test]
    fn key_uses_text_prefixes() {
        let a = format!("{}{}", "x".repeat(100), "tail one");
        let b = format!("{}{}", "x".repeat(100), "tail two");
        assert_eq!(
            cache_key("q", [a.as_str()], 5, 100),
            cache_key("q", [b.as_str()], 5, 100)
        );
    }
}
