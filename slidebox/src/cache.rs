use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use slidebox_core::RemoteFile;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::model::KeyValueMap;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt cache entry: {0}")]
    Json(#[from] serde_json::Error),
}

/// Local SQLite cache of folder listings (expiring) and extracted image
/// metadata (kept until cleared).
///
/// Never fails its callers: if the database cannot be opened every lookup
/// misses and every store is dropped.
pub struct PersistentCache {
    pool: Option<SqlitePool>,
    listing_ttl: Duration,
    clock: Arc<dyn Clock>,
    warned: AtomicBool,
}

impl PersistentCache {
    pub async fn open(path: &Path, listing_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let cache = Self::disabled(listing_ttl, clock);
        match connect(path).await {
            Ok(pool) => Self {
                pool: Some(pool),
                ..cache
            },
            Err(err) => {
                cache.degrade("open", &err);
                cache
            }
        }
    }

    /// A pass-through cache that stores nothing.
    pub fn disabled(listing_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: None,
            listing_ttl,
            clock,
            warned: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// The listing of `folder_id`, if cached less than the TTL ago.
    pub async fn cached_listing(&self, folder_id: &str) -> Option<Vec<RemoteFile>> {
        let pool = self.pool.as_ref()?;
        let result = self.read_listing(pool, folder_id).await;
        self.settle("read listing", result).flatten()
    }

    pub async fn store_listing(&self, folder_id: &str, files: &[RemoteFile]) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        let result = self.write_listing(pool, folder_id, files).await;
        self.settle("store listing", result);
    }

    pub async fn clear_listing(&self, folder_id: &str) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        let result = sqlx::query("DELETE FROM files WHERE folder_id = ?1")
            .bind(folder_id)
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(CacheError::from);
        self.settle("clear listing", result);
    }

    pub async fn extracted(&self, item_id: &str) -> Option<KeyValueMap> {
        let pool = self.pool.as_ref()?;
        let result = read_extracted(pool, item_id).await;
        self.settle("read extracted metadata", result).flatten()
    }

    pub async fn store_extracted(&self, item_id: &str, metadata: &KeyValueMap) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        let result = self.write_extracted(pool, item_id, metadata).await;
        self.settle("store extracted metadata", result);
    }

    pub async fn clear_extracted(&self, item_ids: &[String]) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        for item_id in item_ids {
            let result = sqlx::query("DELETE FROM metadata WHERE item_id = ?1")
                .bind(item_id)
                .execute(pool)
                .await
                .map(|_| ())
                .map_err(CacheError::from);
            if self.settle("clear extracted metadata", result).is_none() {
                return;
            }
        }
    }

    async fn read_listing(
        &self,
        pool: &SqlitePool,
        folder_id: &str,
    ) -> Result<Option<Vec<RemoteFile>>, CacheError> {
        let row = sqlx::query("SELECT items, cached_at FROM files WHERE folder_id = ?1")
            .bind(folder_id)
            .fetch_optional(pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let cached_at: i64 = row.try_get("cached_at")?;
        if !self.is_fresh(cached_at) {
            debug!(folder_id, "cached listing expired");
            return Ok(None);
        }
        let items: String = row.try_get("items")?;
        Ok(Some(serde_json::from_str(&items)?))
    }

    async fn write_listing(
        &self,
        pool: &SqlitePool,
        folder_id: &str,
        files: &[RemoteFile],
    ) -> Result<(), CacheError> {
        let items = serde_json::to_string(files)?;
        sqlx::query(
            "INSERT INTO files (folder_id, items, cached_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(folder_id) DO UPDATE SET items = excluded.items, cached_at = excluded.cached_at",
        )
        .bind(folder_id)
        .bind(items)
        .bind(self.clock.now_millis())
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn write_extracted(
        &self,
        pool: &SqlitePool,
        item_id: &str,
        metadata: &KeyValueMap,
    ) -> Result<(), CacheError> {
        let record = serde_json::to_string(metadata)?;
        sqlx::query(
            "INSERT INTO metadata (item_id, record, cached_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(item_id) DO UPDATE SET record = excluded.record, cached_at = excluded.cached_at",
        )
        .bind(item_id)
        .bind(record)
        .bind(self.clock.now_millis())
        .execute(pool)
        .await?;
        Ok(())
    }

    fn is_fresh(&self, cached_at: i64) -> bool {
        let ttl = i64::try_from(self.listing_ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_sub(cached_at) < ttl
    }

    fn settle<T>(&self, operation: &str, result: Result<T, CacheError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.degrade(operation, &err);
                None
            }
        }
    }

    fn degrade(&self, operation: &str, err: &CacheError) {
        if self.warned.swap(true, Ordering::Relaxed) {
            debug!(operation, "cache unavailable: {err}");
        } else {
            warn!(operation, "local cache unavailable, continuing without it: {err}");
        }
    }
}

async fn read_extracted(pool: &SqlitePool, item_id: &str) -> Result<Option<KeyValueMap>, CacheError> {
    let row = sqlx::query("SELECT record FROM metadata WHERE item_id = ?1")
        .bind(item_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => {
            let record: String = row.try_get("record")?;
            Ok(Some(serde_json::from_str(&record)?))
        }
        None => Ok(None),
    }
}

async fn connect(path: &Path) -> Result<SqlitePool, CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::testing::remote_file;

    async fn open_in(dir: &tempfile::TempDir, clock: &ManualClock) -> PersistentCache {
        PersistentCache::open(
            &dir.path().join("nested").join("cache.sqlite"),
            DEFAULT_LISTING_TTL,
            Arc::new(clock.clone()),
        )
        .await
    }

    #[tokio::test]
    async fn listing_expires_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(1_000);
        let cache = open_in(&dir, &clock).await;
        assert!(cache.is_enabled());

        let files = vec![remote_file("a", "a.png"), remote_file("b", "b.png")];
        cache.store_listing("folder", &files).await;

        clock.advance(59 * 60 * 1000);
        assert_eq!(cache.cached_listing("folder").await, Some(files));
        clock.advance(60 * 1000);
        assert_eq!(cache.cached_listing("folder").await, None);
    }

    #[tokio::test]
    async fn extracted_metadata_never_expires_but_can_be_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(0);
        let cache = open_in(&dir, &clock).await;
        let mut metadata = KeyValueMap::new();
        metadata.insert("prompt".into(), "a lighthouse".into());

        cache.store_extracted("a", &metadata).await;
        clock.advance(i64::from(u32::MAX));
        assert_eq!(cache.extracted("a").await, Some(metadata));

        cache.clear_extracted(&["a".to_string()]).await;
        assert_eq!(cache.extracted("a").await, None);
    }

    #[tokio::test]
    async fn entries_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(0);
        let files = vec![remote_file("a", "a.png")];
        open_in(&dir, &clock).await.store_listing("folder", &files).await;

        let reopened = open_in(&dir, &clock).await;
        assert_eq!(reopened.cached_listing("folder").await, Some(files));
        reopened.clear_listing("folder").await;
        assert_eq!(reopened.cached_listing("folder").await, None);
    }

    #[tokio::test]
    async fn unopenable_store_degrades_to_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let cache = PersistentCache::open(
            &blocker.join("cache.sqlite"),
            DEFAULT_LISTING_TTL,
            Arc::new(ManualClock::new(0)),
        )
        .await;

        assert!(!cache.is_enabled());
        cache.store_listing("folder", &[remote_file("a", "a.png")]).await;
        assert_eq!(cache.cached_listing("folder").await, None);
        assert_eq!(cache.extracted("a").await, None);
    }
}
