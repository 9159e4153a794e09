//! Resolution result cache.
//!
//! Keyed by the normalized video URL. A re-resolution overwrites the whole
//! row, so the hit counter always describes the entry currently stored, not
//! the URL's lifetime popularity.

use super::now_ms;
use crate::database::{DbPool, WritePool};
use sqlx::Row;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub url: String,
    pub manifest_ref: String,
    pub method: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub hit_count: i64,
}

#[derive(Clone)]
pub struct ParseCacheRepository {
    read_pool: DbPool,
    write_pool: WritePool,
    ttl_ms: i64,
}

impl ParseCacheRepository {
    pub fn new(read_pool: DbPool, write_pool: WritePool, ttl_secs: i64) -> Self {
        Self {
            read_pool,
            write_pool,
            ttl_ms: ttl_secs * 1000,
        }
    }

    /// Look up a live entry, bumping its hit counter. An expired entry is a
    /// miss; it stays in place until overwritten or purged.
    ///
    /// Expiry reads the `expires_at` stamped at write time, so entries keep
    /// the lifetime they were created with even if the TTL changes.
    pub async fn get(&self, url: &str) -> crate::Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT url, manifest_ref, method, created_at, expires_at, hit_count
             FROM parse_cache WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.read_pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: i64 = row.get("expires_at");
        if expires_at <= now_ms() {
            debug!(url, "cache entry expired");
            return Ok(None);
        }

        sqlx::query("UPDATE parse_cache SET hit_count = hit_count + 1 WHERE url = ?")
            .bind(url)
            .execute(&self.write_pool)
            .await?;

        Ok(Some(CacheEntry {
            url: row.get("url"),
            manifest_ref: row.get("manifest_ref"),
            method: row.get("method"),
            created_at: row.get("created_at"),
            expires_at,
            hit_count: row.get::<i64, _>("hit_count") + 1,
        }))
    }

    /// Store a resolution, replacing any previous entry for the URL.
    pub async fn put(&self, url: &str, manifest_ref: &str, method: &str) -> crate::Result<()> {
        let now = now_ms();
        sqlx::query(
            "INSERT OR REPLACE INTO parse_cache
                 (url, manifest_ref, method, created_at, expires_at, hit_count)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(url)
        .bind(manifest_ref)
        .bind(method)
        .bind(now)
        .bind(now + self.ttl_ms)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn purge_expired(&self) -> crate::Result<u64> {
        let result = sqlx::query("DELETE FROM parse_cache WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.write_pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(purged, "purged expired cache entries");
        }
        Ok(purged)
    }
}
