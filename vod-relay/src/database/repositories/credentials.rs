//! Credential pool with round-robin rotation.
//!
//! The rotation cursor lives in `pool_state` so restarts resume rotation
//! where it stopped instead of hammering the first credential. The whole
//! read-cursor / select / advance-cursor sequence runs inside one
//! `BEGIN IMMEDIATE` transaction; concurrent callers each get a distinct
//! credential.

use super::now_ms;
use crate::database::{DbPool, WritePool, begin_immediate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resolvers::{ApiCredential, CredentialPool};
use sqlx::Row;
use tracing::{error, info, warn};

const ROTATION_CURSOR_KEY: &str = "rotation_cursor";

const ACTIVE_FILTER: &str = "is_active = 1 AND (expires_at IS NULL OR expires_at > ?)";

#[derive(Clone)]
pub struct CredentialRepository {
    read_pool: DbPool,
    write_pool: WritePool,
}

impl CredentialRepository {
    pub fn new(read_pool: DbPool, write_pool: WritePool) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }

    /// Add a credential to the pool. Duplicate `(client_id, secret)` pairs
    /// are rejected by the schema.
    pub async fn insert(
        &self,
        client_id: &str,
        secret: &str,
        note: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> crate::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO credentials (client_id, secret, note, is_active, expires_at, created_at)
             VALUES (?, ?, ?, 1, ?, ?)",
        )
        .bind(client_id)
        .bind(secret)
        .bind(note)
        .bind(expires_at.map(|t| t.timestamp_millis()))
        .bind(now_ms())
        .execute(&self.write_pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Pull a credential out of rotation without deleting its row.
    pub async fn revoke(&self, client_id: &str) -> crate::Result<u64> {
        let result = sqlx::query("UPDATE credentials SET is_active = 0 WHERE client_id = ?")
            .bind(client_id)
            .execute(&self.write_pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Count of credentials the rotation can currently hand out.
    pub async fn active_count(&self) -> crate::Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM credentials WHERE {ACTIVE_FILTER}"
        ))
        .bind(now_ms())
        .fetch_one(&self.read_pool)
        .await?;
        Ok(count)
    }

    /// Flip expired credentials inactive. Rotation already skips them by
    /// timestamp; this keeps the table honest for operators inspecting it.
    pub async fn deactivate_expired(&self) -> crate::Result<u64> {
        let result = sqlx::query(
            "UPDATE credentials SET is_active = 0
             WHERE is_active = 1 AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now_ms())
        .execute(&self.write_pool)
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            info!(swept, "deactivated expired credentials");
        }
        Ok(swept)
    }

    /// The next credential in round-robin order, advancing the cursor.
    pub async fn next_credential(&self) -> crate::Result<Option<ApiCredential>> {
        let now = now_ms();
        let mut tx = begin_immediate(&self.write_pool).await?;

        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM credentials WHERE {ACTIVE_FILTER}"
        ))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        if count == 0 {
            tx.rollback().await?;
            warn!("credential pool has no active unexpired entries");
            return Ok(None);
        }

        let cursor: i64 = sqlx::query_scalar("SELECT value FROM pool_state WHERE key = ?")
            .bind(ROTATION_CURSOR_KEY)
            .fetch_optional(&mut *tx)
            .await?
            .unwrap_or(0);
        // The pool may have shrunk since the cursor was written.
        let cursor = if cursor >= count { 0 } else { cursor };

        let row = sqlx::query(&format!(
            "SELECT client_id, secret FROM credentials WHERE {ACTIVE_FILTER}
             ORDER BY id LIMIT 1 OFFSET ?"
        ))
        .bind(now)
        .bind(cursor)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO pool_state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(ROTATION_CURSOR_KEY)
        .bind((cursor + 1) % count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(ApiCredential {
            client_id: row.get("client_id"),
            secret: row.get("secret"),
        }))
    }
}

#[async_trait]
impl CredentialPool for CredentialRepository {
    async fn next(&self) -> Option<ApiCredential> {
        match self.next_credential().await {
            Ok(credential) => credential,
            Err(e) => {
                error!(error = %e, "credential rotation failed");
                None
            }
        }
    }
}
