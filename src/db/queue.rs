use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres};

use super::Database;

/// A message dequeued from `reservation_queue`, mirroring the shape of a
/// PGMQ read: the envelope plus PGMQ-style redelivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub body: serde_json::Value,
}

impl Database {
    /// Enqueue a reservation-lifecycle action for the worker pool to pick up.
    pub async fn enqueue(&self, body: &serde_json::Value) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO reservation_queue (body, visible_at)
            VALUES ($1, NOW())
            RETURNING msg_id
            "#,
        )
        .bind(body)
        .fetch_one(&self.pool)
        .await
        .context("failed to enqueue message")?;

        Ok(row.0)
    }

    /// Read up to `batch_size` visible messages, hiding them from other
    /// readers for `visibility_timeout_seconds` and bumping `read_ct`.
    ///
    /// This is the Postgres analogue of `pgmq.read(queue, vt, qty)`: a
    /// single statement that atomically selects and re-hides rows, so two
    /// concurrent pollers never see the same message.
    pub async fn read_queue(
        &self,
        visibility_timeout_seconds: i64,
        batch_size: i64,
    ) -> Result<Vec<QueueMessage>> {
        let rows: Vec<(i64, i32, chrono::DateTime<chrono::Utc>, serde_json::Value)> = sqlx::query_as(
            r#"
            WITH next AS (
                SELECT msg_id
                FROM reservation_queue
                WHERE visible_at <= NOW()
                ORDER BY msg_id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE reservation_queue q
            SET read_ct = q.read_ct + 1,
                visible_at = NOW() + make_interval(secs => $2)
            FROM next
            WHERE q.msg_id = next.msg_id
            RETURNING q.msg_id, q.read_ct, q.enqueued_at, q.body
            "#,
        )
        .bind(batch_size)
        .bind(visibility_timeout_seconds as f64)
        .fetch_all(&self.pool)
        .await
        .context("failed to read from queue")?;

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, body)| QueueMessage {
                msg_id,
                read_ct,
                enqueued_at,
                body,
            })
            .collect())
    }

    /// Delete a message after successful processing.
    pub async fn delete_message(&self, msg_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM reservation_queue WHERE msg_id = $1")
            .bind(msg_id)
            .execute(&self.pool)
            .await
            .context("failed to delete message")?;
        Ok(())
    }

    /// Move a message to the archive table (dead-letter) after it exceeds
    /// the configured retry budget.
    pub async fn archive_message(&self, msg_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            INSERT INTO reservation_queue_archive (msg_id, body, read_ct, enqueued_at, archived_at)
            SELECT msg_id, body, read_ct, enqueued_at, NOW()
            FROM reservation_queue
            WHERE msg_id = $1
            "#,
        )
        .bind(msg_id)
        .execute(&mut *tx)
        .await
        .context("failed to copy message to archive")?
        .rows_affected();

        sqlx::query("DELETE FROM reservation_queue WHERE msg_id = $1")
            .bind(msg_id)
            .execute(&mut *tx)
            .await
            .context("failed to remove archived message from queue")?;

        tx.commit().await?;
        Ok(moved > 0)
    }

    /// Release a message early, making it immediately visible again. Used
    /// when a worker detects a retryable failure and wants redelivery
    /// sooner than the full visibility timeout.
    pub async fn release_message(&self, msg_id: i64) -> Result<()> {
        sqlx::query("UPDATE reservation_queue SET visible_at = NOW() WHERE msg_id = $1")
            .bind(msg_id)
            .execute(&self.pool)
            .await
            .context("failed to release message")?;
        Ok(())
    }

    /// Try to acquire the cluster-wide advisory lock guarding a single-run
    /// job (the disk reconciler). Returns `false` if another instance
    /// already holds it — callers should skip this tick rather than wait.
    pub async fn try_advisory_lock(&self, key: i64) -> Result<bool> {
        let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .context("failed to attempt advisory lock")?;
        Ok(acquired)
    }

    pub async fn advisory_unlock(&self, key: i64) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("failed to release advisory lock")?;
        Ok(())
    }
}

/// Well-known advisory-lock keys. A single `i64` keyspace is shared across
/// all single-run jobs in the cluster, so each gets its own constant.
pub mod lock_keys {
    pub const DISK_RECONCILER: i64 = 0x6770_7572_6563_6f6e;
}

#[allow(dead_code)]
async fn assert_pool_type(_: &Pool<Postgres>) {}
