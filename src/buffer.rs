//! SQLite-backed arrival buffer.
//!
//! Behaves like an SQS queue in front of activation:
//!
//! - a received message is hidden for the visibility timeout and handed out
//!   under a fresh receipt, so a stale receipt cannot delete a redelivery;
//! - a message that is not acknowledged becomes visible again;
//! - a message received `max_receive_count` times without being
//!   acknowledged moves to `arrival_dead_letters` on the next receive.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use level0_core::error::StoreError;
use level0_core::ports::{ArrivalBuffer, BufferedMessage};

use crate::db::{now_millis, store_error};

#[derive(Clone)]
pub struct SqliteBuffer {
    pool: SqlitePool,
    visibility_timeout: Duration,
    max_receive_count: u32,
}

impl SqliteBuffer {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration, max_receive_count: u32) -> Self {
        Self {
            pool,
            visibility_timeout,
            max_receive_count,
        }
    }

    /// Append a raw notification. Returns the message id.
    pub async fn enqueue(&self, body: &str) -> Result<i64, StoreError> {
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO arrival_queue (body, receive_count, visible_at, enqueued_at) VALUES (?, 0, ?, ?)",
        )
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.last_insert_rowid())
    }

    /// Messages waiting in the queue, visible or in flight.
    pub async fn depth(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM arrival_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)
    }

    pub async fn dead_letter_count(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM arrival_dead_letters")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)
    }

    async fn move_exhausted(&self, now: i64) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let moved = sqlx::query(
            r#"
            INSERT INTO arrival_dead_letters (id, body, receive_count, enqueued_at, dead_at)
            SELECT id, body, receive_count, enqueued_at, ?
            FROM arrival_queue
            WHERE visible_at <= ? AND receive_count >= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(self.max_receive_count as i64)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?
        .rows_affected();

        if moved > 0 {
            sqlx::query("DELETE FROM arrival_queue WHERE visible_at <= ? AND receive_count >= ?")
                .bind(now)
                .bind(self.max_receive_count as i64)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
        }
        tx.commit().await.map_err(store_error)?;
        Ok(moved)
    }
}

#[async_trait]
impl ArrivalBuffer for SqliteBuffer {
    async fn receive(&self, max: usize) -> Result<Vec<BufferedMessage>, StoreError> {
        let now = now_millis();
        let moved = self.move_exhausted(now).await?;
        if moved > 0 {
            tracing::warn!(count = moved, "moved exhausted arrival messages to dead letters");
        }

        let batch = uuid::Uuid::new_v4().to_string();
        let hidden_until = now + self.visibility_timeout.as_millis() as i64;
        let rows = sqlx::query(
            r#"
            UPDATE arrival_queue
            SET receipt = ? || '-' || id,
                receive_count = receive_count + 1,
                visible_at = ?
            WHERE id IN (
                SELECT id FROM arrival_queue
                WHERE visible_at <= ? AND receive_count < ?
                ORDER BY id
                LIMIT ?
            )
            RETURNING id, receipt, body, receive_count, enqueued_at
            "#,
        )
        .bind(&batch)
        .bind(hidden_until)
        .bind(now)
        .bind(self.max_receive_count as i64)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        // RETURNING rows come back in no particular order.
        let mut rows: Vec<_> = rows.iter().map(|row| (row.get::<i64, _>("id"), row)).collect();
        rows.sort_by_key(|(id, _)| *id);
        let messages = rows
            .into_iter()
            .map(|(_, row)| BufferedMessage {
                receipt: row.get("receipt"),
                body: row.get("body"),
                receive_count: row.get::<i64, _>("receive_count") as u32,
                enqueued_at: chrono::DateTime::from_timestamp_millis(row.get("enqueued_at"))
                    .unwrap_or_default(),
            })
            .collect();
        Ok(messages)
    }

    async fn ack(&self, receipt: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM arrival_queue WHERE receipt = ?")
            .bind(receipt)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn release(&self, receipt: &str, delay: Duration) -> Result<(), StoreError> {
        sqlx::query("UPDATE arrival_queue SET visible_at = ? WHERE receipt = ?")
            .bind(now_millis() + delay.as_millis() as i64)
            .bind(receipt)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
