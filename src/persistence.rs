//! Postgres sink for the persistence worker.
//!
//! The `messages` table is append-only; redelivered batches simply insert
//! again, which downstream consumers deduplicate on the message id carried
//! in `metadata`.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::{debug, info};

use crate::consumer::BatchProcessor;
use crate::stream::StreamEnvelope;

/// Deadline for room-history reads.
const HISTORY_QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

/// Totals logged at worker shutdown.
#[derive(Debug, Clone, Copy)]
pub struct RepositoryStats {
    pub total_messages: i64,
    pub total_rooms: i64,
}

impl MessageRepository {
    pub async fn connect(postgres_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(postgres_url)
            .await
            .context("connect postgres")?;
        info!("connected to postgres");
        Ok(Self { pool })
    }

    /// Insert a batch of messages inside one transaction.
    pub async fn save_batch(&self, batch: &[StreamEnvelope]) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("begin transaction")?;
        for msg in batch {
            sqlx::query(
                "INSERT INTO messages (room_name, user_id, username, payload, metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5, NOW())",
            )
            .bind(&msg.room_name)
            .bind(&msg.user_id)
            .bind(&msg.username)
            .bind(Json(&msg.payload))
            .bind(Json(&msg.metadata))
            .execute(&mut *tx)
            .await
            .context("insert message")?;
        }
        tx.commit().await.context("commit batch")?;

        debug!(count = batch.len(), "batch written");
        Ok(())
    }

    /// Most recent messages of a room, newest first.
    pub async fn recent_messages(
        &self,
        room_name: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<StreamEnvelope>> {
        let rows: Vec<(String, String, String, serde_json::Value, serde_json::Value)> =
            tokio::time::timeout(
                HISTORY_QUERY_TIMEOUT,
                sqlx::query_as(
                    "SELECT room_name, user_id, username, payload, metadata \
                     FROM messages WHERE room_name = $1 \
                     ORDER BY created_at DESC LIMIT $2",
                )
                .bind(room_name)
                .bind(limit)
                .fetch_all(&self.pool),
            )
            .await
            .context("history query deadline exceeded")?
            .context("query messages")?;

        Ok(rows
            .into_iter()
            .map(|(room_name, user_id, username, payload, metadata)| StreamEnvelope {
                room_name,
                user_id,
                username,
                payload,
                metadata,
            })
            .collect())
    }

    pub async fn stats(&self) -> anyhow::Result<RepositoryStats> {
        let total_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .context("count messages")?;
        let total_rooms: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT room_name) FROM messages")
            .fetch_one(&self.pool)
            .await
            .context("count rooms")?;
        Ok(RepositoryStats {
            total_messages,
            total_rooms,
        })
    }
}

#[async_trait]
impl BatchProcessor for MessageRepository {
    async fn process_batch(&self, batch: &[StreamEnvelope]) -> anyhow::Result<()> {
        self.save_batch(batch).await
    }
}
