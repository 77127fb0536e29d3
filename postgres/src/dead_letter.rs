//! Dead-letter store for failed records.
//!
//! The consumer loop never retries a record inline and never stops for
//! one. Instead of silently dropping a record that failed decode,
//! dispatch or apply, it lands here with its raw payload and failure
//! reason, so the failure can be inspected and the record replayed once
//! the cause is fixed.

use crate::StoreError;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

/// Where in the decode → dispatch → apply sequence a record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// The payload was not a valid command encoding.
    Decode,
    /// The operation tag was not one the materializer recognizes.
    Dispatch,
    /// The materializer rejected or failed to apply the command.
    Apply,
}

impl FailureStage {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Dispatch => "dispatch",
            Self::Apply => "apply",
        }
    }

    /// Parse a stage from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] for an unknown stage string.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "decode" => Ok(Self::Decode),
            "dispatch" => Ok(Self::Dispatch),
            "apply" => Ok(Self::Apply),
            _ => Err(StoreError::Database(format!("invalid failure stage: {s}"))),
        }
    }
}

/// Lifecycle of a dead-lettered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Awaiting investigation or replay.
    Pending,
    /// Successfully replayed or otherwise fixed.
    Resolved,
    /// Permanently unfixable; kept for the audit trail.
    Discarded,
}

impl DeadLetterStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse a status from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] for an unknown status string.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Database(format!("invalid dead letter status: {s}"))),
        }
    }
}

/// One dead-lettered record.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Unique entry id.
    pub id: i64,
    /// Stage at which processing failed.
    pub stage: FailureStage,
    /// The record's raw payload, byte for byte.
    pub raw_payload: Vec<u8>,
    /// Why processing failed.
    pub reason: String,
    /// Current lifecycle status.
    pub status: DeadLetterStatus,
    /// When the record failed.
    pub failed_at: DateTime<Utc>,
    /// When the entry was resolved or discarded, if it was.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Postgres-backed dead-letter store.
#[derive(Clone)]
pub struct DeadLetterStore {
    pool: PgPool,
}

impl DeadLetterStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the dead-letter table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if table creation fails.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id BIGSERIAL PRIMARY KEY,
                stage TEXT NOT NULL,
                raw_payload BYTEA NOT NULL,
                reason TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                failed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                resolved_at TIMESTAMPTZ
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to bootstrap dead_letters: {e}")))?;

        tracing::info!("Dead-letter table ready");
        Ok(())
    }

    /// Record a failed record. Returns the entry id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    pub async fn record(
        &self,
        stage: FailureStage,
        raw_payload: &[u8],
        reason: &str,
    ) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letters (stage, raw_payload, reason)
            VALUES ($1, $2, $3)
            RETURNING id
            ",
        )
        .bind(stage.as_str())
        .bind(raw_payload)
        .bind(reason)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to record dead letter: {e}")))?;

        tracing::warn!(
            dead_letter_id = id,
            stage = stage.as_str(),
            reason,
            payload_bytes = raw_payload.len(),
            "Record dead-lettered"
        );

        metrics::counter!("catalog.dead_letters.recorded", "stage" => stage.as_str())
            .increment(1);

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        #[allow(clippy::cast_possible_wrap)] // limit is a reasonable size
        let rows = sqlx::query(
            r"
            SELECT id, stage, raw_payload, reason, status, failed_at, resolved_at
            FROM dead_letters
            WHERE status = 'pending'
            ORDER BY failed_at ASC
            LIMIT $1
            ",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to list dead letters: {e}")))?;

        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    /// Count pending entries (for monitoring and health checks).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::Database(format!("failed to count dead letters: {e}")))?;

        Ok(count)
    }

    /// Mark an entry as resolved after a successful replay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn mark_resolved(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE dead_letters SET status = 'resolved', resolved_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to resolve dead letter: {e}")))?;

        tracing::info!(dead_letter_id = id, "Dead letter resolved");
        Ok(())
    }

    /// Mark an entry as permanently unfixable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn mark_discarded(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE dead_letters SET status = 'discarded', resolved_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to discard dead letter: {e}")))?;

        tracing::warn!(dead_letter_id = id, "Dead letter discarded");
        Ok(())
    }

    fn row_to_dead_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, StoreError> {
        let stage_str: String = row.get("stage");
        let status_str: String = row.get("status");

        Ok(DeadLetter {
            id: row.get("id"),
            stage: FailureStage::parse(&stage_str)?,
            raw_payload: row.get("raw_payload"),
            reason: row.get("reason"),
            status: DeadLetterStatus::parse(&status_str)?,
            failed_at: row.get("failed_at"),
            resolved_at: row.get("resolved_at"),
        })
    }
}
