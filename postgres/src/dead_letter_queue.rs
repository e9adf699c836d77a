//! Dead Letter Queue (DLQ) for failed messages.
//!
//! Persistent storage for everything the pipeline gave up on: outbox rows
//! past the sweep ceiling and deliveries a consumer could not process.
//! Entries stay `pending` until an operator resolves or discards them.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use wattwise_core::BoxFuture;
use wattwise_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterOrigin, DeadLetterSink};

/// Status of an entry in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Awaiting investigation or reprocessing
    Pending,
    /// Successfully reprocessed
    Resolved,
    /// Permanently discarded
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::Storage(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// A stored dead letter plus its review state.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// The letter as it was recorded
    pub letter: DeadLetter,

    /// Current review status
    pub status: DLQStatus,

    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it
    pub resolved_by: Option<String>,

    /// Resolution or discard notes
    pub resolution_notes: Option<String>,
}

#[allow(clippy::needless_pass_by_value)]
fn storage(err: sqlx::Error) -> DeadLetterError {
    DeadLetterError::Storage(err.to_string())
}

/// `PostgreSQL`-based Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use wattwise_postgres::PostgresDeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// for failed in dlq.list_pending(100).await? {
///     println!("{} {}: {}", failed.id, failed.letter.origin, failed.letter.error);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a letter and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, DeadLetterError> {
        let origin = serde_json::to_string(&letter.origin)
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;
        let attempts = i32::try_from(letter.attempts).unwrap_or(i32::MAX);

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_events (
                origin, topic, message_key, payload, error_message, attempts, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(origin)
        .bind(&letter.topic)
        .bind(&letter.key)
        .bind(&letter.payload)
        .bind(&letter.error)
        .bind(attempts)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        tracing::error!(
            dlq_id = id,
            origin = %letter.origin,
            topic = %letter.topic,
            key = %letter.key,
            attempts = letter.attempts,
            error = %letter.error,
            "Message added to Dead Letter Queue"
        );

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedMessage>, DeadLetterError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedMessage>, DeadLetterError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, origin, topic, message_key, payload, error_message, attempts, failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE status = $1
            ORDER BY failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(Self::row_to_failed_message).collect()
    }

    /// Get one entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedMessage, DeadLetterError> {
        let row = sqlx::query(
            r"
            SELECT
                id, origin, topic, message_key, payload, error_message, attempts, failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        .ok_or(DeadLetterError::NotFound(id))?;

        Self::row_to_failed_message(&row)
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }
        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        Ok(())
    }

    /// Mark an entry as permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id and
    /// [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }
        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<u64, DeadLetterError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn row_to_failed_message(row: &sqlx::postgres::PgRow) -> Result<FailedMessage, DeadLetterError> {
        let origin: String = row.get("origin");
        let origin: DeadLetterOrigin = serde_json::from_str(&origin)
            .map_err(|e| DeadLetterError::Storage(format!("Invalid DLQ origin: {e}")))?;
        let attempts: i32 = row.get("attempts");
        let status: String = row.get("status");

        Ok(FailedMessage {
            id: row.get("id"),
            letter: DeadLetter {
                origin,
                topic: row.get("topic"),
                key: row.get("message_key"),
                payload: row.get("payload"),
                error: row.get("error_message"),
                attempts: u32::try_from(attempts).unwrap_or(0),
                failed_at: row.get("failed_at"),
            },
            status: DLQStatus::parse(&status)?,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for PostgresDeadLetterQueue {
    fn dead_letter(&self, letter: DeadLetter) -> BoxFuture<'_, Result<(), DeadLetterError>> {
        Box::pin(async move {
            self.add_entry(&letter).await?;
            Ok(())
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, Result<u64, DeadLetterError>> {
        Box::pin(self.count_pending())
    }
}
