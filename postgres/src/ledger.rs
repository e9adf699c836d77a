//! `PostgreSQL` dedup ledger.
//!
//! One row per `(consumer, entity_type, entity_id)` in `processed_events`.
//! Compare-and-advance is a single conditional statement, so two instances of
//! the same consumer racing on one entity cannot both advance it.

use sqlx::PgPool;
use wattwise_core::BoxFuture;
use wattwise_core::ledger::{LedgerError, LedgerKey, SequenceLedger};

#[allow(clippy::needless_pass_by_value)]
fn storage(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

fn to_db(sequence: u64) -> Result<i64, LedgerError> {
    i64::try_from(sequence).map_err(|e| LedgerError::Storage(format!("sequence out of range: {e}")))
}

/// [`SequenceLedger`] backed by the `processed_events` table.
#[derive(Clone, Debug)]
pub struct PostgresSequenceLedger {
    pool: PgPool,
}

impl PostgresSequenceLedger {
    /// Ledger over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SequenceLedger for PostgresSequenceLedger {
    fn last_processed(&self, key: LedgerKey) -> BoxFuture<'_, Result<Option<u64>, LedgerError>> {
        Box::pin(async move {
            let row: Option<(i64,)> = sqlx::query_as(
                r"
                SELECT last_sequence FROM processed_events
                WHERE consumer = $1 AND entity_type = $2 AND entity_id = $3
                ",
            )
            .bind(&key.consumer)
            .bind(key.entity_type.as_str())
            .bind(key.entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

            row.map(|(last,)| {
                u64::try_from(last).map_err(|e| LedgerError::Storage(format!("corrupt sequence: {e}")))
            })
            .transpose()
        })
    }

    fn compare_and_advance(
        &self,
        key: LedgerKey,
        expected: Option<u64>,
        next: u64,
    ) -> BoxFuture<'_, Result<bool, LedgerError>> {
        Box::pin(async move {
            let next = to_db(next)?;
            let result = match expected {
                None => {
                    sqlx::query(
                        r"
                        INSERT INTO processed_events (consumer, entity_type, entity_id, last_sequence)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (consumer, entity_type, entity_id) DO NOTHING
                        ",
                    )
                    .bind(&key.consumer)
                    .bind(key.entity_type.as_str())
                    .bind(key.entity_id)
                    .bind(next)
                    .execute(&self.pool)
                    .await
                }
                Some(expected) => {
                    sqlx::query(
                        r"
                        UPDATE processed_events
                        SET last_sequence = $5, updated_at = NOW()
                        WHERE consumer = $1 AND entity_type = $2 AND entity_id = $3
                          AND last_sequence = $4 AND $5 > last_sequence
                        ",
                    )
                    .bind(&key.consumer)
                    .bind(key.entity_type.as_str())
                    .bind(key.entity_id)
                    .bind(to_db(expected)?)
                    .bind(next)
                    .execute(&self.pool)
                    .await
                }
            }
            .map_err(storage)?;

            let advanced = result.rows_affected() == 1;
            if !advanced {
                tracing::debug!(%key, next, "Ledger compare-and-advance lost");
            }
            Ok(advanced)
        })
    }
}
