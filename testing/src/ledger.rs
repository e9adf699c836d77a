//! In-memory sequence ledger.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wattwise_core::BoxFuture;
use wattwise_core::ledger::{LedgerError, LedgerKey, SequenceLedger};

/// [`SequenceLedger`] backed by a map behind a mutex.
///
/// Clones share the same rows, which lets several dispatcher instances of one
/// consumer race on the same ledger in tests.
#[derive(Clone, Debug, Default)]
pub struct InMemorySequenceLedger {
    rows: Arc<Mutex<HashMap<LedgerKey, u64>>>,
}

impl InMemorySequenceLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current row value.
    #[must_use]
    pub fn get(&self, key: &LedgerKey) -> Option<u64> {
        self.rows.lock().unwrap().get(key).copied()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Whether no stream was processed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SequenceLedger for InMemorySequenceLedger {
    fn last_processed(&self, key: LedgerKey) -> BoxFuture<'_, Result<Option<u64>, LedgerError>> {
        Box::pin(async move { Ok(self.get(&key)) })
    }

    fn compare_and_advance(
        &self,
        key: LedgerKey,
        expected: Option<u64>,
        next: u64,
    ) -> BoxFuture<'_, Result<bool, LedgerError>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap();
            let current = rows.get(&key).copied();
            if current != expected || current.is_some_and(|seen| next <= seen) {
                return Ok(false);
            }
            rows.insert(key, next);
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wattwise_core::event::EntityType;

    fn key() -> LedgerKey {
        LedgerKey {
            consumer: "notifier".to_string(),
            entity_type: EntityType::Goal,
            entity_id: 1,
        }
    }

    #[tokio::test]
    async fn advances_only_from_expected_value() {
        let ledger = InMemorySequenceLedger::new();
        assert_eq!(ledger.last_processed(key()).await.unwrap(), None);

        assert!(ledger.compare_and_advance(key(), None, 1).await.unwrap());
        assert!(!ledger.compare_and_advance(key(), None, 2).await.unwrap());
        assert!(ledger.compare_and_advance(key(), Some(1), 3).await.unwrap());
        assert!(!ledger.compare_and_advance(key(), Some(1), 2).await.unwrap());
        assert_eq!(ledger.get(&key()), Some(3));
    }

    #[tokio::test]
    async fn never_moves_backwards() {
        let ledger = InMemorySequenceLedger::new();
        assert!(ledger.compare_and_advance(key(), None, 5).await.unwrap());
        assert!(!ledger.compare_and_advance(key(), Some(5), 4).await.unwrap());
        assert!(!ledger.compare_and_advance(key(), Some(5), 5).await.unwrap());
        assert_eq!(ledger.last_processed(key()).await.unwrap(), Some(5));
    }
}
