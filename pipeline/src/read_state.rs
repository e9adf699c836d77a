//! Read-state counter.
//!
//! Unread counts are never cached: [`ReadStateCounter::count_unread`] asks
//! the record store every time, so a mark-read is reflected exactly once and
//! deleted notifications simply stop counting.

use std::sync::Arc;
use tracing::debug;
use wattwise_core::environment::Clock;
use wattwise_core::error::PipelineError;
use wattwise_core::model::{NotificationId, UserId};
use wattwise_core::store::{Change, RecordStore};
use wattwise_runtime::OutboxPublisher;

/// Marks notifications read and counts unread ones.
#[derive(Clone)]
pub struct ReadStateCounter {
    publisher: OutboxPublisher,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl ReadStateCounter {
    /// Counter over `records`, writing through `publisher`.
    #[must_use]
    pub fn new(
        publisher: OutboxPublisher,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            publisher,
            records,
            clock,
        }
    }

    /// Flip a notification to read. Returns `false` when it was already
    /// read or no longer exists.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn mark_read(&self, id: NotificationId) -> Result<bool, PipelineError> {
        let change = Change::MarkNotificationRead {
            notification_id: id,
            at: self.clock.now(),
        };
        match self.publisher.publish(change).await {
            Ok(outcome) => {
                let flipped = outcome.is_applied();
                debug!(notification = %id, flipped, "Notification marked read");
                Ok(flipped)
            }
            Err(PipelineError::NotFound { .. }) => {
                debug!(notification = %id, "Notification gone, nothing to mark");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Unread notifications of `user`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn count_unread(&self, user: UserId) -> Result<u64, PipelineError> {
        Ok(self.records.count_unread(user).await?)
    }
}

impl std::fmt::Debug for ReadStateCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStateCounter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use wattwise_core::event::{EntityType, EventKey};
    use wattwise_core::model::NotificationSource;
    use wattwise_runtime::DeadLetterQueue;
    use wattwise_testing::{InMemoryEventBus, InMemoryRecordStore, test_clock};

    #[tokio::test]
    async fn marking_read_decrements_once() {
        let store = Arc::new(InMemoryRecordStore::new());
        let clock = Arc::new(test_clock());
        let publisher = OutboxPublisher::new(
            store.clone(),
            store.clone(),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(DeadLetterQueue::default()),
            clock.clone(),
        );
        let counter = ReadStateCounter::new(publisher.clone(), store.clone(), clock.clone());

        let user = publisher
            .publish(Change::RegisterUser {
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                at: clock.now(),
            })
            .await
            .unwrap()
            .primary_event()
            .unwrap()
            .entity_id;
        let user = UserId::new(user);
        let key = EventKey {
            entity_type: EntityType::Goal,
            entity_id: 1,
            sequence: 2,
        };
        publisher
            .publish(Change::CreateNotification {
                user_id: user,
                message: "Goal reached".to_string(),
                source: NotificationSource::new(key, user),
                at: clock.now(),
            })
            .await
            .unwrap();
        assert_eq!(counter.count_unread(user).await.unwrap(), 1);

        let id = store.all_notifications()[0].id;
        assert!(counter.mark_read(id).await.unwrap());
        assert!(!counter.mark_read(id).await.unwrap());
        assert_eq!(counter.count_unread(user).await.unwrap(), 0);
    }
}
