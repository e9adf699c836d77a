//! Bounded in-memory dead-letter queue.
//!
//! The default sink when no database-backed queue is configured, and the one
//! used in tests. Entries can be inspected with [`DeadLetterQueue::peek`] and
//! taken out for manual reprocessing with [`DeadLetterQueue::drain`].

use crate::metrics::DLQ_SIZE;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use wattwise_core::BoxFuture;
use wattwise_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};

/// Dead-letter queue holding at most `max_size` letters.
///
/// When full, the oldest letter is dropped (and counted in `dlq.dropped`).
/// Clones share the same queue.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    queue: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl DeadLetterQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Append a letter, dropping the oldest one when at capacity.
    pub fn push(&self, letter: DeadLetter) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            queue.pop_front();
            metrics::counter!("dlq.dropped").increment(1);
            tracing::warn!(max_size = self.max_size, "DLQ at capacity, dropping oldest entry");
        }

        tracing::error!(
            origin = %letter.origin,
            topic = %letter.topic,
            key = %letter.key,
            attempts = letter.attempts,
            error = %letter.error,
            "Message dead-lettered"
        );
        queue.push_back(letter);

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(DLQ_SIZE).set(queue.len() as f64);
        metrics::counter!("dlq.pushed").increment(1);
    }

    /// Number of letters held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every letter out, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let letters: Vec<_> = queue.drain(..).collect();

        metrics::gauge!(DLQ_SIZE).set(0.0);
        tracing::info!(count = letters.len(), "Drained dead letter queue");

        letters
    }

    /// Oldest letter, left in place.
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Copy of every letter, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Capacity.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn dead_letter(&self, letter: DeadLetter) -> BoxFuture<'_, Result<(), DeadLetterError>> {
        Box::pin(async move {
            self.push(letter);
            Ok(())
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, Result<u64, DeadLetterError>> {
        Box::pin(async move { Ok(self.len() as u64) })
    }
}
