//! Health reporting for the pipeline.
//!
//! [`PipelineHealth`] turns the two numbers that matter operationally, the
//! outbox backlog and the dead-letter count, into a [`HealthReport`].

use std::fmt;
use std::sync::Arc;
use wattwise_core::dead_letter::DeadLetterSink;
use wattwise_core::environment::Clock;
use wattwise_core::store::OutboxStore;
use wattwise_core::{DateTime, Utc};

/// Health check status levels, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational but falling behind (large backlog, dead letters piling up)
    Degraded,
    /// Not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// The worse of two statuses.
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Result of checking one component.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Component name
    pub component: String,
    /// Its status
    pub status: HealthStatus,
    /// Details when not healthy
    pub message: Option<String>,
    /// Extra key/value facts (counts, thresholds)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Healthy component.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Degraded component.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Unhealthy component.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.push((key.into(), value.to_string()));
        self
    }
}

/// Checks folded into one overall status.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status among the checks
    pub status: HealthStatus,
    /// Individual checks
    pub checks: Vec<HealthCheck>,
    /// When the report was taken
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Fold `checks` into a report taken at `timestamp`.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>, timestamp: DateTime<Utc>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        Self {
            status,
            checks,
            timestamp,
        }
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Look up the check for `component`.
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}

/// Outbox backlog and dead-letter thresholds.
#[derive(Clone)]
pub struct PipelineHealth {
    outbox: Arc<dyn OutboxStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    max_backlog: u64,
    max_dead_letters: u64,
}

impl PipelineHealth {
    /// Degrade above 1000 pending outbox rows or any dead letter.
    #[must_use]
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            outbox,
            dead_letters,
            clock,
            max_backlog: 1000,
            max_dead_letters: 0,
        }
    }

    /// Override the thresholds.
    #[must_use]
    pub const fn with_thresholds(mut self, max_backlog: u64, max_dead_letters: u64) -> Self {
        self.max_backlog = max_backlog;
        self.max_dead_letters = max_dead_letters;
        self
    }

    /// Take a report. Storage failures make the affected check unhealthy
    /// rather than failing the report.
    pub async fn report(&self) -> HealthReport {
        let outbox = match self.outbox.count_pending().await {
            Ok(pending) if pending > self.max_backlog => {
                HealthCheck::degraded("outbox", format!("{pending} events waiting to be forwarded"))
                    .with_metadata("pending", pending)
            }
            Ok(pending) => HealthCheck::healthy("outbox").with_metadata("pending", pending),
            Err(e) => HealthCheck::unhealthy("outbox", e.to_string()),
        };

        let dead_letters = match self.dead_letters.pending_count().await {
            Ok(count) if count > self.max_dead_letters => {
                HealthCheck::degraded("dead-letters", format!("{count} messages need attention"))
                    .with_metadata("pending", count)
            }
            Ok(count) => HealthCheck::healthy("dead-letters").with_metadata("pending", count),
            Err(e) => HealthCheck::unhealthy("dead-letters", e.to_string()),
        };

        HealthReport::new(vec![outbox, dead_letters], self.clock.now())
    }
}

impl fmt::Debug for PipelineHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHealth")
            .field("max_backlog", &self.max_backlog)
            .field("max_dead_letters", &self.max_dead_letters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::dead_letter::DeadLetterQueue;
    use wattwise_core::dead_letter::{DeadLetter, DeadLetterOrigin};
    use wattwise_core::store::{Change, RecordStore};
    use wattwise_testing::{InMemoryRecordStore, test_clock};

    #[test]
    fn worst_status_wins() {
        let report = HealthReport::new(
            vec![
                HealthCheck::healthy("a"),
                HealthCheck::degraded("b", "slow"),
                HealthCheck::healthy("c"),
            ],
            test_clock().now(),
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(
            HealthStatus::Degraded.worst(HealthStatus::Unhealthy),
            HealthStatus::Unhealthy
        );
        assert!(HealthReport::new(Vec::new(), test_clock().now()).is_healthy());
    }

    #[tokio::test]
    async fn reports_backlog_and_dead_letters() {
        let store = Arc::new(InMemoryRecordStore::new());
        let dlq = DeadLetterQueue::new(10);
        let health = PipelineHealth::new(store.clone(), Arc::new(dlq.clone()), Arc::new(test_clock()))
            .with_thresholds(1, 0);

        assert!(health.report().await.is_healthy());

        for name in ["ada", "grace"] {
            store
                .commit(Change::RegisterUser {
                    name: name.to_string(),
                    email: format!("{name}@example.com"),
                    at: test_clock().now(),
                })
                .await
                .unwrap();
        }
        dlq.push(DeadLetter {
            origin: DeadLetterOrigin::Outbox { outbox_id: 1 },
            topic: "user".to_string(),
            key: "1".to_string(),
            payload: Vec::new(),
            error: "broker down".to_string(),
            attempts: 10,
            failed_at: test_clock().now(),
        });

        let report = health.report().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        let outbox = report.check("outbox").unwrap();
        assert_eq!(outbox.status, HealthStatus::Degraded);
        assert_eq!(outbox.metadata, vec![("pending".to_string(), "2".to_string())]);
        assert!(report.check("dead-letters").unwrap().status.is_degraded());
    }
}
