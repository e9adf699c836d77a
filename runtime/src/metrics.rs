//! Prometheus exporter for the pipeline's metrics.
//!
//! Counters and gauges are recorded with the `metrics` macros where the work
//! happens; this module describes them and installs the exporter that
//! serves `/metrics` over HTTP.
//!
//! ```rust,no_run
//! use wattwise_runtime::metrics::MetricsExporter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new("0.0.0.0:9090".parse()?);
//! exporter.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Events forwarded to the transport, labelled by topic.
pub const OUTBOX_FORWARDED: &str = "outbox.forwarded";
/// Outbox rows dead-lettered at the sweep attempt ceiling.
pub const OUTBOX_DEAD_LETTERED: &str = "outbox.dead_lettered";
/// Events fully handled by a consumer, labelled by consumer.
pub const DISPATCHER_PROCESSED: &str = "dispatcher.processed";
/// Events discarded by the dedup ledger, labelled by consumer.
pub const DISPATCHER_DUPLICATES: &str = "dispatcher.duplicates";
/// Messages dead-lettered by a consumer, labelled by consumer.
pub const DISPATCHER_DEAD_LETTERED: &str = "dispatcher.dead_lettered";
/// Letters held by the in-memory dead-letter queue.
pub const DLQ_SIZE: &str = "dlq.size";

/// Errors from installing the exporter.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Exporter could not be built or installed
    #[error("Failed to install metrics exporter: {0}")]
    Install(#[from] BuildError),
}

/// Prometheus scrape endpoint.
#[derive(Debug)]
pub struct MetricsExporter {
    addr: SocketAddr,
    started: bool,
}

impl MetricsExporter {
    /// Exporter that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Install the global recorder and start the HTTP listener. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if the listener cannot be set up or
    /// a recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        if self.started {
            return Ok(());
        }
        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()?;
        describe_metrics();
        self.started = true;
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Listen address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }
}

fn describe_metrics() {
    describe_counter!(OUTBOX_FORWARDED, "Events forwarded from the outbox to the transport");
    describe_counter!(
        OUTBOX_DEAD_LETTERED,
        "Outbox rows dead-lettered after exhausting the sweep attempt ceiling"
    );
    describe_counter!(DISPATCHER_PROCESSED, "Events fully handled by a consumer");
    describe_counter!(DISPATCHER_DUPLICATES, "Redelivered events discarded by the dedup ledger");
    describe_counter!(DISPATCHER_DEAD_LETTERED, "Messages dead-lettered by a consumer");
    describe_gauge!(DLQ_SIZE, "Letters held by the in-memory dead-letter queue");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn exporter_keeps_address() {
        let exporter = MetricsExporter::new("127.0.0.1:9100".parse().unwrap());
        assert_eq!(exporter.addr().port(), 9100);
    }
}
