//! Application wiring and lifecycle.
//!
//! [`Pipeline::new`] assembles the publisher, the entrypoint service and the
//! three event consumers from a set of [`Dependencies`]; [`Pipeline::start`]
//! spawns the background tasks:
//!
//! 1. the outbox relay
//! 2. one consumer worker per dispatcher
//! 3. the close-window goal sweeper
//!
//! # Graceful Shutdown
//!
//! [`RunningPipeline::shutdown`] broadcasts the shutdown signal and gives
//! every task the configured timeout to finish its current message.

use crate::achievements::{ACHIEVEMENT_UNLOCKER, AchievementUnlocker};
use crate::config::Config;
use crate::goals::{GOAL_EVALUATOR, GoalEvaluator};
use crate::notifications::{NOTIFICATION_DISPATCHER, NotificationDispatcher, SubscriberDirectory};
use crate::services::EnergyService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wattwise_core::dead_letter::DeadLetterSink;
use wattwise_core::environment::Clock;
use wattwise_core::event::EntityType;
use wattwise_core::event_bus::EventBus;
use wattwise_core::ledger::SequenceLedger;
use wattwise_core::store::{OutboxStore, RecordStore};
use wattwise_runtime::{ConsumerWorker, Dispatcher, OutboxPublisher, PipelineHealth};

/// Adapters the pipeline runs on.
#[derive(Clone)]
pub struct Dependencies {
    /// Authoritative records
    pub records: Arc<dyn RecordStore>,
    /// Relay side of the outbox
    pub outbox: Arc<dyn OutboxStore>,
    /// Per-consumer dedup ledger
    pub ledger: Arc<dyn SequenceLedger>,
    /// Where unprocessable messages go
    pub dead_letters: Arc<dyn DeadLetterSink>,
    /// Transport
    pub bus: Arc<dyn EventBus>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Broadcast recipients
    pub directory: Arc<dyn SubscriberDirectory>,
}

/// Fully wired pipeline, not yet running.
pub struct Pipeline {
    publisher: OutboxPublisher,
    service: EnergyService,
    evaluator: Arc<GoalEvaluator>,
    dispatchers: Vec<Arc<Dispatcher>>,
    health: PipelineHealth,
    bus: Arc<dyn EventBus>,
    config: Config,
}

impl Pipeline {
    /// Wire the pipeline.
    ///
    /// Dispatchers and their input entity types:
    ///
    /// | Consumer | Entity types |
    /// |----------|--------------|
    /// | `goal-evaluator` | consumption record |
    /// | `achievement-unlocker` | goal, consumption record |
    /// | `notification-dispatcher` | goal, achievement, tariff flag |
    #[must_use]
    pub fn new(deps: Dependencies, config: &Config) -> Self {
        let Dependencies {
            records,
            outbox,
            ledger,
            dead_letters,
            bus,
            clock,
            directory,
        } = deps;

        let publisher = OutboxPublisher::new(
            records.clone(),
            outbox.clone(),
            bus.clone(),
            dead_letters.clone(),
            clock.clone(),
        )
        .with_config(config.outbox.to_outbox_config(config.send_timeout()));

        let service = EnergyService::new(publisher.clone(), records.clone(), clock.clone());

        let evaluator = Arc::new(
            GoalEvaluator::new(publisher.clone(), records.clone(), clock.clone())
                .with_comparison(config.goals.comparison),
        );
        let unlocker = Arc::new(AchievementUnlocker::new(
            publisher.clone(),
            records.clone(),
            clock.clone(),
        ));
        let notifier = Arc::new(NotificationDispatcher::new(
            publisher.clone(),
            directory,
            clock.clone(),
        ));

        let dispatcher = |name: &str| {
            Dispatcher::new(name, ledger.clone(), dead_letters.clone(), clock.clone())
                .with_max_attempts(config.dispatcher.max_attempts)
        };
        let dispatchers = vec![
            Arc::new(
                dispatcher(GOAL_EVALUATOR)
                    .with_handler(EntityType::ConsumptionRecord, evaluator.clone()),
            ),
            Arc::new(
                dispatcher(ACHIEVEMENT_UNLOCKER)
                    .with_handler(EntityType::Goal, unlocker.clone())
                    .with_handler(EntityType::ConsumptionRecord, unlocker),
            ),
            Arc::new(
                dispatcher(NOTIFICATION_DISPATCHER)
                    .with_handler(EntityType::Goal, notifier.clone())
                    .with_handler(EntityType::Achievement, notifier.clone())
                    .with_handler(EntityType::TariffFlag, notifier),
            ),
        ];

        let health = PipelineHealth::new(outbox, dead_letters, clock);

        Self {
            publisher,
            service,
            evaluator,
            dispatchers,
            health,
            bus,
            config: config.clone(),
        }
    }

    /// Write and read entrypoints.
    #[must_use]
    pub const fn service(&self) -> &EnergyService {
        &self.service
    }

    /// Outbox publisher shared by the service and the consumers.
    #[must_use]
    pub const fn publisher(&self) -> &OutboxPublisher {
        &self.publisher
    }

    /// Goal evaluator, for running a close-window sweep by hand.
    #[must_use]
    pub const fn evaluator(&self) -> &Arc<GoalEvaluator> {
        &self.evaluator
    }

    /// Dispatchers in wiring order.
    #[must_use]
    pub fn dispatchers(&self) -> &[Arc<Dispatcher>] {
        &self.dispatchers
    }

    /// Health reporter.
    #[must_use]
    pub const fn health(&self) -> &PipelineHealth {
        &self.health
    }

    /// Spawn the relay, the consumer workers and the goal sweeper.
    #[must_use]
    pub fn start(&self) -> RunningPipeline {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::with_capacity(self.dispatchers.len() + 2);

        let relay = self.publisher.clone().spawn_relay(shutdown_tx.subscribe());
        handles.push(("outbox-relay".to_string(), relay));

        let settings = &self.config.dispatcher;
        for dispatcher in &self.dispatchers {
            let worker =
                ConsumerWorker::new(dispatcher.clone(), self.bus.clone(), shutdown_tx.subscribe());
            let handle = worker
                .with_redelivery_policy(settings.redelivery_policy())
                .with_retry_delay(Duration::from_millis(settings.reconnect_delay_ms))
                .spawn();
            handles.push((dispatcher.name().to_string(), handle));
        }

        let sweep_interval = Duration::from_secs(self.config.goals.sweep_interval_secs.max(1));
        handles.push((
            "goal-sweeper".to_string(),
            self.evaluator.clone().spawn_sweeper(sweep_interval, shutdown_tx.subscribe()),
        ));

        info!(
            tasks = handles.len(),
            comparison = %self.evaluator.comparison(),
            "Pipeline started"
        );
        RunningPipeline {
            shutdown_tx,
            handles,
            timeout: self.config.shutdown_timeout(),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("dispatchers", &self.dispatchers.len())
            .finish_non_exhaustive()
    }
}

/// Background tasks of a started pipeline.
pub struct RunningPipeline {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(String, JoinHandle<()>)>,
    timeout: Duration,
}

impl RunningPipeline {
    /// Names of the running tasks.
    #[must_use]
    pub fn tasks(&self) -> Vec<&str> {
        self.handles.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Signal every task to stop and wait for each up to the shutdown
    /// timeout.
    pub async fn shutdown(self) {
        info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(());

        for (task, handle) in self.handles {
            match tokio::time::timeout(self.timeout, handle).await {
                Ok(Ok(())) => info!(%task, "Task stopped gracefully"),
                Ok(Err(e)) => warn!(%task, error = %e, "Task failed"),
                Err(_) => warn!(%task, "Task shutdown timed out"),
            }
        }
        info!("Graceful shutdown complete");
    }
}

impl std::fmt::Debug for RunningPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPipeline")
            .field("tasks", &self.tasks())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Wait for Ctrl+C or SIGTERM.
///
/// A signal handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
