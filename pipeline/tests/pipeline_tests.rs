//! End-to-end pipeline tests on the in-memory adapters.
//!
//! Most tests drive the consumers by hand through [`Harness::settle`], which
//! drains the outbox and feeds every dispatcher until nothing moves, so each
//! assertion sees a quiescent pipeline. The last test runs the real
//! background tasks.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::Duration as Days;
use std::sync::Arc;
use std::time::Duration;
use wattwise_core::environment::Clock;
use wattwise_core::event::{ChangeTag, DomainEvent, EntityType};
use wattwise_core::event_bus::TransportMessage;
use wattwise_core::model::{DeviceCategory, Goal, GoalState, TariffTier, User};
use wattwise_core::store::RecordStore;
use wattwise_core::{DateTime, NaiveDate, Utc};
use wattwise_pipeline::achievements::ACHIEVEMENT_UNLOCKER;
use wattwise_pipeline::notifications::NOTIFICATION_DISPATCHER;
use wattwise_pipeline::{
    AchievementUnlocker, Config, Dependencies, EnergyService, GoalComparison,
    NotificationDispatcher, Pipeline, StoreSubscriberDirectory,
};
use wattwise_runtime::{DeadLetterQueue, Dispatcher, Disposition, EventHandler};
use wattwise_testing::{
    FixedClock, InMemoryEventBus, InMemoryRecordStore, InMemorySequenceLedger, init_test_tracing,
    test_clock,
};

struct Harness {
    pipeline: Pipeline,
    store: Arc<InMemoryRecordStore>,
    bus: Arc<InMemoryEventBus>,
    dead_letters: Arc<DeadLetterQueue>,
    clock: FixedClock,
}

impl Harness {
    fn new(comparison: GoalComparison) -> Self {
        init_test_tracing();
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.goals.comparison = comparison;
        config.dispatcher.reconnect_delay_ms = 10;
        config.outbox.sweep_interval_ms = 20;

        let store = Arc::new(InMemoryRecordStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let dead_letters = Arc::new(DeadLetterQueue::default());
        let clock = test_clock();

        let deps = Dependencies {
            records: store.clone(),
            outbox: store.clone(),
            ledger: Arc::new(InMemorySequenceLedger::new()),
            dead_letters: dead_letters.clone(),
            bus: bus.clone(),
            clock: Arc::new(clock.clone()),
            directory: Arc::new(StoreSubscriberDirectory::new(store.clone())),
        };
        Self {
            pipeline: Pipeline::new(deps, &config),
            store,
            bus,
            dead_letters,
            clock,
        }
    }

    fn service(&self) -> &EnergyService {
        self.pipeline.service()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Forward every pending event and run every consumer until the outbox
    /// and all consumer groups are empty.
    async fn settle(&self) {
        for _ in 0..50 {
            self.pipeline.publisher().drain().await.unwrap();
            let mut delivered = 0;
            for dispatcher in self.pipeline.dispatchers() {
                let topics = dispatcher.topics();
                while let Some(delivery) = self.bus.try_next(dispatcher.name(), &topics) {
                    delivered += 1;
                    let disposition = dispatcher.on_message(delivery.message()).await;
                    if disposition.should_ack() {
                        delivery.ack().await.unwrap();
                    } else {
                        delivery.nack().await.unwrap();
                    }
                }
            }
            if delivered == 0 && self.pipeline.publisher().pending_count().await.unwrap() == 0 {
                return;
            }
        }
        panic!("pipeline did not settle");
    }

    async fn user_with_device(&self, name: &str) -> (User, wattwise_core::model::Device) {
        let user = self
            .service()
            .register_user(name, &format!("{}@example.com", name.to_lowercase()))
            .await
            .unwrap();
        let device = self
            .service()
            .register_device(user.id, "Heat pump", 2000, DeviceCategory::Climate)
            .await
            .unwrap();
        (user, device)
    }

    async fn week_goal(&self, user: &User, target: f64) -> Goal {
        let start = self.now();
        self.service()
            .create_goal(user.id, target, start, start + Days::days(7))
            .await
            .unwrap()
    }

    /// Two instances of one consumer sharing the harness's store and a
    /// fresh ledger, each with its own handler built by `handler`.
    fn replicas(
        &self,
        name: &'static str,
        entity_types: &[EntityType],
        handler: impl Fn() -> Arc<dyn EventHandler>,
    ) -> (Arc<Dispatcher>, Arc<Dispatcher>) {
        let ledger = Arc::new(InMemorySequenceLedger::new());
        let build = || {
            let mut dispatcher = Dispatcher::new(
                name,
                ledger.clone(),
                self.dead_letters.clone(),
                Arc::new(self.clock.clone()),
            );
            for entity_type in entity_types {
                dispatcher = dispatcher.with_handler(*entity_type, handler());
            }
            Arc::new(dispatcher)
        };
        (build(), build())
    }

    async fn goal_is_achieved(&self, goal: &Goal) -> bool {
        self.service()
            .goal(goal.id)
            .await
            .unwrap()
            .unwrap()
            .state
            .is_achieved()
    }
}

#[tokio::test]
async fn goal_is_achieved_once_the_threshold_is_crossed() {
    let h = Harness::new(GoalComparison::Threshold);
    let (user, device) = h.user_with_device("Ada").await;
    let goal = h.week_goal(&user, 100.0).await;

    h.service()
        .log_consumption(device.id, h.now() + Days::days(1), 40.0)
        .await
        .unwrap();
    h.settle().await;
    assert!(!h.goal_is_achieved(&goal).await);
    assert_eq!(h.service().count_unread(user.id).await.unwrap(), 0);

    h.service()
        .log_consumption(device.id, h.now() + Days::days(2), 70.0)
        .await
        .unwrap();
    h.settle().await;

    assert!(h.goal_is_achieved(&goal).await);
    let notifications = h.service().notifications_of(user.id).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].message.starts_with("Goal reached"));
    assert!(notifications[0].state.is_unread());
    assert!(h.dead_letters.is_empty());
}

#[tokio::test]
async fn redelivered_reading_is_discarded_as_duplicate() {
    let h = Harness::new(GoalComparison::Threshold);
    let (user, device) = h.user_with_device("Ada").await;
    h.week_goal(&user, 100.0).await;
    h.service()
        .log_consumption(device.id, h.now() + Days::days(1), 40.0)
        .await
        .unwrap();
    h.service()
        .log_consumption(device.id, h.now() + Days::days(2), 70.0)
        .await
        .unwrap();
    h.settle().await;

    let redelivered = h.bus.published("consumption").last().cloned().unwrap();
    for dispatcher in h.pipeline.dispatchers() {
        if dispatcher.topics().contains(&"consumption") {
            assert_eq!(
                dispatcher.on_message(&redelivered).await,
                Disposition::Duplicate,
                "{} handled a redelivery",
                dispatcher.name()
            );
        }
    }
    h.settle().await;

    assert_eq!(h.service().notifications_of(user.id).await.unwrap().len(), 1);
    assert!(h.service().achievements_of(user.id).await.unwrap().is_empty());
    let achieved: Vec<_> = h
        .store
        .events_of(EntityType::Goal)
        .into_iter()
        .filter(|event| event.is_update(ChangeTag::GoalAchieved))
        .collect();
    assert_eq!(achieved.len(), 1);
}

#[tokio::test]
async fn handlers_stay_idempotent_without_the_ledger() {
    let h = Harness::new(GoalComparison::Threshold);
    let (user, device) = h.user_with_device("Ada").await;
    h.week_goal(&user, 50.0).await;
    let record = h
        .service()
        .log_consumption(device.id, h.now() + Days::days(1), 60.0)
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(h.pipeline.evaluator().on_consumption(&record).await.unwrap(), 0);

    let achieved = h
        .store
        .events_of(EntityType::Goal)
        .into_iter()
        .find(|event| event.is_update(ChangeTag::GoalAchieved))
        .unwrap();
    let notifier = NotificationDispatcher::new(
        h.pipeline.publisher().clone(),
        Arc::new(StoreSubscriberDirectory::new(h.store.clone())),
        Arc::new(h.clock.clone()),
    );
    assert_eq!(notifier.dispatch(&achieved).await.unwrap(), 0);
    assert_eq!(h.service().notifications_of(user.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reading_outside_every_window_changes_nothing() {
    let h = Harness::new(GoalComparison::Threshold);
    let (user, device) = h.user_with_device("Ada").await;
    let goal = h.week_goal(&user, 10.0).await;

    h.service()
        .log_consumption(device.id, h.now() + Days::days(30), 500.0)
        .await
        .unwrap();
    h.settle().await;

    assert!(!h.goal_is_achieved(&goal).await);
    assert_eq!(h.store.events_of(EntityType::Goal).len(), 1);
    assert!(h.service().notifications_of(user.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn tariff_change_notifies_every_user_separately() {
    let h = Harness::new(GoalComparison::Ceiling);
    let ada = h.service().register_user("Ada", "ada@example.com").await.unwrap();
    let grace = h.service().register_user("Grace", "grace@example.com").await.unwrap();
    let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();

    h.service().set_tariff_flag(TariffTier::Green, day).await.unwrap();
    h.settle().await;
    let before_ada = h.service().count_unread(ada.id).await.unwrap();
    let before_grace = h.service().count_unread(grace.id).await.unwrap();

    h.service().set_tariff_flag(TariffTier::Red1, day).await.unwrap();
    h.settle().await;
    assert_eq!(h.service().count_unread(ada.id).await.unwrap(), before_ada + 1);
    assert_eq!(h.service().count_unread(grace.id).await.unwrap(), before_grace + 1);

    let latest = h.service().notifications_of(ada.id).await.unwrap();
    let red = latest
        .iter()
        .find(|n| n.message.contains("RED_1"))
        .unwrap();
    assert!(h.service().mark_read(red.id).await.unwrap());
    assert!(!h.service().mark_read(red.id).await.unwrap());
    h.settle().await;

    assert_eq!(h.service().count_unread(ada.id).await.unwrap(), before_ada);
    assert_eq!(h.service().count_unread(grace.id).await.unwrap(), before_grace + 1);
}

#[tokio::test]
async fn third_achieved_goal_unlocks_hat_trick_once() {
    let h = Harness::new(GoalComparison::Threshold);
    let (user, device) = h.user_with_device("Ada").await;
    for target in [5.0, 10.0, 15.0] {
        h.week_goal(&user, target).await;
    }

    h.service()
        .log_consumption(device.id, h.now() + Days::hours(6), 20.0)
        .await
        .unwrap();
    h.settle().await;

    let achievements = h.service().achievements_of(user.id).await.unwrap();
    assert_eq!(achievements.len(), 1);
    assert_eq!(achievements[0].rule.as_str(), "goals-achieved-3");
    assert_eq!(
        h.service().user(user.id).await.unwrap().unwrap().savings_score,
        50
    );

    let notifications = h.service().notifications_of(user.id).await.unwrap();
    assert_eq!(notifications.len(), 4);
    assert_eq!(
        notifications
            .iter()
            .filter(|n| n.message.starts_with("Achievement unlocked: Hat Trick"))
            .count(),
        1
    );
}

/// Deliver every message to both replicas at the same time.
async fn race(a: &Arc<Dispatcher>, b: &Arc<Dispatcher>, messages: Vec<TransportMessage>) {
    for message in messages {
        let (first, second) = (a.clone(), b.clone());
        let (m1, m2) = (message.clone(), message);
        let (x, y) = tokio::join!(
            tokio::spawn(async move { first.on_message(&m1).await }),
            tokio::spawn(async move { second.on_message(&m2).await }),
        );
        let (x, y) = (x.unwrap(), y.unwrap());
        assert!(x.should_ack() && y.should_ack(), "{x} / {y}");
        assert!(
            x != Disposition::DeadLettered && y != Disposition::DeadLettered,
            "{x} / {y}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_replicas_unlock_and_notify_once() {
    let h = Harness::new(GoalComparison::Threshold);
    let (user, device) = h.user_with_device("Ada").await;
    for target in [5.0, 10.0, 15.0] {
        h.week_goal(&user, target).await;
    }
    let record = h
        .service()
        .log_consumption(device.id, h.now() + Days::hours(6), 20.0)
        .await
        .unwrap();
    assert_eq!(h.pipeline.evaluator().on_consumption(&record).await.unwrap(), 3);
    h.pipeline.publisher().drain().await.unwrap();

    let achieved: Vec<TransportMessage> = h
        .bus
        .published("goal")
        .into_iter()
        .filter(|m| {
            DomainEvent::from_json_bytes(&m.payload)
                .unwrap()
                .is_update(ChangeTag::GoalAchieved)
        })
        .collect();
    assert_eq!(achieved.len(), 3);

    let publisher = h.pipeline.publisher().clone();
    let records: Arc<dyn RecordStore> = h.store.clone();
    let clock = Arc::new(h.clock.clone());
    let (unlock_a, unlock_b) = h.replicas(ACHIEVEMENT_UNLOCKER, &[EntityType::Goal], || {
        Arc::new(AchievementUnlocker::new(
            publisher.clone(),
            records.clone(),
            clock.clone(),
        ))
    });
    let directory = Arc::new(StoreSubscriberDirectory::new(h.store.clone()));
    let (notify_a, notify_b) = h.replicas(
        NOTIFICATION_DISPATCHER,
        &[EntityType::Goal, EntityType::Achievement],
        || {
            Arc::new(NotificationDispatcher::new(
                publisher.clone(),
                directory.clone(),
                clock.clone(),
            ))
        },
    );

    race(&unlock_a, &unlock_b, achieved.clone()).await;
    race(&notify_a, &notify_b, achieved).await;
    h.pipeline.publisher().drain().await.unwrap();
    race(&notify_a, &notify_b, h.bus.published("achievement")).await;

    let achievements = h.service().achievements_of(user.id).await.unwrap();
    assert_eq!(achievements.len(), 1);
    assert_eq!(achievements[0].rule.as_str(), "goals-achieved-3");
    assert_eq!(
        h.service().user(user.id).await.unwrap().unwrap().savings_score,
        50
    );
    let raises = h
        .store
        .events_of(EntityType::User)
        .into_iter()
        .filter(|event| event.is_update(ChangeTag::ScoreRaised))
        .count();
    assert_eq!(raises, 1);

    let notifications = h.store.all_notifications();
    assert_eq!(notifications.len(), 4);
    let mut sources: Vec<String> = notifications.iter().map(|n| n.source.dedup_key()).collect();
    sources.sort();
    sources.dedup();
    assert_eq!(sources.len(), 4);
    assert!(h.dead_letters.is_empty());
}

#[tokio::test]
async fn tenth_reading_unlocks_keeping_track() {
    let h = Harness::new(GoalComparison::Ceiling);
    let (user, device) = h.user_with_device("Ada").await;
    for hour in 0..10 {
        h.service()
            .log_consumption(device.id, h.now() + Days::hours(hour), 1.0)
            .await
            .unwrap();
    }
    h.settle().await;

    let achievements = h.service().achievements_of(user.id).await.unwrap();
    assert_eq!(achievements.len(), 1);
    assert_eq!(achievements[0].rule.as_str(), "consumption-logged-10");
    assert_eq!(
        h.service().user(user.id).await.unwrap().unwrap().savings_score,
        10
    );
}

#[tokio::test]
async fn ceiling_goals_are_settled_when_their_window_closes() {
    let h = Harness::new(GoalComparison::Ceiling);
    let (user, device) = h.user_with_device("Ada").await;
    let kept = h.week_goal(&user, 100.0).await;
    let missed = h.week_goal(&user, 50.0).await;

    for (day, kwh) in [(1, 30.0), (3, 40.0)] {
        h.service()
            .log_consumption(device.id, h.now() + Days::days(day), kwh)
            .await
            .unwrap();
    }
    h.settle().await;
    assert!(!h.goal_is_achieved(&kept).await);

    h.clock.advance(Days::days(8));
    let achieved = h
        .pipeline
        .evaluator()
        .evaluate_closed_windows(h.now())
        .await
        .unwrap();
    assert_eq!(achieved, 1);
    h.settle().await;

    assert!(h.goal_is_achieved(&kept).await);
    assert!(!h.goal_is_achieved(&missed).await);
    assert_eq!(h.service().count_unread(user.id).await.unwrap(), 1);

    let settled = h.service().goal(missed.id).await.unwrap().unwrap();
    assert_eq!(settled.state, GoalState::Missed { at: h.now() });

    let again = h
        .pipeline
        .evaluator()
        .evaluate_closed_windows(h.now())
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn missed_goals_are_not_rescanned_by_later_sweeps() {
    let h = Harness::new(GoalComparison::Ceiling);
    let (user, device) = h.user_with_device("Ada").await;
    for _ in 0..5 {
        h.week_goal(&user, 1.0).await;
    }
    h.service()
        .log_consumption(device.id, h.now() + Days::days(1), 50.0)
        .await
        .unwrap();
    h.settle().await;

    let end = h.now() + Days::days(7);
    assert!(h.store.pending_goals_closed_by(end).await.unwrap().is_empty());

    for sweep in 0..4 {
        h.clock.advance(Days::days(8));
        let achieved = h
            .pipeline
            .evaluator()
            .evaluate_closed_windows(h.now())
            .await
            .unwrap();
        assert_eq!(achieved, 0);
        assert!(
            h.store.pending_goals_closed_by(h.now()).await.unwrap().is_empty(),
            "sweep {sweep} left goals to rescan"
        );
    }
    h.settle().await;

    let goals = h.service().goals_of(user.id).await.unwrap();
    assert!(goals.iter().all(|g| matches!(g.state, GoalState::Missed { .. })));
    let missed_events = h
        .store
        .events_of(EntityType::Goal)
        .into_iter()
        .filter(|event| event.is_update(ChangeTag::GoalMissed))
        .count();
    assert_eq!(missed_events, 5);
    assert!(h.service().notifications_of(user.id).await.unwrap().is_empty());
    assert!(h.dead_letters.is_empty());
}

#[tokio::test]
async fn events_for_deleted_owners_are_benign() {
    let h = Harness::new(GoalComparison::Threshold);
    let (user, device) = h.user_with_device("Ada").await;
    h.week_goal(&user, 10.0).await;
    h.service()
        .log_consumption(device.id, h.now() + Days::days(1), 25.0)
        .await
        .unwrap();

    h.service().delete_user(user.id).await.unwrap();
    h.settle().await;

    assert!(h.dead_letters.is_empty());
    assert!(h.store.all_notifications().is_empty());
    assert!(h.store.all_achievements().is_empty());
    assert!(h.service().user(user.id).await.unwrap().is_none());
    assert_eq!(h.bus.published("user").len(), 2);
}

#[tokio::test]
async fn running_pipeline_converges_and_shuts_down() {
    let h = Harness::new(GoalComparison::Threshold);
    let running = h.pipeline.start();
    assert_eq!(running.tasks().len(), 5);

    let (user, device) = h.user_with_device("Ada").await;
    let goal = h.week_goal(&user, 100.0).await;
    for (day, kwh) in [(1, 40.0), (2, 70.0)] {
        h.service()
            .log_consumption(device.id, h.now() + Days::days(day), kwh)
            .await
            .unwrap();
    }

    let converged = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if h.service().count_unread(user.id).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "pipeline did not converge");
    assert!(h.bus.wait_idle(Duration::from_secs(5)).await);

    running.shutdown().await;

    assert!(h.goal_is_achieved(&goal).await);
    assert_eq!(h.service().count_unread(user.id).await.unwrap(), 1);
    assert!(h.dead_letters.is_empty());
}
