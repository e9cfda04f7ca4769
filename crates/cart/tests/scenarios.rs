use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use keel_core::EntityId;
use keel_events::{AggregateEventTag, Event, InMemoryTopic, Offset};
use keel_infra::entity::{AskError, EntityDirectory};
use keel_infra::event_log::{EventLog, InMemoryEventLog};
use keel_infra::offset_store::InMemoryReadSide;
use keel_infra::projection::{CommitMode, ReadSideProcessor};
use keel_infra::testkit::{FailingEventLog, ReadSideTestDriver};
use keel_infra::topic::TopicProducer;
use keel_infra::workers::{WorkerCoordinator, WorkerStatus};
use keel_infra::{KeelConfig, ProjectionConfig, ReconcilerConfig, RestartBackoff};

use keel_cart::{CartCommand, CartEvent, CartMessage, CartReport, CartReportHandler, ShoppingCart, translate};

fn id(s: &str) -> EntityId {
    EntityId::new(s).unwrap()
}

fn projection_config() -> ProjectionConfig {
    ProjectionConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_flush_interval(Duration::from_millis(20))
        .with_backoff(RestartBackoff::fixed(Duration::from_millis(10)))
}

fn reconciler_config() -> ReconcilerConfig {
    ReconcilerConfig::default().with_tick(Duration::from_millis(20))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

struct Pipeline {
    log: Arc<InMemoryEventLog>,
    directory: EntityDirectory,
    read_side: Arc<InMemoryReadSide>,
    coordinator: WorkerCoordinator,
}

impl Pipeline {
    fn start(mode: fn(&ProjectionConfig) -> CommitMode) -> Self {
        let log = Arc::new(InMemoryEventLog::new());
        let directory = EntityDirectory::builder(log.clone(), &KeelConfig::default())
            .register::<ShoppingCart>()
            .unwrap()
            .build();
        let read_side = Arc::new(InMemoryReadSide::new());
        let config = projection_config();
        let report = Arc::new(
            ReadSideProcessor::new(
                "shopping-cart-report",
                CartEvent::aggregate_tagger().all_tags(),
                CartReportHandler,
                read_side.clone(),
                log.clone(),
                &config,
            )
            .with_commit_mode(mode(&config)),
        );
        let coordinator = WorkerCoordinator::new(&reconciler_config(), directory.placement().clone());
        coordinator.register(report, WorkerStatus::Started).unwrap();
        Self {
            log,
            directory,
            read_side,
            coordinator,
        }
    }

    async fn stop(self) {
        self.coordinator.shutdown().await;
        self.directory.shutdown().await;
    }
}

async fn cart_1_is_reported(mode: fn(&ProjectionConfig) -> CommitMode) {
    let pipeline = Pipeline::start(mode);
    let cart = id("cart-1");
    pipeline
        .directory
        .ask::<ShoppingCart>(&cart, CartCommand::update_item("sku-7", 3))
        .await
        .unwrap();
    let summary = pipeline.directory.ask::<ShoppingCart>(&cart, CartCommand::Checkout).await.unwrap();
    assert!(summary.checked_out);

    eventually(|| CartReport::load(&pipeline.read_side, "cart-1").is_some_and(|r| r.checked_out)).await;
    let rows = pipeline.read_side.rows(keel_cart::REPORT_TABLE);
    assert_eq!(rows.len(), 1);
    let report = CartReport::load(&pipeline.read_side, "cart-1").unwrap();
    assert_eq!(report.items, BTreeMap::from([("sku-7".to_string(), 3)]));
    assert!(report.checked_out);

    pipeline.stop().await;
}

#[tokio::test]
async fn checked_out_cart_is_reported_with_synchronous_commits() {
    cart_1_is_reported(|_| CommitMode::Synchronous).await;
}

#[tokio::test]
async fn checked_out_cart_is_reported_with_batched_commits() {
    cart_1_is_reported(CommitMode::batched).await;
}

#[tokio::test]
async fn rejected_command_appends_nothing() {
    let pipeline = Pipeline::start(|_| CommitMode::Synchronous);
    let cart = id("cart-9");

    let err = pipeline
        .directory
        .ask::<ShoppingCart>(&cart, CartCommand::update_item("sku-1", -2))
        .await
        .unwrap_err();
    assert_eq!(err, AskError::InvalidCommand("Quantity must be greater than zero".into()));
    let err = pipeline.directory.ask::<ShoppingCart>(&cart, CartCommand::Checkout).await.unwrap_err();
    assert!(matches!(err, AskError::InvalidCommand(_)));

    let persisted = pipeline.log.load("shopping-cart", &cart, 0).await.unwrap();
    assert!(persisted.is_empty());
    let state = pipeline.directory.ask::<ShoppingCart>(&cart, CartCommand::Get).await.unwrap();
    assert!(state.items.is_empty() && !state.checked_out);

    pipeline.stop().await;
}

#[tokio::test]
async fn timed_out_update_still_lands() {
    let log = Arc::new(FailingEventLog::new(InMemoryEventLog::new()));
    let directory = EntityDirectory::builder(log.clone(), &KeelConfig::default())
        .register::<ShoppingCart>()
        .unwrap()
        .build();
    let cart = id("cart-slow");

    log.set_append_delay(Duration::from_millis(50));
    let err = directory
        .ask_with_timeout::<ShoppingCart>(&cart, CartCommand::update_item("sku-7", 1), Duration::from_millis(1))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    log.set_append_delay(Duration::ZERO);
    let summary = directory.ask::<ShoppingCart>(&cart, CartCommand::Get).await.unwrap();
    assert_eq!(summary.items.get("sku-7"), Some(&1));
    directory.shutdown().await;
}

#[tokio::test]
async fn stopping_tag_3_leaves_other_tags_running() {
    let pipeline = Pipeline::start(|_| CommitMode::Synchronous);
    let tags = CartEvent::aggregate_tagger();
    // cart-2 lands in CartEvent3, cart-1 in CartEvent0.
    let (in_tag_3, elsewhere) = (id("cart-2"), id("cart-1"));
    let tag_3 = AggregateEventTag::new("CartEvent3");
    assert_eq!(tags.tag_for(&in_tag_3), tag_3);
    assert_ne!(tags.tag_for(&elsewhere), tag_3);

    pipeline
        .directory
        .ask::<ShoppingCart>(&in_tag_3, CartCommand::update_item("a", 1))
        .await
        .unwrap();
    eventually(|| CartReport::load(&pipeline.read_side, "cart-2").is_some()).await;

    pipeline.coordinator.stop_worker("shopping-cart-report", &tag_3).unwrap();
    eventually(|| {
        pipeline.coordinator.get_status()[0]
            .worker(&tag_3)
            .is_some_and(|w| w.observed == WorkerStatus::Stopped)
    })
    .await;
    let status = &pipeline.coordinator.get_status()[0];
    for worker in status.workers.iter().filter(|w| w.tag != tag_3) {
        assert_eq!(worker.observed, WorkerStatus::Started, "{}", worker.name);
    }

    pipeline
        .directory
        .ask::<ShoppingCart>(&in_tag_3, CartCommand::update_item("b", 2))
        .await
        .unwrap();
    pipeline
        .directory
        .ask::<ShoppingCart>(&elsewhere, CartCommand::update_item("c", 3))
        .await
        .unwrap();
    eventually(|| CartReport::load(&pipeline.read_side, "cart-1").is_some()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stale = CartReport::load(&pipeline.read_side, "cart-2").unwrap();
    assert!(!stale.items.contains_key("b"));

    pipeline.coordinator.start_worker("shopping-cart-report", &tag_3).unwrap();
    eventually(|| CartReport::load(&pipeline.read_side, "cart-2").is_some_and(|r| r.items.contains_key("b"))).await;

    pipeline.stop().await;
}

#[tokio::test]
async fn redelivered_events_do_not_change_the_report() {
    let db = Arc::new(InMemoryReadSide::new());
    let driver = ReadSideTestDriver::new("shopping-cart-report", CartReportHandler, db.clone())
        .await
        .unwrap()
        .with_entity_type("shopping-cart");
    let cart = id("cart-1");
    let added = CartEvent::ItemUpdated {
        product_id: "sku-7".into(),
        quantity: 3,
    };

    driver.feed(&cart, added.clone(), Offset::Sequence(1)).await.unwrap();
    let once = CartReport::load(&db, "cart-1").unwrap();
    driver.feed(&cart, added, Offset::Sequence(1)).await.unwrap();
    assert_eq!(CartReport::load(&db, "cart-1").unwrap(), once);
    assert_eq!(db.rows(keel_cart::REPORT_TABLE).len(), 1);

    driver.feed(&cart, CartEvent::CheckedOut, Offset::Sequence(2)).await.unwrap();
    let report = CartReport::load(&db, "cart-1").unwrap();
    assert!(report.checked_out);
    assert_eq!(report.items, BTreeMap::from([("sku-7".to_string(), 3)]));
}

#[tokio::test]
async fn checkouts_are_published_to_the_topic() {
    let log = Arc::new(InMemoryEventLog::new());
    let directory = EntityDirectory::builder(log.clone(), &KeelConfig::default())
        .register::<ShoppingCart>()
        .unwrap()
        .build();
    let topic = Arc::new(InMemoryTopic::<CartMessage>::new());
    let offsets = Arc::new(InMemoryReadSide::new());
    let producer = Arc::new(TopicProducer::from_event_log::<CartEvent, _>(
        "cart-topic",
        log.clone(),
        translate,
        topic.clone(),
        offsets,
        &projection_config(),
    ));
    let coordinator = WorkerCoordinator::new(&reconciler_config(), directory.placement().clone());
    coordinator.register(producer, WorkerStatus::Started).unwrap();

    for cart in ["cart-1", "cart-2", "cart-3"] {
        let cart = id(cart);
        directory
            .ask::<ShoppingCart>(&cart, CartCommand::update_item("sku", 1))
            .await
            .unwrap();
        directory.ask::<ShoppingCart>(&cart, CartCommand::Checkout).await.unwrap();
    }

    eventually(|| topic.len() == 3).await;
    let mut carts: Vec<_> = topic.published().into_iter().map(|m| (m.key, m.message.cart_id)).collect();
    carts.sort();
    assert_eq!(
        carts,
        [
            ("cart-1".to_string(), "cart-1".to_string()),
            ("cart-2".to_string(), "cart-2".to_string()),
            ("cart-3".to_string(), "cart-3".to_string()),
        ]
    );

    coordinator.shutdown().await;
    directory.shutdown().await;
}
