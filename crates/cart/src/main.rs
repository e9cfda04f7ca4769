use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use keel_core::EntityId;
use keel_events::{Event, InMemoryTopic, TopicSink};
use keel_infra::KeelConfig;
use keel_infra::entity::EntityDirectory;
use keel_infra::event_log::{EventLog, InMemoryEventLog, PostgresEventLog};
use keel_infra::offset_store::InMemoryReadSide;
use keel_infra::projection::{CommitMode, ReadSideProcessor};
use keel_infra::topic::TopicProducer;
use keel_infra::workers::{WorkerCoordinator, WorkerStatus};

use keel_cart::{CartCommand, CartEvent, CartMessage, CartReport, CartReportHandler, ShoppingCart, TOPIC_ID, translate};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keel_observability::init();

    let config = KeelConfig::from_env().context("loading KEEL_* configuration")?;
    let log = event_log().await?;
    let sink = topic_sink()?;

    let directory = EntityDirectory::builder(log.clone(), &config)
        .register::<ShoppingCart>()?
        .build();

    let read_side = Arc::new(InMemoryReadSide::new());
    let report = Arc::new(
        ReadSideProcessor::new(
            "shopping-cart-report",
            CartEvent::aggregate_tagger().all_tags(),
            CartReportHandler,
            read_side.clone(),
            log.clone(),
            &config.projection,
        )
        .with_commit_mode(CommitMode::batched(&config.projection)),
    );
    let producer = Arc::new(TopicProducer::from_event_log::<CartEvent, _>(
        TOPIC_ID,
        log.clone(),
        translate,
        sink,
        read_side.clone(),
        &config.projection,
    ));

    let coordinator = WorkerCoordinator::new(&config.reconciler, directory.placement().clone());
    coordinator.register(report, WorkerStatus::Started)?;
    coordinator.register(producer, WorkerStatus::Started)?;

    let cart = EntityId::new("cart-1")?;
    directory.ask::<ShoppingCart>(&cart, CartCommand::update_item("sku-7", 3)).await?;
    let summary = directory.ask::<ShoppingCart>(&cart, CartCommand::Checkout).await?;
    info!(cart_id = %cart, items = ?summary.items, "cart checked out");

    let reported = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(report) = CartReport::load(&read_side, cart.as_str()).filter(|r| r.checked_out) {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("report did not catch up")?;
    info!(cart_id = %reported.cart_id, items = ?reported.items, "report updated");

    for projection in coordinator.get_status() {
        for worker in projection.workers {
            info!(worker = %worker.name, requested = ?worker.requested, observed = ?worker.observed, "worker status");
        }
    }

    coordinator.shutdown().await;
    directory.shutdown().await;
    Ok(())
}

/// Postgres when `DATABASE_URL` is set, in-memory otherwise.
async fn event_log() -> anyhow::Result<Arc<dyn EventLog>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            let log = PostgresEventLog::new(pool);
            log.create_schema().await?;
            Ok(Arc::new(log))
        }
        Err(_) => {
            warn!("DATABASE_URL not set; using in-memory event log");
            Ok(Arc::new(InMemoryEventLog::new()))
        }
    }
}

#[cfg(feature = "redis")]
fn topic_sink() -> anyhow::Result<Arc<dyn TopicSink<CartMessage>>> {
    match std::env::var("REDIS_URL") {
        Ok(url) => Ok(Arc::new(keel_infra::topic::RedisStreamsSink::new(url, TOPIC_ID)?)),
        Err(_) => Ok(Arc::new(InMemoryTopic::new())),
    }
}

#[cfg(not(feature = "redis"))]
fn topic_sink() -> anyhow::Result<Arc<dyn TopicSink<CartMessage>>> {
    if std::env::var("REDIS_URL").is_ok() {
        warn!("REDIS_URL ignored; build with the `redis` feature to publish to Redis Streams");
    }
    Ok(Arc::new(InMemoryTopic::new()))
}
