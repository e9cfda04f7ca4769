use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use keel_core::{Behavior, Effect, EntityId, ExpectedVersion, Kind, PersistentEntity};
use keel_events::{AggregateEventShards, AggregateEventTagger, Event};
use keel_infra::KeelConfig;
use keel_infra::entity::EntityDirectory;
use keel_infra::event_log::{EventLog, InMemoryEventLog, UncommittedEvent};

#[derive(Debug)]
enum CounterCommand {
    Increment,
}

impl Kind for CounterCommand {
    fn kind(&self) -> &'static str {
        "Increment"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Incremented;

impl Kind for Incremented {
    fn kind(&self) -> &'static str {
        "Incremented"
    }
}

impl Event for Incremented {
    fn aggregate_tagger() -> AggregateEventTagger {
        match AggregateEventShards::new("Counter", 8) {
            Ok(shards) => shards.into(),
            Err(err) => unreachable!("{err}"),
        }
    }
}

struct Counter;

impl PersistentEntity for Counter {
    type Command = CounterCommand;
    type Event = Incremented;
    type State = u64;
    type Reply = u64;

    const ENTITY_TYPE: &'static str = "counter";

    fn initial_behavior(snapshot: Option<u64>) -> Behavior<Self> {
        Behavior::<Self>::builder(snapshot.unwrap_or(0))
            .set_command_handler("Increment", |_cmd, _ctx| Effect::persist(Incremented, |n: &u64| *n))
            .set_event_handler("Incremented", |_evt, n| n + 1)
            .build()
    }
}

fn bench_tag_partitioning(c: &mut Criterion) {
    let shards = AggregateEventShards::new("Counter", 16).unwrap();
    let ids: Vec<EntityId> = (0..1000).map(|i| EntityId::new(format!("entity-{i}")).unwrap()).collect();

    let mut group = c.benchmark_group("tag_partitioning");
    group.throughput(Throughput::Elements(ids.len() as u64));
    group.bench_function("tag_for_1000_ids", |b| {
        b.iter(|| {
            for id in &ids {
                black_box(shards.tag_for(id));
            }
        })
    });
    group.finish();
}

fn bench_event_log_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("in_memory_append");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, &size| {
            let log = InMemoryEventLog::new();
            let id = EntityId::new("bench").unwrap();
            b.iter(|| {
                let events: Vec<UncommittedEvent> = (0..size)
                    .map(|_| UncommittedEvent::from_typed("counter", &id, &Incremented).unwrap())
                    .collect();
                rt.block_on(async { black_box(log.append(events, ExpectedVersion::Any).await.unwrap()) });
            })
        });
    }
    group.finish();
}

fn bench_ask_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let directory = rt.block_on(async {
        EntityDirectory::builder(std::sync::Arc::new(InMemoryEventLog::new()), &KeelConfig::default())
            .register::<Counter>()
            .unwrap()
            .build()
    });
    let id = EntityId::new("counter-1").unwrap();

    c.bench_function("ask_round_trip", |b| {
        b.iter(|| rt.block_on(async { black_box(directory.ask::<Counter>(&id, CounterCommand::Increment).await.unwrap()) }))
    });
}

criterion_group!(benches, bench_tag_partitioning, bench_event_log_append, bench_ask_round_trip);
criterion_main!(benches);
