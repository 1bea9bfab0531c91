use criterion::{Criterion, criterion_group, criterion_main};
use event_store::{
    AggregateId, DomainEvent, Event, EventFeedQuery, EventRegistry, EventStore, EventStoreExt,
    InMemoryEventStore, Version,
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct ItemAdded {
    sku: String,
    quantity: u32,
}

impl DomainEvent for ItemAdded {
    const EVENT_NAME: &'static str = "ItemAdded";
}

fn registry() -> EventRegistry {
    EventRegistry::new().register::<ItemAdded>()
}

fn make_event(aggregate_id: &AggregateId, version: i64) -> Event {
    Event::from_domain(
        aggregate_id.clone(),
        &ItemAdded {
            sku: format!("sku-{version}"),
            quantity: 1,
        },
    )
    .unwrap()
    .with_version(Version::new(version))
}

async fn seeded_store(aggregates: usize, events_each: i64) -> InMemoryEventStore {
    let store = InMemoryEventStore::new(registry());
    for n in 0..aggregates {
        let id = AggregateId::new(format!("cart-{n}"));
        let events = (1..=events_each).map(|v| make_event(&id, v)).collect();
        store.save_events(&id, events, None).await.unwrap();
    }
    store
}

fn bench_append_single_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_single_event", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new(registry());
                let id = AggregateId::generate();
                store
                    .save_events(&id, vec![make_event(&id, 1)], None)
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_append_batch_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_batch_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new(registry());
                let id = AggregateId::generate();
                let events = (1..=10).map(|v| make_event(&id, v)).collect();
                store.save_events(&id, events, None).await.unwrap();
            });
        });
    });
}

fn bench_get_events_for_aggregate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(seeded_store(100, 20));
    let id = AggregateId::new("cart-42");

    c.bench_function("event_store/get_events_for_aggregate", |b| {
        b.iter(|| {
            rt.block_on(async {
                let events = store.get_events_for_aggregate(&id).await.unwrap();
                assert_eq!(events.len(), 20);
            });
        });
    });
}

fn bench_feed_page(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(seeded_store(100, 20));

    c.bench_function("event_store/feed_page_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let page = store
                    .get_all_events(EventFeedQuery::page(500, 100))
                    .await
                    .unwrap();
                assert_eq!(page.len(), 100);
            });
        });
    });
}

fn bench_scan_all(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(seeded_store(100, 20));

    c.bench_function("event_store/scan_all_2000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let events: Vec<_> = store.scan_all(250, None).try_collect().await.unwrap();
                assert_eq!(events.len(), 2000);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_append_single_event,
    bench_append_batch_10,
    bench_get_events_for_aggregate,
    bench_feed_page,
    bench_scan_all,
);
criterion_main!(benches);
