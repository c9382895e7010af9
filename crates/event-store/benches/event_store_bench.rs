use criterion::{Criterion, criterion_group, criterion_main};
use event_store::{
    AggregateId, EventEnvelope, EventStore, EventStoreExt, LogFileEventStore, Sequence,
};

fn make_event(aggregate_id: &AggregateId, sequence: u64) -> EventEnvelope {
    EventEnvelope::builder()
        .aggregate_id(aggregate_id.clone())
        .aggregate_type("Account")
        .event_type("AmountDeposited")
        .sequence(Sequence::new(sequence))
        .payload_raw(serde_json::json!({
            "account_id": aggregate_id.to_string(),
            "amount": 100
        }))
        .build()
        .unwrap()
}

fn bench_append_single_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = rt.block_on(LogFileEventStore::open(dir.path())).unwrap();

    c.bench_function("event_store/append_single_event", |b| {
        b.iter(|| {
            rt.block_on(async {
                let agg_id = AggregateId::random();
                let event = make_event(&agg_id, 0);
                store.append_events(&agg_id, None, vec![event]).await.unwrap();
            });
        });
    });
}

fn bench_append_batch_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = rt.block_on(LogFileEventStore::open(dir.path())).unwrap();

    c.bench_function("event_store/append_batch_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let agg_id = AggregateId::random();
                let events: Vec<EventEnvelope> = (0..10).map(|s| make_event(&agg_id, s)).collect();
                store.append_events(&agg_id, None, events).await.unwrap();
            });
        });
    });
}

fn bench_read_stream_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = rt.block_on(LogFileEventStore::open(dir.path())).unwrap();
    let agg_id = AggregateId::random();

    rt.block_on(async {
        let events: Vec<EventEnvelope> = (0..100).map(|s| make_event(&agg_id, s)).collect();
        store.append_events(&agg_id, None, events).await.unwrap();
    });

    c.bench_function("event_store/read_stream_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let events = store.read_all(&agg_id).await.unwrap();
                assert_eq!(events.len(), 100);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_append_single_event,
    bench_append_batch_10,
    bench_read_stream_100,
);
criterion_main!(benches);
