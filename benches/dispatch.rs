use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use tokio::sync::mpsc;

use realtime_sync::{
    ChannelLayout, ChannelSet, EntityBinding, EntityId, EventBus, EventRouter, HeartbeatConfig,
    HeartbeatMonitor, InboundEvent, LoopbackTransport, MemoryActivityLogger, RealtimeTransport,
    StandardChannel, StateCell, SubscriptionRegistry, TransportSignal,
};

/// Router with `extra` unrelated subscriptions plus the transaction channel.
fn make_router(extra: usize) -> (EventRouter, String, mpsc::UnboundedReceiver<TransportSignal>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let transport = Arc::new(LoopbackTransport::new());
    let (tx, rx) = mpsc::unbounded_channel();
    runtime.block_on(transport.open(tx)).unwrap();

    let events = Arc::new(EventBus::new());
    let registry = SubscriptionRegistry::new(transport, Arc::clone(&events));
    let entity = EntityId::new("bench-user").unwrap();
    let layout = ChannelLayout::default();
    let transactions = layout.channel_path(StandardChannel::Transaction, &entity);

    registry
        .subscribe(&ChannelSet::single(transactions.clone()).unwrap(), |_| Ok(()))
        .unwrap();
    for i in 0..extra {
        registry
            .subscribe(&ChannelSet::single(format!("noise.{i}")).unwrap(), |_| Ok(()))
            .unwrap();
    }

    let binding = EntityBinding::default();
    let state = StateCell::default();
    let router = EventRouter::new(
        registry,
        events,
        binding,
        HeartbeatMonitor::new(HeartbeatConfig::default(), state),
        Arc::new(MemoryActivityLogger::new()),
        layout,
        "bench".to_string(),
    );
    (router, transactions, rx)
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    for extra in [0usize, 64] {
        let (router, channel, _rx) = make_router(extra);
        let raw = InboundEvent::new(
            channel,
            json!({
                "userId": "bench-user",
                "type": "buy",
                "amount": 5,
                "symbol": "ETH",
                "status": "pending"
            }),
        )
        .to_raw()
        .unwrap();

        group.bench_function(format!("transaction/{extra}_other_subscriptions"), |b| {
            b.iter(|| router.dispatch(&raw));
        });
    }

    let (router, _channel, _rx) = make_router(64);
    let unmatched = InboundEvent::new("prices.btc", json!({"price": 64000}))
        .to_raw()
        .unwrap();
    group.bench_function("unmatched", |b| {
        b.iter(|| router.dispatch(&unmatched));
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
