use criterion::{criterion_group, criterion_main, Criterion};
use reveal_sync::broadcast::Broadcaster;
use reveal_sync::connection::ConnectionHandle;
use reveal_sync::content::StaticContent;
use reveal_sync::coordinator::{Coordinator, CoordinatorConfig};
use reveal_sync::protocol::{ClientMessage, ServerMessage};
use reveal_sync::session::{ReconnectReadiness, SessionRegistry};
use std::hint::black_box;
use std::sync::Arc;

fn bench_client_decode(c: &mut Criterion) {
    let text = r#"{"type":"ready","clientId":"participant-42","isReady":true}"#;

    c.bench_function("client_message_decode", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(text)).unwrap());
        })
    });
}

fn bench_partial_state_encode(c: &mut Criterion) {
    let msg = ServerMessage::PartialState {
        client_id: "participant-42".to_string(),
        is_ready: true,
        ready_count: 41,
        total_count: 100,
    };

    c.bench_function("partial_state_encode", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_ready_data_1000(c: &mut Criterion) {
    let mut registry = SessionRegistry::new();
    let mut receivers = Vec::new();
    for i in 0..1000 {
        let (conn, rx) = ConnectionHandle::new(1);
        registry.register_or_update(&format!("p{i}"), i % 2 == 0, conn, ReconnectReadiness::default());
        receivers.push(rx);
    }

    c.bench_function("ready_data_1000_sessions", |b| {
        b.iter(|| {
            black_box(registry.ready_data());
        })
    });
}

fn bench_fan_out_100_peers(c: &mut Criterion) {
    let broadcaster = Broadcaster::new();
    let mut connections = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..100 {
        let (conn, rx) = ConnectionHandle::new(4);
        connections.push(conn);
        receivers.push(rx);
    }
    let msg = ServerMessage::ImageUpdated;

    c.bench_function("fan_out_100_peers", |b| {
        b.iter(|| {
            let count = broadcaster.fan_out(black_box(&connections), &msg).unwrap();
            black_box(count);
            for rx in &mut receivers {
                let _ = rx.try_recv();
            }
        })
    });
}

fn bench_ready_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let coordinator = Coordinator::new(
        CoordinatorConfig {
            expected_users: 1000,
            ..Default::default()
        },
        Arc::new(StaticContent::new(false)),
    );
    let mut receivers = Vec::new();
    rt.block_on(async {
        for i in 0..50 {
            let (conn, rx) = ConnectionHandle::new(1);
            coordinator.register(&format!("p{i}"), false, conn).await;
            receivers.push(rx);
        }
    });

    c.bench_function("ready_50_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(coordinator.ready(black_box("p7"), true).await);
            });
        })
    });
}

criterion_group!(
    benches,
    bench_client_decode,
    bench_partial_state_encode,
    bench_ready_data_1000,
    bench_fan_out_100_peers,
    bench_ready_round_trip,
);
criterion_main!(benches);
