use criterion::{black_box, criterion_group, criterion_main, Criterion};
use trichter_core::{EventKind, Owner, RunData, RunEvent, RunWithOwner, PLACEHOLDER_IMAGE};
use trichter_live::protocol::{decode_event, Frame, FrameDecoder};
use trichter_live::reconnect::ReconnectPolicy;
use trichter_live::replica::RunsStore;
use trichter_live::repository::MemoryRunRepository;
use trichter_live::stream::{StreamConfig, StreamEndpoint};
use trichter_live::RunBus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn sample_run(i: usize) -> RunWithOwner {
    RunWithOwner {
        id: format!("run-{i}"),
        name: Some(format!("Run {i}")),
        data: RunData {
            duration: 2.0 + (i % 7) as f64 * 0.1,
            rate: 1.0 + (i % 13) as f64 * 0.25,
            volume: 0.5,
        },
        image: PLACEHOLDER_IMAGE.into(),
        created_at: chrono::Utc::now(),
        user: Some(Owner::new("u1", "Alice", "alice")),
    }
}

fn bench_frame_encode(c: &mut Criterion) {
    let event = RunEvent::Created(sample_run(1));

    c.bench_function("frame_encode_run_created", |b| {
        b.iter(|| {
            let frame = Frame::from_event(black_box(&event)).unwrap();
            black_box(frame.encode());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = Frame::from_event(&RunEvent::Updated(sample_run(1))).unwrap();

    c.bench_function("frame_decode_run_updated", |b| {
        b.iter(|| {
            black_box(decode_event(black_box(&frame)).unwrap());
        })
    });
}

fn bench_sse_decoder(c: &mut Criterion) {
    let body: String = (0..32)
        .map(|i| Frame::from_event(&RunEvent::Created(sample_run(i))).unwrap().encode())
        .collect();
    let bytes = body.into_bytes();

    c.bench_function("sse_decoder_32_frames_in_512B_chunks", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut frames = 0;
            for chunk in bytes.chunks(512) {
                frames += decoder.push(black_box(chunk)).len();
            }
            black_box(frames);
        })
    });
}

fn bench_bus_publish_no_listeners(c: &mut Criterion) {
    let bus = RunBus::default();
    let event = RunEvent::deleted("run-1");

    c.bench_function("bus_publish_0_listeners", |b| {
        b.iter(|| {
            black_box(bus.publish(black_box(&event)));
        })
    });
}

fn bench_bus_fan_out(c: &mut Criterion) {
    let bus = RunBus::default();
    let delivered = Arc::new(AtomicU64::new(0));
    for _ in 0..100 {
        let delivered = delivered.clone();
        bus.subscribe(EventKind::RunDeleted, move |_: &RunEvent| {
            delivered.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
    }
    let event = RunEvent::deleted("run-1");

    c.bench_function("bus_fan_out_100_listeners", |b| {
        b.iter(|| {
            black_box(bus.publish(black_box(&event)));
        })
    });
}

fn bench_endpoint_open_close(c: &mut Criterion) {
    let bus = RunBus::default();
    let endpoint = StreamEndpoint::new(bus, StreamConfig::default());

    c.bench_function("endpoint_open_close", |b| {
        b.iter(|| {
            let subscriber = endpoint.open().unwrap();
            black_box(subscriber.id());
        })
    });
}

fn bench_replica_upsert(c: &mut Criterion) {
    let store = RunsStore::new(Arc::new(MemoryRunRepository::new()));
    store.initialize((0..500).map(sample_run).collect());
    let run = sample_run(250);

    c.bench_function("replica_upsert_existing_500", |b| {
        b.iter(|| {
            black_box(store.upsert(black_box(run.clone())));
        })
    });
}

fn bench_replica_views(c: &mut Criterion) {
    let store = RunsStore::new(Arc::new(MemoryRunRepository::new()));
    store.initialize((0..500).map(sample_run).collect());

    c.bench_function("replica_by_rate_500", |b| {
        b.iter(|| {
            black_box(store.by_rate());
        })
    });
}

fn bench_backoff_delay(c: &mut Criterion) {
    let policy = ReconnectPolicy::default();

    c.bench_function("backoff_delay_for", |b| {
        b.iter(|| {
            for attempt in 0..8 {
                black_box(policy.delay_for(black_box(attempt)));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_sse_decoder,
    bench_bus_publish_no_listeners,
    bench_bus_fan_out,
    bench_endpoint_open_close,
    bench_replica_upsert,
    bench_replica_views,
    bench_backoff_delay,
);
criterion_main!(benches);
