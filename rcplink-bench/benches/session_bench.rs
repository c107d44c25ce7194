//! Queue, session core and loopback round-trip benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rcplink_client::{CacheKey, Client, CommandQueue, SessionConfig, SessionCore, StateCache};
use rcplink_protocol::{Catalog, Command, ParamDef, ParamKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

fn create_catalog() -> Arc<Catalog> {
    Arc::new(
        Catalog::builder()
            .param(
                ParamDef::new("mixer:input:fader", ParamKind::Scaled { scale: 100 })
                    .with_range(-32768, 1000),
            )
            .param(ParamDef::new("mixer:input:on", ParamKind::Boolean))
            .build()
            .unwrap(),
    )
}

fn bench_enqueue_dedup(c: &mut Criterion) {
    let catalog = create_catalog();
    let mut group = c.benchmark_group("enqueue_dedup");

    // Distinct keys in the queue while a fader sweep is coalesced.
    for keys in [1, 16, 64] {
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, &keys| {
            b.iter(|| {
                let mut queue = CommandQueue::new(catalog.clone(), 400);
                for i in 0..256u32 {
                    let row = i % keys;
                    queue.enqueue(Command::set("mixer:input:fader", row, 0, i as i64));
                }
                black_box(queue.len())
            });
        });
    }

    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let catalog = create_catalog();
    let mut group = c.benchmark_group("drain");
    group.throughput(Throughput::Elements(64));

    group.bench_function("64_sets", |b| {
        b.iter(|| {
            let cache = StateCache::new(catalog.clone(), 16);
            let mut queue = CommandQueue::new(catalog.clone(), 400);
            for row in 0..64 {
                queue.enqueue(Command::set("mixer:input:on", row, 0, row % 2 == 0));
            }
            while let Some(cmd) = queue.drain_tick(&cache) {
                black_box(cmd);
            }
        });
    });

    group.finish();
}

fn bench_inbound(c: &mut Criterion) {
    let catalog = create_catalog();
    let mut group = c.benchmark_group("inbound");

    for lines in [1, 64] {
        let data = (0..lines)
            .map(|row| format!("NOTIFY set mixer:input:fader {} 0 -{}.00\n", row, row % 100))
            .collect::<String>();

        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &data, |b, data| {
            let mut core = SessionCore::new(catalog.clone(), &SessionConfig::default());
            core.begin_connect().unwrap();
            core.on_connected().unwrap();
            b.iter(|| {
                core.reset_poll();
                black_box(core.on_data(data.as_bytes()))
            });
        });
    }

    group.finish();
}

/// Answers every `get` with a fixed value, like a device would.
async fn run_fake_device(listener: TcpListener) {
    let Ok((socket, _)) = listener.accept().await else {
        return;
    };
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(rest) = line.strip_prefix("get ") {
            let reply = format!("OK get {} -10.00\n", rest);
            if write_half.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

fn bench_read_roundtrip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let client = rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(run_fake_device(listener));

        let config =
            SessionConfig::new("127.0.0.1", port).with_send_interval(Duration::from_millis(1));
        let client = Client::new(config, create_catalog()).unwrap();
        client.connect().await.unwrap();
        client
    });

    let mut group = c.benchmark_group("e2e_read");
    group.throughput(Throughput::Elements(1));

    group.bench_function("read", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                client
                    .read("mixer:input:fader", 0, 0, Duration::from_secs(1))
                    .await
                    .unwrap(),
            )
        });
    });

    group.bench_function("cached_get", |b| {
        let key = CacheKey::new("mixer:input:fader", 0, 0);
        b.iter(|| black_box(client.get(&key.address, key.row, key.column).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_dedup,
    bench_drain,
    bench_inbound,
    bench_read_roundtrip,
);

criterion_main!(benches);
