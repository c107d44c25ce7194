//! Codec encoding/decoding benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rcplink_protocol::{Catalog, Codec, Command, LineDecoder, ParamDef, ParamKind};
use std::sync::Arc;

fn create_codec() -> Codec {
    let catalog = Catalog::builder()
        .param(
            ParamDef::new("mixer:input:fader", ParamKind::Scaled { scale: 100 })
                .with_range(-32768, 1000),
        )
        .param(ParamDef::new("mixer:input:on", ParamKind::Boolean))
        .param(ParamDef::new("mixer:input:label", ParamKind::String))
        .param(ParamDef::new("eq:band:freq", ParamKind::Frequency { scale: 10 }).aggregate())
        .build()
        .unwrap();
    Codec::new(Arc::new(catalog))
}

fn bench_encode(c: &mut Criterion) {
    let codec = create_codec();
    let mut group = c.benchmark_group("encode");

    let commands = [
        ("scaled", Command::set("mixer:input:fader", 12, 0, -32768)),
        ("boolean", Command::set("mixer:input:on", 3, 0, true)),
        ("string", Command::set("mixer:input:label", 0, 0, "Lead \"Vox\"")),
        ("get", Command::get("mixer:input:fader", 63, 0)),
    ];

    for (name, cmd) in commands {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(name), &cmd, |b, cmd| {
            b.iter(|| black_box(codec.encode(cmd).unwrap()));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let codec = create_codec();
    let mut group = c.benchmark_group("decode");

    let lines = [
        ("notify", "NOTIFY set mixer:input:fader 12 0 -327.68".to_string()),
        ("bare_push", "mixer:input:on 3 0 1".to_string()),
        ("string", r#"OK set mixer:input:label 0 0 "Lead \"Vox\"""#.to_string()),
        ("malformed", "OK frobnicate mixer:input:on 0 0".to_string()),
    ];

    for (name, line) in lines {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(name), &line, |b, line| {
            b.iter(|| black_box(codec.decode(line)));
        });
    }

    group.finish();
}

fn bench_decode_batch(c: &mut Criterion) {
    let codec = create_codec();
    let mut group = c.benchmark_group("decode_batch");

    for values in [1, 8, 64] {
        let mut line = String::from("OKm get eq:band:freq 0 0");
        for i in 0..values {
            line.push_str(&format!(" {}.{}k", 1 + i % 19, i % 10));
        }

        group.throughput(Throughput::Elements(values as u64));
        group.bench_with_input(BenchmarkId::from_parameter(values), &line, |b, line| {
            b.iter(|| black_box(codec.decode(line)));
        });
    }

    group.finish();
}

fn bench_line_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_framing");

    for lines in [1, 16, 256] {
        let data = "NOTIFY set mixer:input:fader 12 0 -327.68\r\n".repeat(lines);

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &data, |b, data| {
            b.iter(|| {
                let mut decoder = LineDecoder::new();
                decoder.extend(data.as_bytes());
                let mut count = 0;
                while let Ok(Some(line)) = decoder.decode_line() {
                    black_box(line);
                    count += 1;
                }
                count
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_decode_batch,
    bench_line_framing,
);

criterion_main!(benches);
