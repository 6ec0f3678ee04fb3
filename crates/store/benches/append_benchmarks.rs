use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use rill_core::{ExpectedVersion, StreamId};
use rill_store::{EventLog, InMemoryEventLog, ProposedEvent, SourceSelector};

fn sid(name: &str) -> StreamId {
    StreamId::new(name).expect("valid stream id")
}

fn batch(size: usize) -> Vec<ProposedEvent> {
    (0..size)
        .map(|i| ProposedEvent::new("AddedEvent", format!("{{\"n\":{i}}}").into_bytes()))
        .collect()
}

fn seeded_log(streams: usize, events_per_stream: usize) -> InMemoryEventLog {
    let log = InMemoryEventLog::new();
    for s in 0..streams {
        let stream = sid(&format!("Stream{s}-1"));
        for chunk in 0..events_per_stream / 100 {
            log.append(&stream, ExpectedVersion::Any, batch(100))
                .unwrap_or_else(|e| panic!("seed chunk {chunk}: {e}"));
        }
    }
    log
}

fn bench_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_throughput");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("single_stream", batch_size),
            batch_size,
            |b, &size| {
                let log = InMemoryEventLog::new();
                let stream = sid("orders-1");
                b.iter(|| {
                    black_box(
                        log.append(&stream, ExpectedVersion::Any, batch(size))
                            .unwrap(),
                    );
                });
            },
        );
    }

    group.throughput(Throughput::Elements(1));
    group.bench_function("round_robin_streams", |b| {
        let log = InMemoryEventLog::new();
        let streams: Vec<StreamId> = (0..8).map(|i| sid(&format!("orders-{i}"))).collect();
        let mut next = 0usize;
        b.iter(|| {
            let stream = &streams[next % streams.len()];
            next += 1;
            black_box(log.append(stream, ExpectedVersion::Any, batch(1)).unwrap());
        });
    });

    group.finish();
}

fn bench_read_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_paths");

    let log = seeded_log(4, 2500);
    let stream = sid("Stream0-1");
    group.throughput(Throughput::Elements(256));
    group.bench_function("stream_page_256", |b| {
        b.iter(|| black_box(log.read(&stream, 1000, 256).unwrap()));
    });

    group.bench_function("merged_page_256", |b| {
        let selector = SourceSelector::category("Stream");
        b.iter(|| black_box(log.read_merged(&selector, 5000, 256).unwrap()));
    });

    group.throughput(Throughput::Elements(10_000));
    group.bench_function("merged_full_scan", |b| {
        let selector = SourceSelector::category("Stream");
        b.iter(|| {
            let mut from = 0;
            let mut seen = 0usize;
            loop {
                let page = log.read_merged(&selector, from, 1000).unwrap();
                let Some(last) = page.last() else { break };
                from = last.global_position + 1;
                seen += page.len();
            }
            black_box(seen)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_append_throughput, bench_read_paths);
criterion_main!(benches);
