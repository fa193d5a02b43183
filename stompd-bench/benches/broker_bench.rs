//! End-to-end benchmarks through the scheduler, without sockets.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::time::Instant;
use stompd_server::{Broker, Config};

const MESSAGES: usize = 500;

fn bench_publish_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker");
    group.throughput(Throughput::Elements(MESSAGES as u64));

    let mut config = Config::default();
    config.broker.max_work = MESSAGES;
    config.broker.dispatch_limit = MESSAGES;

    let now = Instant::now();
    let mut broker = Broker::new(&config);
    let (_, consumer) = broker.connect("127.0.0.1:1".parse().unwrap(), now);
    let (_, producer) = broker.connect("127.0.0.1:2".parse().unwrap(), now);
    consumer.receive(
        b"CONNECT\nlogin:bench\npasscode:x\n\n\0SUBSCRIBE\ndestination:queue/bench\nid:0\n\n\0",
    );
    producer.receive(b"CONNECT\nlogin:bench\npasscode:x\n\n\0");
    broker.run_once(now);
    consumer.transmit();
    producer.transmit();

    let mut batch = Vec::new();
    for i in 0..MESSAGES {
        batch.extend_from_slice(
            format!("SEND\ndestination:queue/bench\n\npayload-{}\0", i).as_bytes(),
        );
    }

    group.bench_function("publish_consume", |b| {
        b.iter(|| {
            producer.receive(&batch);
            broker.run_once(now);
            broker.run_once(now);
            black_box(consumer.transmit());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_publish_consume);
criterion_main!(benches);
