//! Rewriter throughput on typical chunks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hub_relay::registry::{ChannelRegistry, Endpoint, Side};
use hub_relay::rewrite::RewriteRule;
use tokio::sync::mpsc;

/// Benchmark the three rewrite outcomes
fn bench_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite");

    let rule = RewriteRule::for_user("alice");
    let api_request = Bytes::from_static(
        b"GET /api/kernels?1700000000000 HTTP/1.1\r\nHost: localhost:8000\r\nAuthorization: token abc\r\n\r\n",
    );
    let page_request = Bytes::from_static(b"GET /tree HTTP/1.1\r\nHost: localhost:8000\r\n\r\n");
    let mut frame = vec![0x82u8, 0x7f];
    frame.extend(std::iter::repeat_n(0xffu8, 16 * 1024));
    let binary_frame = Bytes::from(frame);

    group.bench_function("api_request", |b| {
        b.iter(|| black_box(rule.rewrite(api_request.clone())));
    });

    group.bench_function("page_request", |b| {
        b.iter(|| black_box(rule.rewrite(page_request.clone())));
    });

    group.bench_function("binary_frame_16k", |b| {
        b.iter(|| black_box(rule.rewrite(binary_frame.clone())));
    });

    group.finish();
}

/// Benchmark pair registration and teardown
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("register_teardown", |b| {
        let mut registry = ChannelRegistry::new();
        let (outbox, _queue) = mpsc::channel(1);
        b.iter(|| {
            let (client, _) = registry.register_pair(
                Endpoint::new(Side::Client, None, outbox.clone()),
                Endpoint::new(Side::Upstream, None, outbox.clone()),
            );
            black_box(registry.teardown(client).is_some());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_rewrite, bench_registry);
criterion_main!(benches);
