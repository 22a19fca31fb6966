//! Benchmarks the hot path exercised on every `Client::send`: weighted
//! route selection and the write race across a multi-route pool.

use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relaynet_core::Id;
use relaynet_transfer::mem_transport::MemNetwork;
use relaynet_transfer::route::RouteManager;
use relaynet_transfer::{MultiRouteSelector, Timeout};
use tokio_util::sync::CancellationToken;

fn bench_route_selection(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("build tokio runtime for benchmark");
    let mut group = c.benchmark_group("multi_route_write");

    for route_count in [1usize, 4, 16, 64] {
        group.bench_with_input(
            BenchmarkId::from_parameter(route_count),
            &route_count,
            |b, &route_count| {
                let network = MemNetwork::new();
                let manager = Arc::new(RouteManager::new());
                runtime.block_on(async {
                    for _ in 0..route_count {
                        let peer = Id::random();
                        network.register(peer);
                        manager.add_route(peer, network.transport(peer)).await;
                    }
                });
                let selector = MultiRouteSelector::new(manager);
                let cancel = CancellationToken::new();

                b.to_async(&runtime).iter(|| {
                    let selector = &selector;
                    let cancel = &cancel;
                    async move {
                        let result = selector
                            .write(Bytes::from_static(b"bench-payload"), Timeout::from_millis(500), cancel)
                            .await;
                        black_box(result).ok();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_route_selection);
criterion_main!(benches);
