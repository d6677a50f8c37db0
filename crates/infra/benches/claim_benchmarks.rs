use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use workhorse_core::OwnerId;
use workhorse_infra::{InMemoryLeaseStore, LeaseManager};

const TTL: Duration = Duration::from_secs(30);

fn seeded(rt: &Runtime, items: usize) -> LeaseManager<Arc<InMemoryLeaseStore>> {
    let manager = LeaseManager::new(InMemoryLeaseStore::arc());
    let keys: Vec<String> = (0..items).map(|i| format!("job-{i}")).collect();
    rt.block_on(manager.enqueue(&keys)).expect("seed ledger");
    manager
}

/// Claim-and-complete throughput at different batch sizes.
fn bench_claim_complete(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let owner = OwnerId::from("bench");
    let mut group = c.benchmark_group("claim_complete");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter_batched(
                    || seeded(&rt, 1_000),
                    |manager| {
                        rt.block_on(async {
                            let items = manager.claim(&owner, batch_size, TTL).await.expect("claim");
                            for item in items {
                                manager.complete(&owner, item.id).await.expect("complete");
                            }
                        })
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

/// Claim latency when most rows are held by live leases.
fn bench_claim_contended(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let manager = seeded(&rt, 5_000);
    rt.block_on(manager.claim(&OwnerId::from("holder"), 4_990, TTL))
        .expect("pre-claim");
    let owner = OwnerId::from("bench");

    c.bench_function("claim_mostly_leased", |b| {
        b.iter(|| {
            rt.block_on(async {
                let items = manager.claim(&owner, 1, TTL).await.expect("claim");
                for item in items {
                    manager.release(&owner, item.id).await.expect("release");
                }
            })
        })
    });
}

criterion_group!(benches, bench_claim_complete, bench_claim_contended);
criterion_main!(benches);
