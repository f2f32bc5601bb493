use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use shardis_server::cluster::{FsmState, TOTAL_SLOTS, hash_slot, rebalance};
use shardis_server::{KVConfig, KVStore, to_cmdline};
use std::hint::black_box;

fn bench_hash_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_slot");
    for key in ["user:1001", "{user:1001}:orders", "session:0123456789abcdef0123456789abcdef"] {
        group.bench_with_input(BenchmarkId::from_parameter(key), key, |b, key| {
            b.iter(|| hash_slot(black_box(key)));
        });
    }
    group.finish();
}

fn seeded_state(masters: usize) -> FsmState {
    let mut state = FsmState::default();
    let all: Vec<u16> = (0..TOTAL_SLOTS).collect();
    for &slot in &all {
        state.slot2node.insert(slot, "node-0".to_string());
    }
    state.node2slot.insert("node-0".to_string(), all);
    for i in 0..masters {
        let node = format!("node-{}", i);
        state.nodes.insert(node.clone());
        state.node2slot.entry(node).or_default();
    }
    state
}

fn bench_rebalance_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebalance_plan");
    for masters in [2, 4, 16] {
        let state = seeded_state(masters);
        group.bench_with_input(BenchmarkId::from_parameter(masters), &state, |b, state| {
            b.iter(|| rebalance::plan(black_box(state)));
        });
    }
    group.finish();
}

fn bench_local_exec(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = KVStore::new(KVConfig::default());
    let set = to_cmdline(["SET", "bench:key", "value"]);
    let get = to_cmdline(["GET", "bench:key"]);

    c.bench_function("exec_set", |b| {
        b.to_async(&rt).iter(|| async { store.exec(black_box(&set)).await });
    });
    c.bench_function("exec_get", |b| {
        b.to_async(&rt).iter(|| async { store.exec(black_box(&get)).await });
    });
}

criterion_group!(benches, bench_hash_slot, bench_rebalance_plan, bench_local_exec);
criterion_main!(benches);
