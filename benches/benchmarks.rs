//! Benchmark suite for valueloop hot paths.
//!
//! - Next-action decision over growing plans
//! - Duplicate detection on `add_work_item`
//! - Error signature normalization
//! - State persistence round trip
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench
//! cargo bench -- --save-baseline main
//! cargo bench -- --baseline main
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

use valueloop::config::LoopConfig;
use valueloop::decision::next_action;
use valueloop::dispatch::validation::find_duplicate;
use valueloop::monitor::signature::signature;
use valueloop::state::{CheckRecord, CheckStatus, ItemStatus, LoopState, StateStore, WorkItem};

/// Plan of `size` items in dependency chains of four, a third done, with one
/// check per done item.
fn plan(size: usize) -> LoopState {
    let mut state = LoopState::new("bench");
    for i in 0..size {
        let mut item = WorkItem::new(
            format!("W{i}"),
            format!("Implement feature {i} touching module {} and handler {}", i % 7, i % 13),
        );
        if i % 4 != 0 {
            item = item.with_dependencies([format!("W{}", i - 1)]);
        }
        if i % 3 == 0 {
            item = item.with_status(ItemStatus::Done);
            state.insert_check(
                CheckRecord::new(format!("c{i}"), format!("cat{}", i % 5))
                    .with_command("true")
                    .with_status(CheckStatus::Passed),
            );
        }
        state.insert_item(item);
    }
    state
}

// ============================================================================
// Decision Benchmarks
// ============================================================================

fn bench_next_action(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_action");
    let config = LoopConfig::default();

    for size in [10, 100, 1000] {
        let state = plan(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &state, |b, state| {
            b.iter(|| next_action(black_box(&config), black_box(state)));
        });
    }
    group.finish();
}

// ============================================================================
// Validation Benchmarks
// ============================================================================

fn bench_duplicate_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_duplicate");

    for size in [10, 100, 1000] {
        let state = plan(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &state, |b, state| {
            b.iter(|| {
                find_duplicate(
                    black_box(state),
                    black_box("Implement feature 9999 touching module 3 and the router"),
                    0.8,
                )
            });
        });
    }
    group.finish();
}

// ============================================================================
// Monitor Benchmarks
// ============================================================================

fn bench_signature(c: &mut Criterion) {
    let output = "2026-03-01T10:22:01Z error[E0308]: mismatched types\n \
                  --> /home/ci/work/src/orders/checkout.rs:42:17\n \
                  thread 'main' panicked at 0x7ffdf00d1234\n"
        .repeat(40);

    c.bench_function("error_signature", |b| {
        b.iter(|| signature(black_box(&output)));
    });
}

// ============================================================================
// Persistence Benchmarks
// ============================================================================

fn bench_state_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_round_trip");
    group.sample_size(20);

    for size in [100, 1000] {
        let dir = TempDir::new().unwrap();
        let store = StateStore::for_project(dir.path());
        let state = plan(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &state, |b, state| {
            b.iter(|| {
                store.save(black_box(state)).unwrap();
                store.load().unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_next_action,
    bench_duplicate_detection,
    bench_signature,
    bench_state_round_trip
);
criterion_main!(benches);
