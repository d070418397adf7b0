//! Benchmarks for the atom graph
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use reatom_core::{action, atom, computed, Atom, Ctx};

fn chain(source: &Atom<i64>, length: usize) -> Atom<i64> {
    let mut tail = source.clone();
    for _ in 0..length {
        let prev = tail.clone();
        tail = computed(move |ctx, _| Ok(ctx.spy(&prev)? + 1), None).unwrap();
    }
    tail
}

fn bench_atom_get(c: &mut Criterion) {
    let ctx = Ctx::new();
    let a = atom(42i64, "a").unwrap();
    a.get(&ctx).unwrap();

    c.bench_function("atom_get", |b| b.iter(|| black_box(a.get(&ctx).unwrap())));
}

fn bench_atom_set(c: &mut Criterion) {
    let ctx = Ctx::new();
    let a = atom(0i64, "a").unwrap();
    let mut n = 0;

    c.bench_function("atom_set", |b| {
        b.iter(|| {
            n += 1;
            a.set(&ctx, black_box(n)).unwrap()
        })
    });
}

fn bench_computed_cached(c: &mut Criterion) {
    let ctx = Ctx::new();
    let a = atom(1i64, "a").unwrap();
    let tail = chain(&a, 10);
    tail.get(&ctx).unwrap();

    c.bench_function("computed_cached_chain_10", |b| {
        b.iter(|| black_box(tail.get(&ctx).unwrap()))
    });
}

fn bench_chain_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_propagation");
    for length in [10usize, 100, 1000] {
        let ctx = Ctx::new();
        let a = atom(0i64, "a").unwrap();
        let tail = chain(&a, length);
        let _sub = tail.subscribe(&ctx, |_| {}).unwrap();
        let mut n = 0;

        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            b.iter(|| {
                n += 1;
                a.set(&ctx, n).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    for width in [10usize, 100] {
        let ctx = Ctx::new();
        let a = atom(0i64, "a").unwrap();
        let subs: Vec<_> = (0..width)
            .map(|i| {
                let a = a.clone();
                let leaf = computed(move |ctx, _| Ok(ctx.spy(&a)? * i as i64), None).unwrap();
                leaf.subscribe(&ctx, |_| {}).unwrap()
            })
            .collect();
        let mut n = 0;

        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                n += 1;
                a.set(&ctx, n).unwrap()
            })
        });
        drop(subs);
    }
    group.finish();
}

fn bench_action_batch(c: &mut Criterion) {
    let ctx = Ctx::new();
    let clicked = action::<u32>("clicked").unwrap();
    let clicks = {
        let clicked = clicked.clone();
        computed(
            move |ctx, prev: Option<&u64>| {
                let mut total = prev.copied().unwrap_or(0);
                ctx.spy_calls(&clicked, |_| total += 1)?;
                Ok(total)
            },
            "clicks",
        )
        .unwrap()
    };
    let _sub = clicks.subscribe(&ctx, |_| {}).unwrap();

    c.bench_function("action_batch_10", |b| {
        b.iter(|| {
            ctx.transaction(|ctx| {
                for i in 0..10 {
                    clicked.call(ctx, i)?;
                }
                Ok(())
            })
            .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_atom_get,
    bench_atom_set,
    bench_computed_cached,
    bench_chain_propagation,
    bench_fan_out,
    bench_action_batch,
);
criterion_main!(benches);
