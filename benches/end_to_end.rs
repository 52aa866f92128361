//! End-to-end latency: compile small guest programs and execute them.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use dirk::{compile, CompileOptions, Vm};

const FIB: &str = "int fib(int n){ if (n < 2) return n; return fib(n-1) + fib(n-2); } \
                   int main(){ return fib(15); }";

const SUM: &str = "int main(){ int i; int s; i = 0; s = 0; \
                   while (i < 10000) { s = s + i; i = i + 1; } return s & 255; }";

const BOOT: &str = include_str!("../testdata/dirk.c");

fn bench_compile(c: &mut Criterion) {
    let options = CompileOptions::default();
    let mut group = c.benchmark_group("compile");
    group.bench_function("fib", |b| b.iter(|| compile(black_box(FIB), &options)));
    group.bench_function("bootstrap", |b| b.iter(|| compile(black_box(BOOT), &options)));
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let options = CompileOptions::default();
    let fib = compile(FIB, &options).expect("compile fib");
    let sum = compile(SUM, &options).expect("compile sum");

    let mut group = c.benchmark_group("execute");
    group.bench_function("fib_15", |b| {
        b.iter(|| {
            Vm::with_output(black_box(&fib), &[], Vec::new())
                .expect("load")
                .run()
                .expect("run")
        })
    });
    group.bench_function("sum_10k", |b| {
        b.iter(|| {
            Vm::with_output(black_box(&sum), &[], Vec::new())
                .expect("load")
                .run()
                .expect("run")
        })
    });
    group.finish();
}

criterion_group!(benches, bench_compile, bench_execute);
criterion_main!(benches);
