use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use tessera_core::{Engine, KernelConfig};
use tessera_model::{Operation, PathAddress};

fn addr(s: &str) -> PathAddress {
    PathAddress::parse(s).unwrap()
}

fn definitions() -> Vec<Operation> {
    vec![
        Operation::new("register-resource", addr("/subsystem=*")).with_param(
            "registration",
            json!({ "capability": "org.tessera.subsystem", "dynamic": true, "service": true }),
        ),
        Operation::new("register-resource", addr("/subsystem=*/pool=*")).with_param(
            "registration",
            json!({ "attributes": { "size": "reload" } }),
        ),
    ]
}

fn boot_ops(subsystems: usize, pools: usize) -> Vec<Operation> {
    let mut ops = definitions();
    for s in 0..subsystems {
        let subsystem = PathAddress::root().append("subsystem", format!("s{s}"));
        ops.push(Operation::new("add", subsystem.clone()));
        for p in 0..pools {
            ops.push(
                Operation::new("add", subsystem.append("pool", format!("p{p}")))
                    .with_param("size", p),
            );
        }
    }
    ops
}

fn booted_engine() -> Engine {
    let engine = Engine::new(KernelConfig::default()).unwrap();
    assert!(engine.boot(boot_ops(4, 4)).unwrap().is_success());
    engine
}

fn bench_add(c: &mut Criterion) {
    c.bench_function("execute_add_pool", |b| {
        b.iter_with_setup(booted_engine, |engine| {
            let op = Operation::new("add", addr("/subsystem=s0/pool=bench")).with_param("size", 8);
            assert!(engine.execute(op).unwrap().is_success());
        });
    });
}

fn bench_write_attribute(c: &mut Criterion) {
    let engine = booted_engine();
    let mut size = 0_u64;
    c.bench_function("execute_write_attribute", |b| {
        b.iter(|| {
            size += 1;
            let op = Operation::new("write-attribute", addr("/subsystem=s1/pool=p1"))
                .with_param("name", "size")
                .with_param("value", size);
            assert!(engine.execute(op).unwrap().is_success());
        });
    });
}

fn bench_read(c: &mut Criterion) {
    let engine = booted_engine();
    c.bench_function("execute_read_resource_recursive", |b| {
        b.iter(|| {
            let op = Operation::new("read-resource", PathAddress::root())
                .with_param("recursive", true);
            engine.execute(op).unwrap()
        });
    });
}

fn bench_boot(c: &mut Criterion) {
    let mut group = c.benchmark_group("boot_16x16");
    for workers in [1, 4] {
        group.bench_function(format!("workers_{workers}"), |b| {
            b.iter_with_setup(
                || {
                    let config = KernelConfig::default().with_boot_workers(workers);
                    (Engine::new(config).unwrap(), boot_ops(16, 16))
                },
                |(engine, ops)| {
                    assert!(engine.boot(ops).unwrap().is_success());
                },
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_add,
    bench_write_attribute,
    bench_read,
    bench_boot
);
criterion_main!(benches);
