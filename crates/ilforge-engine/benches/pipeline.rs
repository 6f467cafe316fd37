use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput,
};
use ilforge_engine::cil::decode;
use ilforge_engine::metadata::{BodyBuilder, ElementType, MethodSig, TypeKind, METHOD_STATIC};
use ilforge_engine::{
    build_module, BuildConfig, BuildScope, InMemoryMetadata, MetadataProvider, ModuleId, TypeSpec,
};

/// `int s = 0; for (int i = 0; i < 100; i++) s += i; return s;`
const SUM_LOOP: [u8; 21] = [
    0x16, 0x0a, 0x16, 0x0b, 0x2b, 0x08, 0x06, 0x07, 0x58, 0x0a, 0x07, 0x17, 0x58, 0x0b, 0x07,
    0x1f, 0x64, 0x32, 0xf3, 0x06, 0x2a,
];

fn module_with(methods: usize) -> (Arc<InMemoryMetadata>, ModuleId) {
    let mut md = InMemoryMetadata::with_corlib();
    let m = md.add_module("bench.dll", "bench");
    let object = md.corlib_type("Object");
    let program = md.add_type(m, "Bench", "Program", TypeKind::Class, object);
    let i4 = TypeSpec::Primitive(ElementType::I4);
    let locals = md.add_locals(m, vec![i4.clone(), i4.clone()]);
    let body = BodyBuilder::new(&SUM_LOOP).locals(locals).build();
    for i in 0..methods {
        md.add_method(
            m,
            program,
            &format!("Sum{}", i),
            METHOD_STATIC,
            MethodSig::new_static(Some(i4.clone()), Vec::new()),
            Some(&body),
        );
    }
    (Arc::new(md), m)
}

fn bench_decode(c: &mut Criterion) {
    let code: Vec<u8> = SUM_LOOP[..SUM_LOOP.len() - 1]
        .iter()
        .copied()
        .cycle()
        .take(20 * 1000)
        .collect();
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(code.len() as u64));
    group.bench_function("sum_loop_x1000", |b| {
        // branch targets only resolve within one copy; decode one copy at a time
        b.iter(|| {
            for chunk in code.chunks(20) {
                let mut body = chunk.to_vec();
                body.push(0x2a);
                black_box(decode(black_box(&body)).unwrap());
            }
        });
    });
    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    for methods in [10usize, 100] {
        for threads in [1usize, 4] {
            group.throughput(Throughput::Elements(methods as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("threads_{}", threads), methods),
                &methods,
                |b, &methods| {
                    b.iter(|| {
                        let (md, m) = module_with(methods);
                        let config = BuildConfig {
                            threads,
                            scope: BuildScope::WholeModule,
                            ..BuildConfig::default()
                        };
                        let (object, stats) = build_module(md, m, config, &[]).unwrap();
                        assert_eq!(stats.methods, methods);
                        black_box(object)
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_decode, bench_build);
criterion_main!(benches);
