//! Work closure tests
//!
//! Tests cover:
//! - Exactly the reachable methods and types are emitted
//! - Duplicate and cyclic requests are absorbed
//! - Serial and pooled builds produce the same artifacts

use std::sync::Arc;

use ilforge_engine::metadata::{BodyBuilder, MethodSig, TypeKind, METHOD_STATIC};
use ilforge_engine::{
    build_module, BuildConfig, BuildSession, BuildStats, Driver, InMemoryMetadata, MetadataProvider,
    MethodSpec, ModuleId, ObjectFile, TypeSpec,
};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

const MAIN: u32 = 1;
const F1: u32 = 2;
const F2: u32 = 3;
const F3: u32 = 4;
const F4: u32 = 5;

const T1: u32 = 2;
const T2: u32 = 3;
const T3: u32 = 4;

fn call(il: &mut Vec<u8>, method_row: u32) {
    il.push(0x28);
    il.extend_from_slice(&(0x0600_0000 | method_row).to_le_bytes());
}

/// `ldnull; isinst T; pop`
fn test_type(il: &mut Vec<u8>, type_row: u32) {
    il.extend_from_slice(&[0x14, 0x75]);
    il.extend_from_slice(&(0x0200_0000 | type_row).to_le_bytes());
    il.push(0x26);
}

/// Entry `Main` reaches four methods (with a cycle and self-recursion) and
/// three types; two more methods are never called.
fn program() -> (Arc<InMemoryMetadata>, ModuleId) {
    let mut md = InMemoryMetadata::with_corlib();
    let m = md.add_module("closure.dll", "closure");
    let object = md.corlib_type("Object");
    let program = md.add_type(m, "Closure", "Program", TypeKind::Class, object.clone());
    for name in ["T1", "T2", "T3"] {
        md.add_type(m, "Closure", name, TypeKind::Class, object.clone());
    }

    let bodies: Vec<(&str, Vec<u8>)> = vec![
        ("Main", {
            let mut il = Vec::new();
            call(&mut il, F1);
            call(&mut il, F2);
            test_type(&mut il, T1);
            il
        }),
        ("F1", {
            let mut il = Vec::new();
            call(&mut il, F2);
            call(&mut il, F3);
            test_type(&mut il, T2);
            il
        }),
        ("F2", {
            let mut il = Vec::new();
            test_type(&mut il, T1);
            il
        }),
        ("F3", {
            let mut il = Vec::new();
            call(&mut il, F4);
            call(&mut il, F3);
            il
        }),
        ("F4", {
            let mut il = Vec::new();
            call(&mut il, F1);
            test_type(&mut il, T3);
            il
        }),
        ("Unused1", Vec::new()),
        ("Unused2", {
            let mut il = Vec::new();
            call(&mut il, MAIN);
            il
        }),
    ];
    for (name, mut il) in bodies {
        il.push(0x2a);
        let body = BodyBuilder::new(&il).build();
        md.add_method(
            m,
            program,
            name,
            METHOD_STATIC,
            MethodSig::new_static(None, Vec::new()),
            Some(&body),
        );
    }
    (Arc::new(md), m)
}

fn method(m: ModuleId, row: u32) -> MethodSpec {
    MethodSpec::def(TypeSpec::def(m, 1), m, row)
}

fn build(entries: &[u32], threads: usize) -> (ObjectFile, BuildStats) {
    let (md, m) = program();
    let entries: Vec<_> = entries.iter().map(|&row| method(m, row)).collect();
    let config = BuildConfig {
        threads,
        ..BuildConfig::default()
    };
    build_module(md, m, config, &entries).unwrap()
}

fn symbol_names(object: &ObjectFile) -> Vec<String> {
    let mut names: Vec<_> = object.symbols().iter().map(|s| s.name.clone()).collect();
    names.sort();
    names
}

// =============================================================================
// CLOSURE TESTS
// =============================================================================

#[test]
fn test_closure_emits_reachable_methods_and_types() {
    let (object, stats) = build(&[MAIN], 1);
    // Main plus F1..F4
    assert_eq!(stats.methods, 5);
    // T1..T3 plus their base System.Object
    assert_eq!(stats.vtables, 4);
    assert_eq!(stats.skipped, 0);

    let (md, m) = program();
    let session = BuildSession::new(md, m, BuildConfig::default()).unwrap();
    for row in [6, 7] {
        let unused = session.mangler().method(&method(m, row)).unwrap();
        assert!(object.symbol(&unused).is_none(), "{} was compiled", unused);
    }
    for row in [MAIN, F1, F2, F3, F4] {
        let used = session.mangler().method(&method(m, row)).unwrap();
        assert!(object.symbol(&used).is_some(), "{} is missing", used);
    }
}

#[test]
fn test_duplicate_requests_compile_once() {
    let (object, stats) = build(&[MAIN, F3, MAIN, F1, F3], 1);
    assert_eq!(stats.methods, 5);
    assert_eq!(stats.vtables, 4);

    let names = symbol_names(&object);
    let mut unique = names.clone();
    unique.dedup();
    assert_eq!(names, unique);
}

#[test]
fn test_request_order_does_not_change_output() {
    let (a, a_stats) = build(&[MAIN], 1);
    let (b, b_stats) = build(&[F4, F2, MAIN], 1);
    assert_eq!(a_stats, b_stats);
    assert_eq!(symbol_names(&a), symbol_names(&b));
}

#[test]
fn test_worker_pool_builds_same_closure() {
    let (serial, serial_stats) = build(&[MAIN], 1);
    for threads in [2, 4, 8] {
        let (pooled, pooled_stats) = build(&[MAIN], threads);
        assert_eq!(serial_stats, pooled_stats);
        assert_eq!(symbol_names(&serial), symbol_names(&pooled));
        assert_eq!(
            serial.undefined_symbols().len(),
            pooled.undefined_symbols().len()
        );
    }
}

#[test]
fn test_only_runtime_helpers_stay_undefined() {
    let (object, _) = build(&[MAIN], 1);
    assert_eq!(object.undefined_symbols(), vec!["castclassex"]);
}

#[test]
fn test_compile_all_reaches_unused_methods() {
    let (md, m) = program();
    let session = BuildSession::new(md, m, BuildConfig::default()).unwrap();
    let stats = Driver::new(&session).compile_all().unwrap();
    assert_eq!(stats.methods, 7);
    assert_eq!(session.requestor().methods().seen_count(), 7);
}
