//! End-to-end emission tests
//!
//! Tests cover:
//! - Exception clauses from a fat header through to the method's EH table
//! - String literal interning across methods
//! - Signature records in the constant table
//! - Writing the finished object as ELF

use std::sync::Arc;

use ilforge_engine::cil::{parse_body, ClauseKind};
use ilforge_engine::metadata::{
    BodyBuilder, ClauseSpec, FullySpecSignature, MethodSig, TypeKind, METHOD_STATIC,
};
use ilforge_engine::object::{elf, RelocKind, SectionKind};
use ilforge_engine::{
    BuildConfig, BuildSession, Driver, EntryAlias, InMemoryMetadata, MetadataProvider, MethodSpec,
    ModuleId, TypeSpec,
};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn app() -> (InMemoryMetadata, ModuleId, u32) {
    let mut md = InMemoryMetadata::with_corlib();
    let m = md.add_module("emit.dll", "emit");
    let object = md.corlib_type("Object");
    let program = md.add_type(m, "Emit", "Program", TypeKind::Class, object);
    (md, m, program)
}

fn static_method(
    md: &mut InMemoryMetadata,
    m: ModuleId,
    owner: u32,
    name: &str,
    body: &[u8],
) -> MethodSpec {
    let row = md.add_method(
        m,
        owner,
        name,
        METHOD_STATIC,
        MethodSig::new_static(None, Vec::new()),
        Some(body),
    );
    MethodSpec::def(TypeSpec::def(m, owner), m, row)
}

fn find(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// =============================================================================
// EXCEPTION CLAUSES
// =============================================================================

/// try { leave 8 } catch (E1) { pop; leave 8 } catch (E2) { pop; leave 8 } ret
const TWO_CATCHES: [u8; 9] = [0xde, 0x06, 0x26, 0xde, 0x03, 0x26, 0xde, 0x00, 0x2a];

fn two_catches() -> (InMemoryMetadata, ModuleId, MethodSpec, TypeSpec, TypeSpec) {
    let (mut md, m, program) = app();
    let object = md.corlib_type("Object");
    let e1 = md.add_type(m, "Emit", "FirstError", TypeKind::Class, object);
    let e1 = TypeSpec::def(m, e1);
    let e2 = md.corlib_type("Array").unwrap();
    let e1_token = md.type_token(m, &e1);
    let e2_token = md.type_token(m, &e2);

    let clause = |handler_offset, token| ClauseSpec {
        flags: 0,
        try_offset: 0,
        try_length: 2,
        handler_offset,
        handler_length: 3,
        class_token_or_filter: token,
    };
    let body = BodyBuilder::new(&TWO_CATCHES)
        .clause(clause(2, e1_token))
        .clause(clause(5, e2_token))
        .build();
    let ms = static_method(&mut md, m, program, "Guarded", &body);
    (md, m, ms, e1, e2)
}

#[test]
fn test_fat_clauses_round_trip() {
    let (md, m, ms, e1, e2) = two_catches();
    let row = ms.row().unwrap();
    let body = md.method_body(m, md.method_def(m, row).unwrap().rva).unwrap();
    let parsed = parse_body(body).unwrap();

    assert!(!parsed.header.tiny);
    assert_eq!(parsed.code, &TWO_CATCHES);
    assert_eq!(parsed.clauses.len(), 2);
    for (clause, (handler, class)) in parsed.clauses.iter().zip([(2, &e1), (5, &e2)]) {
        assert_eq!(clause.kind, ClauseKind::Catch);
        assert_eq!((clause.try_offset, clause.try_length), (0, 2));
        assert_eq!((clause.handler_offset, clause.handler_length), (handler, 3));
        let token = clause.class_token.unwrap();
        assert_eq!(&md.resolve_type(m, token).unwrap(), class);
    }
}

#[test]
fn test_catch_classes_are_relocated_in_eh_table() {
    init_tracing();
    let (md, m, ms, e1, e2) = two_catches();
    let session = BuildSession::new(Arc::new(md), m, BuildConfig::default()).unwrap();
    Driver::new(&session).run(&[ms.clone()]).unwrap();
    let object = session.object();

    let mangler = session.mangler();
    let table = object.symbol(&mangler.eh_table(&ms).unwrap()).unwrap();
    let in_table: Vec<_> = object
        .relocations()
        .iter()
        .filter(|r| r.section == SectionKind::RoData)
        .filter(|r| r.offset >= table.offset && r.offset < table.offset + table.size)
        .collect();

    let e1_vtable = mangler.type_name(&e1).unwrap();
    let e2_vtable = mangler.type_name(&e2).unwrap();
    let classes: Vec<_> = in_table
        .iter()
        .filter(|r| r.symbol == e1_vtable || r.symbol == e2_vtable)
        .map(|r| r.symbol.as_str())
        .collect();
    assert_eq!(classes, vec![e1_vtable.as_str(), e2_vtable.as_str()]);
    assert!(in_table.iter().all(|r| r.kind == RelocKind::Abs64));

    // both catch classes get vtables in the same build
    assert!(object.symbol(&e1_vtable).is_some());
    assert!(object.symbol(&e2_vtable).is_some());
}

// =============================================================================
// CONSTANT TABLE
// =============================================================================

#[test]
fn test_string_literals_are_interned_once() {
    let (mut md, m, program) = app();
    let hi = md.user_string_token(m, "hi");
    let there = md.user_string_token(m, "there");
    let ldstr_pop = |il: &mut Vec<u8>, token: u32| {
        il.push(0x72);
        il.extend_from_slice(&token.to_le_bytes());
        il.push(0x26);
    };

    // row 1 calls row 2
    let mut main = Vec::new();
    ldstr_pop(&mut main, hi);
    main.push(0x28);
    main.extend_from_slice(&0x0600_0002u32.to_le_bytes());
    main.push(0x2a);
    let mut other = Vec::new();
    ldstr_pop(&mut other, hi);
    ldstr_pop(&mut other, there);
    other.push(0x2a);

    let main = static_method(&mut md, m, program, "Main", &BodyBuilder::new(&main).build());
    static_method(&mut md, m, program, "Other", &BodyBuilder::new(&other).build());

    let session = BuildSession::new(Arc::new(md), m, BuildConfig::default()).unwrap();
    let stats = Driver::new(&session).run(&[main]).unwrap();
    assert_eq!(stats.methods, 2);
    assert_eq!(stats.strings, 2);

    let table = session.string_table_symbol();
    let object = session.object();
    let mut addends: Vec<i64> = object
        .relocations()
        .iter()
        .filter(|r| r.section == SectionKind::Text && r.symbol == table)
        .map(|r| r.addend)
        .collect();
    assert_eq!(addends.len(), 3);
    addends.sort();
    addends.dedup();
    assert_eq!(addends.len(), 2);
}

#[test]
fn test_equal_signatures_get_separate_records() {
    let (md, m, program) = app();
    let session = BuildSession::new(Arc::new(md), m, BuildConfig::default()).unwrap();
    let sig = FullySpecSignature::for_type(session.md(), &TypeSpec::def(m, program)).unwrap();

    let (table, first) = session.signature_address(&sig).unwrap();
    let (_, second) = session.signature_address(&sig).unwrap();
    assert_eq!(table, session.string_table_symbol());
    assert_ne!(first, second);
    assert!(second > first);
}

// =============================================================================
// OBJECT OUTPUT
// =============================================================================

#[test]
fn test_build_writes_relocatable_elf() {
    let (mut md, m, program) = app();
    let body = BodyBuilder::new(&[0x2a]).build();
    static_method(&mut md, m, program, "Main", &body);

    let config = BuildConfig {
        aliases: vec![EntryAlias {
            namespace: "Emit".to_string(),
            type_name: "Program".to_string(),
            method: "Main".to_string(),
            alias: "emit_main".to_string(),
        }],
        ..BuildConfig::default()
    };
    let session = BuildSession::new(Arc::new(md), m, config).unwrap();
    Driver::new(&session).run(&[]).unwrap();
    let object = session.into_object();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    elf::write_elf(&object, file.as_file_mut()).unwrap();
    let bytes = std::fs::read(file.path()).unwrap();

    assert_eq!(&bytes[..4], b"\x7fELF");
    // relocatable
    assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), 1);
    for name in [".text", ".rodata", ".symtab", ".strtab", "emit_main"] {
        assert!(find(&bytes, name.as_bytes()), "{} missing", name);
    }
    assert_eq!(bytes, elf::to_elf_bytes(&object).unwrap());
}
