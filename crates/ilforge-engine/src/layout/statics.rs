//! Static data records
//!
//! Static field blocks, method and field info records, and the module and
//! assembly info objects that tie a module's constant table to its image.

use tracing::debug;

use crate::metadata::{FieldSpec, FullySpecSignature, MetadataError, MethodSpec, ModuleId, TypeSpec};
use crate::object::{Blob, SectionKind, SymbolBinding, SymbolKind};
use crate::session::BuildSession;

use super::vtable::binding_for;

/// Build the static field block of `ts`, with field initial data copied in.
/// Returns `None` when the type has no static fields.
pub fn emit_static_fields(
    session: &BuildSession,
    ts: &TypeSpec,
) -> Result<Option<Blob>, MetadataError> {
    let layout = session.layout();
    let size = layout.static_size(ts)?;
    if size == 0 {
        return Ok(None);
    }
    let (module, row) = match ts {
        TypeSpec::Def { module, row, .. } => (*module, *row),
        other => return Err(MetadataError::NotADefinition(other.to_string())),
    };
    let md = session.md();
    let symbol = session.mangler().static_block(ts)?;

    let mut blob = Blob::new(SectionKind::Data, layout.pointer_size());
    blob.define(symbol.clone(), SymbolKind::Object, binding_for(session, ts));
    blob.data.resize(size as usize, 0);

    for &frow in &md.type_def(module, row)?.fields {
        let fd = md.field_def(module, frow)?;
        let rva = match (fd.is_static(), fd.rva) {
            (true, Some(rva)) => rva,
            _ => continue,
        };
        let fs = FieldSpec {
            owner: ts.clone(),
            module,
            row: frow,
        };
        let at = layout.field_offset(&fs)? as usize;
        let len = layout.type_size(&layout.field_type(&fs)?)? as usize;
        let start = md.resolve_rva(module, rva)? as usize;
        let image = md.assembly_image(module)?;
        let data = image
            .get(start..start + len)
            .ok_or(MetadataError::InvalidRva { module, rva })?;
        blob.data[at..at + len].copy_from_slice(data);
    }

    debug!("static block {}: {} bytes", symbol, size);
    Ok(Some(blob))
}

/// Method info: the method's code and its signature record
pub fn emit_method_info(session: &BuildSession, ms: &MethodSpec) -> Result<Blob, MetadataError> {
    let p = session.target().pointer_size;
    let symbol = session.mangler().method_info(ms)?;
    let mut blob = Blob::new(SectionKind::RoData, p);
    blob.define(symbol, SymbolKind::Object, binding_for(session, &ms.owner));

    let code = session.request_method(ms)?;
    blob.push_pointer(code, 0, p);
    let sig = FullySpecSignature::for_method(session.md(), ms)?;
    let (table, offset) = session.signature_address(&sig)?;
    blob.push_pointer(table, i64::from(offset), p);
    Ok(blob)
}

/// Field info: the field's signature record
pub fn emit_field_info(session: &BuildSession, fs: &FieldSpec) -> Result<Blob, MetadataError> {
    let p = session.target().pointer_size;
    let symbol = session.mangler().field_info(fs)?;
    let mut blob = Blob::new(SectionKind::RoData, p);
    blob.define(symbol, SymbolKind::Object, binding_for(session, &fs.owner));

    let sig = FullySpecSignature::for_field(session.md(), fs)?;
    let (table, offset) = session.signature_address(&sig)?;
    blob.push_pointer(table, i64::from(offset), p);
    Ok(blob)
}

/// Module info: the module's constant table and its assembly info
pub fn emit_module_info(session: &BuildSession, module: ModuleId) -> Result<Blob, MetadataError> {
    let p = session.target().pointer_size;
    let mut blob = Blob::new(SectionKind::RoData, p);
    blob.define(
        session.mangler().module_info(module)?,
        SymbolKind::Object,
        SymbolBinding::Global,
    );
    blob.push_pointer(session.string_table_symbol(), 0, p);
    blob.push_pointer(session.request_assembly_info(module)?, 0, p);
    Ok(blob)
}

/// Assembly info: the raw assembly image, so that offsets derived from RVAs
/// resolve against it
pub fn emit_assembly_info(session: &BuildSession, module: ModuleId) -> Result<Blob, MetadataError> {
    let p = session.target().pointer_size;
    let mut blob = Blob::new(SectionKind::RoData, p);
    blob.define(
        session.mangler().assembly_info(module)?,
        SymbolKind::Object,
        SymbolBinding::Global,
    );
    blob.data.extend_from_slice(session.md().assembly_image(module)?);
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::BuildConfig;
    use crate::metadata::{ElementType, InMemoryMetadata, MetadataProvider, TypeKind, FIELD_STATIC};
    use crate::object::RelocKind;

    #[test]
    fn test_static_block_copies_initial_data() {
        let mut md = InMemoryMetadata::with_corlib();
        let m = md.add_module("data.dll", "data");
        let object = md.corlib_type("Object");
        let holder = md.add_type(m, "Data", "Tables", TypeKind::Class, object);
        md.add_field(m, holder, "count", TypeSpec::Primitive(ElementType::I4), FIELD_STATIC);
        let i8 = TypeSpec::Primitive(ElementType::I8);
        let table = md.add_field(m, holder, "table", i8, FIELD_STATIC);
        md.add_field(m, holder, "instance", TypeSpec::Primitive(ElementType::I4), 0);
        md.set_field_data(m, table, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let empty = md.add_type(m, "Data", "Empty", TypeKind::Class, md.corlib_type("Object"));

        let session = BuildSession::new(Arc::new(md), m, BuildConfig::default()).unwrap();
        let ts = TypeSpec::def(m, holder);
        let blob = emit_static_fields(&session, &ts).unwrap().unwrap();
        assert_eq!(blob.section, SectionKind::Data);
        assert_eq!(blob.data, vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(blob.symbols[0].name, session.mangler().static_block(&ts).unwrap());

        assert!(emit_static_fields(&session, &TypeSpec::def(m, empty))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_module_info_points_at_table_and_assembly() {
        let mut md = InMemoryMetadata::with_corlib();
        let m = md.add_module("app.dll", "app");
        let session = BuildSession::new(Arc::new(md), m, BuildConfig::default()).unwrap();

        let blob = emit_module_info(&session, m).unwrap();
        let targets: Vec<_> = blob.relocations.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(targets, vec!["_M9app#2Edll_StringTable", "_A3app"]);
        assert!(blob.relocations.iter().all(|r| r.kind == RelocKind::Abs64));
        assert!(session.requestor().assemblies().has_seen(&m));

        let image = emit_assembly_info(&session, m).unwrap();
        assert_eq!(image.data, session.md().assembly_image(m).unwrap());
    }
}
