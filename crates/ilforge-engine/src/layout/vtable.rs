//! VTable emission
//!
//! A vtable is a read-only object named by the type's symbol:
//!
//! ```text
//! +0      type info        -> string table + type signature record
//! +p      interface map    -> this vtable + map offset
//! +2p     base vtable      -> base type symbol, or 0
//! +3p...  virtual methods  (abstract slots point at __cxa_pure_virtual)
//!         implementation table of each interface, one pointer per slot
//!         interface map: (interface vtable, implementation table) pairs,
//!         terminated by a null pair
//! ```

use tracing::debug;

use crate::metadata::{FullySpecSignature, MetadataError, TypeSpec};
use crate::object::{Blob, SectionKind, SymbolBinding, SymbolKind};
use crate::runtime;
use crate::session::BuildSession;

use super::{VirtualSlot, VTABLE_HEADER_SLOTS};

/// Definition that carries a type's members; primitives map to their core
/// library definition
pub fn member_source(session: &BuildSession, ts: &TypeSpec) -> TypeSpec {
    match ts {
        TypeSpec::Primitive(et) => session
            .md()
            .corlib_type(et.corlib_name())
            .unwrap_or_else(|| ts.clone()),
        _ => ts.clone(),
    }
}

/// Binding of a type's artifacts: only plain definitions of the module being
/// built are strong, since constructed and foreign types may be emitted by
/// several modules
pub fn binding_for(session: &BuildSession, ts: &TypeSpec) -> SymbolBinding {
    match ts {
        TypeSpec::Def { module, args, .. } if *module == session.module() && args.is_empty() => {
            SymbolBinding::Global
        }
        _ => SymbolBinding::Weak,
    }
}

fn slot_target(session: &BuildSession, slot: &VirtualSlot) -> Result<String, MetadataError> {
    match &slot.implementation {
        Some(ms) => session.request_method(ms),
        None => Ok(runtime::PURE_VIRTUAL.to_string()),
    }
}

/// Build the vtable of `ts`
pub fn emit_vtable(session: &BuildSession, ts: &TypeSpec) -> Result<Blob, MetadataError> {
    let layout = session.layout();
    let p = layout.pointer_size();
    let symbol = session.mangler().type_name(ts)?;
    let source = member_source(session, ts);

    let slots = layout.virtual_slots(&source)?;
    let interfaces = layout.interfaces(&source)?;
    let iface_tables = interfaces
        .iter()
        .map(|iface| {
            let wanted = layout.virtual_slots(iface)?;
            // match interface slots against the type's own slots by name and signature
            wanted
                .iter()
                .map(|w| {
                    let found = slots
                        .iter()
                        .find(|s| s.name == w.name && s.sig == w.sig && s.implementation.is_some());
                    match found {
                        Some(s) => slot_target(session, s),
                        None => Ok(runtime::PURE_VIRTUAL.to_string()),
                    }
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, MetadataError>>()?;

    let mut blob = Blob::new(SectionKind::RoData, p);
    blob.define(symbol.clone(), SymbolKind::Object, binding_for(session, ts));

    let sig = FullySpecSignature::for_type(session.md(), ts)?;
    let (table, offset) = session.signature_address(&sig)?;
    blob.push_pointer(table, i64::from(offset), p);

    let tables_start = (VTABLE_HEADER_SLOTS as usize + slots.len()) as u64 * u64::from(p);
    let tables_len: u64 = iface_tables.iter().map(|t| t.len() as u64).sum::<u64>() * u64::from(p);
    blob.push_pointer(symbol.clone(), (tables_start + tables_len) as i64, p);

    match layout.base_type(&source)? {
        Some(base) => {
            let base = session.request_vtable(&base)?;
            blob.push_pointer(base, 0, p);
        }
        None => blob.push_uint(0, p),
    }

    for slot in &slots {
        blob.push_pointer(slot_target(session, slot)?, 0, p);
    }

    let mut table_offsets = Vec::with_capacity(iface_tables.len());
    for table in &iface_tables {
        table_offsets.push(blob.len() as i64);
        for target in table {
            blob.push_pointer(target.clone(), 0, p);
        }
    }
    for (iface, &at) in interfaces.iter().zip(&table_offsets) {
        let iface = session.request_vtable(iface)?;
        blob.push_pointer(iface, 0, p);
        blob.push_pointer(symbol.clone(), at, p);
    }
    blob.push_uint(0, p);
    blob.push_uint(0, p);

    debug!(
        "vtable {}: {} slots, {} interfaces",
        symbol,
        slots.len(),
        interfaces.len()
    );
    Ok(blob)
}
