//! ELF64 relocatable object output
//!
//! Lowers an [`ObjectFile`] onto an `object::write::Object` for x86-64 ELF:
//! `.text`, `.rodata` and `.data` with their symbols, undefined symbols for
//! everything referenced but not defined, and `.rela.*` entries.

use std::io::Write;

use ::object::write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection};
use ::object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolScope,
};
use rustc_hash::FxHashMap;

use super::{ObjectError, ObjectFile, RelocKind, SectionKind, SymbolBinding, SymbolKind};

fn standard_section(kind: SectionKind) -> StandardSection {
    match kind {
        SectionKind::Text => StandardSection::Text,
        SectionKind::RoData => StandardSection::ReadOnlyData,
        SectionKind::Data => StandardSection::Data,
    }
}

fn relocation_flags(kind: RelocKind) -> RelocationFlags {
    let (kind, encoding, size) = match kind {
        RelocKind::Abs64 => (RelocationKind::Absolute, RelocationEncoding::Generic, 64),
        RelocKind::Pc32 => (RelocationKind::Relative, RelocationEncoding::Generic, 32),
        RelocKind::Plt32 => (RelocationKind::PltRelative, RelocationEncoding::X86Branch, 32),
    };
    RelocationFlags::Generic {
        kind,
        encoding,
        size,
    }
}

fn symbol_kind(kind: SymbolKind) -> ::object::SymbolKind {
    match kind {
        SymbolKind::Func => ::object::SymbolKind::Text,
        SymbolKind::Object => ::object::SymbolKind::Data,
        SymbolKind::NoType => ::object::SymbolKind::Unknown,
    }
}

/// Build the `object` representation of `obj`
fn lower(obj: &ObjectFile) -> Result<Object<'_>, ObjectError> {
    let mut out = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

    let sections = SectionKind::ALL.map(|kind| {
        let section = obj.section(kind);
        let id = out.section_id(standard_section(kind));
        out.set_section_data(id, section.data.as_slice(), u64::from(section.align.max(1)));
        id
    });

    let mut symbols: FxHashMap<&str, SymbolId> = FxHashMap::default();
    for s in obj.symbols() {
        let id = out.add_symbol(Symbol {
            name: s.name.as_bytes().to_vec(),
            value: s.offset,
            size: s.size,
            kind: symbol_kind(s.kind),
            scope: match s.binding {
                SymbolBinding::Local => SymbolScope::Compilation,
                SymbolBinding::Global | SymbolBinding::Weak => SymbolScope::Linkage,
            },
            weak: s.binding == SymbolBinding::Weak,
            section: SymbolSection::Section(sections[s.section.index()]),
            flags: SymbolFlags::None,
        });
        symbols.insert(&s.name, id);
    }
    for name in obj.undefined_symbols() {
        let id = out.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: ::object::SymbolKind::Unknown,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        symbols.insert(name, id);
    }

    for r in obj.relocations() {
        let section_len = obj.section(r.section).data.len() as u64;
        let width = if r.kind == RelocKind::Abs64 { 8 } else { 4 };
        if r.offset + width > section_len {
            return Err(ObjectError::RelocationOutOfRange {
                section: r.section,
                offset: r.offset,
            });
        }
        let symbol = symbols
            .get(r.symbol.as_str())
            .copied()
            .ok_or_else(|| ObjectError::UnknownSymbol(r.symbol.clone()))?;
        out.add_relocation(
            sections[r.section.index()],
            Relocation {
                offset: r.offset,
                symbol,
                addend: r.addend,
                flags: relocation_flags(r.kind),
            },
        )?;
    }
    Ok(out)
}

/// Serialize an object for x86-64
pub fn to_elf_bytes(obj: &ObjectFile) -> Result<Vec<u8>, ObjectError> {
    Ok(lower(obj)?.write()?)
}

/// Serialize an object and write it to `w`
pub fn write_elf<W: Write>(obj: &ObjectFile, w: &mut W) -> Result<(), ObjectError> {
    let bytes = to_elf_bytes(obj)?;
    w.write_all(&bytes)?;
    Ok(())
}
