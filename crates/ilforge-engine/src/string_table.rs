//! Per-module constant table
//!
//! One read-only arena holds the module's literal strings (laid out as
//! complete string objects) and its signature records. Code refers to an
//! entry as `table symbol + offset`. Pointer slots inside the arena are
//! recorded as symbol/addend pairs and become relocations when the table is
//! turned into a [`Blob`].

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::layout::{Layout, TargetLayout};
use crate::mangle::Mangler;
use crate::metadata::signature::SigSource;
use crate::metadata::{FullySpecSignature, MetadataError, TypeSpec};
use crate::object::{Blob, BlobReloc, RelocKind, SectionKind, SymbolBinding, SymbolKind};
use crate::requestor::Requestor;

/// Literal strings and signature records of one module
#[derive(Debug, Clone)]
pub struct StringTable {
    symbol: String,
    pointer_size: u32,
    data: Vec<u8>,
    strings: FxHashMap<String, u32>,
    /// Pointer slot offset to target symbol
    symbols: BTreeMap<u32, String>,
    /// Pointer slot offset to addend, when non-zero
    addends: BTreeMap<u32, i64>,
}

impl StringTable {
    /// Empty table emitted under `symbol`
    pub fn new(symbol: impl Into<String>, pointer_size: u32) -> Self {
        Self {
            symbol: symbol.into(),
            pointer_size,
            data: Vec::new(),
            strings: FxHashMap::default(),
            symbols: BTreeMap::new(),
            addends: BTreeMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of distinct strings interned
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    fn align(&mut self) -> u32 {
        while self.data.len() % self.pointer_size as usize != 0 {
            self.data.push(0);
        }
        self.data.len() as u32
    }

    fn push_intptr(&mut self, v: u64) {
        let p = self.pointer_size as usize;
        self.data.extend_from_slice(&v.to_le_bytes()[..p]);
    }

    /// Pointer slot relocated against `symbol + addend`
    fn push_reloc(&mut self, symbol: String, addend: i64) {
        let at = self.data.len() as u32;
        self.symbols.insert(at, symbol);
        if addend != 0 {
            self.addends.insert(at, addend);
        }
        self.push_intptr(0);
    }

    /// Offset of the string object for `s`, adding it on first use. Equal
    /// strings share one entry.
    ///
    /// The entry is a complete string object: vtable pointer, zeroed header
    /// words, the character count and the UTF-16 code units.
    pub fn get_string_address(
        &mut self,
        s: &str,
        string_vtable: &str,
        target: &TargetLayout,
    ) -> u32 {
        if let Some(&offset) = self.strings.get(s) {
            return offset;
        }
        let start = self.align();
        self.strings.insert(s.to_string(), start);

        let vtbl = start + target.object.vtbl;
        self.data.resize(vtbl as usize, 0);
        self.push_reloc(string_vtable.to_string(), 0);
        self.data.resize((start + target.string.length) as usize, 0);

        let units: Vec<u16> = s.encode_utf16().collect();
        self.data.extend_from_slice(&(units.len() as u32).to_le_bytes());
        self.data.resize((start + target.string.start_char) as usize, 0);
        for u in units {
            self.data.extend_from_slice(&u.to_le_bytes());
        }
        start
    }

    /// Append a signature record and return its offset. Records are never
    /// shared, even for equal signatures.
    ///
    /// Layout: kind tag, kind-specific words, module count, one pointer per
    /// referenced module (to its assembly info), then the signature bytes.
    pub fn get_signature_address(
        &mut self,
        sig: &FullySpecSignature,
        layout: &Layout<'_>,
        requestor: &dyn Requestor,
    ) -> Result<u32, MetadataError> {
        let md = layout.md;
        let mangler = Mangler::new(md);
        let start = self.align();
        self.push_intptr(sig.kind as u64);

        match &sig.source {
            SigSource::Field(fs) => {
                let size = layout.type_size(&layout.field_type(fs)?)?;
                self.push_intptr(u64::from(size));
                match md.field_def(fs.module, fs.row)?.rva {
                    Some(rva) => {
                        let offset = md.resolve_rva(fs.module, rva)?;
                        requestor.assemblies().request(fs.module);
                        self.push_reloc(mangler.assembly_info(fs.module)?, offset as i64);
                    }
                    None => self.push_intptr(0),
                }
            }
            SigSource::Type(ts) => {
                let special = match ts {
                    TypeSpec::SzArray(elem) => Some((**elem).clone()),
                    other => layout
                        .enum_underlying(other)?
                        .map(TypeSpec::Primitive),
                };
                match special {
                    Some(target) => {
                        requestor.vtables().request(target.clone());
                        self.push_reloc(mangler.type_name(&target)?, 0);
                    }
                    None => self.push_intptr(0),
                }
                // filled in by the runtime
                self.push_intptr(0);
            }
            SigSource::Method(_) => {}
        }

        self.push_intptr(sig.modules.len() as u64);
        for &module in &sig.modules {
            requestor.assemblies().request(module);
            self.push_reloc(mangler.assembly_info(module)?, 0);
        }
        self.data.extend_from_slice(&sig.bytes);
        Ok(start)
    }

    /// Pointer slots as `(offset, symbol, addend)`
    pub fn relocations(&self) -> impl Iterator<Item = (u32, &str, i64)> + '_ {
        self.symbols.iter().map(|(&offset, symbol)| {
            let addend = self.addends.get(&offset).copied().unwrap_or(0);
            (offset, symbol.as_str(), addend)
        })
    }

    /// Raw table contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The table as a global read-only object
    pub fn to_blob(&self) -> Blob {
        let mut blob = Blob::new(SectionKind::RoData, self.pointer_size);
        blob.define(self.symbol.clone(), SymbolKind::Object, SymbolBinding::Global);
        blob.data.extend_from_slice(&self.data);
        for (offset, symbol, addend) in self.relocations() {
            blob.relocations.push(BlobReloc {
                offset: u64::from(offset),
                symbol: symbol.to_string(),
                kind: RelocKind::Abs64,
                addend,
            });
        }
        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        ElementType, FieldSpec, InMemoryMetadata, MetadataProvider, TypeKind, FIELD_STATIC,
    };
    use crate::requestor::CachingRequestor;

    const STRING_VTBL: &str = "_Zu1S";

    #[test]
    fn test_string_entries_are_deduplicated() {
        let target = TargetLayout::new(8);
        let mut st = StringTable::new("_M3app_StringTable", 8);
        let a = st.get_string_address("hi", STRING_VTBL, &target);
        let b = st.get_string_address("there", STRING_VTBL, &target);
        let c = st.get_string_address("hi", STRING_VTBL, &target);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(b % 8, 0);
        assert_eq!(st.string_count(), 2);

        let len_at = (a + target.string.length) as usize;
        assert_eq!(&st.data()[len_at..len_at + 4], &2u32.to_le_bytes());
        let chars_at = (a + target.string.start_char) as usize;
        assert_eq!(&st.data()[chars_at..chars_at + 4], &[b'h', 0, b'i', 0]);

        let relocs: Vec<_> = st.relocations().collect();
        assert_eq!(relocs, vec![(a, STRING_VTBL, 0), (b, STRING_VTBL, 0)]);
    }

    #[test]
    fn test_signature_records_are_not_shared() {
        let md = InMemoryMetadata::with_corlib();
        let target = TargetLayout::new(8);
        let layout = Layout::new(&md, &target);
        let requestor = CachingRequestor::new();
        let mut st = StringTable::new("t", 8);

        let ts = TypeSpec::Primitive(ElementType::I4).sz_array();
        let sig = FullySpecSignature::for_type(&md, &ts).unwrap();
        let a = st.get_signature_address(&sig, &layout, &requestor).unwrap();
        let b = st.get_signature_address(&sig, &layout, &requestor).unwrap();
        assert_ne!(a, b);

        let tag = &st.data()[a as usize..a as usize + 8];
        assert_eq!(tag, &1u64.to_le_bytes());
        // the element vtable slot follows the tag
        let elem = st
            .relocations()
            .find(|(off, _, _)| *off == a + 8)
            .map(|(_, sym, _)| sym.to_string());
        assert_eq!(elem.as_deref(), Some("_Zi"));
        assert!(requestor
            .vtables()
            .has_seen(&TypeSpec::Primitive(ElementType::I4)));
    }

    #[test]
    fn test_field_signature_points_at_initial_data() {
        let mut md = InMemoryMetadata::with_corlib();
        let app = md.add_module("app.exe", "app");
        let holder = md.add_type(app, "App", "Tables", TypeKind::Class, None);
        let table = md.add_field(
            app,
            holder,
            "table",
            TypeSpec::Primitive(ElementType::I8),
            FIELD_STATIC,
        );
        md.set_field_data(app, table, &42u64.to_le_bytes());
        let target = TargetLayout::new(8);
        let layout = Layout::new(&md, &target);
        let requestor = CachingRequestor::new();
        let mut st = StringTable::new("t", 8);

        let fs = FieldSpec {
            owner: TypeSpec::def(app, holder),
            module: app,
            row: table,
        };
        let sig = FullySpecSignature::for_field(&md, &fs).unwrap();
        let at = st.get_signature_address(&sig, &layout, &requestor).unwrap();
        let size_at = at as usize + 8;
        assert_eq!(&st.data()[size_at..size_at + 8], &8u64.to_le_bytes());

        let rva = md.field_def(app, table).unwrap().rva.unwrap();
        let expected = md.resolve_rva(app, rva).unwrap() as i64;
        let data_ptr = st.relocations().find(|(off, _, _)| *off == at + 16).unwrap();
        assert_eq!(data_ptr.1, "_A3app");
        assert_eq!(data_ptr.2, expected);
        assert!(requestor.assemblies().has_seen(&app));
    }

    #[test]
    fn test_to_blob() {
        let target = TargetLayout::new(8);
        let mut st = StringTable::new("tab", 8);
        st.get_string_address("x", STRING_VTBL, &target);
        let blob = st.to_blob();
        assert_eq!(blob.section, SectionKind::RoData);
        assert_eq!(blob.symbols[0].name, "tab");
        assert_eq!(blob.data.len(), st.len());
        assert_eq!(blob.relocations.len(), 1);
    }
}
