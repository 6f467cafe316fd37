//! Relocatable object model
//!
//! Emitters build a [`Blob`] (bytes plus blob-relative symbols and
//! relocations) and commit it to the shared [`ObjectFile`] in one step, so a
//! method body or table is always contiguous in its section even when several
//! threads emit concurrently.

pub mod elf;

use rustc_hash::FxHashMap;

/// Errors raised while building or writing an object
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("Symbol `{0}` defined more than once")]
    DuplicateSymbol(String),
    #[error("Relocation in {section:?} at {offset:#x} is out of range")]
    RelocationOutOfRange { section: SectionKind, offset: u64 },
    #[error("Relocation against unknown symbol `{0}`")]
    UnknownSymbol(String),
    #[error("Failed to write object: {0}")]
    Write(#[from] ::object::write::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Text,
    RoData,
    Data,
}

impl SectionKind {
    /// All sections in file order
    pub const ALL: [SectionKind; 3] = [SectionKind::Text, SectionKind::RoData, SectionKind::Data];

    /// Conventional section name
    pub fn name(self) -> &'static str {
        match self {
            SectionKind::Text => ".text",
            SectionKind::RoData => ".rodata",
            SectionKind::Data => ".data",
        }
    }

    fn index(self) -> usize {
        match self {
            SectionKind::Text => 0,
            SectionKind::RoData => 1,
            SectionKind::Data => 2,
        }
    }
}

/// Section contents
#[derive(Debug, Clone)]
pub struct Section {
    pub kind: SectionKind,
    pub data: Vec<u8>,
    pub align: u32,
}

impl Section {
    fn new(kind: SectionKind) -> Self {
        Self {
            kind,
            data: Vec::new(),
            align: 1,
        }
    }

    /// Pad with zeros (or `nop` in text) to a multiple of `align`
    pub fn align_to(&mut self, align: u32) {
        let fill = if self.kind == SectionKind::Text { 0x90 } else { 0 };
        while self.data.len() % align.max(1) as usize != 0 {
            self.data.push(fill);
        }
        self.align = self.align.max(align);
    }
}

/// Symbol visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolBinding {
    Local,
    Global,
    Weak,
}

/// Symbol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Func,
    Object,
    NoType,
}

/// A defined symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub section: SectionKind,
    pub offset: u64,
    pub size: u64,
    pub kind: SymbolKind,
    pub binding: SymbolBinding,
}

/// Relocation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// Absolute pointer-sized address (data-to-data and data-to-code)
    Abs64,
    /// 32-bit PC-relative reference to data
    Pc32,
    /// 32-bit PC-relative function call
    Plt32,
}

/// A relocation against a named symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub section: SectionKind,
    pub offset: u64,
    pub symbol: String,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Symbol definition relative to the start of a blob
#[derive(Debug, Clone)]
pub struct BlobSymbol {
    pub name: String,
    pub offset: u64,
    /// `None` means "to the end of the blob"
    pub size: Option<u64>,
    pub kind: SymbolKind,
    pub binding: SymbolBinding,
}

/// Relocation relative to the start of a blob
#[derive(Debug, Clone)]
pub struct BlobReloc {
    pub offset: u64,
    pub symbol: String,
    pub kind: RelocKind,
    pub addend: i64,
}

/// A contiguous piece of section data with its symbols and relocations
#[derive(Debug, Clone)]
pub struct Blob {
    pub section: SectionKind,
    pub align: u32,
    pub data: Vec<u8>,
    pub symbols: Vec<BlobSymbol>,
    pub relocations: Vec<BlobReloc>,
}

impl Blob {
    /// Empty blob for `section`
    pub fn new(section: SectionKind, align: u32) -> Self {
        Self {
            section,
            align,
            data: Vec::new(),
            symbols: Vec::new(),
            relocations: Vec::new(),
        }
    }

    /// Current length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no bytes have been added
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Define a symbol at the current position spanning to the end of the blob
    pub fn define(&mut self, name: impl Into<String>, kind: SymbolKind, binding: SymbolBinding) {
        self.symbols.push(BlobSymbol {
            name: name.into(),
            offset: self.data.len() as u64,
            size: None,
            kind,
            binding,
        });
    }

    /// Append a little-endian unsigned value of `size` bytes
    pub fn push_uint(&mut self, v: u64, size: u32) {
        self.data.extend_from_slice(&v.to_le_bytes()[..size as usize]);
    }

    /// Append a pointer-sized slot relocated against `symbol + addend`
    pub fn push_pointer(&mut self, symbol: impl Into<String>, addend: i64, pointer_size: u32) {
        self.relocations.push(BlobReloc {
            offset: self.data.len() as u64,
            symbol: symbol.into(),
            kind: RelocKind::Abs64,
            addend,
        });
        self.push_uint(0, pointer_size);
    }

    /// Pad with zeros to a multiple of `align`
    pub fn align_to(&mut self, align: u32) {
        while self.data.len() % align.max(1) as usize != 0 {
            self.data.push(0);
        }
    }
}

/// An object file under construction
#[derive(Debug, Clone)]
pub struct ObjectFile {
    sections: [Section; 3],
    symbols: Vec<Symbol>,
    index: FxHashMap<String, usize>,
    relocations: Vec<Relocation>,
}

impl Default for ObjectFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectFile {
    /// Create an empty object
    pub fn new() -> Self {
        Self {
            sections: SectionKind::ALL.map(Section::new),
            symbols: Vec::new(),
            index: FxHashMap::default(),
            relocations: Vec::new(),
        }
    }

    /// Section contents
    pub fn section(&self, kind: SectionKind) -> &Section {
        &self.sections[kind.index()]
    }

    /// Defined symbols in definition order
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Look up a defined symbol
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.index.get(name).map(|&i| &self.symbols[i])
    }

    /// All relocations
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Define a symbol. A weak definition never replaces an existing one; two
    /// strong definitions of the same name are an error.
    pub fn define_symbol(&mut self, symbol: Symbol) -> Result<(), ObjectError> {
        match self.index.get(&symbol.name) {
            Some(&i) => {
                let existing = &self.symbols[i];
                match (existing.binding, symbol.binding) {
                    (_, SymbolBinding::Weak) => Ok(()),
                    (SymbolBinding::Weak, _) => {
                        self.symbols[i] = symbol;
                        Ok(())
                    }
                    _ => Err(ObjectError::DuplicateSymbol(symbol.name)),
                }
            }
            None => {
                self.index.insert(symbol.name.clone(), self.symbols.len());
                self.symbols.push(symbol);
                Ok(())
            }
        }
    }

    /// Add a relocation
    pub fn add_relocation(&mut self, reloc: Relocation) {
        self.relocations.push(reloc);
    }

    /// Append a blob to its section, returning the section offset it landed at
    pub fn commit(&mut self, blob: Blob) -> Result<u64, ObjectError> {
        let len = blob.data.len() as u64;
        for s in &blob.symbols {
            if let Some(&i) = self.index.get(&s.name) {
                let existing = self.symbols[i].binding;
                if existing != SymbolBinding::Weak && s.binding != SymbolBinding::Weak {
                    return Err(ObjectError::DuplicateSymbol(s.name.clone()));
                }
            }
        }

        let section = &mut self.sections[blob.section.index()];
        section.align_to(blob.align);
        let base = section.data.len() as u64;
        section.data.extend_from_slice(&blob.data);

        for s in blob.symbols {
            self.define_symbol(Symbol {
                name: s.name,
                section: blob.section,
                offset: base + s.offset,
                size: s.size.unwrap_or(len - s.offset),
                kind: s.kind,
                binding: s.binding,
            })?;
        }
        for r in blob.relocations {
            self.relocations.push(Relocation {
                section: blob.section,
                offset: base + r.offset,
                symbol: r.symbol,
                kind: r.kind,
                addend: r.addend,
            });
        }
        Ok(base)
    }

    /// Names referenced by relocations but not defined here
    pub fn undefined_symbols(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for r in &self.relocations {
            if !self.index.contains_key(&r.symbol) && !out.contains(&r.symbol.as_str()) {
                out.push(&r.symbol);
            }
        }
        out
    }
}
