//! In-memory metadata provider
//!
//! Holds already-decoded tables for a set of modules together with a synthetic
//! assembly image containing method bodies and field data. Used by embedders
//! that have their own metadata reader and by the test-suite to build small
//! programs without a container file.

use rustc_hash::FxHashMap;

use super::{
    ElementType, FieldDefInfo, FieldSpec, MetadataError, MetadataProvider, MethodDefInfo,
    MethodSig, MethodSpec, ModuleId, TokenTarget, TypeDefInfo, TypeKind, TypeSpec,
};

/// Size of the synthetic image header preceding the first section
const IMAGE_HEADER_SIZE: usize = 0x200;
/// RVA at which the first section is mapped
const SECTION_RVA: u32 = 0x2000;

#[derive(Debug, Default)]
struct ModuleData {
    name: String,
    assembly: String,
    image: Vec<u8>,
    types: Vec<TypeDefInfo>,
    fields: Vec<FieldDefInfo>,
    methods: Vec<MethodDefInfo>,
    /// MemberRef / TypeSpec / MethodSpec tokens
    refs: FxHashMap<u32, TokenTarget>,
    locals: FxHashMap<u32, Vec<TypeSpec>>,
    /// Standalone method signatures (`calli`)
    method_sigs: FxHashMap<u32, MethodSig>,
    strings: FxHashMap<u32, String>,
    next_member_ref: u32,
    next_type_spec: u32,
    next_sig: u32,
    next_string: u32,
}

impl ModuleData {
    fn new(name: &str, assembly: &str) -> Self {
        let mut image = vec![0u8; IMAGE_HEADER_SIZE];
        image[0] = b'M';
        image[1] = b'Z';
        Self {
            name: name.to_string(),
            assembly: assembly.to_string(),
            image,
            next_member_ref: 1,
            next_type_spec: 1,
            next_sig: 1,
            next_string: 1,
            ..Default::default()
        }
    }

    /// Append data to the image and return its RVA
    fn append(&mut self, data: &[u8]) -> u32 {
        while self.image.len() % 4 != 0 {
            self.image.push(0);
        }
        let offset = self.image.len();
        self.image.extend_from_slice(data);
        SECTION_RVA + (offset - IMAGE_HEADER_SIZE) as u32
    }

    fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        let off = rva.checked_sub(SECTION_RVA)? as usize + IMAGE_HEADER_SIZE;
        (off < self.image.len()).then_some(off)
    }
}

/// Metadata for a set of modules held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    modules: Vec<ModuleData>,
    corlib: ModuleId,
}

impl InMemoryMetadata {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider with a minimal core library as module 0
    ///
    /// The core library defines `System.Object`, `System.ValueType`, `System.Enum`,
    /// `System.Array`, `System.String` (with `length` and `start_char` fields) and
    /// one value type per primitive.
    pub fn with_corlib() -> Self {
        let mut md = Self::new();
        let corlib = md.add_module("mscorlib.dll", "mscorlib");
        md.set_corlib(corlib);

        let object = md.add_type(corlib, "System", "Object", TypeKind::Class, None);
        let object_ts = TypeSpec::def(corlib, object);
        let value_type = md.add_type(
            corlib,
            "System",
            "ValueType",
            TypeKind::Class,
            Some(object_ts.clone()),
        );
        md.add_type(
            corlib,
            "System",
            "Enum",
            TypeKind::Class,
            Some(TypeSpec::def(corlib, value_type)),
        );
        md.add_type(corlib, "System", "Array", TypeKind::Class, Some(object_ts.clone()));
        let string = md.add_type(corlib, "System", "String", TypeKind::Class, Some(object_ts));
        md.add_field(
            corlib,
            string,
            "length",
            TypeSpec::Primitive(ElementType::I4),
            0,
        );
        md.add_field(
            corlib,
            string,
            "start_char",
            TypeSpec::Primitive(ElementType::Char),
            0,
        );

        for et in [
            ElementType::Boolean,
            ElementType::Char,
            ElementType::I1,
            ElementType::U1,
            ElementType::I2,
            ElementType::U2,
            ElementType::I4,
            ElementType::U4,
            ElementType::I8,
            ElementType::U8,
            ElementType::R4,
            ElementType::R8,
            ElementType::I,
            ElementType::U,
        ] {
            md.add_type(
                corlib,
                "System",
                et.corlib_name(),
                TypeKind::ValueType,
                Some(TypeSpec::def(corlib, value_type)),
            );
        }
        md
    }

    /// Add a module and return its id
    pub fn add_module(&mut self, name: &str, assembly: &str) -> ModuleId {
        self.modules.push(ModuleData::new(name, assembly));
        ModuleId::new(self.modules.len() as u32 - 1)
    }

    /// Designate the core library module
    pub fn set_corlib(&mut self, module: ModuleId) {
        self.corlib = module;
    }

    fn module_mut(&mut self, module: ModuleId) -> &mut ModuleData {
        &mut self.modules[module.as_u32() as usize]
    }

    fn module(&self, module: ModuleId) -> Result<&ModuleData, MetadataError> {
        self.modules
            .get(module.as_u32() as usize)
            .ok_or(MetadataError::UnknownModule(module))
    }

    /// Add a type definition and return its row
    pub fn add_type(
        &mut self,
        module: ModuleId,
        namespace: &str,
        name: &str,
        kind: TypeKind,
        extends: Option<TypeSpec>,
    ) -> u32 {
        let flags = if kind == TypeKind::Interface {
            super::TYPE_INTERFACE
        } else {
            0
        };
        let m = self.module_mut(module);
        m.types.push(TypeDefInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags,
            kind,
            extends,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            class_size: None,
            generic_params: 0,
        });
        m.types.len() as u32
    }

    /// Mutable access to a type definition (interfaces, class size, generic parameter count)
    pub fn type_mut(&mut self, module: ModuleId, row: u32) -> &mut TypeDefInfo {
        &mut self.module_mut(module).types[row as usize - 1]
    }

    /// Add a field to a type and return its row
    pub fn add_field(
        &mut self,
        module: ModuleId,
        owner_row: u32,
        name: &str,
        ty: TypeSpec,
        flags: u16,
    ) -> u32 {
        let m = self.module_mut(module);
        m.fields.push(FieldDefInfo {
            name: name.to_string(),
            flags,
            ty,
            rva: None,
        });
        let row = m.fields.len() as u32;
        m.types[owner_row as usize - 1].fields.push(row);
        row
    }

    /// Attach initial data to a field
    pub fn set_field_data(&mut self, module: ModuleId, field_row: u32, data: &[u8]) {
        let m = self.module_mut(module);
        let rva = m.append(data);
        m.fields[field_row as usize - 1].rva = Some(rva);
    }

    /// Add a method to a type and return its row; `body` is a complete encoded method body
    pub fn add_method(
        &mut self,
        module: ModuleId,
        owner_row: u32,
        name: &str,
        flags: u16,
        sig: MethodSig,
        body: Option<&[u8]>,
    ) -> u32 {
        let m = self.module_mut(module);
        let rva = body.map(|b| m.append(b)).unwrap_or(0);
        m.methods.push(MethodDefInfo {
            owner_row,
            name: name.to_string(),
            flags,
            impl_flags: 0,
            sig,
            rva,
        });
        let row = m.methods.len() as u32;
        m.types[owner_row as usize - 1].methods.push(row);
        row
    }

    /// Register a local variable signature and return its token
    pub fn add_locals(&mut self, module: ModuleId, locals: Vec<TypeSpec>) -> u32 {
        let m = self.module_mut(module);
        let token = 0x1100_0000 | m.next_sig;
        m.next_sig += 1;
        m.locals.insert(token, locals);
        token
    }

    /// Register a standalone method signature and return its token
    pub fn add_method_sig(&mut self, module: ModuleId, sig: MethodSig) -> u32 {
        let m = self.module_mut(module);
        let token = 0x1100_0000 | m.next_sig;
        m.next_sig += 1;
        m.method_sigs.insert(token, sig);
        token
    }

    /// Token for a type; plain definitions of `module` use TypeDef tokens
    pub fn type_token(&mut self, module: ModuleId, ts: &TypeSpec) -> u32 {
        if let TypeSpec::Def { module: dm, row, args } = ts {
            if *dm == module && args.is_empty() {
                return 0x0200_0000 | row;
            }
        }
        let m = self.module_mut(module);
        let token = 0x1b00_0000 | m.next_type_spec;
        m.next_type_spec += 1;
        m.refs.insert(token, TokenTarget::Type(ts.clone()));
        token
    }

    /// MemberRef token for a method
    pub fn method_token(&mut self, module: ModuleId, ms: &MethodSpec) -> u32 {
        let m = self.module_mut(module);
        let token = 0x0a00_0000 | m.next_member_ref;
        m.next_member_ref += 1;
        m.refs.insert(token, TokenTarget::Method(ms.clone()));
        token
    }

    /// MemberRef token for a field
    pub fn field_token(&mut self, module: ModuleId, fs: &FieldSpec) -> u32 {
        let m = self.module_mut(module);
        let token = 0x0a00_0000 | m.next_member_ref;
        m.next_member_ref += 1;
        m.refs.insert(token, TokenTarget::Field(fs.clone()));
        token
    }

    /// Add a user string and return its `ldstr` token
    pub fn user_string_token(&mut self, module: ModuleId, s: &str) -> u32 {
        let m = self.module_mut(module);
        let index = m.next_string;
        m.next_string += 1 + 2 * s.encode_utf16().count() as u32 + 1;
        m.strings.insert(index, s.to_string());
        0x7000_0000 | index
    }

    /// Open instance of a type definition (generic parameters mapped to themselves)
    fn open_owner(&self, module: ModuleId, row: u32) -> TypeSpec {
        let gp = self
            .module(module)
            .ok()
            .and_then(|m| m.types.get(row as usize - 1))
            .map(|t| t.generic_params)
            .unwrap_or(0);
        TypeSpec::Def {
            module,
            row,
            args: (0..gp).map(TypeSpec::Var).collect(),
        }
    }

    fn field_owner(&self, module: ModuleId, field_row: u32) -> Option<u32> {
        let m = self.module(module).ok()?;
        m.types
            .iter()
            .position(|t| t.fields.contains(&field_row))
            .map(|i| i as u32 + 1)
    }
}

impl MetadataProvider for InMemoryMetadata {
    fn corlib(&self) -> ModuleId {
        self.corlib
    }

    fn module_name(&self, module: ModuleId) -> Result<&str, MetadataError> {
        Ok(&self.module(module)?.name)
    }

    fn assembly_name(&self, module: ModuleId) -> Result<&str, MetadataError> {
        Ok(&self.module(module)?.assembly)
    }

    fn assembly_image(&self, module: ModuleId) -> Result<&[u8], MetadataError> {
        Ok(&self.module(module)?.image)
    }

    fn type_count(&self, module: ModuleId) -> Result<u32, MetadataError> {
        Ok(self.module(module)?.types.len() as u32)
    }

    fn type_def(&self, module: ModuleId, row: u32) -> Result<&TypeDefInfo, MetadataError> {
        row.checked_sub(1)
            .and_then(|i| self.module(module).ok()?.types.get(i as usize))
            .ok_or(MetadataError::UnknownType { module, row })
    }

    fn find_type(&self, module: ModuleId, namespace: &str, name: &str) -> Option<u32> {
        self.module(module)
            .ok()?
            .types
            .iter()
            .position(|t| t.namespace == namespace && t.name == name)
            .map(|i| i as u32 + 1)
    }

    fn field_def(&self, module: ModuleId, row: u32) -> Result<&FieldDefInfo, MetadataError> {
        row.checked_sub(1)
            .and_then(|i| self.module(module).ok()?.fields.get(i as usize))
            .ok_or(MetadataError::UnknownField { module, row })
    }

    fn method_def(&self, module: ModuleId, row: u32) -> Result<&MethodDefInfo, MetadataError> {
        row.checked_sub(1)
            .and_then(|i| self.module(module).ok()?.methods.get(i as usize))
            .ok_or(MetadataError::UnknownMethod { module, row })
    }

    fn method_body(&self, module: ModuleId, rva: u32) -> Result<&[u8], MetadataError> {
        let m = self.module(module)?;
        let off = m
            .rva_to_offset(rva)
            .ok_or(MetadataError::InvalidRva { module, rva })?;
        Ok(&m.image[off..])
    }

    fn resolve_rva(&self, module: ModuleId, rva: u32) -> Result<u64, MetadataError> {
        let m = self.module(module)?;
        m.rva_to_offset(rva)
            .map(|o| o as u64)
            .ok_or(MetadataError::InvalidRva { module, rva })
    }

    fn local_signature(
        &self,
        module: ModuleId,
        token: u32,
    ) -> Result<Vec<TypeSpec>, MetadataError> {
        self.module(module)?
            .locals
            .get(&token)
            .cloned()
            .ok_or(MetadataError::UnresolvedToken { module, token })
    }

    fn standalone_method_sig(
        &self,
        module: ModuleId,
        token: u32,
    ) -> Result<MethodSig, MetadataError> {
        self.module(module)?
            .method_sigs
            .get(&token)
            .cloned()
            .ok_or(MetadataError::UnresolvedToken { module, token })
    }

    fn resolve_type(&self, module: ModuleId, token: u32) -> Result<TypeSpec, MetadataError> {
        let row = token & 0x00ff_ffff;
        match token >> 24 {
            0x02 => {
                self.type_def(module, row)?;
                Ok(self.open_owner(module, row))
            }
            _ => match self.module(module)?.refs.get(&token) {
                Some(TokenTarget::Type(ts)) => Ok(ts.clone()),
                _ => Err(MetadataError::UnresolvedToken { module, token }),
            },
        }
    }

    fn resolve_method(&self, module: ModuleId, token: u32) -> Result<MethodSpec, MetadataError> {
        let row = token & 0x00ff_ffff;
        match token >> 24 {
            0x06 => {
                let md = self.method_def(module, row)?;
                Ok(MethodSpec::def(
                    self.open_owner(module, md.owner_row),
                    module,
                    row,
                ))
            }
            _ => match self.module(module)?.refs.get(&token) {
                Some(TokenTarget::Method(ms)) => Ok(ms.clone()),
                _ => Err(MetadataError::UnresolvedToken { module, token }),
            },
        }
    }

    fn resolve_field(&self, module: ModuleId, token: u32) -> Result<FieldSpec, MetadataError> {
        let row = token & 0x00ff_ffff;
        match token >> 24 {
            0x04 => {
                self.field_def(module, row)?;
                let owner = self
                    .field_owner(module, row)
                    .ok_or(MetadataError::UnresolvedToken { module, token })?;
                Ok(FieldSpec {
                    owner: self.open_owner(module, owner),
                    module,
                    row,
                })
            }
            _ => match self.module(module)?.refs.get(&token) {
                Some(TokenTarget::Field(fs)) => Ok(fs.clone()),
                _ => Err(MetadataError::UnresolvedToken { module, token }),
            },
        }
    }

    fn user_string(&self, module: ModuleId, index: u32) -> Result<&str, MetadataError> {
        self.module(module)?
            .strings
            .get(&index)
            .map(String::as_str)
            .ok_or(MetadataError::UnresolvedToken {
                module,
                token: 0x7000_0000 | index,
            })
    }
}

/// One exception clause for [`BodyBuilder`]
#[derive(Debug, Clone, Copy)]
pub struct ClauseSpec {
    /// 0 catch, 1 filter, 2 finally, 4 fault
    pub flags: u32,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    /// Class token for catch clauses, filter offset for filter clauses
    pub class_token_or_filter: u32,
}

/// Encodes a method body (header, code and exception sections)
#[derive(Debug, Clone)]
pub struct BodyBuilder {
    code: Vec<u8>,
    max_stack: u16,
    locals_token: u32,
    clauses: Vec<ClauseSpec>,
    force_fat: bool,
    small_clauses: bool,
    /// Clauses per exception section; 0 puts them all in one section
    clauses_per_section: usize,
}

impl BodyBuilder {
    /// Body with the given IL code
    pub fn new(code: &[u8]) -> Self {
        Self {
            code: code.to_vec(),
            max_stack: 8,
            locals_token: 0,
            clauses: Vec::new(),
            force_fat: false,
            small_clauses: false,
            clauses_per_section: 0,
        }
    }

    /// Set the maximum evaluation stack depth
    pub fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = max_stack;
        self
    }

    /// Set the local variable signature token
    pub fn locals(mut self, token: u32) -> Self {
        self.locals_token = token;
        self
    }

    /// Add an exception clause
    pub fn clause(mut self, clause: ClauseSpec) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Always use the fat header
    pub fn fat(mut self) -> Self {
        self.force_fat = true;
        self
    }

    /// Encode exception clauses in the small format
    pub fn small_clauses(mut self) -> Self {
        self.small_clauses = true;
        self
    }

    /// Split the clauses into chained sections of at most `n` clauses each
    pub fn clauses_per_section(mut self, n: usize) -> Self {
        self.clauses_per_section = n;
        self
    }

    /// Produce the encoded body
    pub fn build(&self) -> Vec<u8> {
        let tiny = !self.force_fat
            && self.code.len() < 64
            && self.max_stack <= 8
            && self.locals_token == 0
            && self.clauses.is_empty();
        let mut out = Vec::new();
        if tiny {
            out.push(((self.code.len() as u8) << 2) | 0x2);
            out.extend_from_slice(&self.code);
            return out;
        }

        let mut flags: u16 = 0x3 | (3 << 12);
        if !self.clauses.is_empty() {
            flags |= 0x8;
        }
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&self.max_stack.to_le_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.locals_token.to_le_bytes());
        out.extend_from_slice(&self.code);
        if self.clauses.is_empty() {
            return out;
        }

        while out.len() % 4 != 0 {
            out.push(0);
        }
        let per_section = match self.clauses_per_section {
            0 => self.clauses.len(),
            n => n,
        };
        let sections: Vec<&[ClauseSpec]> = self.clauses.chunks(per_section).collect();
        for (i, section) in sections.iter().enumerate() {
            let more = if i + 1 < sections.len() { 0x80 } else { 0 };
            if self.small_clauses {
                Self::small_section(&mut out, section, more);
            } else {
                Self::fat_section(&mut out, section, more);
            }
        }
        out
    }

    fn small_section(out: &mut Vec<u8>, clauses: &[ClauseSpec], more: u8) {
        let data_size = 4 + 12 * clauses.len() as u32;
        out.push(0x01 | more);
        out.push(data_size as u8);
        out.extend_from_slice(&[0, 0]);
        for c in clauses {
            out.extend_from_slice(&(c.flags as u16).to_le_bytes());
            out.extend_from_slice(&(c.try_offset as u16).to_le_bytes());
            out.push(c.try_length as u8);
            out.extend_from_slice(&(c.handler_offset as u16).to_le_bytes());
            out.push(c.handler_length as u8);
            out.extend_from_slice(&c.class_token_or_filter.to_le_bytes());
        }
    }

    fn fat_section(out: &mut Vec<u8>, clauses: &[ClauseSpec], more: u8) {
        let data_size = 4 + 24 * clauses.len() as u32;
        let header = 0x41 | u32::from(more) | (data_size << 8);
        out.extend_from_slice(&header.to_le_bytes());
        for c in clauses {
            for v in [
                c.flags,
                c.try_offset,
                c.try_length,
                c.handler_offset,
                c.handler_length,
                c.class_token_or_filter,
            ] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corlib_types() {
        let md = InMemoryMetadata::with_corlib();
        let corlib = md.corlib();
        let string = md.find_type(corlib, "System", "String").unwrap();
        let info = md.type_def(corlib, string).unwrap();
        assert_eq!(info.fields.len(), 2);
        assert!(md.corlib_type("Int32").is_some());
        assert!(md.corlib_type("Nope").is_none());
    }

    #[test]
    fn test_method_body_by_rva() {
        let mut md = InMemoryMetadata::with_corlib();
        let m = md.add_module("app.exe", "app");
        let t = md.add_type(m, "App", "Program", TypeKind::Class, None);
        let body = BodyBuilder::new(&[0x2a]).build();
        let sig = MethodSig::new_static(None, vec![]);
        let row = md.add_method(m, t, "Main", 0x10, sig, Some(&body));
        let rva = md.method_def(m, row).unwrap().rva;
        assert!(rva >= SECTION_RVA);
        assert_eq!(&md.method_body(m, rva).unwrap()[..2], &[0x06, 0x2a]);
        assert!(md.method_body(m, 0x10).is_err());
    }

    #[test]
    fn test_token_resolution() {
        let mut md = InMemoryMetadata::with_corlib();
        let m = md.add_module("app.exe", "app");
        let t = md.add_type(m, "App", "Program", TypeKind::Class, None);
        let f = md.add_field(m, t, "x", TypeSpec::Primitive(ElementType::I4), 0);
        let row = md.add_method(m, t, "Main", 0x10, MethodSig::new_static(None, vec![]), None);

        let ms = md.resolve_method(m, 0x0600_0000 | row).unwrap();
        assert_eq!(ms.owner, TypeSpec::def(m, t));
        let fs = md.resolve_field(m, 0x0400_0000 | f).unwrap();
        assert_eq!(fs.row, f);

        let arr = TypeSpec::Primitive(ElementType::I4).sz_array();
        let tok = md.type_token(m, &arr);
        assert_eq!(md.resolve_token(m, tok).unwrap(), TokenTarget::Type(arr));

        let s = md.user_string_token(m, "hi");
        assert_eq!(md.user_string(m, s & 0xffffff).unwrap(), "hi");
        assert!(md.resolve_token(m, 0x0a00_0099).is_err());
    }

    #[test]
    fn test_body_builder_tiny_and_fat() {
        let tiny = BodyBuilder::new(&[0x00, 0x2a]).build();
        assert_eq!(tiny, vec![0x0a, 0x00, 0x2a]);

        let fat = BodyBuilder::new(&[0x2a]).max_stack(16).build();
        assert_eq!(fat[0] & 0x3, 0x3);
        assert_eq!(u16::from_le_bytes([fat[2], fat[3]]), 16);
        assert_eq!(u32::from_le_bytes([fat[4], fat[5], fat[6], fat[7]]), 1);
        assert_eq!(fat.len(), 13);
    }
}
