//! Metadata boundary
//!
//! The compiler consumes metadata through the [`MetadataProvider`] trait: type,
//! method and field definitions, token resolution, raw method bodies and the
//! assembly image. Identity values ([`TypeSpec`], [`MethodSpec`], [`FieldSpec`])
//! are plain values with structural equality and hashing.

pub mod identity;
pub mod memory;
pub mod signature;

pub use identity::{
    ArrayMethod, ArrayShape, ElementType, FieldSpec, MethodRef, MethodSpec, ModuleId, TypeSpec,
};
pub use memory::{BodyBuilder, ClauseSpec, InMemoryMetadata};
pub use signature::{FullySpecSignature, SigKind};

/// `TypeDef` flag: type is an interface
pub const TYPE_INTERFACE: u32 = 0x20;

/// `MethodDef` flag: static method
pub const METHOD_STATIC: u16 = 0x10;
/// `MethodDef` flag: virtual method
pub const METHOD_VIRTUAL: u16 = 0x40;
/// `MethodDef` flag: introduces a new vtable slot
pub const METHOD_NEWSLOT: u16 = 0x100;
/// `MethodDef` flag: abstract method
pub const METHOD_ABSTRACT: u16 = 0x400;

/// `Field` flag: static field
pub const FIELD_STATIC: u16 = 0x10;

/// Error reported by a metadata provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("Unknown module {0}")]
    UnknownModule(ModuleId),
    #[error("No type definition row {row} in {module}")]
    UnknownType { module: ModuleId, row: u32 },
    #[error("No method definition row {row} in {module}")]
    UnknownMethod { module: ModuleId, row: u32 },
    #[error("No field definition row {row} in {module}")]
    UnknownField { module: ModuleId, row: u32 },
    #[error("Unresolved token {token:#010x} in {module}")]
    UnresolvedToken { module: ModuleId, token: u32 },
    #[error("RVA {rva:#x} is outside the image of {module}")]
    InvalidRva { module: ModuleId, rva: u32 },
    #[error("Type {0} is not a type definition")]
    NotADefinition(String),
    #[error("Cannot find {0}")]
    NotFound(String),
}

/// Broad category of a type definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Class,
    ValueType,
    Interface,
    /// Enumeration with the given underlying primitive
    Enum(ElementType),
}

/// A row of the type definition table, with its members
#[derive(Debug, Clone)]
pub struct TypeDefInfo {
    pub namespace: String,
    pub name: String,
    pub flags: u32,
    pub kind: TypeKind,
    /// Base type, `None` for `System.Object`, interfaces and value types without a modelled base
    pub extends: Option<TypeSpec>,
    pub interfaces: Vec<TypeSpec>,
    /// Field definition rows in declaration order
    pub fields: Vec<u32>,
    /// Method definition rows in declaration order
    pub methods: Vec<u32>,
    /// Explicit size from the class layout table
    pub class_size: Option<u32>,
    pub generic_params: u32,
}

/// A row of the field table
#[derive(Debug, Clone)]
pub struct FieldDefInfo {
    pub name: String,
    pub flags: u16,
    /// Declared type, possibly mentioning the owner's generic parameters
    pub ty: TypeSpec,
    /// RVA of the initial data, from the field RVA table
    pub rva: Option<u32>,
}

impl FieldDefInfo {
    /// Whether the field is static
    pub fn is_static(&self) -> bool {
        self.flags & FIELD_STATIC != 0
    }
}

/// A method signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    pub has_this: bool,
    pub ret: Option<TypeSpec>,
    pub params: Vec<TypeSpec>,
    pub generic_params: u32,
}

impl MethodSig {
    /// Static method signature
    pub fn new_static(ret: Option<TypeSpec>, params: Vec<TypeSpec>) -> Self {
        Self {
            has_this: false,
            ret,
            params,
            generic_params: 0,
        }
    }

    /// Instance method signature
    pub fn new_instance(ret: Option<TypeSpec>, params: Vec<TypeSpec>) -> Self {
        Self {
            has_this: true,
            ret,
            params,
            generic_params: 0,
        }
    }

    /// Parameter count including the implicit `this`
    pub fn param_count_with_this(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }

    /// Substitute generic parameters throughout the signature
    pub fn substitute(&self, type_args: &[TypeSpec], method_args: &[TypeSpec]) -> MethodSig {
        MethodSig {
            has_this: self.has_this,
            ret: self
                .ret
                .as_ref()
                .map(|r| r.substitute(type_args, method_args)),
            params: self
                .params
                .iter()
                .map(|p| p.substitute(type_args, method_args))
                .collect(),
            generic_params: self.generic_params,
        }
    }
}

/// A row of the method definition table
#[derive(Debug, Clone)]
pub struct MethodDefInfo {
    /// Row of the owning type definition
    pub owner_row: u32,
    pub name: String,
    pub flags: u16,
    pub impl_flags: u16,
    pub sig: MethodSig,
    /// RVA of the method body, 0 when the method has none
    pub rva: u32,
}

impl MethodDefInfo {
    /// Whether the method occupies a vtable slot
    pub fn is_virtual(&self) -> bool {
        self.flags & METHOD_VIRTUAL != 0
    }

    /// Whether the method introduces a new vtable slot rather than overriding
    pub fn is_new_slot(&self) -> bool {
        self.flags & METHOD_NEWSLOT != 0
    }

    /// Whether the method is abstract
    pub fn is_abstract(&self) -> bool {
        self.flags & METHOD_ABSTRACT != 0
    }

    /// Whether the method is static
    pub fn is_static(&self) -> bool {
        self.flags & METHOD_STATIC != 0
    }
}

/// Signature of a method with its owner's and its own generic arguments substituted
pub fn method_signature(
    md: &dyn MetadataProvider,
    ms: &MethodSpec,
) -> Result<MethodSig, MetadataError> {
    match ms.method {
        MethodRef::Def { module, row } => Ok(md
            .method_def(module, row)?
            .sig
            .substitute(ms.owner.generic_args(), &ms.args)),
        MethodRef::Array(accessor) => match &ms.owner {
            TypeSpec::Array(shape) => Ok(shape.accessor_signature(accessor)),
            other => Err(MetadataError::NotADefinition(other.to_string())),
        },
    }
}

/// What a metadata token refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenTarget {
    Type(TypeSpec),
    Method(MethodSpec),
    Field(FieldSpec),
}

/// Source of metadata for the modules taking part in a build
pub trait MetadataProvider: Send + Sync {
    /// The core library module (`System.Object`, `System.String`, ...)
    fn corlib(&self) -> ModuleId;

    /// Module name (e.g. `mscorlib.dll`)
    fn module_name(&self, module: ModuleId) -> Result<&str, MetadataError>;

    /// Name of the assembly the module belongs to
    fn assembly_name(&self, module: ModuleId) -> Result<&str, MetadataError>;

    /// Raw file image of the module's assembly
    fn assembly_image(&self, module: ModuleId) -> Result<&[u8], MetadataError>;

    /// Number of rows in the type definition table
    fn type_count(&self, module: ModuleId) -> Result<u32, MetadataError>;

    /// Type definition by row
    fn type_def(&self, module: ModuleId, row: u32) -> Result<&TypeDefInfo, MetadataError>;

    /// Find a type definition by name
    fn find_type(&self, module: ModuleId, namespace: &str, name: &str) -> Option<u32>;

    /// Field definition by row
    fn field_def(&self, module: ModuleId, row: u32) -> Result<&FieldDefInfo, MetadataError>;

    /// Method definition by row
    fn method_def(&self, module: ModuleId, row: u32) -> Result<&MethodDefInfo, MetadataError>;

    /// Bytes of the image starting at a method body RVA
    fn method_body(&self, module: ModuleId, rva: u32) -> Result<&[u8], MetadataError>;

    /// File offset of an RVA within the assembly image
    fn resolve_rva(&self, module: ModuleId, rva: u32) -> Result<u64, MetadataError>;

    /// Local variable types for a standalone signature token
    fn local_signature(&self, module: ModuleId, token: u32) -> Result<Vec<TypeSpec>, MetadataError>;

    /// Method signature behind a standalone signature token (`calli`)
    fn standalone_method_sig(
        &self,
        module: ModuleId,
        token: u32,
    ) -> Result<MethodSig, MetadataError> {
        Err(MetadataError::UnresolvedToken { module, token })
    }

    /// Resolve a TypeDef/TypeRef/TypeSpec token
    fn resolve_type(&self, module: ModuleId, token: u32) -> Result<TypeSpec, MetadataError>;

    /// Resolve a MethodDef/MemberRef/MethodSpec token
    fn resolve_method(&self, module: ModuleId, token: u32) -> Result<MethodSpec, MetadataError>;

    /// Resolve a Field/MemberRef token
    fn resolve_field(&self, module: ModuleId, token: u32) -> Result<FieldSpec, MetadataError>;

    /// User string heap entry
    fn user_string(&self, module: ModuleId, index: u32) -> Result<&str, MetadataError>;

    /// Resolve a token of any kind, dispatching on its table id
    fn resolve_token(&self, module: ModuleId, token: u32) -> Result<TokenTarget, MetadataError> {
        match token >> 24 {
            0x01 | 0x02 | 0x1b => self.resolve_type(module, token).map(TokenTarget::Type),
            0x04 => self.resolve_field(module, token).map(TokenTarget::Field),
            0x06 | 0x2b => self.resolve_method(module, token).map(TokenTarget::Method),
            0x0a => match self.resolve_method(module, token) {
                Ok(ms) => Ok(TokenTarget::Method(ms)),
                Err(_) => self.resolve_field(module, token).map(TokenTarget::Field),
            },
            _ => Err(MetadataError::UnresolvedToken { module, token }),
        }
    }

    /// The `System.<name>` type definition of the core library
    fn corlib_type(&self, name: &str) -> Option<TypeSpec> {
        let corlib = self.corlib();
        self.find_type(corlib, "System", name)
            .map(|row| TypeSpec::def(corlib, row))
    }
}
