//! Identity values for modules, types, methods and fields
//!
//! These are plain values with structural equality and hashing. Two specs compare
//! equal exactly when they denote the same artifact (including generic
//! instantiation), which is what the work closure relies on for compiling every
//! artifact once.

use std::fmt;

use super::MethodSig;

/// Index of a loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ModuleId(pub u32);

impl ModuleId {
    /// Create a new module id
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw index
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// ECMA-335 element types used for primitive types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Void = 0x01,
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0a,
    U8 = 0x0b,
    R4 = 0x0c,
    R8 = 0x0d,
    String = 0x0e,
    TypedByRef = 0x16,
    I = 0x18,
    U = 0x19,
    Object = 0x1c,
}

impl ElementType {
    /// Decode an element type byte
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Void),
            0x02 => Some(Self::Boolean),
            0x03 => Some(Self::Char),
            0x04 => Some(Self::I1),
            0x05 => Some(Self::U1),
            0x06 => Some(Self::I2),
            0x07 => Some(Self::U2),
            0x08 => Some(Self::I4),
            0x09 => Some(Self::U4),
            0x0a => Some(Self::I8),
            0x0b => Some(Self::U8),
            0x0c => Some(Self::R4),
            0x0d => Some(Self::R8),
            0x0e => Some(Self::String),
            0x16 => Some(Self::TypedByRef),
            0x18 => Some(Self::I),
            0x19 => Some(Self::U),
            0x1c => Some(Self::Object),
            _ => None,
        }
    }

    /// The element type byte
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Size in bytes of a value of this type as stored in memory
    pub fn size(self, pointer_size: u32) -> u32 {
        match self {
            Self::Void => 0,
            Self::Boolean | Self::I1 | Self::U1 => 1,
            Self::Char | Self::I2 | Self::U2 => 2,
            Self::I4 | Self::U4 | Self::R4 => 4,
            Self::I8 | Self::U8 | Self::R8 => 8,
            Self::TypedByRef => pointer_size * 2,
            Self::String | Self::Object | Self::I | Self::U => pointer_size,
        }
    }

    /// Whether loads of this type sign-extend
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::I1 | Self::I2 | Self::I4 | Self::I8 | Self::I | Self::R4 | Self::R8
        )
    }

    /// Whether this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Self::R4 | Self::R8)
    }

    /// Name of the corresponding type in the `System` namespace of the core library
    pub fn corlib_name(self) -> &'static str {
        match self {
            Self::Void => "Void",
            Self::Boolean => "Boolean",
            Self::Char => "Char",
            Self::I1 => "SByte",
            Self::U1 => "Byte",
            Self::I2 => "Int16",
            Self::U2 => "UInt16",
            Self::I4 => "Int32",
            Self::U4 => "UInt32",
            Self::I8 => "Int64",
            Self::U8 => "UInt64",
            Self::R4 => "Single",
            Self::R8 => "Double",
            Self::String => "String",
            Self::TypedByRef => "TypedReference",
            Self::I => "IntPtr",
            Self::U => "UIntPtr",
            Self::Object => "Object",
        }
    }
}

/// Shape of a general (possibly multi-dimensional) array type
///
/// `sizes` and `lobounds` hold the statically known extents and lower bounds
/// from the type signature; they may be shorter than `rank`, in which case the
/// remaining dimensions are only known at run time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayShape {
    pub elem: TypeSpec,
    pub rank: u32,
    pub sizes: Vec<u32>,
    pub lobounds: Vec<i32>,
}

impl ArrayShape {
    /// Array shape with no static bounds
    pub fn new(elem: TypeSpec, rank: u32) -> Self {
        Self {
            elem,
            rank,
            sizes: Vec::new(),
            lobounds: Vec::new(),
        }
    }

    /// Statically known lower bound of dimension `dim` (zero-based)
    pub fn static_lobound(&self, dim: usize) -> Option<i32> {
        self.lobounds.get(dim).copied()
    }

    /// Statically known extent of dimension `dim` (zero-based)
    pub fn static_size(&self, dim: usize) -> Option<u32> {
        self.sizes.get(dim).copied()
    }

    /// Signature of one of the synthesized accessors
    pub fn accessor_signature(&self, accessor: ArrayMethod) -> MethodSig {
        let mut params: Vec<TypeSpec> = (0..self.rank)
            .map(|_| TypeSpec::Primitive(ElementType::I4))
            .collect();
        let ret = match accessor {
            ArrayMethod::Get => Some(self.elem.clone()),
            ArrayMethod::Set => {
                params.push(self.elem.clone());
                None
            }
            ArrayMethod::Address => Some(self.elem.clone().managed_ptr()),
        };
        MethodSig::new_instance(ret, params)
    }
}

/// A type, including generic instantiation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSpec {
    /// Built-in primitive
    Primitive(ElementType),
    /// A type definition, instantiated with `args` when generic
    Def {
        module: ModuleId,
        row: u32,
        args: Vec<TypeSpec>,
    },
    /// Single-dimensional zero-based array
    SzArray(Box<TypeSpec>),
    /// General array
    Array(Box<ArrayShape>),
    /// Managed pointer (`T&`)
    ManagedPtr(Box<TypeSpec>),
    /// Unmanaged pointer (`T*`)
    Ptr(Box<TypeSpec>),
    /// Generic parameter of the enclosing type
    Var(u32),
    /// Generic parameter of the enclosing method
    MVar(u32),
}

impl TypeSpec {
    /// Non-generic type definition
    pub fn def(module: ModuleId, row: u32) -> Self {
        Self::Def {
            module,
            row,
            args: Vec::new(),
        }
    }

    /// Single-dimensional zero-based array of `self`
    pub fn sz_array(self) -> Self {
        Self::SzArray(Box::new(self))
    }

    /// Managed pointer to `self`
    pub fn managed_ptr(self) -> Self {
        Self::ManagedPtr(Box::new(self))
    }

    /// Unmanaged pointer to `self`
    pub fn ptr(self) -> Self {
        Self::Ptr(Box::new(self))
    }

    /// Module defining this type, `None` for primitives (which live in the core library)
    pub fn module(&self) -> Option<ModuleId> {
        match self {
            Self::Def { module, .. } => Some(*module),
            Self::SzArray(e) | Self::ManagedPtr(e) | Self::Ptr(e) => e.module(),
            Self::Array(shape) => shape.elem.module(),
            Self::Primitive(_) | Self::Var(_) | Self::MVar(_) => None,
        }
    }

    /// Whether the type still mentions an unsubstituted generic parameter
    pub fn is_open(&self) -> bool {
        match self {
            Self::Var(_) | Self::MVar(_) => true,
            Self::Primitive(_) => false,
            Self::Def { args, .. } => args.iter().any(TypeSpec::is_open),
            Self::SzArray(e) | Self::ManagedPtr(e) | Self::Ptr(e) => e.is_open(),
            Self::Array(shape) => shape.elem.is_open(),
        }
    }

    /// Replace generic parameters with the given type and method arguments
    ///
    /// Parameters without a matching argument are left in place.
    pub fn substitute(&self, type_args: &[TypeSpec], method_args: &[TypeSpec]) -> TypeSpec {
        match self {
            Self::Var(i) => type_args
                .get(*i as usize)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Self::MVar(i) => method_args
                .get(*i as usize)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Self::Primitive(_) => self.clone(),
            Self::Def { module, row, args } => Self::Def {
                module: *module,
                row: *row,
                args: args
                    .iter()
                    .map(|a| a.substitute(type_args, method_args))
                    .collect(),
            },
            Self::SzArray(e) => Self::SzArray(Box::new(e.substitute(type_args, method_args))),
            Self::ManagedPtr(e) => {
                Self::ManagedPtr(Box::new(e.substitute(type_args, method_args)))
            }
            Self::Ptr(e) => Self::Ptr(Box::new(e.substitute(type_args, method_args))),
            Self::Array(shape) => Self::Array(Box::new(ArrayShape {
                elem: shape.elem.substitute(type_args, method_args),
                rank: shape.rank,
                sizes: shape.sizes.clone(),
                lobounds: shape.lobounds.clone(),
            })),
        }
    }

    /// Generic arguments of a type definition instance
    pub fn generic_args(&self) -> &[TypeSpec] {
        match self {
            Self::Def { args, .. } => args,
            _ => &[],
        }
    }

    /// Element type of an array or pointer type
    pub fn element(&self) -> Option<&TypeSpec> {
        match self {
            Self::SzArray(e) | Self::ManagedPtr(e) | Self::Ptr(e) => Some(e),
            Self::Array(shape) => Some(&shape.elem),
            _ => None,
        }
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(et) => write!(f, "{}", et.corlib_name()),
            Self::Def { module, row, args } => {
                write!(f, "{}:{:#x}", module, 0x0200_0000 | row)?;
                if !args.is_empty() {
                    write!(f, "<")?;
                    for (i, a) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{}", a)?;
                    }
                    write!(f, ">")?;
                }
                Ok(())
            }
            Self::SzArray(e) => write!(f, "{}[]", e),
            Self::Array(shape) => write!(f, "{}[rank {}]", shape.elem, shape.rank),
            Self::ManagedPtr(e) => write!(f, "{}&", e),
            Self::Ptr(e) => write!(f, "{}*", e),
            Self::Var(i) => write!(f, "!{}", i),
            Self::MVar(i) => write!(f, "!!{}", i),
        }
    }
}

/// Compiler-synthesized accessor methods of general arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayMethod {
    Get,
    Set,
    Address,
}

impl ArrayMethod {
    /// Method name as it appears in member references
    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "Get",
            Self::Set => "Set",
            Self::Address => "Address",
        }
    }

    /// Look up an accessor by member name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Get" => Some(Self::Get),
            "Set" => Some(Self::Set),
            "Address" => Some(Self::Address),
            _ => None,
        }
    }
}

/// Which method of the owner type a [`MethodSpec`] denotes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodRef {
    /// A method definition row
    Def { module: ModuleId, row: u32 },
    /// An accessor of a general array owner
    Array(ArrayMethod),
}

/// A method, including the instantiation of its owner and its own generic parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSpec {
    pub owner: TypeSpec,
    pub method: MethodRef,
    pub args: Vec<TypeSpec>,
}

impl MethodSpec {
    /// Non-generic method definition
    pub fn def(owner: TypeSpec, module: ModuleId, row: u32) -> Self {
        Self {
            owner,
            method: MethodRef::Def { module, row },
            args: Vec::new(),
        }
    }

    /// Accessor method of a general array type
    pub fn array(owner: TypeSpec, accessor: ArrayMethod) -> Self {
        Self {
            owner,
            method: MethodRef::Array(accessor),
            args: Vec::new(),
        }
    }

    /// Module defining the method
    pub fn module(&self) -> Option<ModuleId> {
        match self.method {
            MethodRef::Def { module, .. } => Some(module),
            MethodRef::Array(_) => self.owner.module(),
        }
    }

    /// Method definition row, if this is not a synthesized accessor
    pub fn row(&self) -> Option<u32> {
        match self.method {
            MethodRef::Def { row, .. } => Some(row),
            MethodRef::Array(_) => None,
        }
    }
}

impl fmt::Display for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method {
            MethodRef::Def { row, .. } => write!(f, "{}::{:#x}", self.owner, 0x0600_0000 | row)?,
            MethodRef::Array(a) => write!(f, "{}::{}", self.owner, a.name())?,
        }
        if !self.args.is_empty() {
            write!(f, "<{} args>", self.args.len())?;
        }
        Ok(())
    }
}

/// A field of an (instantiated) owner type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    pub owner: TypeSpec,
    pub module: ModuleId,
    pub row: u32,
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{:#x}", self.owner, 0x0400_0000 | self.row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_element_type_roundtrip_codes() {
        for b in 0u8..=0x20 {
            if let Some(et) = ElementType::from_u8(b) {
                assert_eq!(et.code(), b);
            }
        }
        assert_eq!(ElementType::from_u8(0x0f), None);
    }

    #[test]
    fn test_element_sizes() {
        assert_eq!(ElementType::I4.size(8), 4);
        assert_eq!(ElementType::I.size(8), 8);
        assert_eq!(ElementType::I.size(4), 4);
        assert_eq!(ElementType::Char.size(8), 2);
        assert_eq!(ElementType::TypedByRef.size(8), 16);
    }

    #[test]
    fn test_spec_identity_is_structural() {
        let m = ModuleId::new(1);
        let list = TypeSpec::Def {
            module: m,
            row: 7,
            args: vec![TypeSpec::Primitive(ElementType::I4)],
        };
        let list2 = TypeSpec::Def {
            module: m,
            row: 7,
            args: vec![TypeSpec::Primitive(ElementType::I4)],
        };
        let list_str = TypeSpec::Def {
            module: m,
            row: 7,
            args: vec![TypeSpec::Primitive(ElementType::String)],
        };

        let mut set = FxHashSet::default();
        set.insert(list.clone());
        assert!(set.contains(&list2));
        assert!(!set.contains(&list_str));

        let a = MethodSpec::def(list.clone(), m, 3);
        let b = MethodSpec::def(list2, m, 3);
        assert_eq!(a, b);
        assert_ne!(a, MethodSpec::def(list_str, m, 3));
    }

    #[test]
    fn test_substitute() {
        let m = ModuleId::new(0);
        let open = TypeSpec::Def {
            module: m,
            row: 2,
            args: vec![TypeSpec::Var(0), TypeSpec::MVar(0).sz_array()],
        };
        assert!(open.is_open());

        let closed = open.substitute(
            &[TypeSpec::Primitive(ElementType::I8)],
            &[TypeSpec::Primitive(ElementType::U1)],
        );
        assert!(!closed.is_open());
        assert_eq!(
            closed.generic_args(),
            &[
                TypeSpec::Primitive(ElementType::I8),
                TypeSpec::Primitive(ElementType::U1).sz_array()
            ]
        );
    }

    #[test]
    fn test_module_of_composite_types() {
        let m = ModuleId::new(4);
        let t = TypeSpec::def(m, 1).sz_array().managed_ptr();
        assert_eq!(t.module(), Some(m));
        assert_eq!(TypeSpec::Primitive(ElementType::I4).module(), None);
    }
}
