//! Computational types and evaluation stack items

use std::fmt;

use crate::layout::Layout;
use crate::metadata::{ElementType, MetadataError, MetadataProvider, TypeKind, TypeSpec};

/// Computational type of a value on the evaluation stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ct {
    Int32,
    Int64,
    /// Native-sized integer (also unmanaged pointers)
    IntPtr,
    /// Floating point, always held at double precision
    Float,
    /// Object reference
    Object,
    /// Managed pointer
    Ref,
    /// Value type instance
    Vt,
    Void,
}

/// Register class a value lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueClass {
    Int,
    Float,
    /// Stored in memory only
    Vt,
}

impl Ct {
    /// Register class of values of this type
    pub fn class(self) -> ValueClass {
        match self {
            Ct::Float => ValueClass::Float,
            Ct::Vt | Ct::Void => ValueClass::Vt,
            _ => ValueClass::Int,
        }
    }

    /// Whether values are pointer-sized integers or references
    pub fn is_pointer_like(self) -> bool {
        matches!(self, Ct::IntPtr | Ct::Object | Ct::Ref)
    }

    /// Size of a stack value of this type; value types use their layout size
    pub fn size(self, pointer_size: u32) -> u32 {
        match self {
            Ct::Int32 => 4,
            Ct::Int64 | Ct::Float => 8,
            Ct::IntPtr | Ct::Object | Ct::Ref => pointer_size,
            Ct::Vt | Ct::Void => 0,
        }
    }

    /// Computational type of a primitive
    pub fn of_element(et: ElementType) -> Ct {
        match et {
            ElementType::Boolean
            | ElementType::Char
            | ElementType::I1
            | ElementType::U1
            | ElementType::I2
            | ElementType::U2
            | ElementType::I4
            | ElementType::U4 => Ct::Int32,
            ElementType::I8 | ElementType::U8 => Ct::Int64,
            ElementType::R4 | ElementType::R8 => Ct::Float,
            ElementType::I | ElementType::U => Ct::IntPtr,
            ElementType::String | ElementType::Object => Ct::Object,
            ElementType::TypedByRef => Ct::Vt,
            ElementType::Void => Ct::Void,
        }
    }

    /// Computational type of values of `ts`
    pub fn of(layout: &Layout<'_>, ts: &TypeSpec) -> Result<Ct, MetadataError> {
        let ts = canonical(layout.md, ts);
        Ok(match &ts {
            TypeSpec::Primitive(et) => Ct::of_element(*et),
            TypeSpec::Def { .. } => match layout.def_kind(&ts)? {
                Some(TypeKind::Enum(et)) => Ct::of_element(et),
                Some(TypeKind::ValueType) => Ct::Vt,
                _ => Ct::Object,
            },
            TypeSpec::SzArray(_) | TypeSpec::Array(_) => Ct::Object,
            TypeSpec::ManagedPtr(_) => Ct::Ref,
            TypeSpec::Ptr(_) => Ct::IntPtr,
            TypeSpec::Var(_) | TypeSpec::MVar(_) => {
                return Err(MetadataError::NotADefinition(ts.to_string()))
            }
        })
    }
}

impl fmt::Display for Ct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ct::Int32 => "int32",
            Ct::Int64 => "int64",
            Ct::IntPtr => "intptr",
            Ct::Float => "F",
            Ct::Object => "O",
            Ct::Ref => "&",
            Ct::Vt => "vt",
            Ct::Void => "void",
        };
        f.write_str(s)
    }
}

const PRIMITIVES: [ElementType; 16] = [
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
    ElementType::String,
    ElementType::Object,
];

/// Map core library definitions of built-in types (`System.Int32`, ...) to
/// their primitive form so that both spellings denote one artifact
pub fn canonical(md: &dyn MetadataProvider, ts: &TypeSpec) -> TypeSpec {
    if let TypeSpec::Def { module, row, args } = ts {
        if *module == md.corlib() && args.is_empty() {
            if let Ok(info) = md.type_def(*module, *row) {
                if info.namespace == "System" {
                    if let Some(et) = PRIMITIVES.iter().find(|et| et.corlib_name() == info.name) {
                        return TypeSpec::Primitive(*et);
                    }
                }
            }
        }
    }
    ts.clone()
}

/// One entry of the evaluation stack
#[derive(Debug, Clone, PartialEq)]
pub struct StackItem {
    /// Static type, when known
    pub ts: Option<TypeSpec>,
    pub ct: Ct,
    /// Size in bytes
    pub size: u32,
    /// Value when it is a known integer constant
    pub constant: Option<i64>,
}

impl StackItem {
    /// Item of a given computational type with no static type
    pub fn of_ct(ct: Ct, pointer_size: u32) -> Self {
        Self {
            ts: None,
            ct,
            size: ct.size(pointer_size),
            constant: None,
        }
    }

    /// Item holding a value of type `ts`
    pub fn of_type(layout: &Layout<'_>, ts: &TypeSpec) -> Result<Self, MetadataError> {
        let ct = Ct::of(layout, ts)?;
        let size = if ct == Ct::Vt {
            layout.type_size(ts)?
        } else {
            ct.size(layout.pointer_size())
        };
        Ok(Self {
            ts: Some(ts.clone()),
            ct,
            size,
            constant: None,
        })
    }

    /// Integer constant item
    pub fn constant(ct: Ct, value: i64, pointer_size: u32) -> Self {
        Self {
            ts: None,
            ct,
            size: ct.size(pointer_size),
            constant: Some(value),
        }
    }

    /// Register class of the item
    pub fn class(&self) -> ValueClass {
        self.ct.class()
    }
}

impl fmt::Display for StackItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ct, self.constant) {
            (_, Some(c)) => write!(f, "{}:{}", self.ct, c),
            (Ct::Vt, None) => write!(f, "vt{}", self.size),
            _ => write!(f, "{}", self.ct),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TargetLayout;
    use crate::metadata::InMemoryMetadata;

    #[test]
    fn test_ct_of_types() {
        let mut md = InMemoryMetadata::with_corlib();
        let app = md.add_module("app.exe", "app");
        let point = md.add_type(app, "App", "Point", TypeKind::ValueType, None);
        md.add_field(app, point, "x", TypeSpec::Primitive(ElementType::I8), 0);
        md.add_field(app, point, "y", TypeSpec::Primitive(ElementType::I8), 0);
        let color = md.add_type(app, "App", "Color", TypeKind::Enum(ElementType::U1), None);
        let target = TargetLayout::new(8);
        let layout = Layout::new(&md, &target);

        assert_eq!(Ct::of(&layout, &TypeSpec::Primitive(ElementType::U2)).unwrap(), Ct::Int32);
        assert_eq!(Ct::of(&layout, &TypeSpec::def(app, point)).unwrap(), Ct::Vt);
        assert_eq!(Ct::of(&layout, &TypeSpec::def(app, color)).unwrap(), Ct::Int32);
        assert_eq!(
            Ct::of(&layout, &TypeSpec::Primitive(ElementType::I4).sz_array()).unwrap(),
            Ct::Object
        );
        assert!(Ct::of(&layout, &TypeSpec::Var(0)).is_err());

        let item = StackItem::of_type(&layout, &TypeSpec::def(app, point)).unwrap();
        assert_eq!(item.size, 16);
        assert_eq!(item.class(), ValueClass::Vt);
    }

    #[test]
    fn test_canonical_primitive_defs() {
        let md = InMemoryMetadata::with_corlib();
        let int32 = md.corlib_type("Int32").unwrap();
        assert_eq!(canonical(&md, &int32), TypeSpec::Primitive(ElementType::I4));
        let array = md.corlib_type("Array").unwrap();
        assert_eq!(canonical(&md, &array), array);
    }
}
