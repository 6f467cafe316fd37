//! Object and type layout
//!
//! [`TargetLayout`] is the table of named byte offsets for the runtime's object,
//! string and array headers. [`Layout`] combines it with metadata to compute
//! type sizes, field offsets and vtable slot positions.

pub mod statics;
pub mod vtable;

use serde::{Deserialize, Serialize};

use crate::metadata::{
    method_signature, ElementType, FieldSpec, MetadataError, MetadataProvider, MethodSig,
    MethodSpec, TypeKind, TypeSpec,
};

/// Number of pointer-sized header slots at the start of every vtable
/// (type info, interface map, base vtable)
pub const VTABLE_HEADER_SLOTS: u32 = 3;

/// Round `v` up to a multiple of `align` (a power of two)
pub fn align_up(v: u32, align: u32) -> u32 {
    if align <= 1 {
        v
    } else {
        (v + align - 1) & !(align - 1)
    }
}

/// Offsets within every object header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLayout {
    pub vtbl: u32,
    pub lock: u32,
    pub header_size: u32,
}

/// Offsets within a string object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringLayout {
    /// Character count, 4 bytes
    pub length: u32,
    /// First UTF-16 code unit
    pub start_char: u32,
}

/// Offsets within an array object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayLayout {
    pub vtbl: u32,
    pub lock: u32,
    pub elem_type_vtbl: u32,
    /// Pointer to `rank` 4-byte lower bounds
    pub lobounds: u32,
    /// Pointer to `rank` 4-byte extents
    pub sizes: u32,
    /// Pointer to the element data
    pub data: u32,
    /// Element size in bytes, 4 bytes
    pub elem_size: u32,
    /// Rank, 4 bytes
    pub rank: u32,
    /// Total element count, 4 bytes
    pub inner_array_length: u32,
    pub object_size: u32,
}

/// Named field offsets of runtime objects for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLayout {
    pub pointer_size: u32,
    pub object: ObjectLayout,
    pub string: StringLayout,
    pub array: ArrayLayout,
}

impl TargetLayout {
    /// Layout for a target with the given pointer size
    pub fn new(pointer_size: u32) -> Self {
        let p = pointer_size;
        let object = ObjectLayout {
            vtbl: 0,
            lock: p,
            header_size: 2 * p,
        };
        let string = StringLayout {
            length: object.header_size,
            start_char: object.header_size + 4,
        };
        let array = ArrayLayout {
            vtbl: 0,
            lock: p,
            elem_type_vtbl: 2 * p,
            lobounds: 3 * p,
            sizes: 4 * p,
            data: 5 * p,
            elem_size: 6 * p,
            rank: 6 * p + 4,
            inner_array_length: 6 * p + 8,
            object_size: align_up(6 * p + 12, p),
        };
        Self {
            pointer_size,
            object,
            string,
            array,
        }
    }
}

/// A virtual method slot
#[derive(Debug, Clone)]
pub struct VirtualSlot {
    pub name: String,
    pub sig: MethodSig,
    /// Most derived implementation; `None` when abstract
    pub implementation: Option<MethodSpec>,
}

/// Layout queries over metadata for one target
#[derive(Clone, Copy)]
pub struct Layout<'a> {
    pub md: &'a dyn MetadataProvider,
    pub target: &'a TargetLayout,
}

impl<'a> Layout<'a> {
    /// Create a layout view
    pub fn new(md: &'a dyn MetadataProvider, target: &'a TargetLayout) -> Self {
        Self { md, target }
    }

    /// Pointer size of the target
    pub fn pointer_size(&self) -> u32 {
        self.target.pointer_size
    }

    /// Category of a type definition instance, `None` for non-definition types
    pub fn def_kind(&self, ts: &TypeSpec) -> Result<Option<TypeKind>, MetadataError> {
        match ts {
            TypeSpec::Def { module, row, .. } => Ok(Some(self.md.type_def(*module, *row)?.kind)),
            _ => Ok(None),
        }
    }

    /// Whether values of the type are stored inline rather than by reference
    pub fn is_value_type(&self, ts: &TypeSpec) -> Result<bool, MetadataError> {
        Ok(match ts {
            TypeSpec::Primitive(et) => !matches!(et, ElementType::String | ElementType::Object),
            TypeSpec::Def { .. } => matches!(
                self.def_kind(ts)?,
                Some(TypeKind::ValueType) | Some(TypeKind::Enum(_))
            ),
            TypeSpec::SzArray(_) | TypeSpec::Array(_) => false,
            TypeSpec::ManagedPtr(_) | TypeSpec::Ptr(_) => true,
            TypeSpec::Var(_) | TypeSpec::MVar(_) => false,
        })
    }

    /// Whether the type is a value type other than a primitive, pointer or enum
    pub fn is_struct(&self, ts: &TypeSpec) -> Result<bool, MetadataError> {
        Ok(matches!(self.def_kind(ts)?, Some(TypeKind::ValueType)))
    }

    /// Underlying primitive of an enum type
    pub fn enum_underlying(&self, ts: &TypeSpec) -> Result<Option<ElementType>, MetadataError> {
        Ok(match self.def_kind(ts)? {
            Some(TypeKind::Enum(et)) => Some(et),
            _ => None,
        })
    }

    /// Size of a value of this type when stored in a local, field or array element
    pub fn type_size(&self, ts: &TypeSpec) -> Result<u32, MetadataError> {
        let p = self.pointer_size();
        match ts {
            TypeSpec::Primitive(et) => Ok(et.size(p)),
            TypeSpec::Def { module, row, .. } => {
                let info = self.md.type_def(*module, *row)?;
                match info.kind {
                    TypeKind::Enum(et) => Ok(et.size(p)),
                    TypeKind::ValueType => self.instance_size(ts),
                    TypeKind::Class | TypeKind::Interface => Ok(p),
                }
            }
            _ => Ok(p),
        }
    }

    /// Natural alignment of a value of this type
    pub fn type_align(&self, ts: &TypeSpec) -> Result<u32, MetadataError> {
        let size = self.type_size(ts)?.max(1);
        Ok(size.next_power_of_two().min(self.pointer_size()))
    }

    /// Size of the instance data: the object size for reference types, the
    /// field block for value types
    pub fn instance_size(&self, ts: &TypeSpec) -> Result<u32, MetadataError> {
        match ts {
            TypeSpec::SzArray(_) | TypeSpec::Array(_) => Ok(self.target.array.object_size),
            TypeSpec::Primitive(ElementType::String) => Ok(self.target.string.start_char),
            TypeSpec::Primitive(ElementType::Object) => Ok(self.target.object.header_size),
            TypeSpec::Primitive(et) => Ok(et.size(self.pointer_size())),
            TypeSpec::Def { module, row, .. } => {
                let info = self.md.type_def(*module, *row)?;
                let (end, _) = self.layout_fields(ts, false, None)?;
                let size = match info.class_size {
                    Some(cs) => {
                        let base = if self.is_value_type(ts)? {
                            0
                        } else {
                            self.fields_start(ts)?
                        };
                        end.max(base + cs)
                    }
                    None => end,
                };
                if self.is_value_type(ts)? {
                    Ok(size.max(1))
                } else {
                    Ok(size)
                }
            }
            _ => Ok(self.pointer_size()),
        }
    }

    /// Size of the type's static field block
    pub fn static_size(&self, ts: &TypeSpec) -> Result<u32, MetadataError> {
        match ts {
            TypeSpec::Def { .. } => Ok(self.layout_fields(ts, true, None)?.0),
            _ => Ok(0),
        }
    }

    /// Byte offset of a field within the instance (or within the static block for statics)
    pub fn field_offset(&self, fs: &FieldSpec) -> Result<u32, MetadataError> {
        let is_static = self.md.field_def(fs.module, fs.row)?.is_static();
        match self.layout_fields(&fs.owner, is_static, Some(fs.row))?.1 {
            Some(off) => Ok(off),
            None => Err(MetadataError::UnknownField {
                module: fs.module,
                row: fs.row,
            }),
        }
    }

    /// Declared type of a field with the owner's generic arguments substituted
    pub fn field_type(&self, fs: &FieldSpec) -> Result<TypeSpec, MetadataError> {
        let fd = self.md.field_def(fs.module, fs.row)?;
        Ok(fd.ty.substitute(fs.owner.generic_args(), &[]))
    }

    /// Base type with the derived type's generic arguments substituted
    pub fn base_type(&self, ts: &TypeSpec) -> Result<Option<TypeSpec>, MetadataError> {
        match ts {
            TypeSpec::Def { module, row, args } => Ok(self
                .md
                .type_def(*module, *row)?
                .extends
                .as_ref()
                .map(|b| b.substitute(args, &[]))),
            TypeSpec::SzArray(_) | TypeSpec::Array(_) => Ok(self.md.corlib_type("Array")),
            TypeSpec::Primitive(ElementType::Object) => Ok(None),
            TypeSpec::Primitive(et) => {
                Ok(self.md.corlib_type(et.corlib_name()).and_then(|def| {
                    self.base_type(&def).ok().flatten()
                }))
            }
            _ => Ok(None),
        }
    }

    fn fields_start(&self, ts: &TypeSpec) -> Result<u32, MetadataError> {
        if self.is_value_type(ts)? {
            return Ok(0);
        }
        match self.base_type(ts)? {
            Some(base) => self.instance_size(&base),
            None => Ok(self.target.object.header_size),
        }
    }

    /// Sequential layout of instance or static fields; returns the end offset and
    /// the offset of `find` if given
    fn layout_fields(
        &self,
        ts: &TypeSpec,
        statics: bool,
        find: Option<u32>,
    ) -> Result<(u32, Option<u32>), MetadataError> {
        let (module, row, args) = match ts {
            TypeSpec::Def { module, row, args } => (*module, *row, args),
            other => return Err(MetadataError::NotADefinition(other.to_string())),
        };
        let info = self.md.type_def(module, row)?;
        let mut offset = if statics { 0 } else { self.fields_start(ts)? };
        let mut found = None;
        for &frow in &info.fields {
            let fd = self.md.field_def(module, frow)?;
            if fd.is_static() != statics {
                continue;
            }
            let fty = fd.ty.substitute(args, &[]);
            offset = align_up(offset, self.type_align(&fty)?);
            if find == Some(frow) {
                found = Some(offset);
            }
            offset += self.type_size(&fty)?;
        }
        Ok((offset, found))
    }

    /// Virtual method slots of a type, base class slots first
    pub fn virtual_slots(&self, ts: &TypeSpec) -> Result<Vec<VirtualSlot>, MetadataError> {
        let mut slots = match self.base_type(ts)? {
            Some(base) => self.virtual_slots(&base)?,
            None => Vec::new(),
        };
        let (module, row) = match ts {
            TypeSpec::Def { module, row, .. } => (*module, *row),
            _ => return Ok(slots),
        };
        let info = self.md.type_def(module, row)?;
        for &mrow in &info.methods {
            let def = self.md.method_def(module, mrow)?;
            if !def.is_virtual() {
                continue;
            }
            let spec = MethodSpec::def(ts.clone(), module, mrow);
            let sig = method_signature(self.md, &spec)?;
            let implementation = (!def.is_abstract()).then(|| spec.clone());
            let existing = if def.is_new_slot() {
                None
            } else {
                slots
                    .iter_mut()
                    .find(|s| s.name == def.name && s.sig == sig)
            };
            match existing {
                Some(slot) => slot.implementation = implementation,
                None => slots.push(VirtualSlot {
                    name: def.name.clone(),
                    sig,
                    implementation,
                }),
            }
        }
        Ok(slots)
    }

    /// Slot index of a virtual method within its owner's vtable, counting the header slots
    pub fn vtable_slot(&self, ms: &MethodSpec) -> Result<u32, MetadataError> {
        let (module, row) = match ms.method {
            crate::metadata::MethodRef::Def { module, row } => (module, row),
            crate::metadata::MethodRef::Array(_) => {
                return Err(MetadataError::NotADefinition(ms.owner.to_string()))
            }
        };
        let def = self.md.method_def(module, row)?;
        let sig = method_signature(self.md, ms)?;
        let slots = self.virtual_slots(&ms.owner)?;
        slots
            .iter()
            .position(|s| s.name == def.name && s.sig == sig)
            .map(|i| VTABLE_HEADER_SLOTS + i as u32)
            .ok_or(MetadataError::UnknownMethod { module, row })
    }

    /// Interfaces implemented by a type, including those of its base types
    pub fn interfaces(&self, ts: &TypeSpec) -> Result<Vec<TypeSpec>, MetadataError> {
        let mut out = match self.base_type(ts)? {
            Some(base) => self.interfaces(&base)?,
            None => Vec::new(),
        };
        if let TypeSpec::Def { module, row, args } = ts {
            for iface in &self.md.type_def(*module, *row)?.interfaces {
                let iface = iface.substitute(args, &[]);
                if !out.contains(&iface) {
                    out.push(iface);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        InMemoryMetadata, MethodSig, FIELD_STATIC, METHOD_NEWSLOT, METHOD_VIRTUAL,
    };

    #[test]
    fn test_target_layout_64() {
        let l = TargetLayout::new(8);
        assert_eq!(l.object.header_size, 16);
        assert_eq!(l.string.length, 16);
        assert_eq!(l.string.start_char, 20);
        assert_eq!(l.array.data, 40);
        assert_eq!(l.array.elem_size, 48);
        assert_eq!(l.array.rank, 52);
        assert_eq!(l.array.object_size, 64);
    }

    #[test]
    fn test_target_layout_32() {
        let l = TargetLayout::new(4);
        assert_eq!(l.array.data, 20);
        assert_eq!(l.array.object_size, 36);
    }

    #[test]
    fn test_field_offsets() {
        let mut md = InMemoryMetadata::with_corlib();
        let object = md.corlib_type("Object").unwrap();
        let app = md.add_module("app.exe", "app");
        let t = md.add_type(app, "App", "Node", TypeKind::Class, Some(object));
        let a = md.add_field(app, t, "a", TypeSpec::Primitive(ElementType::U1), 0);
        let b = md.add_field(app, t, "b", TypeSpec::Primitive(ElementType::I8), 0);
        let s = md.add_field(app, t, "count", TypeSpec::Primitive(ElementType::I4), FIELD_STATIC);
        let target = TargetLayout::new(8);
        let layout = Layout::new(&md, &target);
        let ts = TypeSpec::def(app, t);
        let off = |row| {
            layout
                .field_offset(&FieldSpec {
                    owner: ts.clone(),
                    module: app,
                    row,
                })
                .unwrap()
        };
        assert_eq!(off(a), 16);
        assert_eq!(off(b), 24);
        assert_eq!(off(s), 0);
        assert_eq!(layout.instance_size(&ts).unwrap(), 32);
        assert_eq!(layout.static_size(&ts).unwrap(), 4);
        assert_eq!(layout.type_size(&ts).unwrap(), 8);
    }

    #[test]
    fn test_value_type_size() {
        let mut md = InMemoryMetadata::with_corlib();
        let app = md.add_module("app.exe", "app");
        let t = md.add_type(app, "App", "Pair", TypeKind::ValueType, None);
        md.add_field(app, t, "x", TypeSpec::Primitive(ElementType::I4), 0);
        md.add_field(app, t, "y", TypeSpec::Primitive(ElementType::I2), 0);
        let target = TargetLayout::new(8);
        let layout = Layout::new(&md, &target);
        let ts = TypeSpec::def(app, t);
        assert!(layout.is_value_type(&ts).unwrap());
        assert_eq!(layout.type_size(&ts).unwrap(), 6);
    }

    #[test]
    fn test_vtable_slots_override_and_newslot() {
        let mut md = InMemoryMetadata::with_corlib();
        let object = md.corlib_type("Object").unwrap();
        let app = md.add_module("app.exe", "app");
        let base = md.add_type(app, "App", "Base", TypeKind::Class, Some(object));
        let sig = MethodSig::new_instance(None, vec![]);
        let f = md.add_method(app, base, "F", METHOD_VIRTUAL | METHOD_NEWSLOT, sig.clone(), None);
        let g = md.add_method(app, base, "G", METHOD_VIRTUAL | METHOD_NEWSLOT, sig.clone(), None);
        let parent = Some(TypeSpec::def(app, base));
        let derived = md.add_type(app, "App", "Derived", TypeKind::Class, parent);
        let g2 = md.add_method(app, derived, "G", METHOD_VIRTUAL, sig.clone(), None);
        let h = md.add_method(app, derived, "H", METHOD_VIRTUAL | METHOD_NEWSLOT, sig, None);

        let target = TargetLayout::new(8);
        let layout = Layout::new(&md, &target);
        let dts = TypeSpec::def(app, derived);
        let slots = layout.virtual_slots(&dts).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[1].implementation.as_ref().unwrap().row(), Some(g2));
        assert_eq!(slots[0].implementation.as_ref().unwrap().row(), Some(f));

        let bts = TypeSpec::def(app, base);
        assert_eq!(layout.vtable_slot(&MethodSpec::def(bts, app, g)).unwrap(), 4);
        assert_eq!(layout.vtable_slot(&MethodSpec::def(dts, app, h)).unwrap(), 5);
    }
}
