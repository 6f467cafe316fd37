//! Symbol name mangling
//!
//! Every emitted artifact gets a symbol derived from its identity with an
//! Itanium-like scheme:
//!
//! ```text
//! symbol      := "_Z" type object | "_M" name | "_A" name
//! type        := "N" name name name [generic] | predefined | "u1Z" type
//!              | "u1A" type rank "_" count "_" {size "_"} count "_" {lobound "_"}
//!              | "P" type | "R" type | "_T" n | "_U" n
//! generic     := "_G" count type*
//! object      := "" (vtable) | "S" (statics) | method | "MI" method | "FI" name | "EH" method
//! method      := "M_" flags "_" name [generic] "_R" (type | "v") "_P" count type*
//! name        := len escaped
//! ```
//!
//! Characters outside `[A-Za-z0-9_]` are escaped as `#XX`.

use std::fmt::Write;

use crate::metadata::{
    method_signature, ElementType, FieldSpec, MetadataError, MetadataProvider,
    MethodRef, MethodSpec, ModuleId, TypeSpec,
};

/// Produces symbol names for types, methods and fields
pub struct Mangler<'a> {
    md: &'a dyn MetadataProvider,
}

impl<'a> Mangler<'a> {
    /// Create a mangler reading names from `md`
    pub fn new(md: &'a dyn MetadataProvider) -> Self {
        Self { md }
    }

    /// Symbol of a type; this is also the symbol of its vtable
    pub fn type_name(&self, ts: &TypeSpec) -> Result<String, MetadataError> {
        let mut out = String::from("_Z");
        self.encode_type(ts, &mut out)?;
        Ok(out)
    }

    /// Symbol of a type's static field block
    pub fn static_block(&self, ts: &TypeSpec) -> Result<String, MetadataError> {
        let mut out = self.type_name(ts)?;
        out.push('S');
        Ok(out)
    }

    /// Symbol of a method's code
    pub fn method(&self, ms: &MethodSpec) -> Result<String, MetadataError> {
        let mut out = self.type_name(&ms.owner)?;
        self.encode_method(ms, &mut out)?;
        Ok(out)
    }

    /// Symbol of a method info record
    pub fn method_info(&self, ms: &MethodSpec) -> Result<String, MetadataError> {
        let mut out = self.type_name(&ms.owner)?;
        out.push_str("MI");
        self.encode_method(ms, &mut out)?;
        Ok(out)
    }

    /// Symbol of a method's exception handler table
    pub fn eh_table(&self, ms: &MethodSpec) -> Result<String, MetadataError> {
        let mut out = self.type_name(&ms.owner)?;
        out.push_str("EH");
        self.encode_method(ms, &mut out)?;
        Ok(out)
    }

    /// Symbol of a field info record
    pub fn field_info(&self, fs: &FieldSpec) -> Result<String, MetadataError> {
        let mut out = self.type_name(&fs.owner)?;
        out.push_str("FI");
        let fd = self.md.field_def(fs.module, fs.row)?;
        push_name(&mut out, &fd.name);
        Ok(out)
    }

    /// Symbol of a module info record
    pub fn module_info(&self, module: ModuleId) -> Result<String, MetadataError> {
        let mut out = String::from("_M");
        push_name(&mut out, self.md.module_name(module)?);
        Ok(out)
    }

    /// Symbol of an assembly info record (the embedded assembly image)
    pub fn assembly_info(&self, module: ModuleId) -> Result<String, MetadataError> {
        let mut out = String::from("_A");
        push_name(&mut out, self.md.assembly_name(module)?);
        Ok(out)
    }

    fn encode_method(&self, ms: &MethodSpec, out: &mut String) -> Result<(), MetadataError> {
        let sig = method_signature(self.md, ms)?;
        let name = match ms.method {
            MethodRef::Def { module, row } => self.md.method_def(module, row)?.name.clone(),
            MethodRef::Array(a) => a.name().to_string(),
        };
        let mut flags = 0u32;
        if sig.has_this {
            flags |= 0x20;
        }
        if !ms.args.is_empty() {
            flags |= 0x10;
        }
        let _ = write!(out, "M_{}_", flags);
        push_name(out, &name);
        self.encode_generic(&ms.args, out)?;
        out.push_str("_R");
        match &sig.ret {
            Some(r) => self.encode_type(r, out)?,
            None => out.push('v'),
        }
        let _ = write!(out, "_P{}", sig.params.len());
        for p in &sig.params {
            self.encode_type(p, out)?;
        }
        Ok(())
    }

    fn encode_generic(&self, args: &[TypeSpec], out: &mut String) -> Result<(), MetadataError> {
        if args.is_empty() {
            return Ok(());
        }
        let _ = write!(out, "_G{}", args.len());
        for a in args {
            self.encode_type(a, out)?;
        }
        Ok(())
    }

    fn encode_type(&self, ts: &TypeSpec, out: &mut String) -> Result<(), MetadataError> {
        match ts {
            TypeSpec::Primitive(et) => out.push_str(predefined(*et)),
            TypeSpec::Def { module, row, args } => {
                let info = self.md.type_def(*module, *row)?;
                out.push('N');
                push_name(out, self.md.module_name(*module)?);
                push_name(out, &info.namespace);
                push_name(out, &info.name);
                self.encode_generic(args, out)?;
            }
            TypeSpec::SzArray(e) => {
                out.push_str("u1Z");
                self.encode_type(e, out)?;
            }
            TypeSpec::Array(shape) => {
                out.push_str("u1A");
                self.encode_type(&shape.elem, out)?;
                let _ = write!(out, "{}_{}_", shape.rank, shape.sizes.len());
                for s in &shape.sizes {
                    let _ = write!(out, "{}_", s);
                }
                let _ = write!(out, "{}_", shape.lobounds.len());
                for lb in &shape.lobounds {
                    if *lb < 0 {
                        let _ = write!(out, "n{}_", lb.unsigned_abs());
                    } else {
                        let _ = write!(out, "{}_", lb);
                    }
                }
            }
            TypeSpec::Ptr(e) => {
                out.push('P');
                self.encode_type(e, out)?;
            }
            TypeSpec::ManagedPtr(e) => {
                out.push('R');
                self.encode_type(e, out)?;
            }
            TypeSpec::Var(i) => {
                let _ = write!(out, "_T{}", i);
            }
            TypeSpec::MVar(i) => {
                let _ = write!(out, "_U{}", i);
            }
        }
        Ok(())
    }
}

fn predefined(et: ElementType) -> &'static str {
    match et {
        ElementType::Void => "v",
        ElementType::Char => "c",
        ElementType::Boolean => "b",
        ElementType::I1 => "a",
        ElementType::U1 => "h",
        ElementType::I2 => "s",
        ElementType::U2 => "t",
        ElementType::I4 => "i",
        ElementType::U4 => "j",
        ElementType::I8 => "x",
        ElementType::U8 => "y",
        ElementType::R4 => "f",
        ElementType::R8 => "d",
        ElementType::I => "u1I",
        ElementType::U => "u1U",
        ElementType::String => "u1S",
        ElementType::Object => "u1O",
        ElementType::TypedByRef => "u1t",
    }
}

/// Escape characters that cannot appear in a symbol
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(out, "#{:02X}", b);
            }
        }
    }
    out
}

fn push_name(out: &mut String, name: &str) {
    let e = escape(name);
    let _ = write!(out, "{}{}", e.len(), e);
}
