//! Fully specified signatures
//!
//! A fully specified signature is a self-contained encoding of a type, field or
//! method identity: the signature bytes refer to type definitions through an
//! index into an accompanying module list instead of module-local tokens, so a
//! record can be interpreted without knowing which module emitted it.

use super::{
    FieldSpec, MetadataError, MetadataProvider, MethodRef, MethodSpec, ModuleId, TypeKind,
    TypeSpec,
};

/// Signature record kind, stored as the record's leading tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigKind {
    Field = 0,
    Type = 1,
    Method = 2,
}

/// The identity a signature was generated from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigSource {
    Type(TypeSpec),
    Field(FieldSpec),
    Method(MethodSpec),
}

/// A signature plus the modules its bytes refer to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullySpecSignature {
    pub kind: SigKind,
    pub source: SigSource,
    pub modules: Vec<ModuleId>,
    pub bytes: Vec<u8>,
}

impl FullySpecSignature {
    /// Signature of a type
    pub fn for_type(md: &dyn MetadataProvider, ts: &TypeSpec) -> Result<Self, MetadataError> {
        let mut w = SigWriter::new(md);
        w.write_type(ts)?;
        Ok(w.finish(SigKind::Type, SigSource::Type(ts.clone())))
    }

    /// Signature of a field: owner type, then `0x06` and the field type
    pub fn for_field(md: &dyn MetadataProvider, fs: &FieldSpec) -> Result<Self, MetadataError> {
        let mut w = SigWriter::new(md);
        w.write_type(&fs.owner)?;
        let fd = md.field_def(fs.module, fs.row)?;
        w.bytes.push(0x06);
        w.write_type(&fd.ty.substitute(fs.owner.generic_args(), &[]))?;
        Ok(w.finish(SigKind::Field, SigSource::Field(fs.clone())))
    }

    /// Signature of a method: owner type, method row, then the method signature
    pub fn for_method(md: &dyn MetadataProvider, ms: &MethodSpec) -> Result<Self, MetadataError> {
        let mut w = SigWriter::new(md);
        w.write_type(&ms.owner)?;
        match ms.method {
            MethodRef::Def { module, row } => {
                let def = md.method_def(module, row)?;
                let sig = def.sig.substitute(ms.owner.generic_args(), &ms.args);
                write_compressed(&mut w.bytes, row);
                let mut cc = 0u8;
                if sig.has_this {
                    cc |= 0x20;
                }
                if !ms.args.is_empty() {
                    cc |= 0x10;
                }
                w.bytes.push(cc);
                if !ms.args.is_empty() {
                    write_compressed(&mut w.bytes, ms.args.len() as u32);
                }
                write_compressed(&mut w.bytes, sig.params.len() as u32);
                match &sig.ret {
                    Some(r) => w.write_type(r)?,
                    None => w.bytes.push(0x01),
                }
                for p in &sig.params {
                    w.write_type(p)?;
                }
            }
            MethodRef::Array(accessor) => {
                write_compressed(&mut w.bytes, 0);
                w.bytes.push(0x20);
                w.bytes.extend_from_slice(accessor.name().as_bytes());
            }
        }
        Ok(w.finish(SigKind::Method, SigSource::Method(ms.clone())))
    }
}

struct SigWriter<'a> {
    md: &'a dyn MetadataProvider,
    bytes: Vec<u8>,
    modules: Vec<ModuleId>,
}

impl<'a> SigWriter<'a> {
    fn new(md: &'a dyn MetadataProvider) -> Self {
        Self {
            md,
            bytes: Vec::new(),
            modules: Vec::new(),
        }
    }

    fn module_index(&mut self, module: ModuleId) -> u32 {
        match self.modules.iter().position(|m| *m == module) {
            Some(i) => i as u32,
            None => {
                self.modules.push(module);
                self.modules.len() as u32 - 1
            }
        }
    }

    fn write_type(&mut self, ts: &TypeSpec) -> Result<(), MetadataError> {
        match ts {
            TypeSpec::Primitive(et) => self.bytes.push(et.code()),
            TypeSpec::Def { module, row, args } => {
                if !args.is_empty() {
                    self.bytes.push(0x15);
                }
                let info = self.md.type_def(*module, *row)?;
                match info.kind {
                    TypeKind::ValueType | TypeKind::Enum(_) => self.bytes.push(0x31),
                    TypeKind::Class | TypeKind::Interface => self.bytes.push(0x32),
                }
                let idx = self.module_index(*module);
                write_compressed(&mut self.bytes, idx);
                // TypeDefOrRef coded index, TypeDef tag 0
                write_compressed(&mut self.bytes, row << 2);
                if !args.is_empty() {
                    write_compressed(&mut self.bytes, args.len() as u32);
                    for a in args {
                        self.write_type(a)?;
                    }
                }
            }
            TypeSpec::SzArray(e) => {
                self.bytes.push(0x1d);
                self.write_type(e)?;
            }
            TypeSpec::Array(shape) => {
                self.bytes.push(0x14);
                self.write_type(&shape.elem)?;
                write_compressed(&mut self.bytes, shape.rank);
                write_compressed(&mut self.bytes, shape.sizes.len() as u32);
                for s in &shape.sizes {
                    write_compressed(&mut self.bytes, *s);
                }
                write_compressed(&mut self.bytes, shape.lobounds.len() as u32);
                for lb in &shape.lobounds {
                    write_compressed_signed(&mut self.bytes, *lb);
                }
            }
            TypeSpec::ManagedPtr(e) => {
                self.bytes.push(0x10);
                self.write_type(e)?;
            }
            TypeSpec::Ptr(e) => {
                self.bytes.push(0x0f);
                self.write_type(e)?;
            }
            TypeSpec::Var(i) => {
                self.bytes.push(0x13);
                write_compressed(&mut self.bytes, *i);
            }
            TypeSpec::MVar(i) => {
                self.bytes.push(0x1e);
                write_compressed(&mut self.bytes, *i);
            }
        }
        Ok(())
    }

    fn finish(self, kind: SigKind, source: SigSource) -> FullySpecSignature {
        FullySpecSignature {
            kind,
            source,
            modules: self.modules,
            bytes: self.bytes,
        }
    }
}

/// Append an ECMA-335 compressed unsigned integer
pub fn write_compressed(out: &mut Vec<u8>, v: u32) {
    if v < 0x80 {
        out.push(v as u8);
    } else if v < 0x4000 {
        out.extend_from_slice(&((v as u16) | 0x8000).to_be_bytes());
    } else {
        out.extend_from_slice(&(v | 0xc000_0000).to_be_bytes());
    }
}

/// Append an ECMA-335 compressed signed integer (sign bit rotated into bit 0)
pub fn write_compressed_signed(out: &mut Vec<u8>, v: i32) {
    let x = v as u32;
    if (-64..64).contains(&v) {
        let x = x & 0x7f;
        out.push((((x << 1) & 0x7f) | (x >> 6)) as u8);
    } else if (-8192..8192).contains(&v) {
        let x = x & 0x3fff;
        let rot = ((x << 1) & 0x3fff) | (x >> 13);
        out.extend_from_slice(&((rot as u16) | 0x8000).to_be_bytes());
    } else {
        let x = x & 0x1fff_ffff;
        let rot = ((x << 1) & 0x1fff_ffff) | (x >> 28);
        out.extend_from_slice(&(rot | 0xc000_0000).to_be_bytes());
    }
}

/// Read an ECMA-335 compressed unsigned integer
pub fn read_compressed(data: &[u8], pos: &mut usize) -> Option<u32> {
    let b0 = *data.get(*pos)?;
    if b0 & 0x80 == 0 {
        *pos += 1;
        Some(b0 as u32)
    } else if b0 & 0xc0 == 0x80 {
        let b1 = *data.get(*pos + 1)?;
        *pos += 2;
        Some((((b0 & 0x3f) as u32) << 8) | b1 as u32)
    } else {
        let b = data.get(*pos..*pos + 4)?;
        *pos += 4;
        Some(u32::from_be_bytes([b[0] & 0x1f, b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ElementType, InMemoryMetadata, MethodSig};

    #[test]
    fn test_compressed_encoding() {
        let mut out = Vec::new();
        write_compressed(&mut out, 0x03);
        write_compressed(&mut out, 0x80);
        write_compressed(&mut out, 0x2e57);
        write_compressed(&mut out, 0x4000);
        assert_eq!(
            out,
            vec![0x03, 0x80, 0x80, 0xae, 0x57, 0xc0, 0x00, 0x40, 0x00]
        );

        let mut pos = 0;
        assert_eq!(read_compressed(&out, &mut pos), Some(0x03));
        assert_eq!(read_compressed(&out, &mut pos), Some(0x80));
        assert_eq!(read_compressed(&out, &mut pos), Some(0x2e57));
        assert_eq!(read_compressed(&out, &mut pos), Some(0x4000));
        assert_eq!(read_compressed(&out, &mut pos), None);
    }

    #[test]
    fn test_compressed_signed_examples() {
        // Examples from ECMA-335 II.23.2
        let cases: &[(i32, &[u8])] = &[
            (3, &[0x06]),
            (-3, &[0x7b]),
            (64, &[0x80, 0x80]),
            (-64, &[0x01]),
            (8192, &[0xc0, 0x00, 0x40, 0x00]),
            (-8192, &[0x80, 0x01]),
        ];
        for (v, expected) in cases {
            let mut out = Vec::new();
            write_compressed_signed(&mut out, *v);
            assert_eq!(&out[..], *expected, "value {}", v);
        }
    }

    #[test]
    fn test_type_signature_module_list() {
        let mut md = InMemoryMetadata::with_corlib();
        let app = md.add_module("app.exe", "app");
        let point = md.add_type(app, "App", "Point", TypeKind::ValueType, None);
        let list = md.add_type(app, "App", "List`1", TypeKind::Class, None);

        let ts = TypeSpec::Def {
            module: app,
            row: list,
            args: vec![TypeSpec::def(app, point)],
        };
        let sig = FullySpecSignature::for_type(&md, &ts).unwrap();
        assert_eq!(sig.kind, SigKind::Type);
        assert_eq!(sig.modules, vec![app]);
        assert_eq!(
            sig.bytes,
            vec![0x15, 0x32, 0x00, (list << 2) as u8, 0x01, 0x31, 0x00, (point << 2) as u8]
        );

        let arr = TypeSpec::Primitive(ElementType::I4).sz_array();
        let sig = FullySpecSignature::for_type(&md, &arr).unwrap();
        assert!(sig.modules.is_empty());
        assert_eq!(sig.bytes, vec![0x1d, 0x08]);
    }

    #[test]
    fn test_method_signature() {
        let mut md = InMemoryMetadata::with_corlib();
        let app = md.add_module("app.exe", "app");
        let t = md.add_type(app, "App", "Program", TypeKind::Class, None);
        let sig = MethodSig::new_static(
            Some(TypeSpec::Primitive(ElementType::I4)),
            vec![TypeSpec::Primitive(ElementType::I8)],
        );
        let row = md.add_method(app, t, "F", 0x10, sig, None);
        let ms = MethodSpec::def(TypeSpec::def(app, t), app, row);
        let fss = FullySpecSignature::for_method(&md, &ms).unwrap();
        assert_eq!(fss.kind, SigKind::Method);
        assert_eq!(&fss.bytes[fss.bytes.len() - 4..], &[0x00, 0x01, 0x08, 0x0a]);
    }
}
