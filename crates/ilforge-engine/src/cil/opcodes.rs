//! Bytecode opcodes
//!
//! One-byte opcodes use their byte as discriminant; two-byte opcodes (prefix
//! `0xfe`) use `0xfe00 | second byte`.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

/// Inline operand format following an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// 8-bit local or argument index
    ShortVar,
    /// 16-bit local or argument index
    Var,
    /// Signed 8-bit integer
    ShortI,
    I32,
    I64,
    R4,
    R8,
    /// Metadata token
    Token,
    /// Signed 8-bit branch displacement
    ShortBranch,
    /// Signed 32-bit branch displacement
    Branch,
    /// Count followed by that many 32-bit displacements
    Switch,
}

macro_rules! opcodes {
    ($($variant:ident = $code:expr, $name:expr, $operand:ident;)*) => {
        /// Bytecode opcode
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($variant = $code,)*
        }

        static TABLE: &[(Opcode, &str, OperandKind)] = &[
            $((Opcode::$variant, $name, OperandKind::$operand),)*
        ];
    };
}

opcodes! {
    Nop = 0x00, "nop", None;
    Ldarg0 = 0x02, "ldarg.0", None;
    Ldarg1 = 0x03, "ldarg.1", None;
    Ldarg2 = 0x04, "ldarg.2", None;
    Ldarg3 = 0x05, "ldarg.3", None;
    Ldloc0 = 0x06, "ldloc.0", None;
    Ldloc1 = 0x07, "ldloc.1", None;
    Ldloc2 = 0x08, "ldloc.2", None;
    Ldloc3 = 0x09, "ldloc.3", None;
    Stloc0 = 0x0a, "stloc.0", None;
    Stloc1 = 0x0b, "stloc.1", None;
    Stloc2 = 0x0c, "stloc.2", None;
    Stloc3 = 0x0d, "stloc.3", None;
    LdargS = 0x0e, "ldarg.s", ShortVar;
    LdargaS = 0x0f, "ldarga.s", ShortVar;
    StargS = 0x10, "starg.s", ShortVar;
    LdlocS = 0x11, "ldloc.s", ShortVar;
    LdlocaS = 0x12, "ldloca.s", ShortVar;
    StlocS = 0x13, "stloc.s", ShortVar;
    Ldnull = 0x14, "ldnull", None;
    LdcI4M1 = 0x15, "ldc.i4.m1", None;
    LdcI40 = 0x16, "ldc.i4.0", None;
    LdcI41 = 0x17, "ldc.i4.1", None;
    LdcI42 = 0x18, "ldc.i4.2", None;
    LdcI43 = 0x19, "ldc.i4.3", None;
    LdcI44 = 0x1a, "ldc.i4.4", None;
    LdcI45 = 0x1b, "ldc.i4.5", None;
    LdcI46 = 0x1c, "ldc.i4.6", None;
    LdcI47 = 0x1d, "ldc.i4.7", None;
    LdcI48 = 0x1e, "ldc.i4.8", None;
    LdcI4S = 0x1f, "ldc.i4.s", ShortI;
    LdcI4 = 0x20, "ldc.i4", I32;
    LdcI8 = 0x21, "ldc.i8", I64;
    LdcR4 = 0x22, "ldc.r4", R4;
    LdcR8 = 0x23, "ldc.r8", R8;
    Dup = 0x25, "dup", None;
    Pop = 0x26, "pop", None;
    Call = 0x28, "call", Token;
    Calli = 0x29, "calli", Token;
    Ret = 0x2a, "ret", None;
    BrS = 0x2b, "br.s", ShortBranch;
    BrfalseS = 0x2c, "brfalse.s", ShortBranch;
    BrtrueS = 0x2d, "brtrue.s", ShortBranch;
    BeqS = 0x2e, "beq.s", ShortBranch;
    BgeS = 0x2f, "bge.s", ShortBranch;
    BgtS = 0x30, "bgt.s", ShortBranch;
    BleS = 0x31, "ble.s", ShortBranch;
    BltS = 0x32, "blt.s", ShortBranch;
    BneUnS = 0x33, "bne.un.s", ShortBranch;
    BgeUnS = 0x34, "bge.un.s", ShortBranch;
    BgtUnS = 0x35, "bgt.un.s", ShortBranch;
    BleUnS = 0x36, "ble.un.s", ShortBranch;
    BltUnS = 0x37, "blt.un.s", ShortBranch;
    Br = 0x38, "br", Branch;
    Brfalse = 0x39, "brfalse", Branch;
    Brtrue = 0x3a, "brtrue", Branch;
    Beq = 0x3b, "beq", Branch;
    Bge = 0x3c, "bge", Branch;
    Bgt = 0x3d, "bgt", Branch;
    Ble = 0x3e, "ble", Branch;
    Blt = 0x3f, "blt", Branch;
    BneUn = 0x40, "bne.un", Branch;
    BgeUn = 0x41, "bge.un", Branch;
    BgtUn = 0x42, "bgt.un", Branch;
    BleUn = 0x43, "ble.un", Branch;
    BltUn = 0x44, "blt.un", Branch;
    Switch = 0x45, "switch", Switch;
    LdindI1 = 0x46, "ldind.i1", None;
    LdindU1 = 0x47, "ldind.u1", None;
    LdindI2 = 0x48, "ldind.i2", None;
    LdindU2 = 0x49, "ldind.u2", None;
    LdindI4 = 0x4a, "ldind.i4", None;
    LdindU4 = 0x4b, "ldind.u4", None;
    LdindI8 = 0x4c, "ldind.i8", None;
    LdindI = 0x4d, "ldind.i", None;
    LdindR4 = 0x4e, "ldind.r4", None;
    LdindR8 = 0x4f, "ldind.r8", None;
    LdindRef = 0x50, "ldind.ref", None;
    StindRef = 0x51, "stind.ref", None;
    StindI1 = 0x52, "stind.i1", None;
    StindI2 = 0x53, "stind.i2", None;
    StindI4 = 0x54, "stind.i4", None;
    StindI8 = 0x55, "stind.i8", None;
    StindR4 = 0x56, "stind.r4", None;
    StindR8 = 0x57, "stind.r8", None;
    Add = 0x58, "add", None;
    Sub = 0x59, "sub", None;
    Mul = 0x5a, "mul", None;
    Div = 0x5b, "div", None;
    DivUn = 0x5c, "div.un", None;
    Rem = 0x5d, "rem", None;
    RemUn = 0x5e, "rem.un", None;
    And = 0x5f, "and", None;
    Or = 0x60, "or", None;
    Xor = 0x61, "xor", None;
    Shl = 0x62, "shl", None;
    Shr = 0x63, "shr", None;
    ShrUn = 0x64, "shr.un", None;
    Neg = 0x65, "neg", None;
    Not = 0x66, "not", None;
    ConvI1 = 0x67, "conv.i1", None;
    ConvI2 = 0x68, "conv.i2", None;
    ConvI4 = 0x69, "conv.i4", None;
    ConvI8 = 0x6a, "conv.i8", None;
    ConvR4 = 0x6b, "conv.r4", None;
    ConvR8 = 0x6c, "conv.r8", None;
    ConvU4 = 0x6d, "conv.u4", None;
    ConvU8 = 0x6e, "conv.u8", None;
    Callvirt = 0x6f, "callvirt", Token;
    Ldobj = 0x71, "ldobj", Token;
    Ldstr = 0x72, "ldstr", Token;
    Newobj = 0x73, "newobj", Token;
    Castclass = 0x74, "castclass", Token;
    Isinst = 0x75, "isinst", Token;
    ConvRUn = 0x76, "conv.r.un", None;
    Throw = 0x7a, "throw", None;
    Ldfld = 0x7b, "ldfld", Token;
    Ldflda = 0x7c, "ldflda", Token;
    Stfld = 0x7d, "stfld", Token;
    Ldsfld = 0x7e, "ldsfld", Token;
    Ldsflda = 0x7f, "ldsflda", Token;
    Stsfld = 0x80, "stsfld", Token;
    Stobj = 0x81, "stobj", Token;
    ConvOvfI1Un = 0x82, "conv.ovf.i1.un", None;
    ConvOvfI2Un = 0x83, "conv.ovf.i2.un", None;
    ConvOvfI4Un = 0x84, "conv.ovf.i4.un", None;
    ConvOvfI8Un = 0x85, "conv.ovf.i8.un", None;
    ConvOvfU1Un = 0x86, "conv.ovf.u1.un", None;
    ConvOvfU2Un = 0x87, "conv.ovf.u2.un", None;
    ConvOvfU4Un = 0x88, "conv.ovf.u4.un", None;
    ConvOvfU8Un = 0x89, "conv.ovf.u8.un", None;
    ConvOvfIUn = 0x8a, "conv.ovf.i.un", None;
    ConvOvfUUn = 0x8b, "conv.ovf.u.un", None;
    Newarr = 0x8d, "newarr", Token;
    Ldlen = 0x8e, "ldlen", None;
    Ldelema = 0x8f, "ldelema", Token;
    LdelemI1 = 0x90, "ldelem.i1", None;
    LdelemU1 = 0x91, "ldelem.u1", None;
    LdelemI2 = 0x92, "ldelem.i2", None;
    LdelemU2 = 0x93, "ldelem.u2", None;
    LdelemI4 = 0x94, "ldelem.i4", None;
    LdelemU4 = 0x95, "ldelem.u4", None;
    LdelemI8 = 0x96, "ldelem.i8", None;
    LdelemI = 0x97, "ldelem.i", None;
    LdelemR4 = 0x98, "ldelem.r4", None;
    LdelemR8 = 0x99, "ldelem.r8", None;
    LdelemRef = 0x9a, "ldelem.ref", None;
    StelemI = 0x9b, "stelem.i", None;
    StelemI1 = 0x9c, "stelem.i1", None;
    StelemI2 = 0x9d, "stelem.i2", None;
    StelemI4 = 0x9e, "stelem.i4", None;
    StelemI8 = 0x9f, "stelem.i8", None;
    StelemR4 = 0xa0, "stelem.r4", None;
    StelemR8 = 0xa1, "stelem.r8", None;
    StelemRef = 0xa2, "stelem.ref", None;
    Ldelem = 0xa3, "ldelem", Token;
    Stelem = 0xa4, "stelem", Token;
    ConvOvfI1 = 0xb3, "conv.ovf.i1", None;
    ConvOvfU1 = 0xb4, "conv.ovf.u1", None;
    ConvOvfI2 = 0xb5, "conv.ovf.i2", None;
    ConvOvfU2 = 0xb6, "conv.ovf.u2", None;
    ConvOvfI4 = 0xb7, "conv.ovf.i4", None;
    ConvOvfU4 = 0xb8, "conv.ovf.u4", None;
    ConvOvfI8 = 0xb9, "conv.ovf.i8", None;
    ConvOvfU8 = 0xba, "conv.ovf.u8", None;
    Ldtoken = 0xd0, "ldtoken", Token;
    ConvU2 = 0xd1, "conv.u2", None;
    ConvU1 = 0xd2, "conv.u1", None;
    ConvI = 0xd3, "conv.i", None;
    ConvOvfI = 0xd4, "conv.ovf.i", None;
    ConvOvfU = 0xd5, "conv.ovf.u", None;
    AddOvf = 0xd6, "add.ovf", None;
    AddOvfUn = 0xd7, "add.ovf.un", None;
    MulOvf = 0xd8, "mul.ovf", None;
    MulOvfUn = 0xd9, "mul.ovf.un", None;
    SubOvf = 0xda, "sub.ovf", None;
    SubOvfUn = 0xdb, "sub.ovf.un", None;
    Endfinally = 0xdc, "endfinally", None;
    Leave = 0xdd, "leave", Branch;
    LeaveS = 0xde, "leave.s", ShortBranch;
    StindI = 0xdf, "stind.i", None;
    ConvU = 0xe0, "conv.u", None;
    Ceq = 0xfe01, "ceq", None;
    Cgt = 0xfe02, "cgt", None;
    CgtUn = 0xfe03, "cgt.un", None;
    Clt = 0xfe04, "clt", None;
    CltUn = 0xfe05, "clt.un", None;
    Ldftn = 0xfe06, "ldftn", Token;
    Ldarg = 0xfe09, "ldarg", Var;
    Ldarga = 0xfe0a, "ldarga", Var;
    Starg = 0xfe0b, "starg", Var;
    Ldloc = 0xfe0c, "ldloc", Var;
    Ldloca = 0xfe0d, "ldloca", Var;
    Stloc = 0xfe0e, "stloc", Var;
    Localloc = 0xfe0f, "localloc", None;
    Endfilter = 0xfe11, "endfilter", None;
    Initobj = 0xfe15, "initobj", Token;
    Rethrow = 0xfe1a, "rethrow", None;
    Sizeof = 0xfe1c, "sizeof", Token;
}

/// Prefix byte of two-byte opcodes
pub const PREFIX: u8 = 0xfe;

/// Whether `value` is an instruction of the bytecode set at all, supported or not
pub fn is_defined(value: u16) -> bool {
    match value {
        0x00..=0x23 | 0x25..=0x76 | 0x79..=0xa5 | 0xb3..=0xba => true,
        0xc2..=0xc3 | 0xc6 | 0xd0..=0xe0 => true,
        0xfe00..=0xfe07 | 0xfe09..=0xfe0f | 0xfe11..=0xfe1a | 0xfe1c..=0xfe1e => true,
        _ => false,
    }
}

static INDEX: Lazy<FxHashMap<u16, usize>> = Lazy::new(|| {
    TABLE
        .iter()
        .enumerate()
        .map(|(i, (op, _, _))| (*op as u16, i))
        .collect()
});

impl Opcode {
    /// Look up an opcode by its (possibly prefixed) value
    pub fn from_u16(value: u16) -> Option<Self> {
        INDEX.get(&value).map(|&i| TABLE[i].0)
    }

    /// Opcode value
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    fn entry(self) -> &'static (Opcode, &'static str, OperandKind) {
        &TABLE[INDEX[&(self as u16)]]
    }

    /// Mnemonic
    pub fn name(self) -> &'static str {
        self.entry().1
    }

    /// Inline operand format
    pub fn operand_kind(self) -> OperandKind {
        self.entry().2
    }

    /// Encoded length of the opcode itself
    pub fn encoded_len(self) -> u32 {
        if (self as u16) > 0xff {
            2
        } else {
            1
        }
    }

    /// Whether execution never falls through to the next instruction
    pub fn is_unconditional_transfer(self) -> bool {
        matches!(
            self,
            Self::Br
                | Self::BrS
                | Self::Ret
                | Self::Throw
                | Self::Rethrow
                | Self::Leave
                | Self::LeaveS
                | Self::Endfinally
                | Self::Endfilter
        )
    }

    /// Whether the opcode has branch targets
    pub fn is_branch(self) -> bool {
        matches!(
            self.operand_kind(),
            OperandKind::Branch | OperandKind::ShortBranch | OperandKind::Switch
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for (op, _, _) in TABLE {
            assert_eq!(Opcode::from_u16(op.to_u16()), Some(*op), "{}", op.name());
        }
    }

    #[test]
    fn test_unknown_opcodes() {
        assert_eq!(Opcode::from_u16(0x01), None);
        assert_eq!(Opcode::from_u16(0x8c), None);
        assert_eq!(Opcode::from_u16(0xfe00), None);
    }

    #[test]
    fn test_names_and_operands() {
        assert_eq!(Opcode::LdcI4S.name(), "ldc.i4.s");
        assert_eq!(Opcode::LdcI4S.operand_kind(), OperandKind::ShortI);
        assert_eq!(Opcode::Ceq.encoded_len(), 2);
        assert_eq!(Opcode::Switch.operand_kind(), OperandKind::Switch);
        assert!(Opcode::LeaveS.is_branch());
        assert!(Opcode::LeaveS.is_unconditional_transfer());
        assert!(!Opcode::Brtrue.is_unconditional_transfer());
    }
}
