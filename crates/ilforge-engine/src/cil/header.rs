//! Method body header and exception clause parsing

use crate::metadata::TypeSpec;

use super::DecodeError;

const TINY_FORMAT: u8 = 0x2;
const FAT_FORMAT: u8 = 0x3;
const FAT_MORE_SECTS: u16 = 0x8;
const FAT_INIT_LOCALS: u16 = 0x10;

const SECT_EH_TABLE: u8 = 0x1;
const SECT_FAT_FORMAT: u8 = 0x40;
const SECT_MORE_SECTS: u8 = 0x80;

const FAT_CLAUSE_SIZE: usize = 24;
const SMALL_CLAUSE_SIZE: usize = 12;

/// Parsed method body header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHeader {
    pub tiny: bool,
    pub max_stack: u16,
    pub code_size: u32,
    /// Local variable signature token, 0 when the method has no locals
    pub local_var_sig_tok: u32,
    pub init_locals: bool,
    /// Offset of the first code byte from the start of the body
    pub header_size: u32,
    pub more_sects: bool,
}

/// Kind of an exception clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClauseKind {
    Catch,
    Filter,
    Finally,
    Fault,
}

impl ClauseKind {
    fn from_flags(flags: u32) -> Result<Self, DecodeError> {
        match flags & 0x7 {
            0 => Ok(Self::Catch),
            1 => Ok(Self::Filter),
            2 => Ok(Self::Finally),
            4 => Ok(Self::Fault),
            _ => Err(DecodeError::InvalidClauseFlags(flags)),
        }
    }

    /// Numeric tag used in emitted handler tables
    pub fn tag(self) -> u32 {
        match self {
            Self::Catch => 0,
            Self::Filter => 1,
            Self::Finally => 2,
            Self::Fault => 4,
        }
    }
}

/// One exception clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHeader {
    /// Index of the clause in declaration order
    pub id: usize,
    pub kind: ClauseKind,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    /// Class token of a catch clause
    pub class_token: Option<u32>,
    /// First instruction of a filter clause's filter block
    pub filter_offset: Option<u32>,
    /// Resolved catch type, filled in by the IR builder
    pub catch_type: Option<TypeSpec>,
}

impl ExceptionHeader {
    /// End of the protected region, exclusive
    pub fn try_end(&self) -> u32 {
        self.try_offset.saturating_add(self.try_length)
    }

    /// End of the handler block, exclusive
    pub fn handler_end(&self) -> u32 {
        self.handler_offset.saturating_add(self.handler_length)
    }

    /// Whether `offset` lies within the protected region
    pub fn protects(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset < self.try_end()
    }

    /// Whether `offset` lies within the handler (or filter) block
    pub fn in_handler(&self, offset: u32) -> bool {
        offset >= self.entry_offset() && offset < self.handler_end()
    }

    /// First instruction executed when the clause is entered
    pub fn entry_offset(&self) -> u32 {
        self.filter_offset.unwrap_or(self.handler_offset)
    }
}

/// A method body split into header, code and exception clauses
#[derive(Debug, Clone)]
pub struct MethodBody<'a> {
    pub header: MethodHeader,
    pub code: &'a [u8],
    pub clauses: Vec<ExceptionHeader>,
}

fn u16_at(data: &[u8], pos: usize) -> Result<u16, DecodeError> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(DecodeError::UnexpectedEnd(pos))
}

fn u32_at(data: &[u8], pos: usize) -> Result<u32, DecodeError> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DecodeError::UnexpectedEnd(pos))
}

/// Parse the header of a method body
pub fn parse_header(body: &[u8]) -> Result<MethodHeader, DecodeError> {
    let first = *body.first().ok_or(DecodeError::UnexpectedEnd(0))?;
    match first & 0x3 {
        TINY_FORMAT => Ok(MethodHeader {
            tiny: true,
            max_stack: 8,
            code_size: u32::from(first >> 2),
            local_var_sig_tok: 0,
            init_locals: false,
            header_size: 1,
            more_sects: false,
        }),
        FAT_FORMAT => {
            let flags = u16_at(body, 0)?;
            let header_size = u32::from(flags >> 12) * 4;
            Ok(MethodHeader {
                tiny: false,
                max_stack: u16_at(body, 2)?,
                code_size: u32_at(body, 4)?,
                local_var_sig_tok: u32_at(body, 8)?,
                init_locals: flags & FAT_INIT_LOCALS != 0,
                header_size,
                more_sects: flags & FAT_MORE_SECTS != 0,
            })
        }
        _ => Err(DecodeError::InvalidHeader(first)),
    }
}

/// Parse a complete method body: header, code span and exception sections
pub fn parse_body(body: &[u8]) -> Result<MethodBody<'_>, DecodeError> {
    let header = parse_header(body)?;
    let start = header.header_size as usize;
    let end = start + header.code_size as usize;
    let code = body
        .get(start..end)
        .ok_or(DecodeError::UnexpectedEnd(body.len()))?;

    let mut clauses = Vec::new();
    if header.more_sects {
        let mut pos = (end + 3) & !3;
        loop {
            let kind = *body.get(pos).ok_or(DecodeError::UnexpectedEnd(pos))?;
            if kind & SECT_EH_TABLE == 0 {
                return Err(DecodeError::InvalidSectionKind(kind));
            }
            let fat = kind & SECT_FAT_FORMAT != 0;
            let word = u32_at(body, pos)?;
            let data_size = if fat {
                (word >> 8) & 0x00ff_ffff
            } else {
                (word >> 8) & 0xff
            } as usize;
            if data_size < 4 {
                return Err(DecodeError::InvalidSectionSize {
                    offset: pos,
                    size: data_size,
                });
            }
            let (clause_size, count) = if fat {
                (FAT_CLAUSE_SIZE, data_size.saturating_sub(4) / FAT_CLAUSE_SIZE)
            } else {
                (SMALL_CLAUSE_SIZE, data_size.saturating_sub(4) / SMALL_CLAUSE_SIZE)
            };
            for i in 0..count {
                let c = pos + 4 + i * clause_size;
                let id = clauses.len();
                let clause = if fat {
                    parse_fat_clause(body, c, id)?
                } else {
                    parse_small_clause(body, c, id)?
                };
                check_clause_range(&clause, header.code_size)?;
                clauses.push(clause);
            }
            if kind & SECT_MORE_SECTS == 0 {
                break;
            }
            pos = (pos + data_size + 3) & !3;
        }
    }

    Ok(MethodBody {
        header,
        code,
        clauses,
    })
}

/// Both regions of a clause, and a filter block's start, must lie within the code
fn check_clause_range(clause: &ExceptionHeader, code_size: u32) -> Result<(), DecodeError> {
    let within = |offset: u32, length: u32| {
        offset
            .checked_add(length)
            .is_some_and(|end| end <= code_size)
    };
    let regions = [
        (clause.try_offset, clause.try_length),
        (clause.handler_offset, clause.handler_length),
        (clause.filter_offset.unwrap_or(0), 0),
    ];
    match regions.iter().find(|&&(offset, length)| !within(offset, length)) {
        Some(&(offset, length)) => Err(DecodeError::InvalidClauseRange {
            clause: clause.id,
            offset,
            length,
        }),
        None => Ok(()),
    }
}

fn make_clause(
    id: usize,
    flags: u32,
    offsets: [u32; 4],
    extra: u32,
) -> Result<ExceptionHeader, DecodeError> {
    let kind = ClauseKind::from_flags(flags)?;
    Ok(ExceptionHeader {
        id,
        kind,
        try_offset: offsets[0],
        try_length: offsets[1],
        handler_offset: offsets[2],
        handler_length: offsets[3],
        class_token: (kind == ClauseKind::Catch).then_some(extra),
        filter_offset: (kind == ClauseKind::Filter).then_some(extra),
        catch_type: None,
    })
}

fn parse_fat_clause(body: &[u8], pos: usize, id: usize) -> Result<ExceptionHeader, DecodeError> {
    make_clause(
        id,
        u32_at(body, pos)?,
        [
            u32_at(body, pos + 4)?,
            u32_at(body, pos + 8)?,
            u32_at(body, pos + 12)?,
            u32_at(body, pos + 16)?,
        ],
        u32_at(body, pos + 20)?,
    )
}

fn parse_small_clause(
    body: &[u8],
    pos: usize,
    id: usize,
) -> Result<ExceptionHeader, DecodeError> {
    let byte = |p: usize| body.get(p).copied().ok_or(DecodeError::UnexpectedEnd(p));
    make_clause(
        id,
        u32::from(u16_at(body, pos)?),
        [
            u32::from(u16_at(body, pos + 2)?),
            u32::from(byte(pos + 4)?),
            u32::from(u16_at(body, pos + 5)?),
            u32::from(byte(pos + 7)?),
        ],
        u32_at(body, pos + 8)?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BodyBuilder, ClauseSpec};

    #[test]
    fn test_tiny_header() {
        let body = BodyBuilder::new(&[0x00, 0x2a]).build();
        let parsed = parse_body(&body).unwrap();
        assert!(parsed.header.tiny);
        assert_eq!(parsed.header.max_stack, 8);
        assert_eq!(parsed.header.code_size, 2);
        assert_eq!(parsed.code, &[0x00, 0x2a]);
        assert!(parsed.clauses.is_empty());
    }

    #[test]
    fn test_fat_header() {
        let body = BodyBuilder::new(&[0x2a]).max_stack(20).locals(0x1100_0001).build();
        let parsed = parse_body(&body).unwrap();
        assert!(!parsed.header.tiny);
        assert_eq!(parsed.header.header_size, 12);
        assert_eq!(parsed.header.max_stack, 20);
        assert_eq!(parsed.header.local_var_sig_tok, 0x1100_0001);
        assert_eq!(parsed.code, &[0x2a]);
    }

    #[test]
    fn test_invalid_header_format() {
        assert!(matches!(
            parse_header(&[0x01, 0x00]),
            Err(DecodeError::InvalidHeader(0x01))
        ));
        assert!(matches!(parse_header(&[]), Err(DecodeError::UnexpectedEnd(0))));
    }

    fn catch(try_offset: u32, handler_offset: u32, token: u32) -> ClauseSpec {
        ClauseSpec {
            flags: 0,
            try_offset,
            try_length: 2,
            handler_offset,
            handler_length: 3,
            class_token_or_filter: token,
        }
    }

    #[test]
    fn test_fat_clauses() {
        let code = [0u8; 12];
        let body = BodyBuilder::new(&code)
            .clause(catch(0, 4, 0x0200_0005))
            .clause(catch(1, 8, 0x0100_0002))
            .build();
        let parsed = parse_body(&body).unwrap();
        assert_eq!(parsed.clauses.len(), 2);
        let c = &parsed.clauses[1];
        assert_eq!(c.id, 1);
        assert_eq!(c.kind, ClauseKind::Catch);
        assert_eq!((c.try_offset, c.try_length), (1, 2));
        assert_eq!((c.handler_offset, c.handler_length), (8, 3));
        assert_eq!(c.class_token, Some(0x0100_0002));
        assert_eq!(c.filter_offset, None);
    }

    #[test]
    fn test_small_clauses() {
        let code = [0u8; 10];
        let body = BodyBuilder::new(&code)
            .small_clauses()
            .clause(ClauseSpec {
                flags: 2,
                try_offset: 0,
                try_length: 4,
                handler_offset: 4,
                handler_length: 6,
                class_token_or_filter: 0,
            })
            .build();
        let parsed = parse_body(&body).unwrap();
        assert_eq!(parsed.clauses.len(), 1);
        let c = &parsed.clauses[0];
        assert_eq!(c.kind, ClauseKind::Finally);
        assert_eq!((c.handler_offset, c.handler_length), (4, 6));
        assert_eq!(c.class_token, None);
        assert!(c.protects(3));
        assert!(!c.protects(4));
        assert!(c.in_handler(9));
    }

    #[test]
    fn test_invalid_section_kind() {
        let mut body = BodyBuilder::new(&[0x2a]).clause(catch(0, 0, 0x0200_0001)).build();
        // section starts at the first 4-byte boundary after the code
        let sect = (12 + 1 + 3) & !3;
        body[sect] &= !SECT_EH_TABLE;
        assert!(matches!(
            parse_body(&body),
            Err(DecodeError::InvalidSectionKind(_))
        ));
    }

    #[test]
    fn test_chained_sections() {
        let code = [0u8; 16];
        let clauses = [
            catch(0, 4, 0x0200_0002),
            catch(1, 8, 0x0200_0003),
            catch(2, 12, 0x0200_0004),
        ];
        for small in [false, true] {
            let mut builder = BodyBuilder::new(&code).clauses_per_section(2);
            if small {
                builder = builder.small_clauses();
            }
            for c in clauses {
                builder = builder.clause(c);
            }
            let bytes = builder.build();
            let parsed = parse_body(&bytes).unwrap();

            assert_eq!(parsed.clauses.len(), 3);
            for (i, (clause, spec)) in parsed.clauses.iter().zip(&clauses).enumerate() {
                assert_eq!(clause.id, i);
                assert_eq!(clause.try_offset, spec.try_offset);
                assert_eq!(clause.handler_offset, spec.handler_offset);
                assert_eq!(clause.class_token, Some(spec.class_token_or_filter));
            }
        }
    }

    #[test]
    fn test_invalid_clause_flags() {
        let mut clause = catch(0, 4, 0x0200_0002);
        clause.flags = 3;
        let body = BodyBuilder::new(&[0u8; 8]).clause(clause).build();
        assert!(matches!(
            parse_body(&body),
            Err(DecodeError::InvalidClauseFlags(3))
        ));
    }

    #[test]
    fn test_empty_section_is_rejected() {
        let mut body = BodyBuilder::new(&[0x2a]).fat().build();
        body[0] |= FAT_MORE_SECTS as u8;
        // 12 byte header, 1 code byte, padded to 16
        body.extend_from_slice(&[0, 0, 0]);
        body.extend_from_slice(&[SECT_EH_TABLE | SECT_MORE_SECTS, 0, 0, 0]);
        assert_eq!(
            parse_body(&body).unwrap_err(),
            DecodeError::InvalidSectionSize { offset: 16, size: 0 }
        );
    }

    #[test]
    fn test_clause_outside_code_is_rejected() {
        let mut wrapping = catch(0, 4, 0x0200_0002);
        wrapping.try_offset = 0xffff_fff0;
        wrapping.try_length = 0x20;
        let body = BodyBuilder::new(&[0u8; 12]).clause(wrapping).build();
        assert_eq!(
            parse_body(&body).unwrap_err(),
            DecodeError::InvalidClauseRange {
                clause: 0,
                offset: 0xffff_fff0,
                length: 0x20
            }
        );

        // handler runs one byte past the end
        let body = BodyBuilder::new(&[0u8; 12]).clause(catch(0, 10, 0x0200_0002)).build();
        assert_eq!(
            parse_body(&body).unwrap_err(),
            DecodeError::InvalidClauseRange {
                clause: 0,
                offset: 10,
                length: 3
            }
        );
    }
}
