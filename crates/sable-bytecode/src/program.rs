//! Program container format
//!
//! A [`Program`] bundles everything the VM needs to run: the code stream,
//! the constants pool (64-bit words), the static string buffer, the debug
//! table, and per-function debug records. The container can be encoded to a
//! checksummed binary image and decoded back.
//!
//! The code stream is deliberately owned as a mutable `Vec<u8>`: inline
//! caches rewrite instruction bytes in place while the program runs. The
//! stream has a single owner (the dispatch loop) and scheduling is
//! cooperative, so no other reader can observe a half-written instruction.

use crate::opcode::{inst_len, OpCode};
use thiserror::Error;

/// Magic number for Sable bytecode images: "SABL"
pub const MAGIC: [u8; 4] = *b"SABL";

/// Current bytecode format version
pub const VERSION: u32 = 1;

/// Sentinel id for "no entry" (absent function record, absent end-locals pc)
pub const NULL_ID: u32 = u32::MAX;

/// Container encoding/decoding/verification errors
#[derive(Debug, Error)]
pub enum ProgramError {
    /// Image too short or a section ran past the end
    #[error("Truncated image at offset {0}")]
    Truncated(usize),

    /// Invalid magic number
    #[error("Invalid magic number: expected SABL, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum recorded in the image
        expected: u32,
        /// Checksum of the decoded payload
        actual: u32,
    },

    /// Invalid opcode byte found during verification
    #[error("Invalid opcode {opcode:#04x} at pc {pc}")]
    InvalidOpcode {
        /// Offending byte
        opcode: u8,
        /// Offset in the code stream
        pc: usize,
    },

    /// Instruction operands run past the end of the code stream
    #[error("Instruction at pc {0} runs past end of code")]
    OperandsOutOfBounds(usize),

    /// Constant pool index out of range
    #[error("Constant index {index} out of range at pc {pc}")]
    BadConstIndex {
        /// Offending index
        index: usize,
        /// Offset in the code stream
        pc: usize,
    },
}

/// One constants pool entry
///
/// The VM lowers these to 64-bit value words at load time, giving the
/// dispatch loop a parallel array of words to index with the 8-bit operand
/// of `ConstOp`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    /// A number
    Number(f64),
    /// An ASCII string slice of the static string buffer
    AStr {
        /// Start byte offset
        start: u32,
        /// End byte offset (exclusive)
        end: u32,
    },
    /// A UTF-8 string slice of the static string buffer; a 12-byte header
    /// precedes `start` in the buffer
    UStr {
        /// Start byte offset (past the header)
        start: u32,
        /// End byte offset (exclusive)
        end: u32,
    },
}

/// One debug table entry
///
/// Entries are sorted by `pc`; the entry covering a pc is the last one at or
/// before it. `src_pos` is a byte offset into [`Program::src`]; `frame` is an
/// index into [`Program::funcs`] (`NULL_ID` for top level). `end_locals_pc`
/// points at a `ReleaseN` instruction naming the locals live at this pc, used
/// when a suspended fiber is unwound without running its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEntry {
    /// Code offset this entry starts covering
    pub pc: u32,
    /// Byte offset into the source text
    pub src_pos: u32,
    /// Enclosing function record, `NULL_ID` for top level
    pub frame: u32,
    /// Offset of a `ReleaseN` naming live locals, `NULL_ID` if none
    pub end_locals_pc: u32,
}

/// Per-function debug record, used only for stack-trace formatting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncDebug {
    /// Function name as declared
    pub name: String,
    /// Byte offset of the declaration in the source text
    pub src_pos: u32,
}

/// A complete Sable program
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Code stream; mutated in place by inline caches
    pub code: Vec<u8>,
    /// Constant pool (numbers and static string slices)
    pub consts: Vec<Const>,
    /// Static string buffer; UTF-8 strings are preceded by a 12-byte header
    /// (char length + MRU byte/char index pair) that the VM mutates
    pub strings: Vec<u8>,
    /// Debug table, sorted by pc
    pub debug: Vec<DebugEntry>,
    /// Function debug records
    pub funcs: Vec<FuncDebug>,
    /// Chunk name reported in stack traces
    pub src_name: String,
    /// Source text, used to compute line/column for traces
    pub src: String,
}

impl Program {
    /// Find the debug entry covering `pc`
    pub fn debug_entry_at(&self, pc: usize) -> Option<&DebugEntry> {
        match self.debug.binary_search_by_key(&(pc as u32), |e| e.pc) {
            Ok(i) => Some(&self.debug[i]),
            Err(0) => None,
            Err(i) => Some(&self.debug[i - 1]),
        }
    }

    /// Compute 1-based line and column for a byte offset into the source
    pub fn line_col(&self, src_pos: u32) -> (u32, u32) {
        let pos = (src_pos as usize).min(self.src.len());
        let mut line = 1;
        let mut col = 1;
        for b in self.src.as_bytes()[..pos].iter() {
            if *b == b'\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    /// Encode to a checksummed binary image
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        write_bytes(&mut payload, &self.code);
        write_u32(&mut payload, self.consts.len() as u32);
        for c in &self.consts {
            match c {
                Const::Number(n) => {
                    payload.push(0);
                    payload.extend_from_slice(&n.to_bits().to_le_bytes());
                }
                Const::AStr { start, end } => {
                    payload.push(1);
                    write_u32(&mut payload, *start);
                    write_u32(&mut payload, *end);
                }
                Const::UStr { start, end } => {
                    payload.push(2);
                    write_u32(&mut payload, *start);
                    write_u32(&mut payload, *end);
                }
            }
        }
        write_bytes(&mut payload, &self.strings);
        write_u32(&mut payload, self.debug.len() as u32);
        for e in &self.debug {
            write_u32(&mut payload, e.pc);
            write_u32(&mut payload, e.src_pos);
            write_u32(&mut payload, e.frame);
            write_u32(&mut payload, e.end_locals_pc);
        }
        write_u32(&mut payload, self.funcs.len() as u32);
        for f in &self.funcs {
            write_bytes(&mut payload, f.name.as_bytes());
            write_u32(&mut payload, f.src_pos);
        }
        write_bytes(&mut payload, self.src_name.as_bytes());
        write_bytes(&mut payload, self.src.as_bytes());

        let checksum = crc32fast::hash(&payload);
        let mut image = Vec::with_capacity(12 + payload.len() + 4);
        image.extend_from_slice(&MAGIC);
        image.extend_from_slice(&VERSION.to_le_bytes());
        image.extend_from_slice(&payload);
        image.extend_from_slice(&checksum.to_le_bytes());
        image
    }

    /// Decode a binary image produced by [`Program::encode`]
    pub fn decode(image: &[u8]) -> Result<Self, ProgramError> {
        if image.len() < 12 {
            return Err(ProgramError::Truncated(image.len()));
        }
        let magic: [u8; 4] = image[0..4].try_into().unwrap();
        if magic != MAGIC {
            return Err(ProgramError::InvalidMagic(magic));
        }
        let version = u32::from_le_bytes(image[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(ProgramError::UnsupportedVersion(version));
        }
        let payload = &image[8..image.len() - 4];
        let expected = u32::from_le_bytes(image[image.len() - 4..].try_into().unwrap());
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(ProgramError::ChecksumMismatch { expected, actual });
        }

        let mut r = Reader { buf: payload, pos: 0 };
        let code = r.read_bytes()?;
        let num_consts = r.read_u32()? as usize;
        let mut consts = Vec::with_capacity(num_consts);
        for _ in 0..num_consts {
            let tag = r.read_u8()?;
            consts.push(match tag {
                0 => Const::Number(f64::from_bits(r.read_u64()?)),
                1 => Const::AStr {
                    start: r.read_u32()?,
                    end: r.read_u32()?,
                },
                2 => Const::UStr {
                    start: r.read_u32()?,
                    end: r.read_u32()?,
                },
                _ => return Err(ProgramError::Truncated(r.pos)),
            });
        }
        let strings = r.read_bytes()?;
        let num_debug = r.read_u32()? as usize;
        let mut debug = Vec::with_capacity(num_debug);
        for _ in 0..num_debug {
            debug.push(DebugEntry {
                pc: r.read_u32()?,
                src_pos: r.read_u32()?,
                frame: r.read_u32()?,
                end_locals_pc: r.read_u32()?,
            });
        }
        let num_funcs = r.read_u32()? as usize;
        let mut funcs = Vec::with_capacity(num_funcs);
        for _ in 0..num_funcs {
            let name = String::from_utf8_lossy(&r.read_bytes()?).into_owned();
            let src_pos = r.read_u32()?;
            funcs.push(FuncDebug { name, src_pos });
        }
        let src_name = String::from_utf8_lossy(&r.read_bytes()?).into_owned();
        let src = String::from_utf8_lossy(&r.read_bytes()?).into_owned();

        Ok(Self {
            code,
            consts,
            strings,
            debug,
            funcs,
            src_name,
            src,
        })
    }

    /// Verify the code stream: every instruction decodes, operands stay in
    /// bounds, and constant references are in range
    pub fn verify(&self) -> Result<(), ProgramError> {
        let mut pc = 0;
        while pc < self.code.len() {
            let byte = self.code[pc];
            let op = OpCode::from_u8(byte)
                .ok_or(ProgramError::InvalidOpcode { opcode: byte, pc })?;
            // Variable-length instructions read a count operand; make sure
            // it is actually there before trusting it.
            if op.fixed_len().is_none() && pc + 2 >= self.code.len() {
                return Err(ProgramError::OperandsOutOfBounds(pc));
            }
            let len = inst_len(&self.code, pc);
            if pc + len > self.code.len() {
                return Err(ProgramError::OperandsOutOfBounds(pc));
            }
            if matches!(op, OpCode::ConstOp) {
                let index = self.code[pc + 1] as usize;
                if index >= self.consts.len() {
                    return Err(ProgramError::BadConstIndex { index, pc });
                }
            }
            pc += len;
        }
        Ok(())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn read_u8(&mut self) -> Result<u8, ProgramError> {
        if self.pos >= self.buf.len() {
            return Err(ProgramError::Truncated(self.pos));
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32, ProgramError> {
        if self.pos + 4 > self.buf.len() {
            return Err(ProgramError::Truncated(self.pos));
        }
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn read_u64(&mut self) -> Result<u64, ProgramError> {
        if self.pos + 8 > self.buf.len() {
            return Err(ProgramError::Truncated(self.pos));
        }
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, ProgramError> {
        let len = self.read_u32()? as usize;
        if self.pos + len > self.buf.len() {
            return Err(ProgramError::Truncated(self.pos));
        }
        let v = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Program {
        Program {
            code: vec![
                OpCode::ConstI8 as u8,
                7,
                0,
                OpCode::End as u8,
                0,
            ],
            consts: vec![Const::Number(42.0), Const::AStr { start: 0, end: 5 }],
            strings: b"hello".to_vec(),
            debug: vec![DebugEntry {
                pc: 0,
                src_pos: 0,
                frame: NULL_ID,
                end_locals_pc: NULL_ID,
            }],
            funcs: vec![FuncDebug {
                name: "main".to_string(),
                src_pos: 0,
            }],
            src_name: "test.sbl".to_string(),
            src: "let a = 7\n".to_string(),
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let p = sample();
        let image = p.encode();
        let q = Program::decode(&image).unwrap();
        assert_eq!(p.code, q.code);
        assert_eq!(p.consts, q.consts);
        assert_eq!(p.strings, q.strings);
        assert_eq!(p.debug, q.debug);
        assert_eq!(p.funcs, q.funcs);
        assert_eq!(p.src_name, q.src_name);
        assert_eq!(p.src, q.src);
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut image = sample().encode();
        image[0] = b'X';
        assert!(matches!(
            Program::decode(&image),
            Err(ProgramError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_decode_bad_checksum() {
        let mut image = sample().encode();
        let idx = image.len() - 5;
        image[idx] ^= 0xFF;
        assert!(matches!(
            Program::decode(&image),
            Err(ProgramError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_ok() {
        assert!(sample().verify().is_ok());
    }

    #[test]
    fn test_verify_bad_opcode() {
        let mut p = sample();
        p.code[0] = 0xEE;
        assert!(matches!(
            p.verify(),
            Err(ProgramError::InvalidOpcode { opcode: 0xEE, pc: 0 })
        ));
    }

    #[test]
    fn test_verify_truncated_operands() {
        let p = Program {
            code: vec![OpCode::ConstI8 as u8, 7],
            ..Default::default()
        };
        assert!(matches!(
            p.verify(),
            Err(ProgramError::OperandsOutOfBounds(0))
        ));
    }

    #[test]
    fn test_verify_bad_const_index() {
        let p = Program {
            code: vec![OpCode::ConstOp as u8, 3, 0, OpCode::Ret0 as u8],
            consts: vec![Const::Number(1.0)],
            ..Default::default()
        };
        assert!(matches!(
            p.verify(),
            Err(ProgramError::BadConstIndex { index: 3, pc: 0 })
        ));
    }

    #[test]
    fn test_debug_entry_lookup() {
        let mut p = sample();
        p.debug = vec![
            DebugEntry { pc: 0, src_pos: 0, frame: NULL_ID, end_locals_pc: NULL_ID },
            DebugEntry { pc: 10, src_pos: 5, frame: 0, end_locals_pc: NULL_ID },
        ];
        assert_eq!(p.debug_entry_at(0).unwrap().pc, 0);
        assert_eq!(p.debug_entry_at(9).unwrap().pc, 0);
        assert_eq!(p.debug_entry_at(10).unwrap().frame, 0);
        assert_eq!(p.debug_entry_at(100).unwrap().frame, 0);
    }

    #[test]
    fn test_line_col() {
        let mut p = sample();
        p.src = "ab\ncde\nf".to_string();
        assert_eq!(p.line_col(0), (1, 1));
        assert_eq!(p.line_col(1), (1, 2));
        assert_eq!(p.line_col(3), (2, 1));
        assert_eq!(p.line_col(5), (2, 3));
        assert_eq!(p.line_col(7), (3, 1));
    }
}
