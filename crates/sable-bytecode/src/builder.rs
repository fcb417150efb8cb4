//! Program assembly
//!
//! [`ProgramBuilder`] is the interface the code generator uses to emit a
//! [`Program`], and what tests use to assemble programs by hand: raw emit
//! helpers, label-based jump patching, constant pool dedup, static string
//! emission, and debug-entry recording.

use crate::opcode::OpCode;
use crate::program::{Const, DebugEntry, FuncDebug, Program, NULL_ID};

/// An unresolved jump target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// How a label reference is encoded at its patch site
#[derive(Debug, Clone, Copy)]
enum RefKind {
    /// Signed 16-bit offset relative to the instruction start
    RelI16,
    /// Unsigned 16-bit forward offset relative to the instruction start
    RelU16,
    /// Unsigned 16-bit backward offset relative to the instruction start
    BackU16,
}

#[derive(Debug)]
struct LabelRef {
    label: Label,
    inst_pc: usize,
    operand_pos: usize,
    kind: RefKind,
}

/// Builder for [`Program`]s
///
/// Jump offsets are always relative to the start of the referencing
/// instruction. Forward references are patched in [`ProgramBuilder::finish`].
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    code: Vec<u8>,
    consts: Vec<Const>,
    strings: Vec<u8>,
    debug: Vec<DebugEntry>,
    funcs: Vec<FuncDebug>,
    src_name: String,
    src: String,
    labels: Vec<Option<usize>>,
    refs: Vec<LabelRef>,
    cur_inst: usize,
}

impl ProgramBuilder {
    /// Create a builder for the named chunk
    pub fn new(src_name: &str, src: &str) -> Self {
        Self {
            src_name: src_name.to_string(),
            src: src.to_string(),
            ..Default::default()
        }
    }

    /// Current code offset
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    /// Emit an opcode byte, starting a new instruction
    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.cur_inst = self.code.len();
        self.code.push(op as u8);
        self
    }

    /// Emit a raw operand byte
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.code.push(v);
        self
    }

    /// Emit a signed operand byte
    pub fn i8(&mut self, v: i8) -> &mut Self {
        self.code.push(v as u8);
        self
    }

    /// Emit a little-endian 16-bit operand
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.code.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Emit a little-endian 32-bit operand
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.code.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Create a fresh, unbound label
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current code offset
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    /// Emit a signed 16-bit offset to `label`, relative to the current
    /// instruction start
    pub fn label_i16(&mut self, label: Label) -> &mut Self {
        self.label_ref(label, RefKind::RelI16)
    }

    /// Emit an unsigned forward 16-bit offset to `label`
    pub fn label_u16(&mut self, label: Label) -> &mut Self {
        self.label_ref(label, RefKind::RelU16)
    }

    /// Emit an unsigned backward 16-bit offset to `label`
    pub fn label_back_u16(&mut self, label: Label) -> &mut Self {
        self.label_ref(label, RefKind::BackU16)
    }

    fn label_ref(&mut self, label: Label, kind: RefKind) -> &mut Self {
        self.refs.push(LabelRef {
            label,
            inst_pc: self.cur_inst,
            operand_pos: self.code.len(),
            kind,
        });
        self.code.extend_from_slice(&[0, 0]);
        self
    }

    /// Intern a number constant, returning its pool index
    pub fn const_number(&mut self, n: f64) -> u8 {
        self.intern_const(Const::Number(n))
    }

    /// Intern an ASCII string constant, returning its pool index
    ///
    /// # Panics
    ///
    /// Panics if `s` is not ASCII.
    pub fn const_astring(&mut self, s: &str) -> u8 {
        assert!(s.is_ascii(), "astring constant must be ASCII");
        let start = self.strings.len() as u32;
        self.strings.extend_from_slice(s.as_bytes());
        let end = self.strings.len() as u32;
        self.intern_const(Const::AStr { start, end })
    }

    /// Intern a UTF-8 string constant, returning its pool index
    ///
    /// Writes the 12-byte static-ustring header (code-point length plus an
    /// MRU byte/char index pair, both zeroed) before the bytes.
    pub fn const_ustring(&mut self, s: &str) -> u8 {
        let char_len = s.chars().count() as u32;
        self.strings.extend_from_slice(&char_len.to_le_bytes());
        self.strings.extend_from_slice(&0u32.to_le_bytes());
        self.strings.extend_from_slice(&0u32.to_le_bytes());
        let start = self.strings.len() as u32;
        self.strings.extend_from_slice(s.as_bytes());
        let end = self.strings.len() as u32;
        self.intern_const(Const::UStr { start, end })
    }

    fn intern_const(&mut self, c: Const) -> u8 {
        if let Some(i) = self.consts.iter().position(|x| match (x, &c) {
            (Const::Number(a), Const::Number(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }) {
            return i as u8;
        }
        self.consts.push(c);
        assert!(self.consts.len() <= 256, "constant pool overflow");
        (self.consts.len() - 1) as u8
    }

    /// Register a function debug record, returning its index
    pub fn func_debug(&mut self, name: &str, src_pos: u32) -> u32 {
        self.funcs.push(FuncDebug {
            name: name.to_string(),
            src_pos,
        });
        (self.funcs.len() - 1) as u32
    }

    /// Record a debug entry covering code emitted from the current offset
    pub fn debug_entry(&mut self, src_pos: u32, frame: u32) -> &mut Self {
        self.debug_entry_full(src_pos, frame, NULL_ID)
    }

    /// Record a debug entry with an end-locals pc
    pub fn debug_entry_full(&mut self, src_pos: u32, frame: u32, end_locals_pc: u32) -> &mut Self {
        self.debug.push(DebugEntry {
            pc: self.code.len() as u32,
            src_pos,
            frame,
            end_locals_pc,
        });
        self
    }

    /// Patch an already-recorded debug entry's end-locals pc
    ///
    /// The epilogue's `ReleaseN` offset is usually unknown when the entry is
    /// recorded; the code generator back-patches it here.
    pub fn patch_end_locals(&mut self, entry_idx: usize, end_locals_pc: u32) {
        self.debug[entry_idx].end_locals_pc = end_locals_pc;
    }

    /// Number of debug entries recorded so far
    pub fn debug_len(&self) -> usize {
        self.debug.len()
    }

    /// Resolve labels and produce the program
    ///
    /// # Panics
    ///
    /// Panics on unbound labels or out-of-range offsets; both are assembly
    /// bugs, not runtime conditions.
    pub fn finish(mut self) -> Program {
        for r in &self.refs {
            let target = self.labels[r.label.0].expect("unbound label") as isize;
            let delta = target - r.inst_pc as isize;
            let bytes = match r.kind {
                RefKind::RelI16 => {
                    let v = i16::try_from(delta).expect("jump offset out of range");
                    v.to_le_bytes()
                }
                RefKind::RelU16 => {
                    let v = u16::try_from(delta).expect("forward offset out of range");
                    v.to_le_bytes()
                }
                RefKind::BackU16 => {
                    let v = u16::try_from(-delta).expect("backward offset out of range");
                    v.to_le_bytes()
                }
            };
            self.code[r.operand_pos..r.operand_pos + 2].copy_from_slice(&bytes);
        }
        self.debug.sort_by_key(|e| e.pc);
        Program {
            code: self.code,
            consts: self.consts,
            strings: self.strings,
            debug: self.debug,
            funcs: self.funcs,
            src_name: self.src_name,
            src: self.src,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_finish() {
        let mut b = ProgramBuilder::new("t.sbl", "");
        b.op(OpCode::ConstI8).i8(5).u8(0);
        b.op(OpCode::End).u8(0);
        let p = b.finish();
        assert_eq!(
            p.code,
            vec![OpCode::ConstI8 as u8, 5, 0, OpCode::End as u8, 0]
        );
        assert!(p.verify().is_ok());
    }

    #[test]
    fn test_const_dedup() {
        let mut b = ProgramBuilder::new("t.sbl", "");
        let a = b.const_number(1.5);
        let c = b.const_number(2.5);
        let d = b.const_number(1.5);
        assert_eq!(a, d);
        assert_ne!(a, c);
    }

    #[test]
    fn test_astring_const() {
        let mut b = ProgramBuilder::new("t.sbl", "");
        let idx = b.const_astring("hi");
        let p = {
            b.op(OpCode::End).u8(0xFF);
            b.finish()
        };
        match p.consts[idx as usize] {
            Const::AStr { start, end } => {
                assert_eq!(&p.strings[start as usize..end as usize], b"hi");
            }
            _ => panic!("expected astring constant"),
        }
    }

    #[test]
    fn test_ustring_header() {
        let mut b = ProgramBuilder::new("t.sbl", "");
        let idx = b.const_ustring("héllo");
        let p = {
            b.op(OpCode::End).u8(0xFF);
            b.finish()
        };
        match p.consts[idx as usize] {
            Const::UStr { start, end } => {
                // header precedes the bytes: char length then zeroed MRU pair
                let hdr = start as usize - 12;
                let char_len =
                    u32::from_le_bytes(p.strings[hdr..hdr + 4].try_into().unwrap());
                assert_eq!(char_len, 5);
                assert_eq!(&p.strings[start as usize..end as usize], "héllo".as_bytes());
            }
            _ => panic!("expected ustring constant"),
        }
    }

    #[test]
    fn test_forward_jump_patch() {
        let mut b = ProgramBuilder::new("t.sbl", "");
        let skip = b.new_label();
        b.op(OpCode::Jump).label_i16(skip);
        b.op(OpCode::Nop);
        b.bind(skip);
        b.op(OpCode::End).u8(0xFF);
        let p = b.finish();
        // jump at 0, nop at 3, target 4
        assert_eq!(i16::from_le_bytes([p.code[1], p.code[2]]), 4);
    }

    #[test]
    fn test_backward_jump_patch() {
        let mut b = ProgramBuilder::new("t.sbl", "");
        let top = b.new_label();
        b.bind(top);
        b.op(OpCode::Nop);
        b.op(OpCode::Jump).label_i16(top);
        let p = b.finish();
        // jump at 1, target 0
        assert_eq!(i16::from_le_bytes([p.code[2], p.code[3]]), -1);
    }

    #[test]
    #[should_panic(expected = "unbound label")]
    fn test_unbound_label_panics() {
        let mut b = ProgramBuilder::new("t.sbl", "");
        let l = b.new_label();
        b.op(OpCode::Jump).label_i16(l);
        let _ = b.finish();
    }
}
