//! Bytecode opcodes for the Sable VM
//!
//! Every instruction is one opcode byte followed by a fixed number of operand
//! bytes; multi-byte operands are little-endian and unaligned. A few opcodes
//! (`Match`, `ReleaseN`) have a length that depends on an operand byte, which
//! is why [`inst_len`] takes the code stream rather than just the opcode.
//!
//! Several dispatch sites rewrite themselves in place on first execution:
//! `CallSym` becomes `CallFuncIC`/`CallNativeIC`, `CallObjSym` becomes
//! `CallObjFuncIC`/`CallObjNativeIC`, the `Field*` family gains `*IC` forms,
//! and `ForRangeInit` specializes the loop's step instruction to `ForRange`
//! or `ForRangeReverse`. A specialized form always has the same length as the
//! general form it replaces.

/// Bytecode opcode enumeration
///
/// Opcodes are organized into bands:
/// - 0x00-0x0F: moves, constants, reference counting
/// - 0x10-0x2F: arithmetic, comparison, logic
/// - 0x30-0x3F: control flow
/// - 0x40-0x4F: calls and returns
/// - 0x50-0x5F: objects, fields, boxes, tags
/// - 0x60-0x6F: collections and strings
/// - 0x70-0x7F: fibers, errors, globals
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // ===== Moves, constants, reference counting (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Load constant pool word: (const_idx: u8, dst: u8)
    ConstOp = 0x01,
    /// Load small integer as a number: (val: i8, dst: u8)
    ConstI8 = 0x02,
    /// Write `none` to dst: (dst: u8)
    None = 0x03,
    /// Write `true` to dst: (dst: u8)
    True = 0x04,
    /// Write `false` to dst: (dst: u8)
    False = 0x05,
    /// Copy src to dst, no rc adjustment: (src: u8, dst: u8)
    Copy = 0x06,
    /// Copy src to dst, retaining src: (src: u8, dst: u8)
    CopyRetainSrc = 0x07,
    /// Copy src to dst, releasing the prior dst: (src: u8, dst: u8)
    CopyReleaseDst = 0x08,
    /// Copy src to dst, retaining src and releasing the prior dst
    CopyRetainRelease = 0x09,
    /// Retain the value in a local: (local: u8)
    Retain = 0x0A,
    /// Release the value in a local: (local: u8)
    Release = 0x0B,
    /// Release n locals: (n: u8, locals: n × u8)
    ReleaseN = 0x0C,

    // ===== Arithmetic, comparison, logic (0x10-0x2F) =====
    /// (left: u8, right: u8, dst: u8)
    Add = 0x10,
    /// (left: u8, right: u8, dst: u8)
    Sub = 0x11,
    /// (left: u8, right: u8, dst: u8)
    Mul = 0x12,
    /// (left: u8, right: u8, dst: u8)
    Div = 0x13,
    /// (left: u8, right: u8, dst: u8)
    Mod = 0x14,
    /// (left: u8, right: u8, dst: u8)
    Pow = 0x15,
    /// Numeric negation: (src: u8, dst: u8)
    Neg = 0x16,
    /// (left: u8, right: u8, dst: u8)
    Less = 0x17,
    /// (left: u8, right: u8, dst: u8)
    LessEqual = 0x18,
    /// (left: u8, right: u8, dst: u8)
    Greater = 0x19,
    /// (left: u8, right: u8, dst: u8)
    GreaterEqual = 0x1A,
    /// Equality: (left: u8, right: u8, dst: u8)
    Compare = 0x1B,
    /// Inequality: (left: u8, right: u8, dst: u8)
    CompareNot = 0x1C,
    /// Logical not via truthiness: (src: u8, dst: u8)
    Not = 0x1D,
    /// (left: u8, right: u8, dst: u8)
    BitAnd = 0x1E,
    /// (left: u8, right: u8, dst: u8)
    BitOr = 0x1F,
    /// (left: u8, right: u8, dst: u8)
    BitXor = 0x20,
    /// (left: u8, right: u8, dst: u8)
    ShiftLeft = 0x21,
    /// (left: u8, right: u8, dst: u8)
    ShiftRight = 0x22,
    /// (src: u8, dst: u8)
    BitNot = 0x23,

    // ===== Control flow (0x30-0x3F) =====
    /// Unconditional relative jump: (offset: i16)
    Jump = 0x30,
    /// Jump when truthy: (cond: u8, offset: i16)
    JumpCond = 0x31,
    /// Jump when falsy: (cond: u8, offset: i16)
    JumpNotCond = 0x32,
    /// Jump when the local is not `none`: (local: u8, offset: i16)
    JumpNotNone = 0x33,
    /// Linear-scan match: (expr: u8, num_cases: u8,
    /// cases: num_cases × (case_local: u8, offset: u16), else_offset: u16)
    Match = 0x34,
    /// Range loop header: (start: u8, end: u8, counter_dst: u8, exit_offset: u16).
    /// On first execution specializes the step instruction at
    /// `pc + exit_offset - 5` to `ForRange` or `ForRangeReverse`.
    ForRangeInit = 0x35,
    /// Forward range step: (counter: u8, end: u8, back_offset: u16)
    ForRange = 0x36,
    /// Reverse range step: (counter: u8, end: u8, back_offset: u16)
    ForRangeReverse = 0x37,

    // ===== Calls and returns (0x40-0x4F) =====
    /// Call a callable value: (start_local: u8, num_args: u8, num_ret: u8).
    /// Callee at `fp[start_local+4]`, args at `fp[start_local+5..]`.
    Call = 0x40,
    /// Call a function symbol: (start_local: u8, num_args: u8, num_ret: u8,
    /// sym: u16, cache: u32). Args at `fp[start_local+4..]`.
    CallSym = 0x41,
    /// Specialized `CallSym` for a bytecode function; cache holds
    /// (pc: u24, num_locals: u8)
    CallFuncIC = 0x42,
    /// Specialized `CallSym` for a native function; cache holds the symbol id
    CallNativeIC = 0x43,
    /// Method call on a receiver: (start_local: u8, num_args: u8,
    /// num_ret: u8, sym: u16, cached_type: u16, cache: u32).
    /// Receiver at `fp[start_local+4]`, args at `fp[start_local+5..]`.
    CallObjSym = 0x44,
    /// Specialized `CallObjSym` for a bytecode method; cache holds
    /// (pc: u24, num_locals: u8)
    CallObjFuncIC = 0x45,
    /// Specialized `CallObjSym` for a native method; cache holds the
    /// method-table entry index
    CallObjNativeIC = 0x46,
    /// Return with no value
    Ret0 = 0x47,
    /// Return the value in `fp[0]`
    Ret1 = 0x48,
    /// Terminate the program: (result_local: u8, 0xFF for none)
    End = 0x49,

    // ===== Objects, fields, boxes, tags (0x50-0x5F) =====
    /// Allocate a user object in the pool (≤ 4 fields):
    /// (shape: u16, start_fields: u8, num_fields: u8, dst: u8)
    ObjectSmall = 0x50,
    /// Allocate a user object outside the pool (> 4 fields); same operands
    Object = 0x51,
    /// Read a field without retaining: (recv: u8, dst: u8, sym: u16,
    /// cached_type: u16, cached_offset: u8)
    Field = 0x52,
    /// Specialized `Field`
    FieldIC = 0x53,
    /// Read a field and retain it; same operands as `Field`
    FieldRetain = 0x54,
    /// Specialized `FieldRetain`
    FieldRetainIC = 0x55,
    /// Write a field, releasing the prior value: (recv: u8, val: u8,
    /// sym: u16, cached_type: u16, cached_offset: u8)
    SetFieldRelease = 0x56,
    /// Specialized `SetFieldRelease`
    SetFieldReleaseIC = 0x57,
    /// Allocate a box holding a value: (src: u8, dst: u8)
    Box = 0x58,
    /// Store into a box: (box: u8, src: u8)
    SetBoxValue = 0x59,
    /// Store into a box, releasing the prior value: (box: u8, src: u8)
    SetBoxValueRelease = 0x5A,
    /// Read a box without retaining: (box: u8, dst: u8)
    BoxValue = 0x5B,
    /// Read a box and retain: (box: u8, dst: u8)
    BoxValueRetain = 0x5C,
    /// Construct a tag value: (tag_type: u8, member: u8, dst: u8)
    Tag = 0x5D,
    /// Load a tag literal: (sym: u8, dst: u8)
    TagLiteral = 0x5E,

    // ===== Collections and strings (0x60-0x6F) =====
    /// Build a list from consecutive locals: (start: u8, n: u8, dst: u8)
    List = 0x60,
    /// Allocate an empty map: (dst: u8)
    MapEmpty = 0x61,
    /// Build a map from key/value pairs in consecutive locals:
    /// (start: u8, num_pairs: u8, dst: u8)
    Map = 0x62,
    /// Indexed read: (left: u8, index: u8, dst: u8)
    Index = 0x63,
    /// Indexed read counting from the end: (left: u8, index: u8, dst: u8)
    ReverseIndex = 0x64,
    /// Indexed write without releasing the prior value:
    /// (left: u8, index: u8, val: u8)
    SetIndex = 0x65,
    /// Indexed write releasing the prior value: (left: u8, index: u8, val: u8)
    SetIndexRelease = 0x66,
    /// Slice a list or string: (recv: u8, start: u8, end: u8, dst: u8)
    Slice = 0x67,
    /// Concatenate 2 or 3 strings: (start: u8, count: u8, dst: u8)
    StringConcat = 0x68,

    // ===== Fibers, errors, globals (0x70-0x7F) =====
    /// Create a fiber: (start_args: u8, num_args: u8, body_offset: u16,
    /// initial_stack: u8, dst: u8). Jumps past the body by `body_offset`.
    Coinit = 0x70,
    /// Resume a fiber: (fiber: u8, dst: u8)
    Coresume = 0x71,
    /// Yield to the parent fiber; two pad bytes keep the resume point at pc+3
    Coyield = 0x72,
    /// Return from a fiber body, terminating the fiber
    Coreturn = 0x73,
    /// Unwrap a non-error or propagate: (src: u8, dst: u8, offset: u16)
    TryValue = 0x74,
    /// Read a global variable symbol, retaining: (sym: u16, dst: u8)
    StaticVar = 0x75,
    /// Write a global variable symbol, releasing the prior value:
    /// (sym: u16, src: u8)
    SetStaticVar = 0x76,
}

impl OpCode {
    /// Convert a raw byte to an opcode
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Nop,
            0x01 => Self::ConstOp,
            0x02 => Self::ConstI8,
            0x03 => Self::None,
            0x04 => Self::True,
            0x05 => Self::False,
            0x06 => Self::Copy,
            0x07 => Self::CopyRetainSrc,
            0x08 => Self::CopyReleaseDst,
            0x09 => Self::CopyRetainRelease,
            0x0A => Self::Retain,
            0x0B => Self::Release,
            0x0C => Self::ReleaseN,
            0x10 => Self::Add,
            0x11 => Self::Sub,
            0x12 => Self::Mul,
            0x13 => Self::Div,
            0x14 => Self::Mod,
            0x15 => Self::Pow,
            0x16 => Self::Neg,
            0x17 => Self::Less,
            0x18 => Self::LessEqual,
            0x19 => Self::Greater,
            0x1A => Self::GreaterEqual,
            0x1B => Self::Compare,
            0x1C => Self::CompareNot,
            0x1D => Self::Not,
            0x1E => Self::BitAnd,
            0x1F => Self::BitOr,
            0x20 => Self::BitXor,
            0x21 => Self::ShiftLeft,
            0x22 => Self::ShiftRight,
            0x23 => Self::BitNot,
            0x30 => Self::Jump,
            0x31 => Self::JumpCond,
            0x32 => Self::JumpNotCond,
            0x33 => Self::JumpNotNone,
            0x34 => Self::Match,
            0x35 => Self::ForRangeInit,
            0x36 => Self::ForRange,
            0x37 => Self::ForRangeReverse,
            0x40 => Self::Call,
            0x41 => Self::CallSym,
            0x42 => Self::CallFuncIC,
            0x43 => Self::CallNativeIC,
            0x44 => Self::CallObjSym,
            0x45 => Self::CallObjFuncIC,
            0x46 => Self::CallObjNativeIC,
            0x47 => Self::Ret0,
            0x48 => Self::Ret1,
            0x49 => Self::End,
            0x50 => Self::ObjectSmall,
            0x51 => Self::Object,
            0x52 => Self::Field,
            0x53 => Self::FieldIC,
            0x54 => Self::FieldRetain,
            0x55 => Self::FieldRetainIC,
            0x56 => Self::SetFieldRelease,
            0x57 => Self::SetFieldReleaseIC,
            0x58 => Self::Box,
            0x59 => Self::SetBoxValue,
            0x5A => Self::SetBoxValueRelease,
            0x5B => Self::BoxValue,
            0x5C => Self::BoxValueRetain,
            0x5D => Self::Tag,
            0x5E => Self::TagLiteral,
            0x60 => Self::List,
            0x61 => Self::MapEmpty,
            0x62 => Self::Map,
            0x63 => Self::Index,
            0x64 => Self::ReverseIndex,
            0x65 => Self::SetIndex,
            0x66 => Self::SetIndexRelease,
            0x67 => Self::Slice,
            0x68 => Self::StringConcat,
            0x70 => Self::Coinit,
            0x71 => Self::Coresume,
            0x72 => Self::Coyield,
            0x73 => Self::Coreturn,
            0x74 => Self::TryValue,
            0x75 => Self::StaticVar,
            0x76 => Self::SetStaticVar,
            _ => return None,
        })
    }

    /// Fixed instruction length including the opcode byte, or `None` for the
    /// opcodes whose length depends on an operand (`ReleaseN`, `Match`)
    pub fn fixed_len(self) -> Option<usize> {
        Some(match self {
            Self::Nop | Self::Ret0 | Self::Ret1 | Self::Coreturn => 1,
            Self::None
            | Self::True
            | Self::False
            | Self::Retain
            | Self::Release
            | Self::MapEmpty
            | Self::End => 2,
            Self::ConstOp
            | Self::ConstI8
            | Self::Copy
            | Self::CopyRetainSrc
            | Self::CopyReleaseDst
            | Self::CopyRetainRelease
            | Self::Neg
            | Self::Not
            | Self::BitNot
            | Self::Jump
            | Self::Box
            | Self::SetBoxValue
            | Self::SetBoxValueRelease
            | Self::BoxValue
            | Self::BoxValueRetain
            | Self::TagLiteral
            | Self::Coresume
            | Self::Coyield => 3,
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Mod
            | Self::Pow
            | Self::Less
            | Self::LessEqual
            | Self::Greater
            | Self::GreaterEqual
            | Self::Compare
            | Self::CompareNot
            | Self::BitAnd
            | Self::BitOr
            | Self::BitXor
            | Self::ShiftLeft
            | Self::ShiftRight
            | Self::JumpCond
            | Self::JumpNotCond
            | Self::JumpNotNone
            | Self::Call
            | Self::Tag
            | Self::List
            | Self::Map
            | Self::Index
            | Self::ReverseIndex
            | Self::SetIndex
            | Self::SetIndexRelease
            | Self::StringConcat
            | Self::StaticVar
            | Self::SetStaticVar => 4,
            Self::ForRange | Self::ForRangeReverse | Self::Slice | Self::TryValue => 5,
            Self::ForRangeInit | Self::ObjectSmall | Self::Object => 6,
            Self::Coinit => 7,
            Self::Field
            | Self::FieldIC
            | Self::FieldRetain
            | Self::FieldRetainIC
            | Self::SetFieldRelease
            | Self::SetFieldReleaseIC => 8,
            Self::CallSym | Self::CallFuncIC | Self::CallNativeIC => 10,
            Self::CallObjSym | Self::CallObjFuncIC | Self::CallObjNativeIC => 12,
            Self::ReleaseN | Self::Match => return Option::None,
        })
    }
}

/// Length of the instruction at `pc`, including the opcode byte
///
/// Queried by stack-trace formatting and fiber unwinding; variable-length
/// instructions read their count operand from the stream.
///
/// # Panics
///
/// Panics if `code[pc]` is not a valid opcode.
pub fn inst_len(code: &[u8], pc: usize) -> usize {
    let op = OpCode::from_u8(code[pc]).expect("invalid opcode in stream");
    match op.fixed_len() {
        Some(len) => len,
        None => match op {
            // (n, locals: n × u8)
            OpCode::ReleaseN => 2 + code[pc + 1] as usize,
            // (expr, num_cases, cases: n × 3, else_offset: u16)
            OpCode::Match => 3 + code[pc + 2] as usize * 3 + 2,
            _ => unreachable!(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0u8..=0xFF {
            if let Some(op) = OpCode::from_u8(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn test_fixed_lengths() {
        assert_eq!(OpCode::Ret0.fixed_len(), Some(1));
        assert_eq!(OpCode::ConstOp.fixed_len(), Some(3));
        assert_eq!(OpCode::CallSym.fixed_len(), Some(10));
        assert_eq!(OpCode::CallObjSym.fixed_len(), Some(12));
        assert_eq!(OpCode::ReleaseN.fixed_len(), None);
        assert_eq!(OpCode::Match.fixed_len(), None);
    }

    #[test]
    fn test_ic_forms_match_general_lengths() {
        assert_eq!(OpCode::CallSym.fixed_len(), OpCode::CallFuncIC.fixed_len());
        assert_eq!(OpCode::CallSym.fixed_len(), OpCode::CallNativeIC.fixed_len());
        assert_eq!(
            OpCode::CallObjSym.fixed_len(),
            OpCode::CallObjFuncIC.fixed_len()
        );
        assert_eq!(OpCode::Field.fixed_len(), OpCode::FieldIC.fixed_len());
        assert_eq!(
            OpCode::SetFieldRelease.fixed_len(),
            OpCode::SetFieldReleaseIC.fixed_len()
        );
        assert_eq!(
            OpCode::ForRange.fixed_len(),
            OpCode::ForRangeReverse.fixed_len()
        );
    }

    #[test]
    fn test_variable_length() {
        // release_n with 3 locals
        let code = [OpCode::ReleaseN as u8, 3, 1, 2, 3];
        assert_eq!(inst_len(&code, 0), 5);

        // match with 2 cases
        let code = [OpCode::Match as u8, 0, 2, 1, 0, 0, 2, 0, 0, 9, 0];
        assert_eq!(inst_len(&code, 0), 11);
    }
}
