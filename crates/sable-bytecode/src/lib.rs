//! Sable VM Bytecode Definitions
//!
//! This crate provides the instruction set, program container, and debug
//! table consumed by the Sable virtual machine, plus a `ProgramBuilder`
//! used by the code generator and by tests to assemble programs by hand.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod opcode;
pub mod program;

pub use builder::{Label, ProgramBuilder};
pub use opcode::{inst_len, OpCode};
pub use program::{Const, DebugEntry, FuncDebug, Program, ProgramError, NULL_ID};
