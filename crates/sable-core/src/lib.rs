//! Sable VM Core Runtime
//!
//! This crate provides the execution core of the Sable virtual machine:
//! - NaN-boxed value representation
//! - Page-pooled, reference-counted heap with on-demand cycle detection
//! - Bytecode dispatch loop with in-place inline-cache rewriting
//! - Object model and string interning
//! - Cooperative fibers
//! - Panic handling and stack traces
//!
//! The parser, semantic analyzer, and code generator are external
//! collaborators; they hand the core a [`sable_bytecode::Program`].

#![warn(rust_2018_idioms)]

pub mod builtins;
pub mod cycle;
pub mod dispatch;
pub mod fiber;
pub mod heap;
pub mod map;
pub mod native;
pub mod object;
pub mod string;
pub mod symbols;
pub mod trace;
pub mod value;
pub mod vm;

pub use fiber::FrameIter;
pub use heap::{Heap, HeapStats};
pub use map::ValueMap;
pub use native::{ModuleDef, ModuleMember, NativeFn, NativeObjFn, NativeObjFn2, NativePair};
pub use object::{type_id, HeapObject};
pub use trace::{PanicPayload, StackFrame};
pub use value::Value;
pub use vm::{DispatchStats, Vm, VmOptions};

/// VM execution errors
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// A frame would run past the end of the stack; the outer eval wrapper
    /// grows the stack and re-enters the loop at the same pc
    #[error("Stack overflow")]
    StackOverflow,

    /// Script panic; the payload and formatted trace are on the [`Vm`]
    #[error("Panic: {0}")]
    Panic(String),

    /// Invalid opcode byte in the code stream
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// Program failed verification at load time
    #[error("Invalid program: {0}")]
    InvalidProgram(#[from] sable_bytecode::ProgramError),

    /// An allocation size could not be represented
    #[error("Out of memory")]
    OutOfMemory,
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
