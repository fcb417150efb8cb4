//! Native function ABI and module registration
//!
//! Host functions receive the VM, a pointer to their arguments on the value
//! stack, and the argument count; object methods additionally receive the
//! receiver. A native signals a panic by returning [`Value::SENTINEL`] after
//! setting a message with [`crate::vm::Vm::set_panic_msg`].
//!
//! Natives run to completion atomically from the VM's perspective: there is
//! no suspension point inside a native call. They may allocate and must
//! leave reference-count and pool invariants consistent on return; arguments
//! are borrowed, and the calling opcode releases them afterwards.

use crate::value::Value;
use crate::vm::Vm;

/// Free native function
pub type NativeFn = fn(&mut Vm, *const Value, u8) -> Value;

/// Native object method returning one value; the receiver value comes first
pub type NativeObjFn = fn(&mut Vm, Value, *const Value, u8) -> Value;

/// Two results from a native method
///
/// The calling opcode drops extras and fills missing results with `none`
/// according to the return count the call site encodes.
#[derive(Debug, Clone, Copy)]
pub struct NativePair {
    /// First result
    pub first: Value,
    /// Second result
    pub second: Value,
}

/// Native object method returning two values
pub type NativeObjFn2 = fn(&mut Vm, Value, *const Value, u8) -> NativePair;

/// One module member
#[derive(Debug, Clone)]
pub enum ModuleMember {
    /// A constant binding; the value is retained by the variable cell
    Var(Value),
    /// A native function descriptor
    NativeFunc {
        /// Declared parameter count
        num_params: u8,
        /// The function
        func: NativeFn,
    },
}

/// A module: a name plus named members
///
/// Modules are loaded eagerly at startup through
/// [`crate::vm::Vm::register_module`], which runs the equivalent of an
/// initializer hook calling `set_var`/`set_native_func` for every member.
#[derive(Debug, Clone, Default)]
pub struct ModuleDef {
    /// Module name; becomes the resolved parent symbol of its members
    pub name: String,
    /// Members in declaration order
    pub members: Vec<(String, ModuleMember)>,
}

impl ModuleDef {
    /// Create an empty module
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Vec::new(),
        }
    }

    /// Add a constant binding
    pub fn var(mut self, name: &str, value: Value) -> Self {
        self.members.push((name.to_string(), ModuleMember::Var(value)));
        self
    }

    /// Add a native function
    pub fn native_func(mut self, name: &str, num_params: u8, func: NativeFn) -> Self {
        self.members.push((
            name.to_string(),
            ModuleMember::NativeFunc { num_params, func },
        ));
        self
    }
}
