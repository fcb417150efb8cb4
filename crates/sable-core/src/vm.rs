//! The runtime instance and outer eval wrapper
//!
//! One [`Vm`] per embedding owns the heap, the intern table, the symbol
//! tables, the loaded program, the fibers, and the panic slot. The dispatch
//! loop proper lives in [`crate::dispatch`]; this module drives it,
//! handling the three ways it exits: `End` (normal termination),
//! `StackOverflow` (grow the stack and re-enter at the same pc), and
//! `Panic` (build the stack trace and bail).

use rustc_hash::FxHashMap;
use sable_bytecode::{Const, OpCode, Program};

use crate::builtins;
use crate::fiber::{alloc_stack, dealloc_stack, fp_word, pc_word, ret_info_word};
use crate::heap::Heap;
use crate::native::{ModuleDef, ModuleMember, NativeFn};
use crate::object::{type_id, Fiber, HeapObject};
use crate::symbols::{error_sym, FuncSymbol, MethodEntry, Symbols};
use crate::trace::{PanicPayload, StackFrame};
use crate::value::Value;
use crate::{VmError, VmResult};

/// Runtime configuration
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Initial main-fiber stack size in slots
    pub initial_stack_slots: usize,
    /// Pages to pre-allocate in the object pool
    pub initial_heap_pages: usize,
    /// Record per-pc opcode execution counts (test/diagnostic hook)
    pub record_dispatch: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            initial_stack_slots: 4096,
            initial_heap_pages: 1,
            record_dispatch: false,
        }
    }
}

/// Per-pc opcode execution counts, recorded when
/// [`VmOptions::record_dispatch`] is set
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    counts: FxHashMap<(u32, u8), u32>,
}

impl DispatchStats {
    #[inline]
    pub(crate) fn record(&mut self, pc: usize, op: u8) {
        *self.counts.entry((pc as u32, op)).or_insert(0) += 1;
    }

    /// Times the instruction at `pc` executed as `op`
    pub fn count_at(&self, pc: usize, op: OpCode) -> u32 {
        self.counts.get(&(pc as u32, op as u8)).copied().unwrap_or(0)
    }

    /// Total executions of `op` across all pcs
    pub fn op_total(&self, op: OpCode) -> u32 {
        self.counts
            .iter()
            .filter(|((_, o), _)| *o == op as u8)
            .map(|(_, n)| *n)
            .sum()
    }
}

/// How the dispatch loop exited
#[derive(Debug)]
pub(crate) enum Exit {
    /// `End` opcode: program finished with a value
    End(Value),
    /// A `ret` honored its ret-flag: a host-initiated call finished
    Return(Value),
}

/// A Sable virtual machine
pub struct Vm {
    /// Object pool and large-object bookkeeping
    pub heap: Heap,
    pub(crate) intern: FxHashMap<Box<[u8]>, *mut HeapObject>,
    pub(crate) symbols: Symbols,
    pub(crate) program: Program,
    pub(crate) consts: Vec<Value>,

    // execution registers; live in locals inside the dispatch loop and are
    // synced here at calls, suspension points, and loop exits
    pub(crate) pc: usize,
    pub(crate) fp: *mut Value,
    pub(crate) stack: *mut Value,
    pub(crate) stack_cap: usize,
    pub(crate) cur_fiber: *mut HeapObject,
    main_fiber: *mut HeapObject,

    pub(crate) panic_payload: PanicPayload,
    pub(crate) pending_panic_msg: Option<String>,
    pub(crate) stack_trace: Vec<StackFrame>,
    pub(crate) dispatch_stats: Option<DispatchStats>,
    pub(crate) method_entry_cache: Vec<MethodEntry>,
    pub(crate) pending_stack_need: usize,
    pub(crate) cycle_roots: Vec<*mut HeapObject>,
}

impl Vm {
    /// Create a runtime with the builtin `core` module registered
    pub fn new(options: VmOptions) -> Self {
        let stack_cap = options.initial_stack_slots.max(8);
        let stack = alloc_stack(stack_cap);
        let main_fiber = Box::into_raw(Box::new(HeapObject {
            fiber: Fiber::new(stack, stack_cap as u32, 0, 0),
        }));
        let mut vm = Self {
            heap: Heap::new(options.initial_heap_pages),
            intern: FxHashMap::default(),
            symbols: Symbols::new(),
            program: Program::default(),
            consts: Vec::new(),
            pc: 0,
            fp: stack,
            stack,
            stack_cap,
            cur_fiber: main_fiber,
            main_fiber,
            panic_payload: PanicPayload::None,
            pending_panic_msg: None,
            stack_trace: Vec::new(),
            dispatch_stats: options.record_dispatch.then(DispatchStats::default),
            method_entry_cache: Vec::new(),
            pending_stack_need: 0,
            cycle_roots: Vec::new(),
        };
        vm.reset_root_frame();
        builtins::register_core(&mut vm);
        vm
    }

    pub(crate) fn main_fiber_ptr(&self) -> *mut HeapObject {
        self.main_fiber
    }

    fn reset_root_frame(&mut self) {
        unsafe {
            *self.stack = Value::none();
            *self.stack.add(1) = ret_info_word(0, true);
            *self.stack.add(2) = pc_word(0);
            *self.stack.add(3) = fp_word(self.stack);
        }
        self.fp = self.stack;
    }

    /// The symbol tables
    pub fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    /// The symbol tables, mutably (for the code-generator collaborator)
    pub fn symbols_mut(&mut self) -> &mut Symbols {
        &mut self.symbols
    }

    /// Recorded dispatch counts, when enabled
    pub fn dispatch_stats(&self) -> Option<&DispatchStats> {
        self.dispatch_stats.as_ref()
    }

    /// The formatted frames of the last panic
    pub fn stack_trace(&self) -> &[StackFrame] {
        &self.stack_trace
    }

    /// Number of cycle roots found by the last `check_memory` pass
    pub fn cycle_root_count(&self) -> usize {
        self.cycle_roots.len()
    }

    /// Set the message the next [`Value::SENTINEL`] native return raises
    pub fn set_panic_msg(&mut self, msg: impl Into<String>) {
        self.pending_panic_msg = Some(msg.into());
    }

    // ===== Module interface =====

    /// Register a module, eagerly binding every member
    pub fn register_module(&mut self, def: &ModuleDef) {
        for (name, member) in &def.members {
            match member {
                ModuleMember::Var(v) => self.set_var(&def.name, name, *v),
                ModuleMember::NativeFunc { num_params, func } => {
                    self.set_native_func(&def.name, name, *num_params, *func)
                }
            }
        }
    }

    /// Bind a constant into a module's variable cell, retaining it
    pub fn set_var(&mut self, module: &str, name: &str, v: Value) {
        let parent = self.symbols.ensure_name(module);
        let sym = self.symbols.ensure_var_sym(parent, name);
        let old = self.symbols.var_syms[sym as usize];
        self.retain(v);
        self.symbols.var_syms[sym as usize] = v;
        self.release(old);
    }

    /// Bind a native function into a module
    pub fn set_native_func(&mut self, module: &str, name: &str, num_params: u8, func: NativeFn) {
        let parent = self.symbols.ensure_name(module);
        let sym = self.symbols.ensure_func_sym(parent, name, num_params);
        self.symbols.func_syms[sym as usize] = FuncSymbol::Native { func, num_params };
    }

    /// Bind a closure value as a function symbol, retaining it
    pub fn bind_func_closure(&mut self, sym: u32, closure: Value) {
        debug_assert!(closure.is_pointer());
        self.retain(closure);
        if let FuncSymbol::Closure(old) = self.symbols.func_syms[sym as usize] {
            self.release(unsafe { Value::from_ptr(old) });
        }
        self.symbols.func_syms[sym as usize] =
            FuncSymbol::Closure(unsafe { closure.as_ptr() });
    }

    // ===== Program loading and evaluation =====

    /// Verify, load, and run a program to completion
    pub fn eval(&mut self, program: Program) -> VmResult<Value> {
        program.verify()?;
        self.load_program(program);
        self.run()
    }

    fn load_program(&mut self, program: Program) {
        self.consts = program
            .consts
            .iter()
            .map(|c| match *c {
                Const::Number(n) => Value::number(n),
                Const::AStr { start, end } => Value::static_astring(start, end),
                Const::UStr { start, end } => Value::static_ustring(start, end),
            })
            .collect();
        self.program = program;
        self.panic_payload = PanicPayload::None;
        self.stack_trace.clear();
        self.pc = 0;
        // evaluation always starts on the main fiber
        self.cur_fiber = self.main_fiber;
        unsafe {
            let f = (*self.main_fiber).fiber;
            self.stack = f.stack;
            self.stack_cap = f.stack_cap as usize;
        }
        self.reset_root_frame();
    }

    /// Drive the dispatch loop until it finishes, growing the stack and
    /// re-entering at the same pc whenever a frame would not fit
    pub(crate) fn run(&mut self) -> VmResult<Value> {
        loop {
            match self.dispatch_loop() {
                Ok(Exit::End(v)) | Ok(Exit::Return(v)) => return Ok(v),
                Err(VmError::StackOverflow) => {
                    let needed = self.pending_stack_need;
                    self.grow_stack(needed)?;
                }
                Err(e) => {
                    if matches!(e, VmError::Panic(_)) {
                        self.stack_trace = self.build_stack_trace();
                    }
                    return Err(e);
                }
            }
        }
    }

    // ===== Host call interface =====

    /// Call a callable value from the host with the given arguments
    ///
    /// The VM must be idle (not inside `eval`). Arity mismatches produce an
    /// `error(InvalidSignature)` value, matching the in-language behavior.
    pub fn call_function(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        if !callee.is_pointer() {
            return Ok(Value::error_tag(error_sym::INVALID_SIGNATURE));
        }
        unsafe {
            let obj = callee.as_ptr();
            match (*obj).head.type_id {
                type_id::NATIVE_FUNC => {
                    let nf = (*obj).native_func;
                    if nf.num_params as usize != args.len() {
                        return Ok(Value::error_tag(error_sym::INVALID_SIGNATURE));
                    }
                    let res = (nf.func)(self, args.as_ptr(), args.len() as u8);
                    if res == Value::SENTINEL {
                        let msg = self
                            .pending_panic_msg
                            .take()
                            .unwrap_or_else(|| "panic".to_string());
                        self.panic_payload = PanicPayload::Msg(msg.clone());
                        return Err(VmError::Panic(msg));
                    }
                    Ok(res)
                }
                type_id::LAMBDA | type_id::CLOSURE => {
                    let (func_pc, num_params, num_locals) =
                        if (*obj).head.type_id == type_id::LAMBDA {
                            let l = (*obj).lambda;
                            (l.func_pc, l.num_params, l.num_locals)
                        } else {
                            let c = &(*obj).closure;
                            (c.func_pc, c.num_params, c.num_locals)
                        };
                    if num_params as usize != args.len() {
                        return Ok(Value::error_tag(error_sym::INVALID_SIGNATURE));
                    }
                    let need = 4 + num_locals as usize;
                    if need > self.stack_cap {
                        self.grow_stack(need)?;
                    }
                    let fp = self.stack;
                    *fp = Value::none();
                    *fp.add(1) = ret_info_word(1, true);
                    *fp.add(2) = pc_word(0);
                    *fp.add(3) = fp_word(fp);
                    self.retain(callee);
                    *fp.add(4) = callee;
                    for (i, a) in args.iter().enumerate() {
                        self.retain(*a);
                        *fp.add(5 + i) = *a;
                    }
                    if (*obj).head.type_id == type_id::CLOSURE {
                        let c = &(*obj).closure;
                        let base = 4 + num_locals as usize - c.num_captured as usize;
                        for (i, cap) in c.captures.iter().enumerate() {
                            self.retain(*cap);
                            *fp.add(base + i) = *cap;
                        }
                    }
                    self.fp = fp;
                    self.pc = func_pc as usize;
                    self.run()
                }
                _ => Ok(Value::error_tag(error_sym::INVALID_SIGNATURE)),
            }
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // release the globals the symbol tables own
        for i in 0..self.symbols.var_syms.len() {
            let v = self.symbols.var_syms[i];
            self.symbols.var_syms[i] = Value::none();
            self.release(v);
        }
        for i in 0..self.symbols.func_syms.len() {
            if let FuncSymbol::Closure(obj) = self.symbols.func_syms[i] {
                self.symbols.func_syms[i] = FuncSymbol::None;
                self.release(unsafe { Value::from_ptr(obj) });
            }
        }
        unsafe {
            let f = (*self.main_fiber).fiber;
            dealloc_stack(f.stack, f.stack_cap as usize);
            drop(Box::from_raw(self.main_fiber));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_vm_is_clean() {
        let vm = Vm::new(VmOptions::default());
        // builtin registration must not leak heap objects
        assert_eq!(vm.heap.global_rc, 0);
        assert_eq!(vm.heap.stats().live_objects, 0);
        assert!(vm.heap.verify_pages());
    }

    #[test]
    fn test_set_var_retains() {
        let mut vm = Vm::new(VmOptions::default());
        let s = vm.new_string("hello");
        vm.set_var("app", "greeting", s);
        unsafe { assert_eq!((*s.as_ptr()).head.rc, 2) };
        vm.release(s);
        unsafe { assert_eq!((*s.as_ptr()).head.rc, 1) };
    }

    #[test]
    fn test_register_module() {
        fn nop(_vm: &mut Vm, _args: *const Value, _n: u8) -> Value {
            Value::none()
        }
        let mut vm = Vm::new(VmOptions::default());
        let def = ModuleDef::new("testmod")
            .var("version", Value::number(1.0))
            .native_func("nop", 0, nop);
        vm.register_module(&def);
        let parent = vm.symbols.ensure_name("testmod");
        let var = vm.symbols.ensure_var_sym(parent, "version");
        assert_eq!(vm.symbols.var_syms[var as usize], Value::number(1.0));
        let func = vm.symbols.ensure_func_sym(parent, "nop", 0);
        assert!(matches!(
            vm.symbols.func_syms[func as usize],
            FuncSymbol::Native { .. }
        ));
    }

    #[test]
    fn test_call_native_function_value() {
        fn double(_vm: &mut Vm, args: *const Value, n: u8) -> Value {
            assert_eq!(n, 1);
            let v = unsafe { *args };
            Value::number(v.to_f64() * 2.0)
        }
        let mut vm = Vm::new(VmOptions::default());
        let f = vm.alloc_native_func(double, 1);
        let r = vm.call_function(f, &[Value::number(21.0)]).unwrap();
        assert_eq!(r, Value::number(42.0));
        // wrong arity degrades to an error value, not a panic
        let e = vm.call_function(f, &[]).unwrap();
        assert!(e.is_error());
        vm.release(f);
    }
}
