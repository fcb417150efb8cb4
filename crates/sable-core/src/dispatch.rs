//! The bytecode dispatch loop
//!
//! One tight loop over the mutable code stream: fetch the opcode byte,
//! decode operands (little-endian, unaligned), execute, continue. The pc
//! and frame pointer live in locals and are synced to the [`Vm`] only at
//! calls, fiber switches, and loop exits.
//!
//! Shape-dispatched sites rewrite themselves in place on first execution:
//! `field`/`field_retain`/`set_field_release` specialize to `*_ic` forms
//! caching the observed type id and offset, `call_sym` caches the resolved
//! target, and `call_obj_sym` caches the receiver type and method entry. A
//! cached-type mismatch rewrites the site back to its general form and
//! re-executes it. The stream is single-owner and scheduling is
//! cooperative, so a half-rewritten instruction is never observable.
//!
//! Errors leave the loop by `Err`: `StackOverflow` is retried by the outer
//! wrapper after growing the stack (handlers perform the bounds check
//! before any side effect, so re-entry at the same pc is safe), and `Panic`
//! aborts with the frame chain intact for trace building.

use sable_bytecode::OpCode;

use crate::fiber::{decode_ret_info, fp_word, pc_word, ret_info_word, word_fp};
use crate::object::{type_id, MAX_POOL_OBJECT_FIELDS};
use crate::symbols::{error_sym, FuncSymbol, MethodEntry};
use crate::value::{Tag, Value};
use crate::vm::{Exit, Vm};
use crate::{VmError, VmResult};

impl Vm {
    #[inline]
    fn code_u8(&self, at: usize) -> u8 {
        self.program.code[at]
    }

    #[inline]
    fn code_i8(&self, at: usize) -> i8 {
        self.program.code[at] as i8
    }

    #[inline]
    fn code_u16(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.program.code[at], self.program.code[at + 1]])
    }

    #[inline]
    fn code_i16(&self, at: usize) -> i16 {
        self.code_u16(at) as i16
    }

    #[inline]
    fn code_u24(&self, at: usize) -> u32 {
        let c = &self.program.code;
        u32::from_le_bytes([c[at], c[at + 1], c[at + 2], 0])
    }

    #[inline]
    fn code_u32(&self, at: usize) -> u32 {
        let c = &self.program.code;
        u32::from_le_bytes([c[at], c[at + 1], c[at + 2], c[at + 3]])
    }

    #[inline]
    fn patch_op(&mut self, pc: usize, op: OpCode) {
        self.program.code[pc] = op as u8;
    }

    #[inline]
    fn patch_u16(&mut self, at: usize, v: u16) {
        self.program.code[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn patch_u24(&mut self, at: usize, v: u32) {
        self.program.code[at..at + 3].copy_from_slice(&v.to_le_bytes()[..3]);
    }

    #[inline]
    fn patch_u32(&mut self, at: usize, v: u32) {
        self.program.code[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Type id used for method dispatch on a receiver value
    fn dispatch_type_id(&self, v: Value) -> Option<u32> {
        match v.get_tag() {
            Tag::Pointer => Some(unsafe { (*v.as_ptr()).head.type_id }),
            Tag::StaticAstring => Some(type_id::ASTRING),
            Tag::StaticUstring => Some(type_id::USTRING),
            _ => None,
        }
    }

    /// Equality as `compare` sees it: bit equality, or byte equality when
    /// both sides are strings
    pub(crate) fn values_equal(&self, a: Value, b: Value) -> bool {
        if a.raw() == b.raw() {
            return true;
        }
        self.value_string_bytes(a).is_some() && self.string_eq(a, b)
    }

    /// Bounds-check a prospective frame, reporting `StackOverflow` with the
    /// registers saved so the wrapper can grow and re-enter at the same pc
    #[inline]
    fn check_frame(
        &mut self,
        pc: usize,
        fp: *mut Value,
        new_fp: *mut Value,
        num_locals: usize,
    ) -> VmResult<()> {
        unsafe {
            let end = new_fp.add(4 + num_locals);
            if end > self.stack.add(self.stack_cap) {
                self.pc = pc;
                self.fp = fp;
                self.pending_stack_need = end.offset_from(self.stack) as usize;
                return Err(VmError::StackOverflow);
            }
        }
        Ok(())
    }

    /// Handle a native's sentinel return by raising Panic with the message
    /// the native left behind
    fn native_panic(&mut self, pc: usize, fp: *mut Value) -> VmError {
        let msg = self
            .pending_panic_msg
            .take()
            .unwrap_or_else(|| "panic".to_string());
        self.panic_msg(pc, fp, msg)
    }

    /// The dispatch loop; see the module docs
    pub(crate) fn dispatch_loop(&mut self) -> VmResult<Exit> {
        let mut pc = self.pc;
        let mut fp = self.fp;

        macro_rules! local {
            ($idx:expr) => {
                unsafe { *fp.add($idx as usize) }
            };
        }
        macro_rules! set_local {
            ($idx:expr, $v:expr) => {
                unsafe { *fp.add($idx as usize) = $v }
            };
        }

        loop {
            let opbyte = self.program.code[pc];
            if let Some(stats) = &mut self.dispatch_stats {
                stats.record(pc, opbyte);
            }
            let op = match OpCode::from_u8(opbyte) {
                Some(op) => op,
                None => {
                    self.pc = pc;
                    self.fp = fp;
                    return Err(VmError::InvalidOpcode(opbyte));
                }
            };

            match op {
                OpCode::Nop => pc += 1,

                // ===== Moves, constants, reference counting =====
                OpCode::ConstOp => {
                    let idx = self.code_u8(pc + 1) as usize;
                    set_local!(self.code_u8(pc + 2), self.consts[idx]);
                    pc += 3;
                }
                OpCode::ConstI8 => {
                    let v = Value::number(self.code_i8(pc + 1) as f64);
                    set_local!(self.code_u8(pc + 2), v);
                    pc += 3;
                }
                OpCode::None => {
                    set_local!(self.code_u8(pc + 1), Value::none());
                    pc += 2;
                }
                OpCode::True => {
                    set_local!(self.code_u8(pc + 1), Value::boolean(true));
                    pc += 2;
                }
                OpCode::False => {
                    set_local!(self.code_u8(pc + 1), Value::boolean(false));
                    pc += 2;
                }
                OpCode::Copy => {
                    set_local!(self.code_u8(pc + 2), local!(self.code_u8(pc + 1)));
                    pc += 3;
                }
                OpCode::CopyRetainSrc => {
                    let v = local!(self.code_u8(pc + 1));
                    self.retain(v);
                    set_local!(self.code_u8(pc + 2), v);
                    pc += 3;
                }
                OpCode::CopyReleaseDst => {
                    let dst = self.code_u8(pc + 2);
                    self.release(local!(dst));
                    set_local!(dst, local!(self.code_u8(pc + 1)));
                    pc += 3;
                }
                OpCode::CopyRetainRelease => {
                    let v = local!(self.code_u8(pc + 1));
                    let dst = self.code_u8(pc + 2);
                    self.retain(v);
                    self.release(local!(dst));
                    set_local!(dst, v);
                    pc += 3;
                }
                OpCode::Retain => {
                    self.retain(local!(self.code_u8(pc + 1)));
                    pc += 2;
                }
                OpCode::Release => {
                    self.release(local!(self.code_u8(pc + 1)));
                    pc += 2;
                }
                OpCode::ReleaseN => {
                    let n = self.code_u8(pc + 1) as usize;
                    for i in 0..n {
                        self.release(local!(self.code_u8(pc + 2 + i)));
                    }
                    pc += 2 + n;
                }

                // ===== Arithmetic, comparison, logic =====
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod
                | OpCode::Pow => {
                    let a = local!(self.code_u8(pc + 1));
                    let b = local!(self.code_u8(pc + 2));
                    // hot path: both operands are already numbers
                    let (x, y) = if a.is_number() && b.is_number() {
                        (a.as_f64().unwrap(), b.as_f64().unwrap())
                    } else {
                        (self.to_number(a), self.to_number(b))
                    };
                    let r = match op {
                        OpCode::Add => x + y,
                        OpCode::Sub => x - y,
                        OpCode::Mul => x * y,
                        OpCode::Div => x / y,
                        OpCode::Mod => x % y,
                        _ => x.powf(y),
                    };
                    set_local!(self.code_u8(pc + 3), Value::number(r));
                    pc += 4;
                }
                OpCode::Neg => {
                    let v = local!(self.code_u8(pc + 1));
                    let x = if v.is_number() {
                        v.as_f64().unwrap()
                    } else {
                        self.to_number(v)
                    };
                    set_local!(self.code_u8(pc + 2), Value::number(-x));
                    pc += 3;
                }
                OpCode::Less | OpCode::LessEqual | OpCode::Greater | OpCode::GreaterEqual => {
                    let a = local!(self.code_u8(pc + 1));
                    let b = local!(self.code_u8(pc + 2));
                    let (x, y) = if a.is_number() && b.is_number() {
                        (a.as_f64().unwrap(), b.as_f64().unwrap())
                    } else {
                        (self.to_number(a), self.to_number(b))
                    };
                    let r = match op {
                        OpCode::Less => x < y,
                        OpCode::LessEqual => x <= y,
                        OpCode::Greater => x > y,
                        _ => x >= y,
                    };
                    set_local!(self.code_u8(pc + 3), Value::boolean(r));
                    pc += 4;
                }
                OpCode::Compare => {
                    let r = self.values_equal(local!(self.code_u8(pc + 1)), local!(self.code_u8(pc + 2)));
                    set_local!(self.code_u8(pc + 3), Value::boolean(r));
                    pc += 4;
                }
                OpCode::CompareNot => {
                    let r = self.values_equal(local!(self.code_u8(pc + 1)), local!(self.code_u8(pc + 2)));
                    set_local!(self.code_u8(pc + 3), Value::boolean(!r));
                    pc += 4;
                }
                OpCode::Not => {
                    let v = local!(self.code_u8(pc + 1));
                    set_local!(self.code_u8(pc + 2), Value::boolean(!v.to_bool()));
                    pc += 3;
                }
                OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor | OpCode::ShiftLeft
                | OpCode::ShiftRight => {
                    let a = self.to_number(local!(self.code_u8(pc + 1))) as i32;
                    let b = self.to_number(local!(self.code_u8(pc + 2))) as i32;
                    let r = match op {
                        OpCode::BitAnd => a & b,
                        OpCode::BitOr => a | b,
                        OpCode::BitXor => a ^ b,
                        OpCode::ShiftLeft => a.wrapping_shl(b as u32),
                        _ => a.wrapping_shr(b as u32),
                    };
                    set_local!(self.code_u8(pc + 3), Value::number(r as f64));
                    pc += 4;
                }
                OpCode::BitNot => {
                    let a = self.to_number(local!(self.code_u8(pc + 1))) as i32;
                    set_local!(self.code_u8(pc + 2), Value::number(!a as f64));
                    pc += 3;
                }

                // ===== Control flow =====
                OpCode::Jump => {
                    pc = (pc as isize + self.code_i16(pc + 1) as isize) as usize;
                }
                OpCode::JumpCond => {
                    if local!(self.code_u8(pc + 1)).to_bool() {
                        pc = (pc as isize + self.code_i16(pc + 2) as isize) as usize;
                    } else {
                        pc += 4;
                    }
                }
                OpCode::JumpNotCond => {
                    if !local!(self.code_u8(pc + 1)).to_bool() {
                        pc = (pc as isize + self.code_i16(pc + 2) as isize) as usize;
                    } else {
                        pc += 4;
                    }
                }
                OpCode::JumpNotNone => {
                    if !local!(self.code_u8(pc + 1)).is_none() {
                        pc = (pc as isize + self.code_i16(pc + 2) as isize) as usize;
                    } else {
                        pc += 4;
                    }
                }
                OpCode::Match => {
                    let expr = local!(self.code_u8(pc + 1));
                    let num_cases = self.code_u8(pc + 2) as usize;
                    let mut target = None;
                    for i in 0..num_cases {
                        let at = pc + 3 + i * 3;
                        let case = local!(self.code_u8(at));
                        if self.values_equal(expr, case) {
                            target = Some(self.code_u16(at + 1) as usize);
                            break;
                        }
                    }
                    let off = target
                        .unwrap_or_else(|| self.code_u16(pc + 3 + num_cases * 3) as usize);
                    pc += off;
                }
                OpCode::ForRangeInit => {
                    let start = self.to_number(local!(self.code_u8(pc + 1)));
                    let end = self.to_number(local!(self.code_u8(pc + 2)));
                    set_local!(self.code_u8(pc + 3), Value::number(start));
                    let exit_off = self.code_u16(pc + 4) as usize;
                    if start == end {
                        pc += exit_off;
                    } else {
                        // first execution picks the step specialization
                        let step_pc = pc + exit_off - 5;
                        let step_op = if start < end {
                            OpCode::ForRange
                        } else {
                            OpCode::ForRangeReverse
                        };
                        self.patch_op(step_pc, step_op);
                        pc += 6;
                    }
                }
                OpCode::ForRange => {
                    let counter = self.code_u8(pc + 1);
                    let end = self.to_number(local!(self.code_u8(pc + 2)));
                    let c = local!(counter).to_f64() + 1.0;
                    if c < end {
                        set_local!(counter, Value::number(c));
                        pc -= self.code_u16(pc + 3) as usize;
                    } else {
                        pc += 5;
                    }
                }
                OpCode::ForRangeReverse => {
                    let counter = self.code_u8(pc + 1);
                    let end = self.to_number(local!(self.code_u8(pc + 2)));
                    let c = local!(counter).to_f64() - 1.0;
                    if c > end {
                        set_local!(counter, Value::number(c));
                        pc -= self.code_u16(pc + 3) as usize;
                    } else {
                        pc += 5;
                    }
                }

                // ===== Calls and returns =====
                OpCode::Call => {
                    let start = self.code_u8(pc + 1) as usize;
                    let num_args = self.code_u8(pc + 2);
                    let num_ret = self.code_u8(pc + 3);
                    let new_fp = unsafe { fp.add(start) };
                    let callee = unsafe { *new_fp.add(4) };
                    match self.call_value(pc, fp, new_fp, callee, num_args, num_ret, pc + 4)? {
                        CallOutcome::Enter(entry_pc) => {
                            fp = new_fp;
                            pc = entry_pc;
                        }
                        CallOutcome::Continue => pc += 4,
                    }
                }
                OpCode::CallSym => {
                    let start = self.code_u8(pc + 1) as usize;
                    let num_args = self.code_u8(pc + 2);
                    let num_ret = self.code_u8(pc + 3);
                    let sym = self.code_u16(pc + 4) as usize;
                    let new_fp = unsafe { fp.add(start) };
                    match self.symbols.func_syms[sym] {
                        FuncSymbol::Func {
                            pc: func_pc,
                            num_params,
                            num_locals,
                        } => {
                            debug_assert_eq!(num_params, num_args);
                            self.check_frame(pc, fp, new_fp, num_locals as usize)?;
                            self.patch_op(pc, OpCode::CallFuncIC);
                            self.patch_u24(pc + 6, func_pc);
                            self.program.code[pc + 9] = num_locals;
                            unsafe {
                                *new_fp.add(1) = ret_info_word(num_ret, false);
                                *new_fp.add(2) = pc_word(pc + 10);
                                *new_fp.add(3) = fp_word(fp);
                            }
                            fp = new_fp;
                            pc = func_pc as usize;
                        }
                        FuncSymbol::Native { func, num_params } => {
                            debug_assert_eq!(num_params, num_args);
                            self.patch_op(pc, OpCode::CallNativeIC);
                            self.patch_u32(pc + 6, sym as u32);
                            self.pc = pc;
                            self.fp = fp;
                            let res =
                                func(self, unsafe { new_fp.add(4) } as *const Value, num_args);
                            if res == Value::SENTINEL {
                                return Err(self.native_panic(pc, fp));
                            }
                            for i in 0..num_args as usize {
                                self.release(unsafe { *new_fp.add(4 + i) });
                            }
                            if num_ret >= 1 {
                                unsafe { *new_fp = res };
                            } else {
                                self.release(res);
                            }
                            pc += 10;
                        }
                        FuncSymbol::Closure(obj) => {
                            // bounds-check before mutating the frame: the
                            // arg shift below must not run twice when the
                            // wrapper grows the stack and re-enters here
                            let num_locals = unsafe { (&(*obj).closure).num_locals };
                            self.check_frame(pc, fp, new_fp, num_locals as usize)?;
                            // shift the args up one slot into the value-call
                            // shape and keep the closure in the callee slot
                            unsafe {
                                std::ptr::copy(
                                    new_fp.add(4),
                                    new_fp.add(5),
                                    num_args as usize,
                                );
                                let callee = Value::from_ptr(obj);
                                self.retain(callee);
                                *new_fp.add(4) = callee;
                            }
                            let callee = unsafe { Value::from_ptr(obj) };
                            match self
                                .call_value(pc, fp, new_fp, callee, num_args, num_ret, pc + 10)?
                            {
                                CallOutcome::Enter(entry_pc) => {
                                    fp = new_fp;
                                    pc = entry_pc;
                                }
                                CallOutcome::Continue => pc += 10,
                            }
                        }
                        FuncSymbol::None => {
                            return Err(self.panic_msg(
                                pc,
                                fp,
                                "Missing function symbol.".to_string(),
                            ));
                        }
                    }
                }
                OpCode::CallFuncIC => {
                    let start = self.code_u8(pc + 1) as usize;
                    let num_ret = self.code_u8(pc + 3);
                    let func_pc = self.code_u24(pc + 6);
                    let num_locals = self.code_u8(pc + 9) as usize;
                    let new_fp = unsafe { fp.add(start) };
                    self.check_frame(pc, fp, new_fp, num_locals)?;
                    unsafe {
                        *new_fp.add(1) = ret_info_word(num_ret, false);
                        *new_fp.add(2) = pc_word(pc + 10);
                        *new_fp.add(3) = fp_word(fp);
                    }
                    fp = new_fp;
                    pc = func_pc as usize;
                }
                OpCode::CallNativeIC => {
                    let start = self.code_u8(pc + 1) as usize;
                    let num_args = self.code_u8(pc + 2);
                    let num_ret = self.code_u8(pc + 3);
                    let sym = self.code_u32(pc + 6) as usize;
                    let new_fp = unsafe { fp.add(start) };
                    match self.symbols.func_syms[sym] {
                        FuncSymbol::Native { func, .. } => {
                            self.pc = pc;
                            self.fp = fp;
                            let res =
                                func(self, unsafe { new_fp.add(4) } as *const Value, num_args);
                            if res == Value::SENTINEL {
                                return Err(self.native_panic(pc, fp));
                            }
                            for i in 0..num_args as usize {
                                self.release(unsafe { *new_fp.add(4 + i) });
                            }
                            if num_ret >= 1 {
                                unsafe { *new_fp = res };
                            } else {
                                self.release(res);
                            }
                            pc += 10;
                        }
                        _ => {
                            // the symbol was rebound; fall back to the
                            // general form and re-execute
                            self.patch_op(pc, OpCode::CallSym);
                        }
                    }
                }
                OpCode::CallObjSym => {
                    let num_args = self.code_u8(pc + 2);
                    let num_ret = self.code_u8(pc + 3);
                    let sym = self.code_u16(pc + 4) as u32;
                    let new_fp = unsafe { fp.add(self.code_u8(pc + 1) as usize) };
                    let recv = unsafe { *new_fp.add(4) };
                    let tid = match self.dispatch_type_id(recv) {
                        Some(tid) => tid,
                        None => {
                            let msg = format!(
                                "`{}` is not callable on `{}`.",
                                self.symbols.method_name(sym),
                                recv.type_name()
                            );
                            return Err(self.panic_msg(pc, fp, msg));
                        }
                    };
                    match self.symbols.resolve_method(tid, sym) {
                        Some(entry) => {
                            match entry {
                                MethodEntry::Func {
                                    pc: func_pc,
                                    num_locals,
                                    ..
                                } => {
                                    self.check_frame(pc, fp, new_fp, num_locals as usize)?;
                                    self.patch_op(pc, OpCode::CallObjFuncIC);
                                    self.patch_u16(pc + 6, tid as u16);
                                    self.patch_u24(pc + 8, func_pc);
                                    self.program.code[pc + 11] = num_locals;
                                    unsafe {
                                        *new_fp.add(1) = ret_info_word(num_ret, false);
                                        *new_fp.add(2) = pc_word(pc + 12);
                                        *new_fp.add(3) = fp_word(fp);
                                    }
                                    fp = new_fp;
                                    pc = func_pc as usize;
                                }
                                MethodEntry::Native1(_) | MethodEntry::Native2(_) => {
                                    self.patch_op(pc, OpCode::CallObjNativeIC);
                                    self.patch_u16(pc + 6, tid as u16);
                                    self.method_entry_cache.push(entry);
                                    let cache_idx = self.method_entry_cache.len() as u32 - 1;
                                    self.patch_u32(pc + 8, cache_idx);
                                    self.call_obj_native(pc, fp, new_fp, entry, num_args, num_ret)?;
                                    pc += 12;
                                }
                            }
                        }
                        None => {
                            let msg = format!(
                                "`{}` is not a method of `{}`.",
                                self.symbols.method_name(sym),
                                self.type_display_name(tid)
                            );
                            return Err(self.panic_msg(pc, fp, msg));
                        }
                    }
                }
                OpCode::CallObjFuncIC => {
                    let num_ret = self.code_u8(pc + 3);
                    let cached_tid = self.code_u16(pc + 6) as u32;
                    let new_fp = unsafe { fp.add(self.code_u8(pc + 1) as usize) };
                    let recv = unsafe { *new_fp.add(4) };
                    if self.dispatch_type_id(recv) == Some(cached_tid) {
                        let func_pc = self.code_u24(pc + 8);
                        let num_locals = self.code_u8(pc + 11) as usize;
                        self.check_frame(pc, fp, new_fp, num_locals)?;
                        unsafe {
                            *new_fp.add(1) = ret_info_word(num_ret, false);
                            *new_fp.add(2) = pc_word(pc + 12);
                            *new_fp.add(3) = fp_word(fp);
                        }
                        fp = new_fp;
                        pc = func_pc as usize;
                    } else {
                        self.patch_op(pc, OpCode::CallObjSym);
                    }
                }
                OpCode::CallObjNativeIC => {
                    let num_args = self.code_u8(pc + 2);
                    let num_ret = self.code_u8(pc + 3);
                    let cached_tid = self.code_u16(pc + 6) as u32;
                    let new_fp = unsafe { fp.add(self.code_u8(pc + 1) as usize) };
                    let recv = unsafe { *new_fp.add(4) };
                    if self.dispatch_type_id(recv) == Some(cached_tid) {
                        let entry = self.method_entry_cache[self.code_u32(pc + 8) as usize];
                        self.call_obj_native(pc, fp, new_fp, entry, num_args, num_ret)?;
                        pc += 12;
                    } else {
                        self.patch_op(pc, OpCode::CallObjSym);
                    }
                }
                OpCode::Ret0 | OpCode::Ret1 => {
                    let (num_ret, ret_flag) = decode_ret_info(unsafe { *fp.add(1) });
                    let ret_pc = unsafe { (*fp.add(2)).raw() as usize };
                    let prev_fp = unsafe { word_fp(*fp.add(3)) };
                    let mut result = Value::none();
                    if op == OpCode::Ret1 {
                        result = unsafe { *fp };
                        if num_ret == 0 {
                            self.release(result);
                            result = Value::none();
                        }
                    } else if num_ret >= 1 {
                        unsafe { *fp = Value::none() };
                    }
                    if num_ret >= 2 {
                        // a single-result return filling a two-result site
                        unsafe { *fp.add(1) = Value::none() };
                    }
                    pc = ret_pc;
                    fp = prev_fp;
                    if ret_flag {
                        self.pc = pc;
                        self.fp = fp;
                        return Ok(Exit::Return(result));
                    }
                }
                OpCode::End => {
                    let local = self.code_u8(pc + 1);
                    let v = if local == 0xFF {
                        Value::none()
                    } else {
                        local!(local)
                    };
                    self.pc = pc;
                    self.fp = fp;
                    return Ok(Exit::End(v));
                }

                // ===== Objects, fields, boxes, tags =====
                OpCode::ObjectSmall | OpCode::Object => {
                    let shape = self.code_u16(pc + 1) as u32;
                    let start = self.code_u8(pc + 3) as usize;
                    let n = self.code_u8(pc + 4) as usize;
                    let tid = type_id::FIRST_OBJECT + shape;
                    debug_assert_eq!(self.symbols.object_shape_field_count(tid), n);
                    debug_assert_eq!(op == OpCode::ObjectSmall, n <= MAX_POOL_OBJECT_FIELDS);
                    let mut taken = Vec::with_capacity(n);
                    for i in 0..n {
                        taken.push(unsafe { *fp.add(start + i) });
                    }
                    let obj = self.alloc_object(tid, &taken);
                    set_local!(self.code_u8(pc + 5), obj);
                    pc += 6;
                }
                OpCode::Field | OpCode::FieldRetain => {
                    let recv = local!(self.code_u8(pc + 1));
                    let sym = self.code_u16(pc + 3) as u32;
                    let offset = self.resolve_field_or_panic(pc, fp, recv, sym)?;
                    let v = unsafe { *Self::object_fields(recv.as_ptr()).add(offset as usize) };
                    if op == OpCode::FieldRetain {
                        self.retain(v);
                        self.patch_op(pc, OpCode::FieldRetainIC);
                    } else {
                        self.patch_op(pc, OpCode::FieldIC);
                    }
                    let tid = unsafe { (*recv.as_ptr()).head.type_id };
                    self.patch_u16(pc + 5, tid as u16);
                    self.program.code[pc + 7] = offset as u8;
                    set_local!(self.code_u8(pc + 2), v);
                    pc += 8;
                }
                OpCode::FieldIC | OpCode::FieldRetainIC => {
                    let recv = local!(self.code_u8(pc + 1));
                    let cached_tid = self.code_u16(pc + 5) as u32;
                    if recv.is_pointer()
                        && unsafe { (*recv.as_ptr()).head.type_id } == cached_tid
                    {
                        let off = self.code_u8(pc + 7) as usize;
                        let v = unsafe { *Self::object_fields(recv.as_ptr()).add(off) };
                        if op == OpCode::FieldRetainIC {
                            self.retain(v);
                        }
                        set_local!(self.code_u8(pc + 2), v);
                        pc += 8;
                    } else {
                        let general = if op == OpCode::FieldIC {
                            OpCode::Field
                        } else {
                            OpCode::FieldRetain
                        };
                        self.patch_op(pc, general);
                    }
                }
                OpCode::SetFieldRelease => {
                    let recv = local!(self.code_u8(pc + 1));
                    let sym = self.code_u16(pc + 3) as u32;
                    let offset = self.resolve_field_or_panic(pc, fp, recv, sym)?;
                    unsafe {
                        let slot = Self::object_fields(recv.as_ptr()).add(offset as usize);
                        let old = *slot;
                        *slot = local!(self.code_u8(pc + 2));
                        self.release(old);
                        let tid = (*recv.as_ptr()).head.type_id;
                        self.patch_op(pc, OpCode::SetFieldReleaseIC);
                        self.patch_u16(pc + 5, tid as u16);
                        self.program.code[pc + 7] = offset as u8;
                    }
                    pc += 8;
                }
                OpCode::SetFieldReleaseIC => {
                    let recv = local!(self.code_u8(pc + 1));
                    let cached_tid = self.code_u16(pc + 5) as u32;
                    if recv.is_pointer()
                        && unsafe { (*recv.as_ptr()).head.type_id } == cached_tid
                    {
                        unsafe {
                            let slot = Self::object_fields(recv.as_ptr())
                                .add(self.code_u8(pc + 7) as usize);
                            let old = *slot;
                            *slot = local!(self.code_u8(pc + 2));
                            self.release(old);
                        }
                        pc += 8;
                    } else {
                        self.patch_op(pc, OpCode::SetFieldRelease);
                    }
                }
                OpCode::Box => {
                    let v = local!(self.code_u8(pc + 1));
                    let b = self.alloc_box(v);
                    set_local!(self.code_u8(pc + 2), b);
                    pc += 3;
                }
                OpCode::SetBoxValue | OpCode::SetBoxValueRelease => {
                    let b = local!(self.code_u8(pc + 1));
                    let v = local!(self.code_u8(pc + 2));
                    debug_assert!(b.is_pointer());
                    unsafe {
                        let obj = b.as_ptr();
                        debug_assert_eq!((*obj).head.type_id, type_id::BOX);
                        let old = (*obj).boxv.value;
                        (*obj).boxv.value = v;
                        if op == OpCode::SetBoxValueRelease {
                            self.release(old);
                        }
                    }
                    pc += 3;
                }
                OpCode::BoxValue | OpCode::BoxValueRetain => {
                    let b = local!(self.code_u8(pc + 1));
                    debug_assert!(b.is_pointer());
                    let v = unsafe { (*b.as_ptr()).boxv.value };
                    if op == OpCode::BoxValueRetain {
                        self.retain(v);
                    }
                    set_local!(self.code_u8(pc + 2), v);
                    pc += 3;
                }
                OpCode::Tag => {
                    let v = Value::tag_value(self.code_u8(pc + 1), self.code_u8(pc + 2));
                    set_local!(self.code_u8(pc + 3), v);
                    pc += 4;
                }
                OpCode::TagLiteral => {
                    let v = Value::tag_literal(self.code_u8(pc + 1) as u32);
                    set_local!(self.code_u8(pc + 2), v);
                    pc += 3;
                }

                // ===== Collections and strings =====
                OpCode::List => {
                    let start = self.code_u8(pc + 1) as usize;
                    let n = self.code_u8(pc + 2) as usize;
                    let mut elems = Vec::with_capacity(n);
                    for i in 0..n {
                        elems.push(unsafe { *fp.add(start + i) });
                    }
                    let l = self.alloc_list(elems);
                    set_local!(self.code_u8(pc + 3), l);
                    pc += 4;
                }
                OpCode::MapEmpty => {
                    let m = self.alloc_map();
                    set_local!(self.code_u8(pc + 1), m);
                    pc += 2;
                }
                OpCode::Map => {
                    let start = self.code_u8(pc + 1) as usize;
                    let n = self.code_u8(pc + 2) as usize;
                    let m = self.alloc_map();
                    for i in 0..n {
                        let key = unsafe { *fp.add(start + i * 2) };
                        let val = unsafe { *fp.add(start + i * 2 + 1) };
                        unsafe {
                            let inner = &mut (*(*m.as_ptr()).map).inner;
                            let bytes = self.string_bytes(key);
                            if let Some(prior) = inner.insert(key, bytes, val) {
                                // duplicate literal key: last value wins and
                                // the duplicate key object is dropped
                                self.release(prior);
                                self.release(key);
                            }
                        }
                    }
                    set_local!(self.code_u8(pc + 3), m);
                    pc += 4;
                }
                OpCode::Index => {
                    let left = local!(self.code_u8(pc + 1));
                    let idx = local!(self.code_u8(pc + 2));
                    let v = self.index_read(pc, fp, left, idx, false)?;
                    set_local!(self.code_u8(pc + 3), v);
                    pc += 4;
                }
                OpCode::ReverseIndex => {
                    let left = local!(self.code_u8(pc + 1));
                    let idx = local!(self.code_u8(pc + 2));
                    let v = self.index_read(pc, fp, left, idx, true)?;
                    set_local!(self.code_u8(pc + 3), v);
                    pc += 4;
                }
                OpCode::SetIndex | OpCode::SetIndexRelease => {
                    let left = local!(self.code_u8(pc + 1));
                    let idx = local!(self.code_u8(pc + 2));
                    let val = local!(self.code_u8(pc + 3));
                    self.index_write(pc, fp, left, idx, val, op == OpCode::SetIndexRelease)?;
                    pc += 4;
                }
                OpCode::Slice => {
                    let recv = local!(self.code_u8(pc + 1));
                    let start_v = local!(self.code_u8(pc + 2));
                    let end_v = local!(self.code_u8(pc + 3));
                    let v = self.slice_value(pc, fp, recv, start_v, end_v)?;
                    set_local!(self.code_u8(pc + 4), v);
                    pc += 5;
                }
                OpCode::StringConcat => {
                    let start = self.code_u8(pc + 1) as usize;
                    let count = self.code_u8(pc + 2);
                    let a = unsafe { *fp.add(start) };
                    let b = unsafe { *fp.add(start + 1) };
                    let r = if count == 2 {
                        self.string_concat2(a, b)
                    } else {
                        let c = unsafe { *fp.add(start + 2) };
                        self.string_concat3(a, b, c)
                    };
                    match r {
                        Some(v) => set_local!(self.code_u8(pc + 3), v),
                        None => {
                            return Err(self.panic_msg(
                                pc,
                                fp,
                                "Cannot concatenate non-string values.".to_string(),
                            ));
                        }
                    }
                    pc += 4;
                }

                // ===== Fibers, errors, globals =====
                OpCode::Coinit => {
                    let start_args = self.code_u8(pc + 1);
                    let num_args = self.code_u8(pc + 2);
                    let jump = self.code_u16(pc + 3) as usize;
                    let init_stack = self.code_u8(pc + 5) as usize;
                    let fiber = self.alloc_fiber(fp, start_args, num_args, pc + 7, init_stack);
                    set_local!(self.code_u8(pc + 6), fiber);
                    pc += jump;
                }
                OpCode::Coresume => {
                    let fiber = local!(self.code_u8(pc + 1));
                    let dst = self.code_u8(pc + 2);
                    self.pc = pc;
                    self.fp = fp;
                    match self.resume_fiber(fiber, dst, pc) {
                        Some(entry_pc) => {
                            pc = entry_pc;
                            fp = self.fp;
                        }
                        None => {
                            set_local!(dst, Value::none());
                            pc += 3;
                        }
                    }
                }
                OpCode::Coyield => {
                    if self.on_main_fiber() {
                        return Err(self.panic_msg(
                            pc,
                            fp,
                            "Cannot yield from the main fiber.".to_string(),
                        ));
                    }
                    self.fp = fp;
                    pc = self.yield_fiber(pc);
                    fp = self.fp;
                }
                OpCode::Coreturn => {
                    if self.on_main_fiber() {
                        return Err(self.panic_msg(
                            pc,
                            fp,
                            "Cannot return from the main fiber.".to_string(),
                        ));
                    }
                    self.fp = fp;
                    pc = self.return_fiber();
                    fp = self.fp;
                }
                OpCode::TryValue => {
                    let v = local!(self.code_u8(pc + 1));
                    if !v.is_error() {
                        set_local!(self.code_u8(pc + 2), v);
                        pc += 5;
                    } else if unsafe { word_fp(*fp.add(3)) } == fp {
                        // unhandled error escaping the root frame
                        return Err(self.panic_err(pc, fp, v));
                    } else {
                        unsafe { *fp = v };
                        pc += self.code_u16(pc + 3) as usize;
                    }
                }
                OpCode::StaticVar => {
                    let sym = self.code_u16(pc + 1) as usize;
                    let v = self.symbols.var_syms[sym];
                    self.retain(v);
                    set_local!(self.code_u8(pc + 3), v);
                    pc += 4;
                }
                OpCode::SetStaticVar => {
                    let sym = self.code_u16(pc + 1) as usize;
                    let v = local!(self.code_u8(pc + 3));
                    let old = self.symbols.var_syms[sym];
                    self.symbols.var_syms[sym] = v;
                    self.release(old);
                    pc += 4;
                }
            }
        }
    }

    fn type_display_name(&self, tid: u32) -> String {
        if tid >= type_id::FIRST_OBJECT {
            self.symbols.object_shape_name(tid).to_string()
        } else {
            format!("type#{tid}")
        }
    }

    fn resolve_field_or_panic(
        &mut self,
        pc: usize,
        fp: *mut Value,
        recv: Value,
        sym: u32,
    ) -> VmResult<u16> {
        if !recv.is_pointer() {
            let msg = format!("Field access on `{}`.", recv.type_name());
            return Err(self.panic_msg(pc, fp, msg));
        }
        let tid = unsafe { (*recv.as_ptr()).head.type_id };
        if tid < type_id::FIRST_OBJECT {
            let msg = format!("Field access on `{}`.", self.type_display_name(tid));
            return Err(self.panic_msg(pc, fp, msg));
        }
        match self.symbols.resolve_field(tid, sym) {
            Some(off) => Ok(off),
            None => {
                let msg = format!(
                    "Missing field `{}` in `{}`.",
                    self.symbols.field_name(sym),
                    self.type_display_name(tid)
                );
                Err(self.panic_msg(pc, fp, msg))
            }
        }
    }

    /// Value-call path shared by `call` and closure-bound symbols
    ///
    /// The callee sits at `new_fp[4]` and args at `new_fp[5..]`. On arity
    /// mismatch the callee and args are released, `error(InvalidSignature)`
    /// lands in the destination, and the body is not entered.
    fn call_value(
        &mut self,
        pc: usize,
        fp: *mut Value,
        new_fp: *mut Value,
        callee: Value,
        num_args: u8,
        num_ret: u8,
        ret_pc: usize,
    ) -> VmResult<CallOutcome> {
        let arity_error = |vm: &mut Vm| {
            vm.release(callee);
            for i in 0..num_args as usize {
                vm.release(unsafe { *new_fp.add(5 + i) });
            }
            if num_ret >= 1 {
                unsafe { *new_fp = Value::error_tag(error_sym::INVALID_SIGNATURE) };
            }
            Ok(CallOutcome::Continue)
        };

        if !callee.is_pointer() {
            let msg = format!("`{}` is not callable.", callee.type_name());
            return Err(self.panic_msg(pc, fp, msg));
        }
        unsafe {
            let obj = callee.as_ptr();
            match (*obj).head.type_id {
                type_id::LAMBDA => {
                    let l = (*obj).lambda;
                    if l.num_params != num_args {
                        return arity_error(self);
                    }
                    self.check_frame(pc, fp, new_fp, l.num_locals as usize)?;
                    *new_fp.add(1) = ret_info_word(num_ret, false);
                    *new_fp.add(2) = pc_word(ret_pc);
                    *new_fp.add(3) = fp_word(fp);
                    Ok(CallOutcome::Enter(l.func_pc as usize))
                }
                type_id::CLOSURE => {
                    let (func_pc, num_params, num_locals, num_captured) = {
                        let c = &(*obj).closure;
                        (c.func_pc, c.num_params, c.num_locals, c.num_captured)
                    };
                    if num_params != num_args {
                        return arity_error(self);
                    }
                    self.check_frame(pc, fp, new_fp, num_locals as usize)?;
                    *new_fp.add(1) = ret_info_word(num_ret, false);
                    *new_fp.add(2) = pc_word(ret_pc);
                    *new_fp.add(3) = fp_word(fp);
                    // captured values are copied to the top of the frame
                    let base = 4 + num_locals as usize - num_captured as usize;
                    for i in 0..num_captured as usize {
                        let cap = (&(*obj).closure).captures[i];
                        self.retain(cap);
                        *new_fp.add(base + i) = cap;
                    }
                    Ok(CallOutcome::Enter(func_pc as usize))
                }
                type_id::NATIVE_FUNC => {
                    let nf = (*obj).native_func;
                    if nf.num_params as u8 != num_args {
                        return arity_error(self);
                    }
                    self.pc = pc;
                    self.fp = fp;
                    let res = (nf.func)(self, new_fp.add(5) as *const Value, num_args);
                    if res == Value::SENTINEL {
                        return Err(self.native_panic(pc, fp));
                    }
                    for i in 0..num_args as usize {
                        self.release(*new_fp.add(5 + i));
                    }
                    self.release(callee);
                    if num_ret >= 1 {
                        *new_fp = res;
                    } else {
                        self.release(res);
                    }
                    Ok(CallOutcome::Continue)
                }
                _ => {
                    let msg = format!("`{}` is not callable.", callee.type_name());
                    Err(self.panic_msg(pc, fp, msg))
                }
            }
        }
    }

    /// Invoke a native method entry and distribute its results
    fn call_obj_native(
        &mut self,
        pc: usize,
        fp: *mut Value,
        new_fp: *mut Value,
        entry: MethodEntry,
        num_args: u8,
        num_ret: u8,
    ) -> VmResult<()> {
        unsafe {
            let recv = *new_fp.add(4);
            self.pc = pc;
            self.fp = fp;
            match entry {
                MethodEntry::Native1(f) => {
                    let res = f(self, recv, new_fp.add(5) as *const Value, num_args);
                    if res == Value::SENTINEL {
                        return Err(self.native_panic(pc, fp));
                    }
                    for i in 0..num_args as usize {
                        self.release(*new_fp.add(5 + i));
                    }
                    self.release(recv);
                    match num_ret {
                        0 => self.release(res),
                        1 => *new_fp = res,
                        _ => {
                            // missing results are filled with none
                            *new_fp = res;
                            *new_fp.add(1) = Value::none();
                        }
                    }
                }
                MethodEntry::Native2(f) => {
                    let pair = f(self, recv, new_fp.add(5) as *const Value, num_args);
                    if pair.first == Value::SENTINEL {
                        self.release(pair.second);
                        return Err(self.native_panic(pc, fp));
                    }
                    for i in 0..num_args as usize {
                        self.release(*new_fp.add(5 + i));
                    }
                    self.release(recv);
                    match num_ret {
                        0 => {
                            self.release(pair.first);
                            self.release(pair.second);
                        }
                        1 => {
                            // extra results are released
                            *new_fp = pair.first;
                            self.release(pair.second);
                        }
                        _ => {
                            *new_fp = pair.first;
                            *new_fp.add(1) = pair.second;
                        }
                    }
                }
                MethodEntry::Func { .. } => unreachable!("bytecode entry on native path"),
            }
        }
        Ok(())
    }

    /// `index` / `reverse_index` read
    fn index_read(
        &mut self,
        pc: usize,
        fp: *mut Value,
        left: Value,
        idx: Value,
        from_end: bool,
    ) -> VmResult<Value> {
        if !left.is_pointer() {
            let msg = format!("`{}` is not indexable.", left.type_name());
            return Err(self.panic_msg(pc, fp, msg));
        }
        unsafe {
            let obj = left.as_ptr();
            match (*obj).head.type_id {
                type_id::LIST => {
                    let elems = &(&(*obj).list).elems;
                    let n = self.to_number(idx);
                    let i = if from_end {
                        elems.len() as f64 - n
                    } else {
                        n
                    };
                    if i < 0.0 || i as usize >= elems.len() {
                        let msg = format!("Index `{}` out of bounds.", self.value_display(idx));
                        return Err(self.panic_msg(pc, fp, msg));
                    }
                    let v = elems[i as usize];
                    self.retain(v);
                    Ok(v)
                }
                type_id::MAP => {
                    let bytes = self.string_bytes(idx);
                    let v = (&(*obj).map).inner.get(idx, bytes).unwrap_or(Value::none());
                    self.retain(v);
                    Ok(v)
                }
                _ => {
                    let msg = format!("`{}` is not indexable.", left.type_name());
                    Err(self.panic_msg(pc, fp, msg))
                }
            }
        }
    }

    /// `set_index` / `set_index_release` write
    ///
    /// The non-releasing form overwrites without touching the prior value's
    /// count; the releasing form releases it. Writing past a list's length
    /// panics.
    fn index_write(
        &mut self,
        pc: usize,
        fp: *mut Value,
        left: Value,
        idx: Value,
        val: Value,
        release_prior: bool,
    ) -> VmResult<()> {
        if !left.is_pointer() {
            let msg = format!("`{}` is not indexable.", left.type_name());
            return Err(self.panic_msg(pc, fp, msg));
        }
        unsafe {
            let obj = left.as_ptr();
            match (*obj).head.type_id {
                type_id::LIST => {
                    let elems = &mut (*(*obj).list).elems;
                    let i = self.to_number(idx);
                    if i < 0.0 || i as usize >= elems.len() {
                        let msg = format!("Index `{}` out of bounds.", self.value_display(idx));
                        return Err(self.panic_msg(pc, fp, msg));
                    }
                    let old = elems[i as usize];
                    elems[i as usize] = val;
                    if release_prior {
                        self.release(old);
                    }
                    Ok(())
                }
                type_id::MAP => {
                    let bytes = self.string_bytes(idx);
                    let inner = &mut (*(*obj).map).inner;
                    match inner.insert(idx, bytes, val) {
                        Some(prior) => {
                            if release_prior {
                                self.release(prior);
                            }
                        }
                        None => {
                            // freshly stored key: the map takes its own ref
                            self.retain(idx);
                        }
                    }
                    Ok(())
                }
                _ => {
                    let msg = format!("`{}` is not indexable.", left.type_name());
                    Err(self.panic_msg(pc, fp, msg))
                }
            }
        }
    }

    /// `slice`: lists copy, strings produce parent-retaining slice objects
    fn slice_value(
        &mut self,
        pc: usize,
        fp: *mut Value,
        recv: Value,
        start_v: Value,
        end_v: Value,
    ) -> VmResult<Value> {
        let oob = |vm: &mut Vm, pc, fp| {
            let msg = "Slice out of bounds.".to_string();
            Err(vm.panic_msg(pc, fp, msg))
        };
        if recv.is_pointer() && unsafe { (*recv.as_ptr()).head.type_id } == type_id::LIST {
            unsafe {
                let elems = &(&(*recv.as_ptr()).list).elems;
                let len = elems.len();
                let start = if start_v.is_none() { 0 } else { self.to_number(start_v) as usize };
                let end = if end_v.is_none() { len } else { self.to_number(end_v) as usize };
                if start > end || end > len {
                    return oob(self, pc, fp);
                }
                let copy: Vec<Value> = elems[start..end].to_vec();
                for v in &copy {
                    self.retain(*v);
                }
                return Ok(self.alloc_list(copy));
            }
        }
        if let Some((_, len)) = self.value_string_bytes(recv) {
            let start = if start_v.is_none() { 0 } else { self.to_number(start_v) as usize };
            let end = if end_v.is_none() { len } else { self.to_number(end_v) as usize };
            return match self.string_slice_value(recv, start, end) {
                Some(v) => Ok(v),
                None => oob(self, pc, fp),
            };
        }
        let msg = format!("`{}` cannot be sliced.", recv.type_name());
        Err(self.panic_msg(pc, fp, msg))
    }
}

/// Outcome of a call opcode
enum CallOutcome {
    /// Enter a bytecode body at this pc; the caller installs the new frame
    Enter(usize),
    /// The call completed inline (native, or degraded to an error value)
    Continue,
}
