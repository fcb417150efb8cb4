//! Fibers, stacks, and call frames
//!
//! Every fiber owns one value stack. A call frame occupies four header slots
//! before its arguments:
//!
//! ```text
//! fp[0]  return value destination (also the first local)
//! fp[1]  return info: num_ret_vals (low byte), ret_flag (second byte)
//! fp[2]  return pc
//! fp[3]  caller frame pointer (the stack base, self-referential, at root)
//! fp[4..] args / callee slot, then locals and captured values
//! ```
//!
//! Header words are raw bit patterns stored in value slots; script code
//! never observes them. Frame pointers are real addresses into the owning
//! fiber's stack, so growing a stack that relocates must walk the frame
//! chain and rewrite every saved frame pointer from the old base to the new
//! one before execution continues.
//!
//! A fiber switch saves and restores the stack registers (`stack`,
//! `stack_end`, `fp`) and pc as one unit; the yielding fiber's state is
//! fully materialized before the resumer runs.

use std::alloc::{alloc, dealloc, realloc, Layout};

use sable_bytecode::{OpCode, NULL_ID};

use crate::object::{type_id, Fiber, HeapObject, FIBER_PC_TERMINATED};
use crate::value::Value;
use crate::vm::Vm;
use crate::{VmError, VmResult};

/// Sentinel for "no copy-back local" on a fiber
pub const NO_DST_LOCAL: u8 = 0xFF;

/// Pack return info into a frame-header word
#[inline]
pub(crate) fn ret_info_word(num_ret: u8, ret_flag: bool) -> Value {
    Value::from_raw(num_ret as u64 | ((ret_flag as u64) << 8))
}

/// Unpack a return-info word
#[inline]
pub(crate) fn decode_ret_info(v: Value) -> (u8, bool) {
    ((v.raw() & 0xFF) as u8, (v.raw() >> 8) & 1 != 0)
}

/// Pack a pc into a frame-header word
#[inline]
pub(crate) fn pc_word(pc: usize) -> Value {
    Value::from_raw(pc as u64)
}

/// Pack a frame pointer into a frame-header word
#[inline]
pub(crate) fn fp_word(fp: *mut Value) -> Value {
    Value::from_raw(fp as u64)
}

/// Unpack a frame-pointer word
#[inline]
pub(crate) fn word_fp(v: Value) -> *mut Value {
    v.raw() as usize as *mut Value
}

fn stack_layout(cap: usize) -> Layout {
    Layout::array::<Value>(cap).expect("stack layout")
}

/// Allocate a raw stack buffer of `cap` slots
pub(crate) fn alloc_stack(cap: usize) -> *mut Value {
    let ptr = unsafe { alloc(stack_layout(cap)) } as *mut Value;
    if ptr.is_null() {
        panic!("Out of memory: stack allocation failed");
    }
    ptr
}

/// Free a stack buffer
///
/// # Safety
///
/// `ptr` must have been allocated by [`alloc_stack`] with the same `cap`.
pub(crate) unsafe fn dealloc_stack(ptr: *mut Value, cap: usize) {
    dealloc(ptr as *mut u8, stack_layout(cap));
}

/// Iterator over a frame-pointer chain, from the newest frame down to the
/// stack base
pub struct FrameIter {
    fp: *mut Value,
    done: bool,
}

impl FrameIter {
    /// Walk frames starting at `fp`
    ///
    /// # Safety
    ///
    /// `fp` must be a live frame pointer whose chain terminates at a
    /// self-referential base frame.
    pub unsafe fn new(fp: *mut Value) -> Self {
        Self { fp, done: false }
    }
}

impl Iterator for FrameIter {
    type Item = *mut Value;

    fn next(&mut self) -> Option<*mut Value> {
        if self.done {
            return None;
        }
        let cur = self.fp;
        let prev = unsafe { word_fp(*cur.add(3)) };
        if prev == cur {
            self.done = true;
        } else {
            self.fp = prev;
        }
        Some(cur)
    }
}

impl Vm {
    /// Grow the current fiber's stack to hold at least `needed` slots
    ///
    /// Attempts an in-place resize first; on relocation, copies the values
    /// and rewrites every saved frame pointer in the chain from the old base
    /// to the new one.
    pub(crate) fn grow_stack(&mut self, needed: usize) -> VmResult<()> {
        let old_base = self.stack;
        let old_cap = self.stack_cap;
        let new_cap = std::cmp::max(old_cap * 2, needed);
        if new_cap > u32::MAX as usize {
            return Err(VmError::OutOfMemory);
        }
        let new_base = unsafe {
            realloc(
                old_base as *mut u8,
                stack_layout(old_cap),
                new_cap * std::mem::size_of::<Value>(),
            )
        } as *mut Value;
        if new_base.is_null() {
            panic!("Out of memory: stack growth failed");
        }
        self.stack_cap = new_cap;
        self.stack = new_base;
        unsafe {
            (*self.cur_fiber).fiber.stack = new_base;
            (*self.cur_fiber).fiber.stack_cap = new_cap as u32;
            if new_base != old_base {
                let fp_off = self.fp.offset_from(old_base);
                self.fp = new_base.offset(fp_off);
                let mut f = self.fp;
                loop {
                    let prev_old = word_fp(*f.add(3));
                    let prev_new = new_base.offset(prev_old.offset_from(old_base));
                    *f.add(3) = fp_word(prev_new);
                    if prev_new == f {
                        break;
                    }
                    f = prev_new;
                }
            }
        }
        Ok(())
    }

    /// Allocate a fiber for `coinit`
    ///
    /// Builds the fiber's root frame header at the stack base and copies
    /// (retaining) the arguments into slots `[5..5+num_args]`, the shape the
    /// body's value-call frame convention expects at frame base 0.
    pub(crate) fn alloc_fiber(
        &mut self,
        fp: *mut Value,
        start_args: u8,
        num_args: u8,
        body_pc: usize,
        initial_stack: usize,
    ) -> Value {
        let cap = std::cmp::max(initial_stack, 5 + num_args as usize);
        let stack = alloc_stack(cap);
        unsafe {
            *stack = Value::none();
            *stack.add(1) = ret_info_word(0, true);
            *stack.add(2) = pc_word(0);
            *stack.add(3) = fp_word(stack);
            *stack.add(4) = Value::none();
            for i in 0..num_args as usize {
                let v = *fp.add(start_args as usize + i);
                self.retain(v);
                *stack.add(5 + i) = v;
            }
            let slot = self.heap.alloc_pool_slot();
            (*slot).fiber = Fiber::new(stack, cap as u32, body_pc as u32, num_args);
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Save the running fiber's registers into its object
    unsafe fn save_cur_fiber(&mut self, pc: usize) {
        let f = &mut (*self.cur_fiber).fiber;
        f.stack = self.stack;
        f.stack_cap = self.stack_cap as u32;
        f.pc = pc as u32;
        f.fp_off = self.fp.offset_from(self.stack) as u32;
    }

    /// Install a fiber's saved registers as the running state
    unsafe fn install_fiber(&mut self, obj: *mut HeapObject) {
        let f = (*obj).fiber;
        self.cur_fiber = obj;
        self.stack = f.stack;
        self.stack_cap = f.stack_cap as usize;
        self.fp = f.stack.add(f.fp_off as usize);
    }

    /// Switch into `fiber_v` for `coresume`
    ///
    /// Returns the pc to continue at inside the fiber, or `None` when the
    /// target is not a resumable fiber (dead, running, or not a fiber).
    pub(crate) fn resume_fiber(
        &mut self,
        fiber_v: Value,
        dst_local: u8,
        cur_pc: usize,
    ) -> Option<usize> {
        if !fiber_v.is_pointer() {
            return None;
        }
        unsafe {
            let obj = fiber_v.as_ptr();
            if (*obj).head.type_id != type_id::FIBER
                || obj == self.cur_fiber
                || (*obj).fiber.pc == FIBER_PC_TERMINATED
            {
                return None;
            }
            self.save_cur_fiber(cur_pc);
            let prev = self.cur_fiber;
            self.retain(Value::from_ptr(prev));
            (*obj).fiber.prev_fiber = prev;
            (*obj).fiber.parent_dst_local = dst_local;
            self.install_fiber(obj);
            let f = &mut (*obj).fiber;
            if f.started == 0 {
                f.started = 1;
                Some(f.pc as usize)
            } else {
                // parked on a coyield; continue past it
                Some(f.pc as usize + 3)
            }
        }
    }

    /// Switch back to the parent fiber for `coyield`
    ///
    /// Saves the full state of the yielding fiber, copies `none` into the
    /// parent's copy-back local (if set), and returns the parent's pc just
    /// past its `coresume`.
    pub(crate) fn yield_fiber(&mut self, cur_pc: usize) -> usize {
        unsafe {
            let child = self.cur_fiber;
            self.save_cur_fiber(cur_pc);
            let parent = (*child).fiber.prev_fiber;
            (*child).fiber.prev_fiber = std::ptr::null_mut();
            self.install_fiber(parent);
            let dst = (*child).fiber.parent_dst_local;
            if dst != NO_DST_LOCAL {
                *self.fp.add(dst as usize) = Value::none();
            }
            self.release(Value::from_ptr(parent));
            (*parent).fiber.pc as usize + 3
        }
    }

    /// Terminate the current fiber for `coreturn`
    ///
    /// The body leaves its result in `fp[1]` of the fiber's root frame; the
    /// result moves to the parent's copy-back local, or is released when the
    /// fiber was resumed without one. No later resume can enter the fiber.
    pub(crate) fn return_fiber(&mut self) -> usize {
        unsafe {
            let child = self.cur_fiber;
            let result = *self.fp.add(1);
            (*child).fiber.pc = FIBER_PC_TERMINATED;
            let parent = (*child).fiber.prev_fiber;
            (*child).fiber.prev_fiber = std::ptr::null_mut();
            self.install_fiber(parent);
            let dst = (*child).fiber.parent_dst_local;
            if dst != NO_DST_LOCAL {
                *self.fp.add(dst as usize) = result;
            } else {
                self.release(result);
            }
            self.release(Value::from_ptr(parent));
            (*parent).fiber.pc as usize + 3
        }
    }

    /// Tear down a dead fiber's pending stack
    ///
    /// Walks the suspended frame chain, releasing the locals recorded live
    /// at each frame's end-locals pc; a fiber parked on a `coyield` uses the
    /// yield site's entry, and a fiber that never entered its body releases
    /// only the initial arguments. The stack buffer is then freed.
    pub(crate) unsafe fn release_fiber_resources(&mut self, obj: *mut HeapObject) {
        let f = (*obj).fiber;
        if f.stack.is_null() {
            return;
        }
        if f.pc != FIBER_PC_TERMINATED {
            if f.started == 0 {
                for i in 0..f.init_num_args as usize {
                    self.release(*f.stack.add(5 + i));
                }
            } else {
                let mut pc = f.pc as usize;
                for fp in FrameIter::new(f.stack.add(f.fp_off as usize)) {
                    self.release_end_locals(fp, pc);
                    let ret_pc = (*fp.add(2)).raw() as usize;
                    pc = ret_pc.saturating_sub(1);
                }
            }
        }
        dealloc_stack(f.stack, f.stack_cap as usize);
        (*obj).fiber.stack = std::ptr::null_mut();
    }

    /// Release the locals listed by the `ReleaseN` at the debug entry
    /// covering `pc`, against the frame at `fp`
    unsafe fn release_end_locals(&mut self, fp: *mut Value, pc: usize) {
        let end_pc = match self.program.debug_entry_at(pc) {
            Some(entry) if entry.end_locals_pc != NULL_ID => entry.end_locals_pc as usize,
            _ => return,
        };
        let code = &self.program.code;
        if code.get(end_pc).copied() != Some(OpCode::ReleaseN as u8) {
            return;
        }
        let n = code[end_pc + 1] as usize;
        let locals: Vec<u8> = code[end_pc + 2..end_pc + 2 + n].to_vec();
        for local in locals {
            self.release(*fp.add(local as usize));
        }
    }

    /// Whether the current fiber is the main fiber
    #[inline]
    pub(crate) fn on_main_fiber(&self) -> bool {
        self.cur_fiber == self.main_fiber_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ret_info_roundtrip() {
        let w = ret_info_word(2, true);
        assert_eq!(decode_ret_info(w), (2, true));
        let w = ret_info_word(0, false);
        assert_eq!(decode_ret_info(w), (0, false));
    }

    #[test]
    fn test_frame_iter_single_frame() {
        let mut slots = [Value::none(); 8];
        let base = slots.as_mut_ptr();
        unsafe {
            *base.add(3) = fp_word(base);
            let frames: Vec<_> = FrameIter::new(base).collect();
            assert_eq!(frames, vec![base]);
        }
    }

    #[test]
    fn test_frame_iter_chain() {
        let mut slots = [Value::none(); 32];
        let base = slots.as_mut_ptr();
        unsafe {
            *base.add(3) = fp_word(base);
            let f1 = base.add(8);
            *f1.add(3) = fp_word(base);
            let f2 = base.add(16);
            *f2.add(3) = fp_word(f1);
            let frames: Vec<_> = FrameIter::new(f2).collect();
            assert_eq!(frames, vec![f2, f1, base]);
        }
    }
}
