//! On-demand cycle detection
//!
//! Reference counting cannot reclaim cycles, and lists (plus user objects
//! holding them) can close cycles. `check_memory` is the explicit
//! diagnostic pass: walk every live slot in every page, DFS through the
//! cycle-prone children (list elements and user-object fields), collect the
//! target of every back edge as a cycle root, then force-release each root.
//! Force-releasing deallocates the object and charges its entire remaining
//! reference count against the process-wide count in one step, treating the
//! cycle as otherwise unreachable.

use rustc_hash::FxHashMap;

use crate::heap::PAGE_SLOTS;
use crate::object::{type_id, HeapObject};
use crate::value::Value;
use crate::vm::Vm;

/// Reference count pinned onto objects being torn down by a force-release,
/// so releases arriving from inside the dying cycle become no-ops
pub(crate) const RC_DYING: u32 = u32::MAX;

#[derive(Default, Clone, Copy)]
struct RcNode {
    visited: bool,
    entered: bool,
}

impl Vm {
    /// Scan the live heap for reference cycles
    ///
    /// Returns `false` if any cycle was found. Found cycles are broken:
    /// every root in [`Vm::cycle_root_count`] has been force-released and
    /// the global retain count adjusted accordingly.
    pub fn check_memory(&mut self) -> bool {
        self.cycle_roots.clear();
        let mut nodes: FxHashMap<usize, RcNode> = FxHashMap::default();

        let pages: Vec<*mut HeapObject> = self.heap.pages().to_vec();
        for page in pages {
            let mut i = 1;
            while i < PAGE_SLOTS {
                let slot = unsafe { page.add(i) };
                let tid = unsafe { (*slot).head.type_id };
                if tid == type_id::FREE {
                    i += unsafe { (*slot).free_span.len } as usize;
                } else {
                    self.dfs(slot, &mut nodes);
                    i += 1;
                }
            }
        }

        let roots = std::mem::take(&mut self.cycle_roots);
        for &root in &roots {
            unsafe { self.force_release(root) };
        }
        self.cycle_roots = roots;
        self.cycle_roots.is_empty()
    }

    fn dfs(&mut self, obj: *mut HeapObject, nodes: &mut FxHashMap<usize, RcNode>) {
        let addr = obj as usize;
        let node = nodes.entry(addr).or_default();
        if node.entered {
            // back edge; the entered node roots a cycle
            if !self.cycle_roots.contains(&obj) {
                self.cycle_roots.push(obj);
            }
            return;
        }
        if node.visited {
            return;
        }
        node.entered = true;

        for child in unsafe { cycle_children(obj, self) } {
            self.dfs(child, nodes);
        }

        let node = nodes.get_mut(&addr).expect("node vanished during dfs");
        node.entered = false;
        node.visited = true;
    }

    /// Deallocate a cycle root, charging its whole remaining count
    ///
    /// The count is pinned to [`RC_DYING`] first so releases coming from the
    /// dying cycle's own children cannot re-enter the destructor.
    ///
    /// # Safety
    ///
    /// `obj` must be a live heap object.
    pub(crate) unsafe fn force_release(&mut self, obj: *mut HeapObject) {
        let rc = (*obj).head.rc;
        if rc == RC_DYING {
            return;
        }
        self.heap.global_rc -= rc as u64;
        (*obj).head.rc = RC_DYING;
        self.free_object(obj);
    }
}

/// Pointer children that can participate in cycles: list elements and
/// user-object fields
///
/// # Safety
///
/// `obj` must be a live heap object.
unsafe fn cycle_children(obj: *mut HeapObject, vm: &Vm) -> Vec<*mut HeapObject> {
    let tid = (*obj).head.type_id;
    let mut out = Vec::new();
    if tid == type_id::LIST {
        for v in &(&(*obj).list).elems {
            if v.is_pointer() {
                out.push(v.as_ptr());
            }
        }
    } else if tid >= type_id::FIRST_OBJECT && tid < type_id::RESERVED {
        let n = vm.symbols.object_shape_field_count(tid);
        let fields = std::ptr::addr_of!((*obj).object.fields) as *const Value;
        for i in 0..n {
            let v = *fields.add(i);
            if v.is_pointer() {
                out.push(v.as_ptr());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmOptions;

    fn vm() -> Vm {
        Vm::new(VmOptions::default())
    }

    #[test]
    fn test_no_cycles_on_clean_heap() {
        let mut vm = vm();
        let l = vm.alloc_list(vec![Value::number(1.0)]);
        assert!(vm.check_memory());
        assert_eq!(vm.cycle_root_count(), 0);
        vm.release(l);
    }

    #[test]
    fn test_self_cycle_detected_and_broken() {
        let mut vm = vm();
        // a = []; a.append(a); a = none
        let a = vm.alloc_list(Vec::new());
        vm.retain(a);
        unsafe { (*(*a.as_ptr()).list).elems.push(a) };
        vm.release(a);
        assert_eq!(vm.heap.global_rc, 1);

        assert!(!vm.check_memory());
        assert_eq!(vm.cycle_root_count(), 1);
        assert_eq!(vm.heap.global_rc, 0);
        assert_eq!(vm.heap.stats().live_objects, 0);
        assert!(vm.heap.verify_pages());
    }

    #[test]
    fn test_two_node_cycle() {
        let mut vm = vm();
        let a = vm.alloc_list(Vec::new());
        let b = vm.alloc_list(Vec::new());
        vm.retain(b);
        unsafe { (*(*a.as_ptr()).list).elems.push(b) };
        vm.retain(a);
        unsafe { (*(*b.as_ptr()).list).elems.push(a) };
        vm.release(a);
        vm.release(b);
        assert_eq!(vm.heap.global_rc, 2);

        assert!(!vm.check_memory());
        assert_eq!(vm.heap.global_rc, 0);
        assert_eq!(vm.heap.stats().live_objects, 0);
    }

    #[test]
    fn test_shared_acyclic_not_collected() {
        let mut vm = vm();
        let shared = vm.alloc_list(vec![Value::number(7.0)]);
        vm.retain(shared);
        vm.retain(shared);
        let a = vm.alloc_list(vec![shared]);
        let b = vm.alloc_list(vec![shared]);
        vm.release(shared);
        // diamond sharing is not a cycle
        assert!(vm.check_memory());
        vm.release(a);
        vm.release(b);
        assert_eq!(vm.heap.global_rc, 0);
    }
}
