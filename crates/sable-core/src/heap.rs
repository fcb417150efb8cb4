//! Pooled heap and reference counting
//!
//! Small objects live in pages of 102 fixed 40-byte slots. Slot 0 of every
//! page is a reserved guard so the free path can always inspect the
//! preceding slot; the remaining 101 slots start as one free span. Free
//! spans thread a singly-linked freelist; freeing a slot whose predecessor
//! is free extends that span in O(1) instead of growing the list.
//!
//! Objects whose payload exceeds the slot (long strings, wide user objects)
//! come from the general allocator with the identical header prefix. The
//! free path picks pool vs. general by size category, never by inspecting
//! the slot.
//!
//! Reclamation is deterministic reference counting; [`crate::cycle`] adds an
//! on-demand cycle pass. A process-wide `global_rc` diagnostic count tracks
//! every retain/release so tests can assert balance.

use std::alloc::{alloc, dealloc, Layout};
use std::mem::ManuallyDrop;

use crate::object::{
    type_id, FreeSpan, HeapHead, HeapObject, ASTRING_BUF_OFFSET, MAX_POOL_ASTRING,
    MAX_POOL_OBJECT_FIELDS, MAX_POOL_RAWSTRING, MAX_POOL_USTRING, USTRING_BUF_OFFSET,
};
use crate::value::Value;
use crate::vm::Vm;

/// Slots per page, including the reserved guard slot
pub const PAGE_SLOTS: usize = 102;

/// Usable slots per page
pub const PAGE_CAPACITY: usize = PAGE_SLOTS - 1;

/// Heap diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of pages
    pub pages: usize,
    /// Live pool objects
    pub live_objects: usize,
    /// Free pool slots
    pub free_slots: usize,
    /// Live general-allocator objects
    pub large_objects: usize,
    /// Process-wide retain count
    pub global_rc: u64,
}

/// The object pool plus large-object bookkeeping
pub struct Heap {
    pages: Vec<*mut HeapObject>,
    free_head: *mut HeapObject,
    large_objects: usize,
    /// Diagnostic retain count; incremented on every retain and allocation,
    /// decremented on every release
    pub global_rc: u64,
}

impl Heap {
    /// Create a heap with `initial_pages` pre-allocated pages
    pub fn new(initial_pages: usize) -> Self {
        let mut heap = Self {
            pages: Vec::new(),
            free_head: std::ptr::null_mut(),
            large_objects: 0,
            global_rc: 0,
        };
        if initial_pages > 0 {
            heap.grow(initial_pages);
        }
        heap
    }

    fn page_layout() -> Layout {
        Layout::array::<HeapObject>(PAGE_SLOTS).expect("page layout")
    }

    /// Add `num_pages` pages, threading each page's slots as one free span
    fn grow(&mut self, num_pages: usize) {
        for _ in 0..num_pages {
            let page = unsafe { alloc(Self::page_layout()) } as *mut HeapObject;
            if page.is_null() {
                panic!("Out of memory: heap page allocation failed");
            }
            unsafe {
                // guard slot, never allocated and never free
                (*page).head = HeapHead {
                    type_id: type_id::RESERVED,
                    rc: 0,
                };
                for i in 1..PAGE_SLOTS {
                    (*page.add(i)).head = HeapHead {
                        type_id: type_id::FREE,
                        rc: 0,
                    };
                }
                let head = page.add(1);
                (*head).free_span = FreeSpan {
                    type_id: type_id::FREE,
                    len: PAGE_CAPACITY as u32,
                    start: head,
                    next: self.free_head,
                };
                (*page.add(PAGE_SLOTS - 1)).free_span.start = head;
                self.free_head = head;
            }
            self.pages.push(page);
        }
    }

    /// Pop one slot off the head span, growing the pool when empty
    ///
    /// The returned slot is uninitialized; the caller writes a full object
    /// (including `type_id` and `rc`) before the slot is observable.
    pub fn alloc_pool_slot(&mut self) -> *mut HeapObject {
        if self.free_head.is_null() {
            let num = std::cmp::max(1, self.pages.len() * 3 / 2);
            self.grow(num);
        }
        unsafe {
            let head = self.free_head;
            let span = (*head).free_span;
            if span.len == 1 {
                self.free_head = span.next;
            } else {
                let new_head = head.add(1);
                (*new_head).free_span = FreeSpan {
                    type_id: type_id::FREE,
                    len: span.len - 1,
                    start: new_head,
                    next: span.next,
                };
                if span.len > 2 {
                    (*head.add(span.len as usize - 1)).free_span.start = new_head;
                }
                self.free_head = new_head;
            }
            head
        }
    }

    /// Return a slot to the pool
    ///
    /// If the preceding slot is free, the span it terminates absorbs this
    /// slot; otherwise a new single-slot span is prepended to the freelist.
    ///
    /// # Safety
    ///
    /// `obj` must be a live slot previously returned by
    /// [`Heap::alloc_pool_slot`], with any owned payload already torn down.
    pub unsafe fn free_pool_slot(&mut self, obj: *mut HeapObject) {
        let prev = obj.sub(1);
        if (*prev).head.type_id == type_id::FREE {
            // prev is the last slot of some span; its start points at the head
            let head = (*prev).free_span.start;
            (*head).free_span.len += 1;
            (*obj).free_span = FreeSpan {
                type_id: type_id::FREE,
                len: 0,
                start: head,
                next: std::ptr::null_mut(),
            };
        } else {
            (*obj).free_span = FreeSpan {
                type_id: type_id::FREE,
                len: 1,
                start: obj,
                next: self.free_head,
            };
            self.free_head = obj;
        }
    }

    /// Allocate a large object of `size` bytes from the general allocator
    pub fn alloc_large(&mut self, size: usize) -> *mut HeapObject {
        let layout = Layout::from_size_align(size, 8).expect("large object layout");
        let ptr = unsafe { alloc(layout) } as *mut HeapObject;
        if ptr.is_null() {
            panic!("Out of memory: large object allocation failed");
        }
        self.large_objects += 1;
        ptr
    }

    /// Free a large object allocated with [`Heap::alloc_large`]
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated by `alloc_large` with the same `size`.
    pub unsafe fn free_large(&mut self, obj: *mut HeapObject, size: usize) {
        let layout = Layout::from_size_align(size, 8).expect("large object layout");
        dealloc(obj as *mut u8, layout);
        self.large_objects -= 1;
    }

    /// The pages, for heap walks
    pub fn pages(&self) -> &[*mut HeapObject] {
        &self.pages
    }

    /// Gather heap diagnostics by walking every page
    pub fn stats(&self) -> HeapStats {
        let (live, free) = self.count_slots();
        HeapStats {
            pages: self.pages.len(),
            live_objects: live,
            free_slots: free,
            large_objects: self.large_objects,
            global_rc: self.global_rc,
        }
    }

    /// Check the page invariant: free-span lengths plus live objects account
    /// for every usable slot of every page
    pub fn verify_pages(&self) -> bool {
        for &page in &self.pages {
            let mut i = 1;
            let mut counted = 0;
            while i < PAGE_SLOTS {
                let slot = unsafe { page.add(i) };
                let tid = unsafe { (*slot).head.type_id };
                if tid == type_id::FREE {
                    let span = unsafe { (*slot).free_span };
                    if span.start != slot || span.len == 0 {
                        return false;
                    }
                    let tail = unsafe { slot.add(span.len as usize - 1) };
                    if unsafe { (*tail).free_span.start } != slot {
                        return false;
                    }
                    counted += span.len as usize;
                    i += span.len as usize;
                } else {
                    counted += 1;
                    i += 1;
                }
            }
            if counted != PAGE_CAPACITY {
                return false;
            }
        }
        true
    }

    fn count_slots(&self) -> (usize, usize) {
        let mut live = 0;
        let mut free = 0;
        for &page in &self.pages {
            let mut i = 1;
            while i < PAGE_SLOTS {
                let slot = unsafe { page.add(i) };
                let tid = unsafe { (*slot).head.type_id };
                if tid == type_id::FREE {
                    let len = unsafe { (*slot).free_span.len } as usize;
                    free += len;
                    i += len;
                } else {
                    live += 1;
                    i += 1;
                }
            }
        }
        (live, free)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for &page in &self.pages {
            unsafe { dealloc(page as *mut u8, Self::page_layout()) };
        }
    }
}

impl Vm {
    /// Increment the reference count of a pointer value
    #[inline]
    pub fn retain(&mut self, v: Value) {
        if v.is_pointer() {
            unsafe {
                let obj = v.as_ptr();
                debug_assert_ne!((*obj).head.type_id, type_id::FREE);
                (*obj).head.rc += 1;
            }
            self.heap.global_rc += 1;
        }
    }

    /// Increment the reference count of a pointer value by `n`
    #[inline]
    pub fn retain_inc(&mut self, v: Value, n: u32) {
        if v.is_pointer() {
            unsafe {
                let obj = v.as_ptr();
                debug_assert_ne!((*obj).head.type_id, type_id::FREE);
                (*obj).head.rc += n;
            }
            self.heap.global_rc += n as u64;
        }
    }

    /// Decrement the reference count of a pointer value, destroying the
    /// object when it reaches zero
    ///
    /// Objects pinned by a cycle force-release are skipped entirely: their
    /// whole count was already charged and their teardown is in progress.
    #[inline]
    pub fn release(&mut self, v: Value) {
        if v.is_pointer() {
            unsafe {
                let obj = v.as_ptr();
                debug_assert_ne!((*obj).head.type_id, type_id::FREE);
                if (*obj).head.rc == crate::cycle::RC_DYING {
                    return;
                }
                debug_assert!((*obj).head.rc > 0);
                (*obj).head.rc -= 1;
                self.heap.global_rc -= 1;
                if (*obj).head.rc == 0 {
                    self.free_object(obj);
                }
            }
        }
    }

    /// Destroy an object whose reference count reached zero: release owned
    /// children, drop any side storage, and return the memory
    ///
    /// # Safety
    ///
    /// `obj` must be a live heap object with `rc == 0` (or be force-released
    /// by the cycle detector, which accounts for the remaining count).
    pub(crate) unsafe fn free_object(&mut self, obj: *mut HeapObject) {
        let tid = (*obj).head.type_id;
        match tid {
            type_id::LIST => {
                let list = ManuallyDrop::into_inner(std::ptr::read(&(*obj).list));
                for v in &list.elems {
                    self.release(*v);
                }
                drop(list);
                self.heap.free_pool_slot(obj);
            }
            type_id::LIST_ITER => {
                let list = (*obj).list_iter.list;
                self.release(Value::from_ptr(list));
                self.heap.free_pool_slot(obj);
            }
            type_id::MAP => {
                let map = ManuallyDrop::into_inner(std::ptr::read(&(*obj).map));
                for (k, v) in map.inner.iter() {
                    self.release(k);
                    self.release(v);
                }
                drop(map);
                self.heap.free_pool_slot(obj);
            }
            type_id::MAP_ITER => {
                let map = (*obj).map_iter.map;
                self.release(Value::from_ptr(map));
                self.heap.free_pool_slot(obj);
            }
            type_id::CLOSURE => {
                let closure = ManuallyDrop::into_inner(std::ptr::read(&(*obj).closure));
                for v in closure.captures.iter() {
                    self.release(*v);
                }
                drop(closure);
                self.heap.free_pool_slot(obj);
            }
            type_id::LAMBDA => self.heap.free_pool_slot(obj),
            type_id::ASTRING => {
                let len = (*obj).astring.len as usize;
                self.intern_remove_if_same(obj);
                if len <= MAX_POOL_ASTRING {
                    self.heap.free_pool_slot(obj);
                } else {
                    self.heap.free_large(obj, ASTRING_BUF_OFFSET + len);
                }
            }
            type_id::USTRING => {
                let len = (*obj).ustring.len as usize;
                self.intern_remove_if_same(obj);
                if len <= MAX_POOL_USTRING {
                    self.heap.free_pool_slot(obj);
                } else {
                    self.heap.free_large(obj, USTRING_BUF_OFFSET + len);
                }
            }
            type_id::ASTRING_SLICE => {
                let parent = (*obj).astring_slice.parent;
                self.release(Value::from_ptr(parent));
                self.heap.free_pool_slot(obj);
            }
            type_id::USTRING_SLICE => {
                let parent = (*obj).ustring_slice.parent;
                self.release(Value::from_ptr(parent));
                self.heap.free_pool_slot(obj);
            }
            type_id::RAWSTRING => {
                let len = (*obj).rawstring.len as usize;
                if len <= MAX_POOL_RAWSTRING {
                    self.heap.free_pool_slot(obj);
                } else {
                    self.heap.free_large(obj, ASTRING_BUF_OFFSET + len);
                }
            }
            type_id::RAWSTRING_SLICE => {
                let parent = (*obj).rawstring_slice.parent;
                self.release(Value::from_ptr(parent));
                self.heap.free_pool_slot(obj);
            }
            type_id::FIBER => {
                self.release_fiber_resources(obj);
                self.heap.free_pool_slot(obj);
            }
            type_id::BOX => {
                let v = (*obj).boxv.value;
                self.release(v);
                self.heap.free_pool_slot(obj);
            }
            type_id::NATIVE_FUNC | type_id::OPAQUE_PTR => self.heap.free_pool_slot(obj),
            type_id::FILE => {
                let file = (*obj).file;
                if !file.closed {
                    close_fd(file.fd);
                }
                self.heap.free_pool_slot(obj);
            }
            type_id::DIR => {
                close_fd((*obj).dir.fd);
                self.heap.free_pool_slot(obj);
            }
            type_id::DIR_ITER => {
                let dir = (*obj).dir_iter.dir;
                self.release(Value::from_ptr(dir));
                self.heap.free_pool_slot(obj);
            }
            type_id::FFI_STATE => {
                let st = (*obj).ffi_state;
                if let Some(finalizer) = st.finalizer {
                    finalizer(st.state);
                }
                self.heap.free_pool_slot(obj);
            }
            _ => {
                debug_assert!(tid >= type_id::FIRST_OBJECT);
                let num_fields = self.symbols.object_shape_field_count(tid);
                let fields = std::ptr::addr_of_mut!((*obj).object.fields) as *mut Value;
                for i in 0..num_fields {
                    self.release(*fields.add(i));
                }
                if num_fields <= MAX_POOL_OBJECT_FIELDS {
                    self.heap.free_pool_slot(obj);
                } else {
                    self.heap.free_large(obj, 8 + num_fields * 8);
                }
            }
        }
    }

    /// Heap diagnostics
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }
}

#[cfg(unix)]
fn close_fd(fd: i32) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(not(unix))]
fn close_fd(_fd: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_heap_topology() {
        let heap = Heap::new(1);
        let stats = heap.stats();
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.free_slots, PAGE_CAPACITY);
        assert!(heap.verify_pages());
    }

    #[test]
    fn test_alloc_shrinks_head_span() {
        let mut heap = Heap::new(1);
        let a = heap.alloc_pool_slot();
        unsafe {
            (*a).head = HeapHead {
                type_id: type_id::LAMBDA,
                rc: 1,
            };
        }
        let stats = heap.stats();
        assert_eq!(stats.live_objects, 1);
        assert_eq!(stats.free_slots, PAGE_CAPACITY - 1);
        assert!(heap.verify_pages());
    }

    #[test]
    fn test_alloc_free_restores_topology() {
        let mut heap = Heap::new(1);
        let before = heap.stats();
        let mut slots = Vec::new();
        for _ in 0..10 {
            let s = heap.alloc_pool_slot();
            unsafe {
                (*s).head = HeapHead {
                    type_id: type_id::LAMBDA,
                    rc: 1,
                };
            }
            slots.push(s);
        }
        // free in address order so every free coalesces backward into the
        // span the previous free created
        for s in slots {
            unsafe { heap.free_pool_slot(s) };
        }
        let after = heap.stats();
        assert_eq!(before.pages, after.pages);
        assert_eq!(before.free_slots, after.free_slots);
        assert_eq!(after.live_objects, 0);
        assert!(heap.verify_pages());
    }

    #[test]
    fn test_free_non_adjacent_prepends_span() {
        let mut heap = Heap::new(1);
        let mut slots = Vec::new();
        for _ in 0..4 {
            let s = heap.alloc_pool_slot();
            unsafe {
                (*s).head = HeapHead {
                    type_id: type_id::LAMBDA,
                    rc: 1,
                };
            }
            slots.push(s);
        }
        // free slot 1, leaving live neighbors on both sides: a fresh
        // single-slot span must appear
        unsafe { heap.free_pool_slot(slots[1]) };
        assert!(heap.verify_pages());
        let stats = heap.stats();
        assert_eq!(stats.live_objects, 3);
        assert_eq!(stats.free_slots, PAGE_CAPACITY - 3);

        // freeing slot 2 extends that span (its predecessor is free)
        unsafe { heap.free_pool_slot(slots[2]) };
        assert!(heap.verify_pages());
        assert_eq!(heap.stats().live_objects, 2);
    }

    #[test]
    fn test_grows_when_exhausted() {
        let mut heap = Heap::new(1);
        for _ in 0..PAGE_CAPACITY {
            let s = heap.alloc_pool_slot();
            unsafe {
                (*s).head = HeapHead {
                    type_id: type_id::LAMBDA,
                    rc: 1,
                };
            }
        }
        assert_eq!(heap.stats().pages, 1);
        let s = heap.alloc_pool_slot();
        unsafe {
            (*s).head = HeapHead {
                type_id: type_id::LAMBDA,
                rc: 1,
            };
        }
        // grew by max(1, 1 * 3/2) = 1 page
        assert_eq!(heap.stats().pages, 2);
        assert!(heap.verify_pages());
    }

    #[test]
    fn test_large_alloc_tracking() {
        let mut heap = Heap::new(1);
        let obj = heap.alloc_large(128);
        assert_eq!(heap.stats().large_objects, 1);
        unsafe { heap.free_large(obj, 128) };
        assert_eq!(heap.stats().large_objects, 0);
    }
}
