//! Heap object model
//!
//! Every managed object is a 40-byte pool slot (or a larger allocation with
//! the identical prefix). The first word is a type id, the second a reference
//! count; the remaining 32 bytes are the kind-specific payload. The kinds are
//! `#[repr(C)]` structs sharing the [`HeapHead`] prefix, overlaid in the
//! [`HeapObject`] union so a slot can be reinterpreted from its first word.
//!
//! Free pool slots reuse the same 40 bytes as [`FreeSpan`] links.
//!
//! # Layout contract
//!
//! - Pool slots are exactly [`POOL_SLOT_SIZE`] bytes, 8-aligned.
//! - String payloads that fit inline stay in the slot (ASCII 28 bytes, UTF-8
//!   16, raw 28); longer strings are general allocations whose header bytes
//!   match the pool layout, so reads never care which side of the boundary
//!   an object landed on.
//! - User objects hold up to 4 fields inline; larger shapes are general
//!   allocations with the extra fields trailing the same struct.

use std::mem::ManuallyDrop;

use crate::map::ValueMap;
use crate::native::NativeFn;
use crate::value::Value;

/// Size of one pool slot in bytes
pub const POOL_SLOT_SIZE: usize = 40;

/// Max ASCII string payload held inline in a pool slot
pub const MAX_POOL_ASTRING: usize = 28;
/// Max UTF-8 string payload held inline in a pool slot
pub const MAX_POOL_USTRING: usize = 16;
/// Max raw string payload held inline in a pool slot
pub const MAX_POOL_RAWSTRING: usize = 28;
/// Max user-object field count held inline in a pool slot
pub const MAX_POOL_OBJECT_FIELDS: usize = 4;

/// Byte offset of string payloads behind the astring/rawstring header
pub const ASTRING_BUF_OFFSET: usize = 12;
/// Byte offset of string payloads behind the ustring header
pub const USTRING_BUF_OFFSET: usize = 24;

/// Well-known object type ids
///
/// User-defined object shapes are assigned ids from [`type_id::FIRST_OBJECT`]
/// upward by the struct table.
pub mod type_id {
    /// List
    pub const LIST: u32 = 0;
    /// List iterator
    pub const LIST_ITER: u32 = 1;
    /// Map
    pub const MAP: u32 = 2;
    /// Map iterator
    pub const MAP_ITER: u32 = 3;
    /// Closure (function + captured values)
    pub const CLOSURE: u32 = 4;
    /// Lambda (function, no captures)
    pub const LAMBDA: u32 = 5;
    /// ASCII string
    pub const ASTRING: u32 = 6;
    /// UTF-8 string with code-point length cache
    pub const USTRING: u32 = 7;
    /// Slice of an ASCII string
    pub const ASTRING_SLICE: u32 = 8;
    /// Slice of a UTF-8 string
    pub const USTRING_SLICE: u32 = 9;
    /// Raw byte string
    pub const RAWSTRING: u32 = 10;
    /// Slice of a raw byte string
    pub const RAWSTRING_SLICE: u32 = 11;
    /// Fiber
    pub const FIBER: u32 = 12;
    /// Box (mutable captured variable cell)
    pub const BOX: u32 = 13;
    /// Native function binding
    pub const NATIVE_FUNC: u32 = 14;
    /// Opaque host pointer
    pub const OPAQUE_PTR: u32 = 15;
    /// Open file
    pub const FILE: u32 = 16;
    /// Open directory
    pub const DIR: u32 = 17;
    /// Directory iterator
    pub const DIR_ITER: u32 = 18;
    /// C-interop bridge state, opaque to the core
    pub const FFI_STATE: u32 = 19;
    /// First user-defined object shape id
    pub const FIRST_OBJECT: u32 = 20;
    /// Reserved guard slot at the start of every page
    pub const RESERVED: u32 = u32::MAX - 1;
    /// Free-span sentinel
    pub const FREE: u32 = u32::MAX;

    /// Whether a type id is one of the heap string kinds
    pub const fn is_string(id: u32) -> bool {
        matches!(
            id,
            ASTRING | USTRING | ASTRING_SLICE | USTRING_SLICE | RAWSTRING | RAWSTRING_SLICE
        )
    }
}

/// Common object prefix: type id and reference count
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct HeapHead {
    /// Object kind, or a user shape id
    pub type_id: u32,
    /// Reference count
    pub rc: u32,
}

/// A free pool slot, threaded into the free-span list
///
/// The span head's `start` points at itself and `len`/`next` describe the
/// span; the span's last slot keeps `start` pointing back at the head so the
/// backward-coalescing free path can find it in O(1).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FreeSpan {
    /// Always [`type_id::FREE`]
    pub type_id: u32,
    /// Number of slots in the span (meaningful at the head)
    pub len: u32,
    /// First slot of the span
    pub start: *mut HeapObject,
    /// Next span in the freelist (meaningful at the head)
    pub next: *mut HeapObject,
}

/// List of values
#[repr(C)]
pub struct List {
    /// Common prefix
    pub head: HeapHead,
    /// Element storage
    pub elems: Vec<Value>,
}

/// List iterator; retains its list
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ListIter {
    /// Common prefix
    pub head: HeapHead,
    /// The list being iterated
    pub list: *mut HeapObject,
    /// Next element index
    pub next_idx: u32,
}

/// Map of values
#[repr(C)]
pub struct MapObj {
    /// Common prefix
    pub head: HeapHead,
    /// Table storage, boxed to fit the slot
    pub inner: Box<ValueMap>,
}

/// Map iterator; retains its map
#[derive(Clone, Copy)]
#[repr(C)]
pub struct MapIter {
    /// Common prefix
    pub head: HeapHead,
    /// The map being iterated
    pub map: *mut HeapObject,
    /// Next entry index
    pub next_idx: u32,
}

/// Closure: a function plus captured values
///
/// Captures live in one boxed block behind a single slot word; the
/// destructor releases every captured value exactly once.
#[repr(C)]
pub struct Closure {
    /// Common prefix
    pub head: HeapHead,
    /// Entry pc of the function body
    pub func_pc: u32,
    /// Declared parameter count
    pub num_params: u8,
    /// Total frame slots past the header
    pub num_locals: u8,
    /// Number of captured values
    pub num_captured: u8,
    _pad: u8,
    /// Captured values, copied into the frame on call
    pub captures: Box<[Value]>,
}

impl Closure {
    /// Build a closure payload
    pub fn new(func_pc: u32, num_params: u8, num_locals: u8, captures: Box<[Value]>) -> Self {
        Self {
            head: HeapHead {
                type_id: type_id::CLOSURE,
                rc: 1,
            },
            func_pc,
            num_params,
            num_locals,
            num_captured: captures.len() as u8,
            _pad: 0,
            captures,
        }
    }
}

/// Lambda: a function value with no captures
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Lambda {
    /// Common prefix
    pub head: HeapHead,
    /// Entry pc of the function body
    pub func_pc: u32,
    /// Declared parameter count
    pub num_params: u8,
    /// Total frame slots past the header
    pub num_locals: u8,
    _pad: [u8; 2],
}

impl Lambda {
    /// Build a lambda payload
    pub fn new(func_pc: u32, num_params: u8, num_locals: u8) -> Self {
        Self {
            head: HeapHead {
                type_id: type_id::LAMBDA,
                rc: 1,
            },
            func_pc,
            num_params,
            num_locals,
            _pad: [0; 2],
        }
    }
}

/// ASCII string; payload inline up to [`MAX_POOL_ASTRING`] bytes
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Astring {
    /// Common prefix
    pub head: HeapHead,
    /// Byte length
    pub len: u32,
    /// Inline payload; longer strings trail the same header in a general
    /// allocation
    pub buf: [u8; MAX_POOL_ASTRING],
}

/// UTF-8 string with a code-point length and an MRU (byte, char) index pair
/// giving amortized O(1) random access
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Ustring {
    /// Common prefix
    pub head: HeapHead,
    /// Byte length
    pub len: u32,
    /// Code-point length
    pub char_len: u32,
    /// MRU byte index
    pub mru_byte_idx: u32,
    /// MRU char index matching `mru_byte_idx`
    pub mru_char_idx: u32,
    /// Inline payload
    pub buf: [u8; MAX_POOL_USTRING],
}

/// Slice of an ASCII string; retains the parent
#[derive(Clone, Copy)]
#[repr(C)]
pub struct AstringSlice {
    /// Common prefix
    pub head: HeapHead,
    /// Parent string
    pub parent: *mut HeapObject,
    /// Start byte in the parent
    pub start: u32,
    /// Byte length
    pub len: u32,
}

/// Slice of a UTF-8 string; retains the parent
#[derive(Clone, Copy)]
#[repr(C)]
pub struct UstringSlice {
    /// Common prefix
    pub head: HeapHead,
    /// Parent string
    pub parent: *mut HeapObject,
    /// Start byte in the parent
    pub start: u32,
    /// Byte length
    pub len: u32,
    /// Code-point length, computed at slice creation
    pub char_len: u32,
}

/// Raw byte string; payload inline up to [`MAX_POOL_RAWSTRING`] bytes
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RawString {
    /// Common prefix
    pub head: HeapHead,
    /// Byte length
    pub len: u32,
    /// Inline payload
    pub buf: [u8; MAX_POOL_RAWSTRING],
}

/// Slice of a raw byte string; retains the parent
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RawStringSlice {
    /// Common prefix
    pub head: HeapHead,
    /// Parent string
    pub parent: *mut HeapObject,
    /// Start byte in the parent
    pub start: u32,
    /// Byte length
    pub len: u32,
}

/// Sentinel pc marking a terminated fiber
pub const FIBER_PC_TERMINATED: u32 = u32::MAX;

/// Cooperative fiber
///
/// While suspended, `stack`/`pc`/`fp_off` hold the complete execution state;
/// on a switch all three are saved and restored together.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Fiber {
    /// Common prefix
    pub head: HeapHead,
    /// The fiber that resumed this one; null while not running
    pub prev_fiber: *mut HeapObject,
    /// Stack buffer
    pub stack: *mut Value,
    /// Stack capacity in slots
    pub stack_cap: u32,
    /// Saved pc, or [`FIBER_PC_TERMINATED`]
    pub pc: u32,
    /// Saved frame pointer as a slot offset from the stack base
    pub fp_off: u32,
    /// Caller local receiving yielded/returned values; 0xFF for none
    pub parent_dst_local: u8,
    /// Argument count copied at coinit, for teardown before first entry
    pub init_num_args: u8,
    /// Whether the fiber ever entered its body
    pub started: u8,
    _pad: u8,
}

impl Fiber {
    /// Build a fiber payload for a freshly created, not-yet-entered fiber
    pub fn new(stack: *mut Value, stack_cap: u32, pc: u32, init_num_args: u8) -> Self {
        Self {
            head: HeapHead {
                type_id: type_id::FIBER,
                rc: 1,
            },
            prev_fiber: std::ptr::null_mut(),
            stack,
            stack_cap,
            pc,
            fp_off: 0,
            parent_dst_local: 0xFF,
            init_num_args,
            started: 0,
            _pad: 0,
        }
    }
}

/// Box: a single mutable value cell, used for captured variables
#[derive(Clone, Copy)]
#[repr(C)]
pub struct BoxObj {
    /// Common prefix
    pub head: HeapHead,
    /// Cell contents
    pub value: Value,
}

/// Native function binding object
#[derive(Clone, Copy)]
#[repr(C)]
pub struct NativeFuncObj {
    /// Common prefix
    pub head: HeapHead,
    /// The bound function
    pub func: NativeFn,
    /// Declared parameter count
    pub num_params: u32,
    _pad: u32,
}

impl NativeFuncObj {
    /// Build a native binding payload
    pub fn new(func: NativeFn, num_params: u32) -> Self {
        Self {
            head: HeapHead {
                type_id: type_id::NATIVE_FUNC,
                rc: 1,
            },
            func,
            num_params,
            _pad: 0,
        }
    }
}

/// Opaque host pointer
#[derive(Clone, Copy)]
#[repr(C)]
pub struct OpaquePtr {
    /// Common prefix
    pub head: HeapHead,
    /// The wrapped pointer
    pub ptr: *mut std::ffi::c_void,
}

/// Open file handle
#[derive(Clone, Copy)]
#[repr(C)]
pub struct FileObj {
    /// Common prefix
    pub head: HeapHead,
    /// Host file descriptor
    pub fd: i32,
    /// Set once the descriptor has been closed
    pub closed: bool,
}

/// Open directory handle
#[derive(Clone, Copy)]
#[repr(C)]
pub struct DirObj {
    /// Common prefix
    pub head: HeapHead,
    /// Host directory descriptor
    pub fd: i32,
    /// Whether iteration is permitted
    pub iterable: bool,
}

/// Directory iterator; retains its directory
#[derive(Clone, Copy)]
#[repr(C)]
pub struct DirIterObj {
    /// Common prefix
    pub head: HeapHead,
    /// The directory being iterated
    pub dir: *mut HeapObject,
    /// Whether iteration recurses into subdirectories
    pub recursive: bool,
}

/// C-interop bridge state; the core only stores and finalizes it
#[derive(Clone, Copy)]
#[repr(C)]
pub struct FfiState {
    /// Common prefix
    pub head: HeapHead,
    /// Bridge-owned state
    pub state: *mut std::ffi::c_void,
    /// Teardown hook invoked when the object dies
    pub finalizer: Option<unsafe extern "C" fn(*mut std::ffi::c_void)>,
}

/// User-defined object instance
///
/// `head.type_id` is the shape id (>= [`type_id::FIRST_OBJECT`]); the struct
/// table maps it to the field count. Up to 4 fields inline; larger shapes
/// are general allocations with the extra fields trailing.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ObjectInst {
    /// Common prefix
    pub head: HeapHead,
    /// First fields; larger shapes continue past the struct
    pub fields: [Value; MAX_POOL_OBJECT_FIELDS],
}

/// One heap object slot, reinterpreted through its first word
#[repr(C)]
pub union HeapObject {
    /// Common prefix view
    pub head: HeapHead,
    /// Free-slot view
    pub free_span: FreeSpan,
    /// List view
    pub list: ManuallyDrop<List>,
    /// List iterator view
    pub list_iter: ListIter,
    /// Map view
    pub map: ManuallyDrop<MapObj>,
    /// Map iterator view
    pub map_iter: MapIter,
    /// Closure view
    pub closure: ManuallyDrop<Closure>,
    /// Lambda view
    pub lambda: Lambda,
    /// ASCII string view
    pub astring: Astring,
    /// UTF-8 string view
    pub ustring: Ustring,
    /// ASCII slice view
    pub astring_slice: AstringSlice,
    /// UTF-8 slice view
    pub ustring_slice: UstringSlice,
    /// Raw string view
    pub rawstring: RawString,
    /// Raw slice view
    pub rawstring_slice: RawStringSlice,
    /// Fiber view
    pub fiber: Fiber,
    /// Box view
    pub boxv: BoxObj,
    /// Native function binding view
    pub native_func: NativeFuncObj,
    /// Opaque pointer view
    pub opaque: OpaquePtr,
    /// File view
    pub file: FileObj,
    /// Directory view
    pub dir: DirObj,
    /// Directory iterator view
    pub dir_iter: DirIterObj,
    /// FFI bridge state view
    pub ffi_state: FfiState,
    /// User object view
    pub object: ObjectInst,
}

impl HeapObject {
    /// Object type id
    ///
    /// # Safety
    ///
    /// `self` must be an initialized slot (live object, free span, or the
    /// reserved guard).
    #[inline]
    pub unsafe fn type_id(&self) -> u32 {
        self.head.type_id
    }

    /// Reference count
    ///
    /// # Safety
    ///
    /// `self` must be a live object.
    #[inline]
    pub unsafe fn rc(&self) -> u32 {
        self.head.rc
    }
}

impl crate::vm::Vm {
    /// Allocate a list taking ownership of `elems`
    pub fn alloc_list(&mut self, elems: Vec<Value>) -> Value {
        let slot = self.heap.alloc_pool_slot();
        unsafe {
            std::ptr::addr_of_mut!((*slot).list).write(ManuallyDrop::new(List {
                head: HeapHead {
                    type_id: type_id::LIST,
                    rc: 1,
                },
                elems,
            }));
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Allocate an iterator over a list, retaining it
    pub fn alloc_list_iter(&mut self, list: Value) -> Value {
        debug_assert!(list.is_pointer());
        self.retain(list);
        let slot = self.heap.alloc_pool_slot();
        unsafe {
            (*slot).list_iter = ListIter {
                head: HeapHead {
                    type_id: type_id::LIST_ITER,
                    rc: 1,
                },
                list: list.as_ptr(),
                next_idx: 0,
            };
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Allocate an empty map
    pub fn alloc_map(&mut self) -> Value {
        let slot = self.heap.alloc_pool_slot();
        unsafe {
            std::ptr::addr_of_mut!((*slot).map).write(ManuallyDrop::new(MapObj {
                head: HeapHead {
                    type_id: type_id::MAP,
                    rc: 1,
                },
                inner: Box::new(ValueMap::new()),
            }));
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Allocate an iterator over a map, retaining it
    pub fn alloc_map_iter(&mut self, map: Value) -> Value {
        debug_assert!(map.is_pointer());
        self.retain(map);
        let slot = self.heap.alloc_pool_slot();
        unsafe {
            (*slot).map_iter = MapIter {
                head: HeapHead {
                    type_id: type_id::MAP_ITER,
                    rc: 1,
                },
                map: map.as_ptr(),
                next_idx: 0,
            };
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Allocate a lambda
    pub fn alloc_lambda(&mut self, func_pc: u32, num_params: u8, num_locals: u8) -> Value {
        let slot = self.heap.alloc_pool_slot();
        unsafe {
            (*slot).lambda = Lambda::new(func_pc, num_params, num_locals);
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Allocate a closure taking ownership of the captured values
    pub fn alloc_closure(
        &mut self,
        func_pc: u32,
        num_params: u8,
        num_locals: u8,
        captures: Box<[Value]>,
    ) -> Value {
        let slot = self.heap.alloc_pool_slot();
        unsafe {
            std::ptr::addr_of_mut!((*slot).closure).write(ManuallyDrop::new(Closure::new(
                func_pc, num_params, num_locals, captures,
            )));
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Allocate a box taking ownership of `value`
    pub fn alloc_box(&mut self, value: Value) -> Value {
        let slot = self.heap.alloc_pool_slot();
        unsafe {
            (*slot).boxv = BoxObj {
                head: HeapHead {
                    type_id: type_id::BOX,
                    rc: 1,
                },
                value,
            };
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Allocate a native function binding
    pub fn alloc_native_func(&mut self, func: NativeFn, num_params: u32) -> Value {
        let slot = self.heap.alloc_pool_slot();
        unsafe {
            (*slot).native_func = NativeFuncObj::new(func, num_params);
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Allocate a user object of shape `tid` taking ownership of `fields`
    ///
    /// Shapes up to [`MAX_POOL_OBJECT_FIELDS`] fields live in the pool;
    /// wider shapes are general allocations with the extra fields trailing.
    pub fn alloc_object(&mut self, tid: u32, fields: &[Value]) -> Value {
        debug_assert!(tid >= type_id::FIRST_OBJECT);
        let slot = if fields.len() <= MAX_POOL_OBJECT_FIELDS {
            self.heap.alloc_pool_slot()
        } else {
            self.heap.alloc_large(8 + fields.len() * 8)
        };
        unsafe {
            (*slot).head = HeapHead { type_id: tid, rc: 1 };
            let dst = std::ptr::addr_of_mut!((*slot).object.fields) as *mut Value;
            std::ptr::copy_nonoverlapping(fields.as_ptr(), dst, fields.len());
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Allocate an opaque pointer wrapper
    pub fn alloc_opaque(&mut self, ptr: *mut std::ffi::c_void) -> Value {
        let slot = self.heap.alloc_pool_slot();
        unsafe {
            (*slot).opaque = OpaquePtr {
                head: HeapHead {
                    type_id: type_id::OPAQUE_PTR,
                    rc: 1,
                },
                ptr,
            };
            self.heap.global_rc += 1;
            Value::from_ptr(slot)
        }
    }

    /// Field storage of a user object
    ///
    /// # Safety
    ///
    /// `obj` must be a live user object.
    #[inline]
    pub(crate) unsafe fn object_fields(obj: *mut HeapObject) -> *mut Value {
        std::ptr::addr_of_mut!((*obj).object.fields) as *mut Value
    }
}

// Pool layout contract: every inline variant fits one slot, and the widest
// ones define it exactly.
const _: () = {
    use std::mem::size_of;
    assert!(size_of::<HeapObject>() == POOL_SLOT_SIZE);
    assert!(size_of::<FreeSpan>() <= POOL_SLOT_SIZE);
    assert!(size_of::<List>() <= POOL_SLOT_SIZE);
    assert!(size_of::<ListIter>() <= POOL_SLOT_SIZE);
    assert!(size_of::<MapObj>() <= POOL_SLOT_SIZE);
    assert!(size_of::<MapIter>() <= POOL_SLOT_SIZE);
    assert!(size_of::<Closure>() <= POOL_SLOT_SIZE);
    assert!(size_of::<Lambda>() <= POOL_SLOT_SIZE);
    assert!(size_of::<Astring>() == POOL_SLOT_SIZE);
    assert!(size_of::<Ustring>() == POOL_SLOT_SIZE);
    assert!(size_of::<AstringSlice>() <= POOL_SLOT_SIZE);
    assert!(size_of::<UstringSlice>() <= POOL_SLOT_SIZE);
    assert!(size_of::<RawString>() == POOL_SLOT_SIZE);
    assert!(size_of::<RawStringSlice>() <= POOL_SLOT_SIZE);
    assert!(size_of::<Fiber>() == POOL_SLOT_SIZE);
    assert!(size_of::<BoxObj>() <= POOL_SLOT_SIZE);
    assert!(size_of::<NativeFuncObj>() <= POOL_SLOT_SIZE);
    assert!(size_of::<OpaquePtr>() <= POOL_SLOT_SIZE);
    assert!(size_of::<FileObj>() <= POOL_SLOT_SIZE);
    assert!(size_of::<DirObj>() <= POOL_SLOT_SIZE);
    assert!(size_of::<DirIterObj>() <= POOL_SLOT_SIZE);
    assert!(size_of::<FfiState>() <= POOL_SLOT_SIZE);
    assert!(size_of::<ObjectInst>() == POOL_SLOT_SIZE);
};
