//! String objects and interning
//!
//! Three heap encodings (ASCII, UTF-8 with a code-point cache, raw bytes),
//! two heap slice kinds plus a raw slice, and two static-buffer slice value
//! encodings. Short managed strings (ASCII or UTF-8, at most
//! [`INTERN_MAX_LEN`] bytes) are canonicalized through the intern table: the
//! table maps bytes to the one live object carrying them and holds no
//! reference count of its own; the string's destructor removes the entry,
//! but only when the entry still points at that exact object.
//!
//! Concatenation probes the intern table with the prospective bytes on a
//! stack buffer, so the common repeated-concat path allocates nothing.

use std::ptr::{addr_of, addr_of_mut};

use crate::object::{
    type_id, Astring, HeapHead, HeapObject, RawString, Ustring, ASTRING_BUF_OFFSET,
    MAX_POOL_ASTRING, MAX_POOL_RAWSTRING, MAX_POOL_USTRING, USTRING_BUF_OFFSET,
};
use crate::value::{Tag, Value};
use crate::vm::Vm;

/// Maximum byte length at which a new string is interned
pub const INTERN_MAX_LEN: usize = 64;

/// One resolved concatenation operand
#[derive(Clone, Copy)]
pub(crate) struct StrPart {
    ptr: *const u8,
    len: usize,
    kind: StrPartKind,
}

#[derive(Clone, Copy, PartialEq)]
enum StrPartKind {
    Ascii,
    Utf8 { char_len: u32 },
    Raw,
}

impl Vm {
    /// Resolve any string value to its bytes as a raw (ptr, len) pair
    ///
    /// Returns `None` for non-string values. The pointer stays valid while
    /// the value (or the loaded program, for static slices) is alive.
    pub fn value_string_bytes(&self, v: Value) -> Option<(*const u8, usize)> {
        match v.get_tag() {
            Tag::StaticAstring | Tag::StaticUstring => {
                let (start, end) = v.as_static_string_slice();
                let bytes = &self.program.strings[start as usize..end as usize];
                Some((bytes.as_ptr(), bytes.len()))
            }
            Tag::Pointer => unsafe {
                let obj = v.as_ptr();
                heap_string_bytes(obj)
            },
            _ => None,
        }
    }

    /// Borrow a string value's bytes
    ///
    /// # Safety
    ///
    /// The returned slice aliases heap object storage; the caller must not
    /// release the value or mutate the string while holding it.
    pub unsafe fn string_bytes<'a>(&self, v: Value) -> Option<&'a [u8]> {
        self.value_string_bytes(v)
            .map(|(ptr, len)| std::slice::from_raw_parts(ptr, len))
    }

    /// Allocate an ASCII string without consulting the intern table
    pub fn alloc_astring(&mut self, bytes: &[u8]) -> Value {
        debug_assert!(bytes.is_ascii());
        let len = bytes.len();
        let obj = if len <= MAX_POOL_ASTRING {
            self.heap.alloc_pool_slot()
        } else {
            self.heap.alloc_large(ASTRING_BUF_OFFSET + len)
        };
        unsafe {
            addr_of_mut!((*obj).astring).write(Astring {
                head: HeapHead {
                    type_id: type_id::ASTRING,
                    rc: 1,
                },
                len: len as u32,
                buf: [0; MAX_POOL_ASTRING],
            });
            let dst = addr_of_mut!((*obj).astring.buf) as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, len);
            self.heap.global_rc += 1;
            Value::from_ptr(obj)
        }
    }

    /// Allocate a UTF-8 string without consulting the intern table
    pub fn alloc_ustring(&mut self, bytes: &[u8], char_len: u32) -> Value {
        let len = bytes.len();
        let obj = if len <= MAX_POOL_USTRING {
            self.heap.alloc_pool_slot()
        } else {
            self.heap.alloc_large(USTRING_BUF_OFFSET + len)
        };
        unsafe {
            addr_of_mut!((*obj).ustring).write(Ustring {
                head: HeapHead {
                    type_id: type_id::USTRING,
                    rc: 1,
                },
                len: len as u32,
                char_len,
                mru_byte_idx: 0,
                mru_char_idx: 0,
                buf: [0; MAX_POOL_USTRING],
            });
            let dst = addr_of_mut!((*obj).ustring.buf) as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, len);
            self.heap.global_rc += 1;
            Value::from_ptr(obj)
        }
    }

    /// Allocate a raw byte string; raw strings are never interned
    pub fn alloc_rawstring(&mut self, bytes: &[u8]) -> Value {
        let len = bytes.len();
        let obj = if len <= MAX_POOL_RAWSTRING {
            self.heap.alloc_pool_slot()
        } else {
            self.heap.alloc_large(ASTRING_BUF_OFFSET + len)
        };
        unsafe {
            addr_of_mut!((*obj).rawstring).write(RawString {
                head: HeapHead {
                    type_id: type_id::RAWSTRING,
                    rc: 1,
                },
                len: len as u32,
                buf: [0; MAX_POOL_RAWSTRING],
            });
            let dst = addr_of_mut!((*obj).rawstring.buf) as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, len);
            self.heap.global_rc += 1;
            Value::from_ptr(obj)
        }
    }

    /// Get the interned ASCII string for `bytes`, allocating on miss
    ///
    /// Lengths over [`INTERN_MAX_LEN`] always allocate a fresh string.
    pub fn get_or_alloc_astring(&mut self, bytes: &[u8]) -> Value {
        if bytes.len() > INTERN_MAX_LEN {
            return self.alloc_astring(bytes);
        }
        if let Some(&obj) = self.intern.get(bytes) {
            let v = unsafe { Value::from_ptr(obj) };
            self.retain(v);
            return v;
        }
        let v = self.alloc_astring(bytes);
        self.intern.insert(bytes.into(), unsafe { v.as_ptr() });
        v
    }

    /// Get the interned UTF-8 string for `bytes`, allocating on miss
    pub fn get_or_alloc_ustring(&mut self, bytes: &[u8], char_len: u32) -> Value {
        if bytes.len() > INTERN_MAX_LEN {
            return self.alloc_ustring(bytes, char_len);
        }
        if let Some(&obj) = self.intern.get(bytes) {
            let v = unsafe { Value::from_ptr(obj) };
            self.retain(v);
            return v;
        }
        let v = self.alloc_ustring(bytes, char_len);
        self.intern.insert(bytes.into(), unsafe { v.as_ptr() });
        v
    }

    /// Create a managed string from a Rust string, interning when short
    pub fn new_string(&mut self, s: &str) -> Value {
        if s.is_ascii() {
            self.get_or_alloc_astring(s.as_bytes())
        } else {
            self.get_or_alloc_ustring(s.as_bytes(), s.chars().count() as u32)
        }
    }

    /// Remove the intern entry for a dying string, but only if the entry
    /// still refers to this exact object (identity, not equality)
    pub(crate) unsafe fn intern_remove_if_same(&mut self, obj: *mut HeapObject) {
        let (ptr, len) = match heap_string_bytes(obj) {
            Some(b) => b,
            None => return,
        };
        if len > INTERN_MAX_LEN {
            return;
        }
        let bytes = std::slice::from_raw_parts(ptr, len);
        if self.intern.get(bytes).copied() == Some(obj) {
            self.intern.remove(bytes);
        }
    }

    /// Slice a string value into `[start, end)` by bytes
    ///
    /// Slices of static strings stay static values; slices of heap strings
    /// allocate a slice object retaining the root string. Returns `None`
    /// when the receiver is not a string or the range is out of bounds.
    pub fn string_slice_value(&mut self, v: Value, start: usize, end: usize) -> Option<Value> {
        let (_, len) = self.value_string_bytes(v)?;
        if start > end || end > len {
            return None;
        }
        match v.get_tag() {
            Tag::StaticAstring => {
                let (s, _) = v.as_static_string_slice();
                Some(Value::static_astring(s + start as u32, s + end as u32))
            }
            Tag::StaticUstring => {
                let (s, _) = v.as_static_string_slice();
                Some(Value::static_ustring(s + start as u32, s + end as u32))
            }
            Tag::Pointer => unsafe {
                let obj = v.as_ptr();
                let (root, base) = string_root(obj);
                let abs = base + start as u32;
                let slice_len = (end - start) as u32;
                let tid = (*root).head.type_id;
                let out = match tid {
                    type_id::ASTRING => {
                        let slot = self.heap.alloc_pool_slot();
                        (*slot).astring_slice = crate::object::AstringSlice {
                            head: HeapHead {
                                type_id: type_id::ASTRING_SLICE,
                                rc: 1,
                            },
                            parent: root,
                            start: abs,
                            len: slice_len,
                        };
                        slot
                    }
                    type_id::USTRING => {
                        let (p, _) = heap_string_bytes(root).unwrap();
                        let bytes = std::slice::from_raw_parts(p.add(abs as usize), end - start);
                        let char_len = count_chars(bytes);
                        let slot = self.heap.alloc_pool_slot();
                        (*slot).ustring_slice = crate::object::UstringSlice {
                            head: HeapHead {
                                type_id: type_id::USTRING_SLICE,
                                rc: 1,
                            },
                            parent: root,
                            start: abs,
                            len: slice_len,
                            char_len,
                        };
                        slot
                    }
                    type_id::RAWSTRING => {
                        let slot = self.heap.alloc_pool_slot();
                        (*slot).rawstring_slice = crate::object::RawStringSlice {
                            head: HeapHead {
                                type_id: type_id::RAWSTRING_SLICE,
                                rc: 1,
                            },
                            parent: root,
                            start: abs,
                            len: slice_len,
                        };
                        slot
                    }
                    _ => return None,
                };
                self.retain(Value::from_ptr(root));
                self.heap.global_rc += 1;
                Some(Value::from_ptr(out))
            },
            _ => None,
        }
    }

    pub(crate) fn resolve_str_part(&self, v: Value) -> Option<StrPart> {
        let (ptr, len) = self.value_string_bytes(v)?;
        let kind = match v.get_tag() {
            Tag::StaticAstring => StrPartKind::Ascii,
            Tag::StaticUstring => {
                let (start, _) = v.as_static_string_slice();
                StrPartKind::Utf8 {
                    char_len: self.static_ustring_header(start).0,
                }
            }
            Tag::Pointer => unsafe {
                let obj = v.as_ptr();
                match (*obj).head.type_id {
                    type_id::ASTRING | type_id::ASTRING_SLICE => StrPartKind::Ascii,
                    type_id::USTRING => StrPartKind::Utf8 {
                        char_len: (*obj).ustring.char_len,
                    },
                    type_id::USTRING_SLICE => StrPartKind::Utf8 {
                        char_len: (*obj).ustring_slice.char_len,
                    },
                    _ => StrPartKind::Raw,
                }
            },
            _ => return None,
        };
        Some(StrPart { ptr, len, kind })
    }

    /// Concatenate two string values
    pub fn string_concat2(&mut self, a: Value, b: Value) -> Option<Value> {
        let parts = [self.resolve_str_part(a)?, self.resolve_str_part(b)?];
        Some(self.concat_parts(&parts))
    }

    /// Concatenate three string values
    pub fn string_concat3(&mut self, a: Value, b: Value, c: Value) -> Option<Value> {
        let parts = [
            self.resolve_str_part(a)?,
            self.resolve_str_part(b)?,
            self.resolve_str_part(c)?,
        ];
        Some(self.concat_parts(&parts))
    }

    /// Build the concatenation of resolved parts, probing the intern table
    /// from a stack buffer before materializing anything
    fn concat_parts(&mut self, parts: &[StrPart]) -> Value {
        let total: usize = parts.iter().map(|p| p.len).sum();
        let any_raw = parts.iter().any(|p| p.kind == StrPartKind::Raw);
        let all_ascii = parts.iter().all(|p| p.kind == StrPartKind::Ascii);
        let char_len: u32 = parts
            .iter()
            .map(|p| match p.kind {
                StrPartKind::Ascii | StrPartKind::Raw => p.len as u32,
                StrPartKind::Utf8 { char_len } => char_len,
            })
            .sum();

        if !any_raw && total <= INTERN_MAX_LEN {
            let mut buf = [0u8; INTERN_MAX_LEN];
            let mut at = 0;
            for p in parts {
                unsafe { std::ptr::copy_nonoverlapping(p.ptr, buf.as_mut_ptr().add(at), p.len) };
                at += p.len;
            }
            let bytes = &buf[..total];
            if let Some(&obj) = self.intern.get(bytes) {
                let v = unsafe { Value::from_ptr(obj) };
                self.retain(v);
                return v;
            }
            let bytes = bytes.to_vec();
            let v = if all_ascii {
                self.alloc_astring(&bytes)
            } else {
                self.alloc_ustring(&bytes, char_len)
            };
            self.intern.insert(bytes.into(), unsafe { v.as_ptr() });
            return v;
        }

        let mut bytes = Vec::with_capacity(total);
        for p in parts {
            bytes.extend_from_slice(unsafe { std::slice::from_raw_parts(p.ptr, p.len) });
        }
        if any_raw {
            self.alloc_rawstring(&bytes)
        } else if all_ascii {
            self.alloc_astring(&bytes)
        } else {
            self.alloc_ustring(&bytes, char_len)
        }
    }

    /// Code-point length of a string value
    pub fn string_char_len(&self, v: Value) -> Option<u32> {
        match v.get_tag() {
            Tag::StaticAstring => {
                let (s, e) = v.as_static_string_slice();
                Some(e - s)
            }
            Tag::StaticUstring => {
                let (s, _) = v.as_static_string_slice();
                Some(self.static_ustring_header(s).0)
            }
            Tag::Pointer => unsafe {
                let obj = v.as_ptr();
                match (*obj).head.type_id {
                    type_id::ASTRING => Some((*obj).astring.len),
                    type_id::ASTRING_SLICE => Some((*obj).astring_slice.len),
                    type_id::USTRING => Some((*obj).ustring.char_len),
                    type_id::USTRING_SLICE => Some((*obj).ustring_slice.char_len),
                    type_id::RAWSTRING => Some((*obj).rawstring.len),
                    type_id::RAWSTRING_SLICE => Some((*obj).rawstring_slice.len),
                    _ => None,
                }
            },
            _ => None,
        }
    }

    /// Character at a code-point index, using the MRU (byte, char) cache for
    /// UTF-8 strings so sequential access is O(1) amortized
    pub fn string_char_at(&mut self, v: Value, idx: usize) -> Option<char> {
        let (ptr, len) = self.value_string_bytes(v)?;
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        match v.get_tag() {
            Tag::StaticAstring => bytes.get(idx).map(|b| *b as char),
            Tag::StaticUstring => {
                let (start, _) = v.as_static_string_slice();
                let (_, mru_char, mru_byte) = self.static_ustring_header(start);
                let (c, new_byte) = char_at_cached(bytes, idx, mru_char as usize, mru_byte as usize)?;
                self.set_static_ustring_mru(start, idx as u32, new_byte as u32);
                Some(c)
            }
            Tag::Pointer => unsafe {
                let obj = v.as_ptr();
                match (*obj).head.type_id {
                    type_id::ASTRING | type_id::ASTRING_SLICE => {
                        bytes.get(idx).map(|b| *b as char)
                    }
                    type_id::USTRING => {
                        let mru_byte = (*obj).ustring.mru_byte_idx as usize;
                        let mru_char = (*obj).ustring.mru_char_idx as usize;
                        let (c, new_byte) = char_at_cached(bytes, idx, mru_char, mru_byte)?;
                        (*obj).ustring.mru_char_idx = idx as u32;
                        (*obj).ustring.mru_byte_idx = new_byte as u32;
                        Some(c)
                    }
                    type_id::USTRING_SLICE => {
                        // slices carry no cache of their own; scan from 0
                        let (c, _) = char_at_cached(bytes, idx, 0, 0)?;
                        Some(c)
                    }
                    _ => None,
                }
            },
            _ => None,
        }
    }

    /// Read a static-ustring header: (char_len, mru_char_idx, mru_byte_idx)
    pub(crate) fn static_ustring_header(&self, start: u32) -> (u32, u32, u32) {
        let h = start as usize - 12;
        let s = &self.program.strings;
        (
            u32::from_le_bytes(s[h..h + 4].try_into().unwrap()),
            u32::from_le_bytes(s[h + 4..h + 8].try_into().unwrap()),
            u32::from_le_bytes(s[h + 8..h + 12].try_into().unwrap()),
        )
    }

    fn set_static_ustring_mru(&mut self, start: u32, char_idx: u32, byte_idx: u32) {
        let h = start as usize - 12;
        self.program.strings[h + 4..h + 8].copy_from_slice(&char_idx.to_le_bytes());
        self.program.strings[h + 8..h + 12].copy_from_slice(&byte_idx.to_le_bytes());
    }

    /// Coerce a value to a number the way arithmetic slow paths do: strings
    /// parse, and parse failures are absorbed as 0.0
    pub fn to_number(&self, v: Value) -> f64 {
        if let Some((ptr, len)) = self.value_string_bytes(v) {
            let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
            return std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(0.0);
        }
        v.to_f64()
    }

    /// Byte-equality over any two string values
    pub fn string_eq(&self, a: Value, b: Value) -> bool {
        match (self.value_string_bytes(a), self.value_string_bytes(b)) {
            (Some((pa, la)), Some((pb, lb))) => unsafe {
                la == lb && std::slice::from_raw_parts(pa, la) == std::slice::from_raw_parts(pb, lb)
            },
            _ => false,
        }
    }
}

/// Bytes of a heap string object, or `None` for non-string kinds
///
/// # Safety
///
/// `obj` must be a live heap object.
pub(crate) unsafe fn heap_string_bytes(obj: *mut HeapObject) -> Option<(*const u8, usize)> {
    match (*obj).head.type_id {
        type_id::ASTRING => Some((
            addr_of!((*obj).astring.buf) as *const u8,
            (*obj).astring.len as usize,
        )),
        type_id::USTRING => Some((
            addr_of!((*obj).ustring.buf) as *const u8,
            (*obj).ustring.len as usize,
        )),
        type_id::RAWSTRING => Some((
            addr_of!((*obj).rawstring.buf) as *const u8,
            (*obj).rawstring.len as usize,
        )),
        type_id::ASTRING_SLICE => {
            let s = (*obj).astring_slice;
            let (p, _) = heap_string_bytes(s.parent)?;
            Some((p.add(s.start as usize), s.len as usize))
        }
        type_id::USTRING_SLICE => {
            let s = (*obj).ustring_slice;
            let (p, _) = heap_string_bytes(s.parent)?;
            Some((p.add(s.start as usize), s.len as usize))
        }
        type_id::RAWSTRING_SLICE => {
            let s = (*obj).rawstring_slice;
            let (p, _) = heap_string_bytes(s.parent)?;
            Some((p.add(s.start as usize), s.len as usize))
        }
        _ => None,
    }
}

/// Resolve a heap string to its root object and the byte offset of `obj`'s
/// content within it
///
/// # Safety
///
/// `obj` must be a live heap string object.
unsafe fn string_root(obj: *mut HeapObject) -> (*mut HeapObject, u32) {
    match (*obj).head.type_id {
        type_id::ASTRING_SLICE => ((*obj).astring_slice.parent, (*obj).astring_slice.start),
        type_id::USTRING_SLICE => ((*obj).ustring_slice.parent, (*obj).ustring_slice.start),
        type_id::RAWSTRING_SLICE => {
            ((*obj).rawstring_slice.parent, (*obj).rawstring_slice.start)
        }
        _ => (obj, 0),
    }
}

fn count_chars(bytes: &[u8]) -> u32 {
    bytes.iter().filter(|b| (*b & 0xC0) != 0x80).count() as u32
}

/// Find the char at `idx` starting the scan from a cached (char, byte)
/// position; returns the char and its byte offset
fn char_at_cached(
    bytes: &[u8],
    idx: usize,
    mru_char: usize,
    mru_byte: usize,
) -> Option<(char, usize)> {
    let (mut char_i, mut byte_i) = if mru_byte < bytes.len() && mru_char <= idx {
        (mru_char, mru_byte)
    } else {
        (0, 0)
    };
    while byte_i < bytes.len() {
        if char_i == idx {
            let s = unsafe { std::str::from_utf8_unchecked(&bytes[byte_i..]) };
            return s.chars().next().map(|c| (c, byte_i));
        }
        byte_i += utf8_len(bytes[byte_i]);
        char_i += 1;
    }
    None
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b & 0x80 == 0 => 1,
        b if b & 0xE0 == 0xC0 => 2,
        b if b & 0xF0 == 0xE0 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Vm, VmOptions};

    fn vm() -> Vm {
        Vm::new(VmOptions::default())
    }

    #[test]
    fn test_intern_hit_returns_same_object() {
        let mut vm = vm();
        let a = vm.get_or_alloc_astring(b"hello");
        let b = vm.get_or_alloc_astring(b"hello");
        assert_eq!(a.raw(), b.raw());
        unsafe { assert_eq!((*a.as_ptr()).head.rc, 2) };
        vm.release(a);
        vm.release(b);
    }

    #[test]
    fn test_intern_boundary() {
        let mut vm = vm();
        // 64 bytes must intern
        let s64 = [b'a'; 64];
        let a = vm.get_or_alloc_astring(&s64);
        let b = vm.get_or_alloc_astring(&s64);
        assert_eq!(a.raw(), b.raw());
        vm.release(b);
        // 65 bytes must not
        let s65 = [b'a'; 65];
        let c = vm.get_or_alloc_astring(&s65);
        let d = vm.get_or_alloc_astring(&s65);
        assert_ne!(c.raw(), d.raw());
        vm.release(a);
        vm.release(c);
        vm.release(d);
    }

    #[test]
    fn test_intern_entry_removed_on_free() {
        let mut vm = vm();
        let a = vm.get_or_alloc_astring(b"gone");
        vm.release(a);
        // a fresh request must allocate a new object, not resurrect the old
        let b = vm.get_or_alloc_astring(b"gone");
        unsafe { assert_eq!((*b.as_ptr()).head.rc, 1) };
        vm.release(b);
        assert_eq!(vm.heap.global_rc, 0);
    }

    #[test]
    fn test_pool_and_large_strings() {
        let mut vm = vm();
        let small = vm.alloc_astring(&[b'x'; MAX_POOL_ASTRING]);
        let large = vm.alloc_astring(&[b'y'; MAX_POOL_ASTRING + 1]);
        let live_before = vm.heap.stats().live_objects;
        let large_before = vm.heap.stats().large_objects;
        assert_eq!(large_before, 1);
        vm.release(small);
        vm.release(large);
        assert_eq!(vm.heap.stats().live_objects, live_before - 1);
        assert_eq!(vm.heap.stats().large_objects, 0);
    }

    #[test]
    fn test_concat2_interns_pointer_equal() {
        let mut vm = vm();
        let ab = vm.get_or_alloc_astring(b"ab");
        let cd = vm.get_or_alloc_astring(b"cd");
        let a = vm.get_or_alloc_astring(b"a");
        let b = vm.get_or_alloc_astring(b"b");
        let r1 = vm.string_concat2(ab, cd).unwrap();
        let r2 = vm.string_concat3(a, b, cd).unwrap();
        // concat("ab","cd") == concat3("a","b","cd") by pointer identity
        assert_eq!(r1.raw(), r2.raw());
        for v in [ab, cd, a, b, r1, r2] {
            vm.release(v);
        }
        assert_eq!(vm.heap.global_rc, 0);
    }

    #[test]
    fn test_concat_over_threshold_not_interned() {
        let mut vm = vm();
        let x = vm.alloc_astring(&[b'x'; 40]);
        let y = vm.alloc_astring(&[b'y'; 40]);
        let r1 = vm.string_concat2(x, y).unwrap();
        let r2 = vm.string_concat2(x, y).unwrap();
        assert_ne!(r1.raw(), r2.raw());
        for v in [x, y, r1, r2] {
            vm.release(v);
        }
    }

    #[test]
    fn test_ustring_concat_char_len() {
        let mut vm = vm();
        let a = vm.new_string("héllo");
        let b = vm.new_string("wörld");
        let r = vm.string_concat2(a, b).unwrap();
        assert_eq!(vm.string_char_len(r), Some(10));
        for v in [a, b, r] {
            vm.release(v);
        }
    }

    #[test]
    fn test_char_at_with_mru_cache() {
        let mut vm = vm();
        let s = vm.new_string("aébc\u{1F600}d");
        assert_eq!(vm.string_char_at(s, 0), Some('a'));
        assert_eq!(vm.string_char_at(s, 1), Some('é'));
        assert_eq!(vm.string_char_at(s, 4), Some('\u{1F600}'));
        // sequential access reuses the cache
        assert_eq!(vm.string_char_at(s, 5), Some('d'));
        assert_eq!(vm.string_char_at(s, 6), None);
        // going backwards falls back to a scan from the start
        assert_eq!(vm.string_char_at(s, 2), Some('b'));
        vm.release(s);
    }

    #[test]
    fn test_slice_retains_parent() {
        let mut vm = vm();
        let s = vm.alloc_astring(b"hello world");
        let sl = vm.string_slice_value(s, 6, 11).unwrap();
        unsafe {
            assert_eq!((*s.as_ptr()).head.rc, 2);
            assert_eq!(vm.string_bytes(sl).unwrap(), b"world");
        }
        vm.release(s);
        // the slice keeps the parent alive
        unsafe { assert_eq!(vm.string_bytes(sl).unwrap(), b"world") };
        vm.release(sl);
        assert_eq!(vm.heap.global_rc, 0);
    }

    #[test]
    fn test_to_number_parses_strings() {
        let mut vm = vm();
        let n = vm.new_string("12.5");
        let junk = vm.new_string("pears");
        assert_eq!(vm.to_number(n), 12.5);
        // parse failure absorbs to 0.0
        assert_eq!(vm.to_number(junk), 0.0);
        assert_eq!(vm.to_number(Value::boolean(true)), 1.0);
        vm.release(n);
        vm.release(junk);
    }

    #[test]
    fn test_string_eq_across_kinds() {
        let mut vm = vm();
        let a = vm.alloc_astring(b"same");
        let b = vm.alloc_astring(b"same");
        assert!(vm.string_eq(a, b));
        let c = vm.alloc_rawstring(b"same");
        assert!(vm.string_eq(a, c));
        let d = vm.alloc_astring(b"diff");
        assert!(!vm.string_eq(a, d));
        for v in [a, b, c, d] {
            vm.release(v);
        }
    }
}
