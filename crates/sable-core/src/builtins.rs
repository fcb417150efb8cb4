//! Builtin `core` module and built-in type methods
//!
//! Registered on every new [`Vm`]: the `core` module's free functions and
//! the native methods of the built-in container, string, and fiber kinds.
//! Arguments reach natives borrowed; ownership of results transfers to the
//! calling opcode.

use once_cell::sync::Lazy;

use crate::native::{ModuleDef, NativePair};
use crate::object::{type_id, FIBER_PC_TERMINATED};
use crate::symbols::MethodEntry;
use crate::value::Value;
use crate::vm::Vm;

static CORE_MODULE: Lazy<ModuleDef> = Lazy::new(|| {
    ModuleDef::new("core")
        .native_func("print", 1, core_print)
        .native_func("typeof", 1, core_typeof)
        .native_func("check_memory", 0, core_check_memory)
        .native_func("perf_counters", 0, core_perf_counters)
});

/// Register the `core` module and the built-in type methods
pub(crate) fn register_core(vm: &mut Vm) {
    vm.register_module(&CORE_MODULE);

    // list
    let append = vm.symbols.ensure_method_sym("append");
    let len = vm.symbols.ensure_method_sym("len");
    let insert = vm.symbols.ensure_method_sym("insert");
    let remove = vm.symbols.ensure_method_sym("remove");
    let iterator = vm.symbols.ensure_method_sym("iterator");
    let next = vm.symbols.ensure_method_sym("next");
    vm.symbols
        .set_method(type_id::LIST, append, MethodEntry::Native1(list_append));
    vm.symbols
        .set_method(type_id::LIST, len, MethodEntry::Native1(list_len));
    vm.symbols
        .set_method(type_id::LIST, insert, MethodEntry::Native1(list_insert));
    vm.symbols
        .set_method(type_id::LIST, remove, MethodEntry::Native1(list_remove));
    vm.symbols
        .set_method(type_id::LIST, iterator, MethodEntry::Native1(list_iterator));
    vm.symbols
        .set_method(type_id::LIST_ITER, next, MethodEntry::Native2(list_iter_next));

    // map
    let size = vm.symbols.ensure_method_sym("size");
    vm.symbols
        .set_method(type_id::MAP, size, MethodEntry::Native1(map_size));
    vm.symbols
        .set_method(type_id::MAP, remove, MethodEntry::Native1(map_remove));
    vm.symbols
        .set_method(type_id::MAP, iterator, MethodEntry::Native1(map_iterator));
    vm.symbols
        .set_method(type_id::MAP_ITER, next, MethodEntry::Native2(map_iter_next));

    // strings, every encoding
    let char_at = vm.symbols.ensure_method_sym("charAt");
    let byte_at = vm.symbols.ensure_method_sym("byteAt");
    let index_of = vm.symbols.ensure_method_sym("indexOf");
    for tid in [
        type_id::ASTRING,
        type_id::USTRING,
        type_id::ASTRING_SLICE,
        type_id::USTRING_SLICE,
        type_id::RAWSTRING,
        type_id::RAWSTRING_SLICE,
    ] {
        vm.symbols.set_method(tid, len, MethodEntry::Native1(string_len));
        vm.symbols
            .set_method(tid, char_at, MethodEntry::Native1(string_char_at_method));
        vm.symbols
            .set_method(tid, byte_at, MethodEntry::Native1(string_byte_at));
        vm.symbols
            .set_method(tid, index_of, MethodEntry::Native1(string_index_of));
    }

    // fiber
    let status = vm.symbols.ensure_method_sym("status");
    vm.symbols
        .set_method(type_id::FIBER, status, MethodEntry::Native1(fiber_status));
}

// ===== core module functions =====

fn core_print(vm: &mut Vm, args: *const Value, _n: u8) -> Value {
    let v = unsafe { *args };
    println!("{}", vm.value_display(v));
    Value::none()
}

fn core_typeof(vm: &mut Vm, args: *const Value, _n: u8) -> Value {
    let v = unsafe { *args };
    let name = match v.get_tag() {
        crate::value::Tag::Pointer => unsafe {
            let tid = (*v.as_ptr()).head.type_id;
            match tid {
                type_id::LIST => "list",
                type_id::MAP => "map",
                type_id::CLOSURE | type_id::LAMBDA => "function",
                type_id::FIBER => "fiber",
                type_id::BOX => "box",
                t if type_id::is_string(t) => "string",
                t if t >= type_id::FIRST_OBJECT => {
                    let name = vm.symbols.object_shape_name(t).to_string();
                    return vm.new_string(&name);
                }
                _ => "object",
            }
        },
        _ => v.type_name(),
    };
    vm.new_string(name)
}

fn core_check_memory(vm: &mut Vm, _args: *const Value, _n: u8) -> Value {
    Value::boolean(vm.check_memory())
}

fn core_perf_counters(vm: &mut Vm, _args: *const Value, _n: u8) -> Value {
    let stats = vm.heap.stats();
    let m = vm.alloc_map();
    let entries = [
        ("pages", stats.pages as f64),
        ("liveObjects", stats.live_objects as f64),
        ("freeSlots", stats.free_slots as f64),
        ("globalRc", stats.global_rc as f64),
    ];
    for (name, value) in entries {
        let key = vm.new_string(name);
        unsafe {
            let inner = &mut (*(*m.as_ptr()).map).inner;
            inner.insert(key, Some(name.as_bytes()), Value::number(value));
        }
    }
    m
}

// ===== list methods =====

fn list_append(vm: &mut Vm, recv: Value, args: *const Value, _n: u8) -> Value {
    let v = unsafe { *args };
    vm.retain(v);
    unsafe { (*(*recv.as_ptr()).list).elems.push(v) };
    Value::none()
}

fn list_len(_vm: &mut Vm, recv: Value, _args: *const Value, _n: u8) -> Value {
    let len = unsafe { (&(*recv.as_ptr()).list).elems.len() };
    Value::number(len as f64)
}

fn list_insert(vm: &mut Vm, recv: Value, args: *const Value, _n: u8) -> Value {
    let idx = vm.to_number(unsafe { *args });
    let v = unsafe { *args.add(1) };
    unsafe {
        let elems = &mut (*(*recv.as_ptr()).list).elems;
        if idx < 0.0 || idx as usize > elems.len() {
            vm.set_panic_msg(format!("Insert index `{idx}` out of bounds."));
            return Value::SENTINEL;
        }
        vm.retain(v);
        elems.insert(idx as usize, v);
    }
    Value::none()
}

fn list_remove(vm: &mut Vm, recv: Value, args: *const Value, _n: u8) -> Value {
    let idx = vm.to_number(unsafe { *args });
    unsafe {
        let elems = &mut (*(*recv.as_ptr()).list).elems;
        if idx < 0.0 || idx as usize >= elems.len() {
            vm.set_panic_msg(format!("Remove index `{idx}` out of bounds."));
            return Value::SENTINEL;
        }
        // ownership of the removed element transfers to the caller
        elems.remove(idx as usize)
    }
}

fn list_iterator(vm: &mut Vm, recv: Value, _args: *const Value, _n: u8) -> Value {
    vm.alloc_list_iter(recv)
}

fn list_iter_next(vm: &mut Vm, recv: Value, _args: *const Value, _n: u8) -> NativePair {
    unsafe {
        let it = recv.as_ptr();
        let list = (*it).list_iter.list;
        let idx = (*it).list_iter.next_idx as usize;
        if idx < (&(*list).list).elems.len() {
            (*it).list_iter.next_idx += 1;
            let v = (&(*list).list).elems[idx];
            vm.retain(v);
            NativePair {
                first: v,
                second: Value::boolean(true),
            }
        } else {
            NativePair {
                first: Value::none(),
                second: Value::boolean(false),
            }
        }
    }
}

// ===== map methods =====

fn map_size(_vm: &mut Vm, recv: Value, _args: *const Value, _n: u8) -> Value {
    let len = unsafe { (&(*recv.as_ptr()).map).inner.len() };
    Value::number(len as f64)
}

fn map_remove(vm: &mut Vm, recv: Value, args: *const Value, _n: u8) -> Value {
    let key = unsafe { *args };
    unsafe {
        let bytes = vm.string_bytes(key);
        let removed = (*(*recv.as_ptr()).map).inner.remove(key, bytes);
        match removed {
            Some((stored_key, value)) => {
                vm.release(stored_key);
                vm.release(value);
                Value::boolean(true)
            }
            None => Value::boolean(false),
        }
    }
}

fn map_iterator(vm: &mut Vm, recv: Value, _args: *const Value, _n: u8) -> Value {
    vm.alloc_map_iter(recv)
}

fn map_iter_next(vm: &mut Vm, recv: Value, _args: *const Value, _n: u8) -> NativePair {
    unsafe {
        let it = recv.as_ptr();
        let map = (*it).map_iter.map;
        let mut idx = (*it).map_iter.next_idx;
        match (&(*map).map).inner.next_entry(&mut idx) {
            Some((k, v)) => {
                (*it).map_iter.next_idx = idx;
                vm.retain(k);
                vm.retain(v);
                NativePair { first: k, second: v }
            }
            None => {
                (*it).map_iter.next_idx = idx;
                NativePair {
                    first: Value::none(),
                    second: Value::none(),
                }
            }
        }
    }
}

// ===== string methods =====

fn string_len(vm: &mut Vm, recv: Value, _args: *const Value, _n: u8) -> Value {
    match vm.string_char_len(recv) {
        Some(n) => Value::number(n as f64),
        None => Value::number(0.0),
    }
}

fn string_char_at_method(vm: &mut Vm, recv: Value, args: *const Value, _n: u8) -> Value {
    let idx = vm.to_number(unsafe { *args });
    if idx < 0.0 {
        return Value::error_tag(crate::symbols::error_sym::OUT_OF_BOUNDS);
    }
    match vm.string_char_at(recv, idx as usize) {
        Some(c) => {
            let mut buf = [0u8; 4];
            vm.new_string(c.encode_utf8(&mut buf))
        }
        None => Value::error_tag(crate::symbols::error_sym::OUT_OF_BOUNDS),
    }
}

fn string_byte_at(vm: &mut Vm, recv: Value, args: *const Value, _n: u8) -> Value {
    let idx = vm.to_number(unsafe { *args });
    match vm.value_string_bytes(recv) {
        Some((ptr, len)) if idx >= 0.0 && (idx as usize) < len => {
            Value::number(unsafe { *ptr.add(idx as usize) } as f64)
        }
        _ => Value::error_tag(crate::symbols::error_sym::OUT_OF_BOUNDS),
    }
}

fn string_index_of(vm: &mut Vm, recv: Value, args: *const Value, _n: u8) -> Value {
    let needle_v = unsafe { *args };
    unsafe {
        let hay = match vm.string_bytes(recv) {
            Some(b) => b,
            None => return Value::none(),
        };
        let needle = match vm.string_bytes(needle_v) {
            Some(b) => b,
            None => return Value::none(),
        };
        if needle.is_empty() || needle.len() > hay.len() {
            return Value::none();
        }
        for i in 0..=(hay.len() - needle.len()) {
            if &hay[i..i + needle.len()] == needle {
                return Value::number(i as f64);
            }
        }
    }
    Value::none()
}

// ===== fiber methods =====

fn fiber_status(vm: &mut Vm, recv: Value, _args: *const Value, _n: u8) -> Value {
    let status = unsafe {
        let obj = recv.as_ptr();
        if obj == vm.cur_fiber {
            "running"
        } else if (*obj).fiber.pc == FIBER_PC_TERMINATED {
            "done"
        } else {
            "paused"
        }
    };
    vm.new_string(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmOptions;

    fn vm() -> Vm {
        Vm::new(VmOptions::default())
    }

    #[test]
    fn test_list_append_retains() {
        let mut vm = vm();
        let l = vm.alloc_list(Vec::new());
        let s = vm.new_string("elem");
        list_append(&mut vm, l, &s, 1);
        unsafe {
            assert_eq!((*s.as_ptr()).head.rc, 2);
            assert_eq!((&(*l.as_ptr()).list).elems.len(), 1);
        }
        vm.release(s);
        vm.release(l);
        assert_eq!(vm.heap.global_rc, 0);
    }

    #[test]
    fn test_list_iter_next_pair() {
        let mut vm = vm();
        let l = vm.alloc_list(vec![Value::number(5.0)]);
        let it = list_iterator(&mut vm, l, std::ptr::null(), 0);
        let p = list_iter_next(&mut vm, it, std::ptr::null(), 0);
        assert_eq!(p.first, Value::number(5.0));
        assert_eq!(p.second, Value::boolean(true));
        let p = list_iter_next(&mut vm, it, std::ptr::null(), 0);
        assert!(p.first.is_none());
        assert_eq!(p.second, Value::boolean(false));
        vm.release(it);
        vm.release(l);
        assert_eq!(vm.heap.global_rc, 0);
    }

    #[test]
    fn test_map_remove_releases() {
        let mut vm = vm();
        let m = vm.alloc_map();
        let k = vm.new_string("key");
        let v = vm.new_string("value");
        unsafe {
            let inner = &mut (*(*m.as_ptr()).map).inner;
            inner.insert(k, Some(b"key"), v);
        }
        // the map owns its own refs on key and value
        vm.retain(k);
        let removed = map_remove(&mut vm, m, &k, 1);
        assert_eq!(removed, Value::boolean(true));
        vm.release(k);
        vm.release(m);
        assert_eq!(vm.heap.global_rc, 0);
    }

    #[test]
    fn test_string_methods() {
        let mut vm = vm();
        let s = vm.new_string("hello");
        assert_eq!(string_len(&mut vm, s, std::ptr::null(), 0), Value::number(5.0));
        let idx_arg = Value::number(1.0);
        let c = string_char_at_method(&mut vm, s, &idx_arg, 1);
        unsafe { assert_eq!(vm.string_bytes(c).unwrap(), b"e") };
        let b = string_byte_at(&mut vm, s, &idx_arg, 1);
        assert_eq!(b, Value::number(b'e' as f64));
        let needle = vm.new_string("llo");
        assert_eq!(string_index_of(&mut vm, s, &needle, 1), Value::number(2.0));
        let oob = Value::number(9.0);
        assert!(string_char_at_method(&mut vm, s, &oob, 1).is_error());
        for v in [s, c, needle] {
            vm.release(v);
        }
    }

    #[test]
    fn test_typeof() {
        let mut vm = vm();
        let l = vm.alloc_list(Vec::new());
        let t = core_typeof(&mut vm, &l, 1);
        unsafe { assert_eq!(vm.string_bytes(t).unwrap(), b"list") };
        let n = Value::number(1.0);
        let t2 = core_typeof(&mut vm, &n, 1);
        unsafe { assert_eq!(vm.string_bytes(t2).unwrap(), b"number") };
        vm.release(l);
        vm.release(t);
        vm.release(t2);
    }
}
