//! Heap and reference-counting integration tests

use sable_bytecode::{OpCode, ProgramBuilder};
use sable_core::value::Value;
use sable_core::vm::{Vm, VmOptions};

fn vm() -> Vm {
    Vm::new(VmOptions::default())
}

#[test]
fn test_cycle_detection_end_to_end() {
    // a = []; a.append(a); a = none; check_memory()
    let mut vm = vm();
    let append = vm.symbols_mut().ensure_method_sym("append");
    let core = vm.symbols_mut().ensure_name("core");
    let check = vm.symbols_mut().ensure_func_sym(core, "check_memory", 0);

    let mut b = ProgramBuilder::new("t.sbl", "");
    b.op(OpCode::List).u8(5).u8(0).u8(4); // a = []
    // a.append(a)
    b.op(OpCode::CopyRetainSrc).u8(4).u8(9);
    b.op(OpCode::CopyRetainSrc).u8(4).u8(10);
    b.op(OpCode::CallObjSym).u8(5).u8(1).u8(0).u16(append as u16).u16(0).u32(0);
    // a = none
    b.op(OpCode::Release).u8(4);
    // check_memory()
    b.op(OpCode::CallSym).u8(5).u8(0).u8(1).u16(check as u16).u32(0);
    b.op(OpCode::End).u8(5);

    let r = vm.eval(b.finish()).unwrap();
    assert_eq!(r, Value::boolean(false));
    assert_eq!(vm.cycle_root_count(), 1);
    assert_eq!(vm.heap.global_rc, 0);
    assert_eq!(vm.heap.stats().live_objects, 0);
    assert!(vm.heap.verify_pages());
}

#[test]
fn test_check_memory_clean_heap() {
    let mut vm = vm();
    let core = vm.symbols_mut().ensure_name("core");
    let check = vm.symbols_mut().ensure_func_sym(core, "check_memory", 0);

    let mut b = ProgramBuilder::new("t.sbl", "");
    b.op(OpCode::ConstI8).i8(1).u8(5);
    b.op(OpCode::List).u8(5).u8(1).u8(4);
    b.op(OpCode::CallSym).u8(5).u8(0).u8(1).u16(check as u16).u32(0);
    b.op(OpCode::Copy).u8(5).u8(6);
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(6);
    assert_eq!(vm.eval(b.finish()).unwrap(), Value::boolean(true));
    assert_eq!(vm.cycle_root_count(), 0);
    assert_eq!(vm.heap.global_rc, 0);
}

#[test]
fn test_heap_topology_restored_after_program() {
    let mut vm = vm();
    let before = vm.heap.stats();

    let mut b = ProgramBuilder::new("t.sbl", "");
    let s = b.const_astring("a fresh heap string to allocate");
    // allocate a list, a map, a string slice, then drop everything
    b.op(OpCode::ConstI8).i8(1).u8(5);
    b.op(OpCode::ConstI8).i8(2).u8(6);
    b.op(OpCode::List).u8(5).u8(2).u8(4);
    b.op(OpCode::MapEmpty).u8(7);
    b.op(OpCode::ConstOp).u8(s).u8(8);
    b.op(OpCode::ConstI8).i8(0).u8(9);
    b.op(OpCode::ConstI8).i8(5).u8(10);
    b.op(OpCode::Slice).u8(8).u8(9).u8(10).u8(11);
    b.op(OpCode::Release).u8(11);
    b.op(OpCode::Release).u8(7);
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(0xFF);
    vm.eval(b.finish()).unwrap();

    let after = vm.heap.stats();
    assert_eq!(before.pages, after.pages);
    assert_eq!(before.free_slots, after.free_slots);
    assert_eq!(before.live_objects, after.live_objects);
    assert_eq!(after.global_rc, 0);
    assert!(vm.heap.verify_pages());
}

#[test]
fn test_perf_counters_builtin() {
    let mut vm = vm();
    let core = vm.symbols_mut().ensure_name("core");
    let perf = vm.symbols_mut().ensure_func_sym(core, "perf_counters", 0);

    let mut b = ProgramBuilder::new("t.sbl", "");
    let key = b.const_astring("pages");
    b.op(OpCode::CallSym).u8(5).u8(0).u8(1).u16(perf as u16).u32(0);
    b.op(OpCode::ConstOp).u8(key).u8(6);
    b.op(OpCode::Index).u8(5).u8(6).u8(7);
    b.op(OpCode::Release).u8(5);
    b.op(OpCode::End).u8(7);
    let r = vm.eval(b.finish()).unwrap();
    assert_eq!(r, Value::number(1.0));
    assert_eq!(vm.heap.global_rc, 0);
}

#[test]
fn test_many_allocations_grow_and_stay_consistent() {
    // allocate more lists than one page holds so the pool grows, keep them
    // alive in one big list, then drop the lot
    let mut vm = vm();
    let append = vm.symbols_mut().ensure_method_sym("append");

    let mut b = ProgramBuilder::new("t.sbl", "");
    let n = b.const_number(150.0);
    b.op(OpCode::List).u8(5).u8(0).u8(4); // holder
    b.op(OpCode::ConstI8).i8(0).u8(5);
    b.op(OpCode::ConstOp).u8(n).u8(6);
    let exit = b.new_label();
    let body = b.new_label();
    b.op(OpCode::ForRangeInit).u8(5).u8(6).u8(7).label_u16(exit);
    b.bind(body);
    b.op(OpCode::List).u8(10).u8(0).u8(14); // arg: fresh list
    b.op(OpCode::CopyRetainSrc).u8(4).u8(13); // receiver
    b.op(OpCode::CallObjSym).u8(9).u8(1).u8(0).u16(append as u16).u16(0).u32(0);
    b.op(OpCode::ForRange).u8(7).u8(6).label_back_u16(body);
    b.bind(exit);
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(0xFF);
    vm.eval(b.finish()).unwrap();

    let stats = vm.heap.stats();
    assert!(stats.pages >= 2, "pool should have grown");
    assert_eq!(stats.live_objects, 0);
    assert_eq!(stats.global_rc, 0);
    assert!(vm.heap.verify_pages());
}
