//! Fiber integration tests: coinit/coresume/coyield/coreturn round trips
//! and teardown of suspended fibers

use sable_bytecode::{OpCode, ProgramBuilder};
use sable_core::value::Value;
use sable_core::vm::{Vm, VmOptions};
use sable_core::VmError;

fn vm() -> Vm {
    Vm::new(VmOptions::default())
}

#[test]
fn test_fiber_yield_then_return() {
    // f = coinit g(); coresume f; coresume f
    // g yields once, then returns 99
    let mut b = ProgramBuilder::new("t.sbl", "");
    let after_body = b.new_label();
    b.op(OpCode::Coinit).u8(0).u8(0).label_u16(after_body).u8(32).u8(4);
    // body
    b.op(OpCode::Coyield).u8(0).u8(0);
    b.op(OpCode::ConstI8).i8(99).u8(1); // result slot of the fiber root frame
    b.op(OpCode::Coreturn);
    b.bind(after_body);
    b.op(OpCode::Coresume).u8(4).u8(5); // runs to the yield; l5 = none
    b.op(OpCode::Coresume).u8(4).u8(6); // runs to the return; l6 = 99
    b.op(OpCode::Coresume).u8(4).u8(7); // dead fiber; l7 = none
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(6);
    let mut vm = vm();
    assert_eq!(vm.eval(b.finish()).unwrap(), Value::number(99.0));
    assert_eq!(vm.heap.global_rc, 0);
    assert_eq!(vm.heap.stats().live_objects, 0);
}

#[test]
fn test_first_resume_observes_none_from_yield() {
    let mut b = ProgramBuilder::new("t.sbl", "");
    let after_body = b.new_label();
    b.op(OpCode::Coinit).u8(0).u8(0).label_u16(after_body).u8(32).u8(4);
    b.op(OpCode::Coyield).u8(0).u8(0);
    b.op(OpCode::None).u8(1);
    b.op(OpCode::Coreturn);
    b.bind(after_body);
    b.op(OpCode::ConstI8).i8(77).u8(5); // overwritten by the yield copy-back
    b.op(OpCode::Coresume).u8(4).u8(5);
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(5);
    let mut vm = vm();
    assert!(vm.eval(b.finish()).unwrap().is_none());
}

#[test]
fn test_coinit_passes_args() {
    // f = coinit g(21); g returns its arg * 2
    let mut b = ProgramBuilder::new("t.sbl", "");
    let after_body = b.new_label();
    b.op(OpCode::ConstI8).i8(21).u8(8);
    b.op(OpCode::Coinit).u8(8).u8(1).label_u16(after_body).u8(32).u8(4);
    // body: arg at fp[5] of the fiber's root frame
    b.op(OpCode::ConstI8).i8(2).u8(6);
    b.op(OpCode::Mul).u8(5).u8(6).u8(1);
    b.op(OpCode::Coreturn);
    b.bind(after_body);
    b.op(OpCode::Coresume).u8(4).u8(5);
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(5);
    let mut vm = vm();
    assert_eq!(vm.eval(b.finish()).unwrap(), Value::number(42.0));
    assert_eq!(vm.heap.global_rc, 0);
}

#[test]
fn test_fiber_released_while_suspended_frees_live_locals() {
    // the fiber owns a list across its yield; discarding the suspended
    // fiber must release exactly that local
    let mut vm = vm();
    let mut b = ProgramBuilder::new("t.sbl", "");
    let after_body = b.new_label();
    // a = [1]
    b.op(OpCode::ConstI8).i8(1).u8(8);
    b.op(OpCode::List).u8(8).u8(1).u8(9);
    b.op(OpCode::Coinit).u8(9).u8(1).label_u16(after_body).u8(32).u8(4);
    // body: list arg owned at fp[5]
    let yield_pc = b.pos();
    let dbg_idx = b.debug_len();
    b.debug_entry_full(0, sable_bytecode::NULL_ID, 0);
    b.op(OpCode::Coyield).u8(0).u8(0);
    b.op(OpCode::Release).u8(5);
    b.op(OpCode::None).u8(1);
    b.op(OpCode::Coreturn);
    // end-locals shadow for the yield site; interpreted, never executed
    let end_locals_pc = b.pos();
    b.op(OpCode::ReleaseN).u8(1).u8(5);
    b.bind(after_body);
    b.op(OpCode::Release).u8(9); // main's ref on the list
    b.op(OpCode::Coresume).u8(4).u8(10); // parks the fiber at the yield
    b.op(OpCode::Release).u8(4); // discard the suspended fiber
    b.op(OpCode::End).u8(0xFF);
    let _ = yield_pc;
    b.patch_end_locals(dbg_idx, end_locals_pc as u32);

    vm.eval(b.finish()).unwrap();
    // the fiber's pending stack released the list it still owned
    assert_eq!(vm.heap.global_rc, 0);
    assert_eq!(vm.heap.stats().live_objects, 0);
    assert!(vm.heap.verify_pages());
}

#[test]
fn test_fiber_released_before_first_resume_frees_args() {
    let mut vm = vm();
    let mut b = ProgramBuilder::new("t.sbl", "");
    let after_body = b.new_label();
    b.op(OpCode::ConstI8).i8(1).u8(8);
    b.op(OpCode::List).u8(8).u8(1).u8(9);
    b.op(OpCode::Coinit).u8(9).u8(1).label_u16(after_body).u8(16).u8(4);
    b.op(OpCode::Release).u8(5);
    b.op(OpCode::None).u8(1);
    b.op(OpCode::Coreturn);
    b.bind(after_body);
    b.op(OpCode::Release).u8(9);
    // never resumed: teardown releases only the initial args
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(0xFF);
    vm.eval(b.finish()).unwrap();
    assert_eq!(vm.heap.global_rc, 0);
    assert_eq!(vm.heap.stats().live_objects, 0);
}

#[test]
fn test_yield_on_main_fiber_panics() {
    let mut b = ProgramBuilder::new("t.sbl", "");
    b.op(OpCode::Coyield).u8(0).u8(0);
    b.op(OpCode::End).u8(0xFF);
    let mut vm = vm();
    assert!(matches!(vm.eval(b.finish()), Err(VmError::Panic(_))));
}

#[test]
fn test_resume_non_fiber_yields_none() {
    let mut b = ProgramBuilder::new("t.sbl", "");
    b.op(OpCode::ConstI8).i8(5).u8(4);
    b.op(OpCode::ConstI8).i8(1).u8(5);
    b.op(OpCode::Coresume).u8(4).u8(5);
    b.op(OpCode::End).u8(5);
    let mut vm = vm();
    assert!(vm.eval(b.finish()).unwrap().is_none());
}

#[test]
fn test_nested_fibers() {
    // outer fiber resumes an inner fiber, both yield values through
    // coreturn back up the parent chain
    let mut b = ProgramBuilder::new("t.sbl", "");
    let after_outer = b.new_label();
    b.op(OpCode::Coinit).u8(0).u8(0).label_u16(after_outer).u8(64).u8(4);
    {
        // outer body: spin up the inner fiber and resume it
        let after_inner = b.new_label();
        b.op(OpCode::Coinit).u8(0).u8(0).label_u16(after_inner).u8(32).u8(5);
        // inner body
        b.op(OpCode::ConstI8).i8(40).u8(1);
        b.op(OpCode::Coreturn);
        b.bind(after_inner);
        b.op(OpCode::Coresume).u8(5).u8(6);
        b.op(OpCode::Release).u8(5);
        b.op(OpCode::ConstI8).i8(2).u8(7);
        b.op(OpCode::Add).u8(6).u8(7).u8(1);
        b.op(OpCode::Coreturn);
    }
    b.bind(after_outer);
    b.op(OpCode::Coresume).u8(4).u8(5);
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(5);
    let mut vm = vm();
    assert_eq!(vm.eval(b.finish()).unwrap(), Value::number(42.0));
    assert_eq!(vm.heap.global_rc, 0);
}

#[test]
fn test_fiber_status_method() {
    let mut vm = vm();
    let status = vm.symbols_mut().ensure_method_sym("status");
    let mut b2 = ProgramBuilder::new("t.sbl", "");
    let after_body = b2.new_label();
    b2.op(OpCode::Coinit).u8(0).u8(0).label_u16(after_body).u8(16).u8(4);
    b2.op(OpCode::None).u8(1);
    b2.op(OpCode::Coreturn);
    b2.bind(after_body);
    b2.op(OpCode::Coresume).u8(4).u8(7);
    b2.op(OpCode::CopyRetainSrc).u8(4).u8(9);
    b2.op(OpCode::CallObjSym).u8(5).u8(0).u8(1).u16(status as u16).u16(0).u32(0);
    b2.op(OpCode::Release).u8(4);
    b2.op(OpCode::End).u8(5);
    let r = vm.eval(b2.finish()).unwrap();
    unsafe {
        assert_eq!(vm.string_bytes(r).unwrap(), b"done");
    }
    vm.release(r);
    assert_eq!(vm.heap.global_rc, 0);
}
