//! Dispatch loop benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sable_bytecode::{OpCode, Program, ProgramBuilder};
use sable_core::symbols::FuncSymbol;
use sable_core::vm::{Vm, VmOptions};

/// sum = 0; for i in 0..100_000 { sum += i }
fn range_sum_program() -> Program {
    let mut b = ProgramBuilder::new("bench.sbl", "");
    let n = b.const_number(100_000.0);
    b.op(OpCode::ConstI8).i8(0).u8(4);
    b.op(OpCode::ConstI8).i8(0).u8(5);
    b.op(OpCode::ConstOp).u8(n).u8(6);
    let exit = b.new_label();
    let body = b.new_label();
    b.op(OpCode::ForRangeInit).u8(5).u8(6).u8(7).label_u16(exit);
    b.bind(body);
    b.op(OpCode::Add).u8(4).u8(7).u8(4);
    b.op(OpCode::ForRange).u8(7).u8(6).label_back_u16(body);
    b.bind(exit);
    b.op(OpCode::End).u8(4);
    b.finish()
}

/// Recursive call benchmark: f(n) = n <= 0 ? 0 : f(n - 1), depth 5000
fn call_program(vm: &mut Vm) -> Program {
    let parent = vm.symbols_mut().ensure_name("bench");
    let sym = vm.symbols_mut().ensure_func_sym(parent, "f", 1);

    let mut b = ProgramBuilder::new("bench.sbl", "");
    let done = b.new_label();
    let func = b.new_label();
    let n = b.const_number(5000.0);
    b.op(OpCode::ConstOp).u8(n).u8(9);
    b.op(OpCode::CallSym).u8(5).u8(1).u8(1).u16(sym as u16).u32(0);
    b.op(OpCode::Jump).label_i16(done);

    b.bind(func);
    let func_pc = b.pos();
    let recurse = b.new_label();
    b.op(OpCode::ConstI8).i8(0).u8(5);
    b.op(OpCode::Greater).u8(4).u8(5).u8(6);
    b.op(OpCode::JumpCond).u8(6).label_i16(recurse);
    b.op(OpCode::ConstI8).i8(0).u8(0);
    b.op(OpCode::Ret1);
    b.bind(recurse);
    b.op(OpCode::ConstI8).i8(1).u8(5);
    b.op(OpCode::Sub).u8(4).u8(5).u8(10);
    b.op(OpCode::CallSym).u8(6).u8(1).u8(1).u16(sym as u16).u32(0);
    b.op(OpCode::Copy).u8(6).u8(0);
    b.op(OpCode::Ret1);

    b.bind(done);
    b.op(OpCode::Copy).u8(5).u8(4);
    b.op(OpCode::End).u8(4);

    vm.symbols_mut().func_syms[sym as usize] = FuncSymbol::Func {
        pc: func_pc as u32,
        num_params: 1,
        num_locals: 7,
    };
    b.finish()
}

fn bench_range_loop(c: &mut Criterion) {
    let program = range_sum_program();
    c.bench_function("range_sum_100k", |bench| {
        bench.iter(|| {
            let mut vm = Vm::new(VmOptions::default());
            black_box(vm.eval(program.clone()).unwrap())
        })
    });
}

fn bench_calls(c: &mut Criterion) {
    c.bench_function("recursive_calls_5k", |bench| {
        bench.iter(|| {
            let mut vm = Vm::new(VmOptions::default());
            let program = call_program(&mut vm);
            black_box(vm.eval(program).unwrap())
        })
    });
}

criterion_group!(benches, bench_range_loop, bench_calls);
criterion_main!(benches);
