//! Fiber lifecycle and the bytecode dispatch loop, exercised end-to-end
//! through `Engine`'s public call/run API rather than by hand-driving
//! `Fiber` directly.

use wick_core::{Config, ErrNum, ObjRef, Type, Val};
use wick_runtime::{Code, CodeKind, Engine, Opcode, WordBuffer};

fn arithmetic_code(opcode: Opcode) -> Code {
    let mut words = WordBuffer::new();
    words.put_instr(opcode, 0, 0);
    words.put_instr(Opcode::Ret, 0, 1);
    Code {
        kind: CodeKind::Byte { words, labels: vec![] },
        consts: vec![],
        num_locals: 0,
        num_upvals: 0,
        num_fixed_params: 2,
        has_var_params: false,
        var_params_idx: None,
    }
}

fn run_binop(e: &mut Engine, opcode: Opcode, a: Val, b: Val) -> Val {
    let code_ref = e.alloc_code(arithmetic_code(opcode)).commit();
    let fun_ref = e.alloc_function(code_ref, vec![], None).commit();
    let fib_ref = e.alloc_fiber(fun_ref).commit();
    // slot 0 of a frame is reserved (v_size's leading `1`); real params
    // start at slot 1.
    e.push_value(fib_ref, Val::Udf).unwrap();
    e.push_value(fib_ref, a).unwrap();
    e.push_value(fib_ref, b).unwrap();
    e.call_byte(fib_ref, fun_ref, 0).unwrap();
    let result = e.run_fiber(fib_ref).unwrap();
    result[0]
}

#[test]
fn add_dispatches_through_the_interpreter_loop() {
    let mut e = Engine::new(Config::default());
    assert_eq!(run_binop(&mut e, Opcode::Add, Val::Int(2), Val::Int(3)), Val::Int(5));
}

#[test]
fn sub_mul_and_comparisons_dispatch_correctly() {
    let mut e = Engine::new(Config::default());
    assert_eq!(run_binop(&mut e, Opcode::Sub, Val::Int(10), Val::Int(4)), Val::Int(6));
    assert_eq!(run_binop(&mut e, Opcode::Mul, Val::Int(6), Val::Int(7)), Val::Int(42));
    assert_eq!(run_binop(&mut e, Opcode::Lt, Val::Int(1), Val::Int(2)), Val::Log(true));
    assert_eq!(run_binop(&mut e, Opcode::Ie, Val::Int(5), Val::Int(5)), Val::Log(true));
}

#[test]
fn div_by_zero_raises_an_error() {
    let mut e = Engine::new(Config::default());
    let code_ref = e.alloc_code(arithmetic_code(Opcode::Div)).commit();
    let fun_ref = e.alloc_function(code_ref, vec![], None).commit();
    let fib_ref = e.alloc_fiber(fun_ref).commit();
    e.push_value(fib_ref, Val::Udf).unwrap();
    e.push_value(fib_ref, Val::Int(1)).unwrap();
    e.push_value(fib_ref, Val::Int(0)).unwrap();
    e.call_byte(fib_ref, fun_ref, 0).unwrap();
    let err = e.run_fiber(fib_ref).unwrap_err();
    assert_eq!(err.num, ErrNum::Other);
}

#[test]
fn resuming_a_finished_fiber_is_rejected() {
    let mut e = Engine::new(Config::default());
    let entry = ObjRef::new(Type::Fun, 0, 0);
    let fib_ref = e.alloc_fiber(entry).commit();
    e.run_fiber(fib_ref).unwrap();
    let err = e.run_fiber(fib_ref).unwrap_err();
    assert_eq!(err.num, ErrNum::FibNotStopped);
}
