use std::sync::Arc;

use garnet_bytecode::{ArgSpec, CatchKind, Irep, IrepBuilder, OpCode};
use pretty_assertions::assert_eq;
use test_env_log::test;

use crate::config::VmConfig;
use crate::error::Error;
use crate::value::Value;
use crate::vm::Vm;

fn describe(vm: &Vm, r: Result<Value, Error>) -> String {
    match r {
        Ok(v) => vm.inspect(v),
        Err(e) => vm.describe_error(&e),
    }
}

fn run(vm: &mut Vm, irep: Arc<Irep>) -> String {
    let r = vm.run(irep);
    describe(vm, r)
}

/// `R1 op R2` at the top level.
fn binary(op: OpCode, x: i64, y: i64) -> Arc<Irep> {
    let mut b = IrepBuilder::new(1, 3);
    b.load_int(1, x);
    b.load_int(2, y);
    b.op_a(op, 1);
    b.op_a(OpCode::Return, 1);
    b.build()
}

#[test]
fn test_integer_arithmetic() {
    let mut vm = Vm::new();
    assert_eq!(run(&mut vm, binary(OpCode::Add, 2, 3)), "5");
    assert_eq!(run(&mut vm, binary(OpCode::Sub, 2, 300)), "-298");
    assert_eq!(run(&mut vm, binary(OpCode::Mul, -7, 6)), "-42");
    assert_eq!(run(&mut vm, binary(OpCode::Div, -7, 2)), "-4");
    assert_eq!(run(&mut vm, binary(OpCode::Lt, 1, 2)), "true");
    assert_eq!(run(&mut vm, binary(OpCode::Eq, 1, 2)), "false");
}

#[test]
fn test_overflow_promotes_to_float() {
    let mut vm = Vm::new();
    let r = vm.run(binary(OpCode::Add, i64::MAX, 1)).unwrap();
    assert_eq!(r, Value::Float(i64::MAX as f64 + 1.0));
    let r = vm.run(binary(OpCode::Mul, i64::MIN, -1)).unwrap();
    assert!(matches!(r, Value::Float(_)));
}

#[test]
fn test_division_by_zero() {
    let mut vm = Vm::new();
    assert_eq!(
        run(&mut vm, binary(OpCode::Div, 1, 0)),
        "ZeroDivisionError: divided by 0"
    );
    // the machine stays usable after an uncaught exception
    assert_eq!(run(&mut vm, binary(OpCode::Add, 1, 1)), "2");
}

#[test]
fn test_define_and_call_method() {
    let mut vm = Vm::new();
    let mut m = IrepBuilder::new(3, 5);
    m.enter(ArgSpec::required(1));
    m.op_ab(OpCode::Move, 3, 1);
    m.op_ab(OpCode::Move, 4, 1);
    m.op_a(OpCode::Add, 3);
    m.op_a(OpCode::Return, 3);

    let mut top = IrepBuilder::new(1, 4);
    top.op_a(OpCode::TClass, 1);
    top.def(1, "double", m.build());
    top.load_int(2, 21);
    top.ssend(1, "double", 1);
    top.op_a(OpCode::Return, 1);
    assert_eq!(run(&mut vm, top.build()), "42");

    let main = vm.main_object();
    assert_eq!(vm.funcall(main, "double", &[Value::Integer(4)]).unwrap(), Value::Integer(8));
    let r = vm.funcall(main, "double", &[]);
    assert_eq!(
        describe(&vm, r),
        "ArgumentError: wrong number of arguments (given 0, expected 1)"
    );
}

#[test]
fn test_unbounded_recursion() {
    let config = VmConfig::default().with_max_call_depth(64);
    let mut vm = Vm::with_config(config);
    let mut m = IrepBuilder::new(2, 3);
    m.enter(ArgSpec::required(0));
    m.ssend(2, "down", 0);
    m.op_a(OpCode::Return, 2);

    let mut top = IrepBuilder::new(1, 3);
    top.op_a(OpCode::TClass, 1);
    top.def(1, "down", m.build());
    top.ssend(1, "down", 0);
    top.op_a(OpCode::Return, 1);
    assert_eq!(
        run(&mut vm, top.build()),
        "SystemStackError: stack level too deep"
    );
    assert!(vm.ctx().frames.is_empty());
}

#[test]
fn test_undefined_method() {
    let mut vm = Vm::new();
    let mut top = IrepBuilder::new(1, 3);
    top.load_int(1, 5);
    top.send(1, "frobnicate", 0);
    top.op_a(OpCode::Return, 1);
    assert_eq!(
        run(&mut vm, top.build()),
        "NoMethodError: undefined method 'frobnicate' for an instance of Integer"
    );
}

/// `def descend(n)`: recurse down to zero and raise there, bumping `$count`
/// in an ensure clause at every level.
fn descend() -> Arc<Irep> {
    let mut m = IrepBuilder::new(3, 8);
    m.enter(ArgSpec::required(1));
    let recurse = m.label();
    let target = m.label();
    let begin = m.mark();
    m.op_ab(OpCode::Move, 3, 1);
    m.load_int(4, 0);
    m.op_a(OpCode::Eq, 3);
    m.jump(OpCode::JmpNot, Some(3), recurse);
    m.load_string(4, "boom");
    m.ssend(3, "raise", 1);
    m.bind(recurse);
    m.op_ab(OpCode::Move, 4, 1);
    m.op_ab(OpCode::SubI, 4, 1);
    m.ssend(3, "descend", 1);
    let end = m.mark();
    m.bind(target);
    m.op_a(OpCode::Except, 5);
    let count = m.sym("$count");
    m.op_ab(OpCode::GetGV, 6, count);
    m.op_ab(OpCode::AddI, 6, 1);
    m.op_ab(OpCode::SetGV, 6, count);
    m.op_a(OpCode::RaiseIf, 5);
    m.op_a(OpCode::LoadNil, 6);
    m.op_a(OpCode::Return, 6);
    m.catch(CatchKind::Ensure, begin, end, target);
    m.build()
}

#[test]
fn test_ensure_runs_once_per_level() {
    let mut rng = fastrand::Rng::with_seed(0xe75e);
    for _ in 0..16 {
        let n = rng.i64(0..40);
        let mut vm = Vm::new();
        vm.set_global("$count", Value::Integer(0));

        let mut top = IrepBuilder::new(1, 5);
        top.op_a(OpCode::TClass, 1);
        top.def(1, "descend", descend());
        let rescue = top.label();
        let begin = top.mark();
        top.load_int(2, n);
        top.ssend(1, "descend", 1);
        let end = top.mark();
        top.op_a(OpCode::Return, 1);
        top.bind(rescue);
        top.op_a(OpCode::Except, 1);
        let count = top.sym("$count");
        top.op_ab(OpCode::GetGV, 1, count);
        top.op_a(OpCode::Return, 1);
        top.catch(CatchKind::Rescue, begin, end, rescue);

        assert_eq!(vm.run(top.build()).unwrap(), Value::Integer(n + 1), "depth {}", n);
    }
}

#[test]
fn test_raise_in_ensure_replaces_exception() {
    let mut vm = Vm::new();
    let mut top = IrepBuilder::new(1, 4);
    let target = top.label();
    let begin = top.mark();
    top.load_string(2, "first");
    top.ssend(1, "raise", 1);
    let end = top.mark();
    top.bind(target);
    top.op_a(OpCode::Except, 3);
    top.load_string(2, "second");
    top.ssend(1, "raise", 1);
    top.op_a(OpCode::RaiseIf, 3);
    top.op_a(OpCode::Return, 1);
    top.catch(CatchKind::Ensure, begin, end, target);

    let err = vm.run(top.build()).unwrap_err();
    assert_eq!(vm.describe_error(&err), "RuntimeError: second");
    let exc = match err {
        Error::Raise(exc) => Value::Object(exc),
        e => panic!("unexpected {:?}", e),
    };
    let cause = vm.funcall(exc, "cause", &[]).unwrap();
    assert_eq!(vm.inspect(cause), "#<RuntimeError: first>");

    let backtrace = vm.funcall(exc, "backtrace", &[]).unwrap();
    let lines = vm.array_items(backtrace).unwrap().to_vec();
    assert_eq!(vm.string_lossy(lines[0]).as_deref(), Some("raise@native"));
    assert!(vm.string_lossy(lines[1]).unwrap().starts_with("<main>@"));
}

#[test]
fn test_break_out_of_each() {
    let mut vm = Vm::new();
    // { |x| break x if x == 20 }
    let mut blk = IrepBuilder::new(3, 5);
    blk.enter(ArgSpec::required(1));
    let skip = blk.label();
    blk.op_ab(OpCode::Move, 3, 1);
    blk.load_int(4, 20);
    blk.op_a(OpCode::Eq, 3);
    blk.jump(OpCode::JmpNot, Some(3), skip);
    blk.op_a(OpCode::Break, 1);
    blk.bind(skip);
    blk.op_a(OpCode::LoadNil, 3);
    blk.op_a(OpCode::Return, 3);

    let mut top = IrepBuilder::new(1, 4);
    top.load_int(1, 10);
    top.load_int(2, 20);
    top.load_int(3, 30);
    top.op_ab(OpCode::Array, 1, 3);
    let idx = top.child(blk.build());
    top.op_ab(OpCode::Block, 2, idx);
    top.send_block(1, "each", 0);
    top.op_a(OpCode::Return, 1);
    assert_eq!(run(&mut vm, top.build()), "20");
}

/// `def kw(x:) = x`, called with the given keyword pairs.
fn keyword_call(pairs: &[(&str, i64)]) -> Arc<Irep> {
    let mut m = IrepBuilder::new(3, 4);
    m.enter(ArgSpec::new(0, 0, false, 0, 1, false, false));
    let x = m.sym("x");
    m.op_ab(OpCode::KArg, 3, x);
    m.op(OpCode::KeyEnd);
    m.op_a(OpCode::Return, 3);

    let mut top = IrepBuilder::new(1, 2 + 2 * pairs.len() as u16 + 1);
    top.op_a(OpCode::TClass, 1);
    top.def(1, "kw", m.build());
    for (i, (key, value)) in pairs.iter().enumerate() {
        let reg = 2 + 2 * i as u32;
        top.load_sym(reg, key);
        top.load_int(reg + 1, *value);
    }
    top.ssend(1, "kw", (pairs.len() as u32) << 4);
    top.op_a(OpCode::Return, 1);
    top.build()
}

#[test]
fn test_keyword_arguments() {
    let mut vm = Vm::new();
    assert_eq!(run(&mut vm, keyword_call(&[("x", 7)])), "7");
    assert_eq!(
        run(&mut vm, keyword_call(&[])),
        "ArgumentError: missing keyword: x"
    );
    assert_eq!(
        run(&mut vm, keyword_call(&[("x", 1), ("y", 2)])),
        "ArgumentError: unknown keyword: :y"
    );
}

#[test]
fn test_string_literals_are_fresh() {
    let mut vm = Vm::new();
    let mut top = IrepBuilder::new(1, 4);
    top.load_string(1, "ab");
    top.load_string(2, "ab");
    top.op_ab(OpCode::Move, 3, 2);
    top.op_a(OpCode::StrCat, 2);
    top.op_ab(OpCode::Array, 1, 2);
    top.op_a(OpCode::Return, 1);
    assert_eq!(run(&mut vm, top.build()), r#"["ab", "abab"]"#);
}

/// `def down; send(:down); end`, called under `begin ... rescue => e; e; end`.
fn recurse_through_send() -> Arc<Irep> {
    let mut m = IrepBuilder::new(2, 5);
    m.enter(ArgSpec::required(0));
    m.load_sym(3, "down");
    m.ssend(2, "send", 1);
    m.op_a(OpCode::Return, 2);

    let mut top = IrepBuilder::new(1, 4);
    top.op_a(OpCode::TClass, 1);
    top.def(1, "down", m.build());
    let rescue = top.label();
    let begin = top.mark();
    top.ssend(1, "down", 0);
    let end = top.mark();
    top.op_a(OpCode::Return, 1);
    top.bind(rescue);
    top.op_a(OpCode::Except, 1);
    top.op_a(OpCode::Return, 1);
    top.catch(CatchKind::Rescue, begin, end, rescue);
    top.build()
}

#[test]
fn test_recursion_through_native_is_rescued() {
    let (out, native_depth, frames) = std::thread::Builder::new()
        .stack_size(2 << 20)
        .spawn(|| {
            let mut vm = Vm::new();
            let out = run(&mut vm, recurse_through_send());
            (out, vm.native_depth, vm.ctx().frames.len())
        })
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(out, "#<SystemStackError: stack level too deep>");
    assert_eq!(native_depth, 0);
    assert_eq!(frames, 0);
}

#[test]
fn test_native_depth_limit_is_configurable() {
    let mut vm = Vm::with_config(VmConfig::default().with_max_native_depth(4));
    assert_eq!(
        run(&mut vm, recurse_through_send()),
        "#<SystemStackError: stack level too deep>"
    );
    assert_eq!(vm.native_depth, 0);
    assert_eq!(run(&mut vm, binary(OpCode::Add, 1, 2)), "3");
}

#[test]
fn test_bytecode_rescues_stack_overflow() {
    let mut vm = Vm::new();
    let mut m = IrepBuilder::new(2, 3);
    m.enter(ArgSpec::required(0));
    m.ssend(2, "down", 0);
    m.op_a(OpCode::Return, 2);

    // begin; down; rescue => e; [e.message, SystemStackError === e]; end
    let mut top = IrepBuilder::new(1, 5);
    top.op_a(OpCode::TClass, 1);
    top.def(1, "down", m.build());
    let rescue = top.label();
    let begin = top.mark();
    top.ssend(1, "down", 0);
    let end = top.mark();
    top.op_a(OpCode::Return, 1);
    top.bind(rescue);
    top.op_a(OpCode::Except, 1);
    top.op_ab(OpCode::Move, 3, 1);
    top.send(3, "message", 0);
    let class = top.sym("SystemStackError");
    top.op_ab(OpCode::GetConst, 2, class);
    top.op_ab(OpCode::Rescue, 1, 2);
    top.op_ab(OpCode::Move, 1, 3);
    top.op_ab(OpCode::Array, 1, 2);
    top.op_a(OpCode::Return, 1);
    top.catch(CatchKind::Rescue, begin, end, rescue);

    assert_eq!(run(&mut vm, top.build()), r#"["stack level too deep", true]"#);
    assert!(vm.ctx().frames.is_empty());
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Level {
    Ensure,
    Rescue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Exit {
    Fallthrough,
    Raise,
    Return,
    JumpOut,
}

/// `def nested` wrapping an innermost exit in `levels` of begin blocks,
/// outermost first. Every ensure clause bumps `$count`.
fn nested_exits(levels: &[Level], exit: Exit) -> Arc<Irep> {
    let d = levels.len() as u32;
    let scratch = 2 + d;
    let mut m = IrepBuilder::new(2, (scratch + 4) as u16);
    m.enter(ArgSpec::required(0));
    let count = m.sym("$count");
    let out = m.label();
    let regions: Vec<_> = levels.iter().map(|_| (m.label(), m.label(), m.label())).collect();

    for &(begin, _, _) in &regions {
        m.bind(begin);
    }
    match exit {
        Exit::Fallthrough => {}
        Exit::Raise => {
            m.load_string(scratch + 2, "boom");
            m.ssend(scratch + 1, "raise", 1);
        }
        Exit::Return => {
            m.load_int(scratch + 1, 7);
            m.op_a(OpCode::Return, scratch + 1);
        }
        Exit::JumpOut => {
            m.jump(OpCode::JmpUw, None, out);
        }
    }
    for (i, (&level, &(_, end, target))) in levels.iter().zip(&regions).enumerate().rev() {
        let reg = 2 + i as u32;
        m.bind(end);
        match level {
            Level::Ensure => {
                m.bind(target);
                m.op_a(OpCode::Except, reg);
                m.op_ab(OpCode::GetGV, scratch, count);
                m.op_ab(OpCode::AddI, scratch, 1);
                m.op_ab(OpCode::SetGV, scratch, count);
                m.op_a(OpCode::RaiseIf, reg);
            }
            Level::Rescue => {
                let after = m.label();
                m.jump(OpCode::Jmp, None, after);
                m.bind(target);
                m.op_a(OpCode::Except, reg);
                m.bind(after);
            }
        }
    }
    m.load_int(scratch + 1, 0);
    m.op_a(OpCode::Return, scratch + 1);
    m.bind(out);
    m.load_int(scratch + 1, 9);
    m.op_a(OpCode::Return, scratch + 1);

    // outer regions first, so the innermost one is found first
    for (&level, &(begin, end, target)) in levels.iter().zip(&regions) {
        let kind = match level {
            Level::Ensure => CatchKind::Ensure,
            Level::Rescue => CatchKind::Rescue,
        };
        m.catch(kind, begin, end, target);
    }

    let mut top = IrepBuilder::new(1, 3);
    top.op_a(OpCode::TClass, 1);
    top.def(1, "nested", m.build());
    let rescue = top.label();
    let begin = top.mark();
    top.ssend(1, "nested", 0);
    let end = top.mark();
    top.op_a(OpCode::Return, 1);
    top.bind(rescue);
    top.load_int(1, -1);
    top.op_a(OpCode::Return, 1);
    top.catch(CatchKind::Rescue, begin, end, rescue);
    top.build()
}

#[test]
fn test_every_exit_runs_each_ensure_once() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    for _ in 0..64 {
        let levels: Vec<Level> = (0..rng.usize(1..6))
            .map(|_| if rng.bool() { Level::Ensure } else { Level::Rescue })
            .collect();
        let exit = [Exit::Fallthrough, Exit::Raise, Exit::Return, Exit::JumpOut][rng.usize(0..4)];
        let ensures = levels.iter().filter(|&&l| l == Level::Ensure).count() as i64;
        let expected = match exit {
            Exit::Fallthrough => 0,
            Exit::Raise if levels.contains(&Level::Rescue) => 0,
            Exit::Raise => -1,
            Exit::Return => 7,
            Exit::JumpOut => 9,
        };

        let mut vm = Vm::new();
        vm.set_global("$count", Value::Integer(0));
        let r = vm.run(nested_exits(&levels, exit)).unwrap();
        assert_eq!(r, Value::Integer(expected), "{:?} {:?}", levels, exit);
        assert_eq!(vm.get_global("$count"), Value::Integer(ensures), "{:?} {:?}", levels, exit);
    }
}

#[test]
fn test_break_through_ensure_in_block() {
    let mut vm = Vm::new();
    vm.set_global("$count", Value::Integer(0));
    // { |x| begin; break x * 10 if x == 2; ensure; $count += 1; end }
    let mut blk = IrepBuilder::new(3, 7);
    blk.enter(ArgSpec::required(1));
    let skip = blk.label();
    let target = blk.label();
    let begin = blk.mark();
    blk.op_ab(OpCode::Move, 3, 1);
    blk.load_int(4, 2);
    blk.op_a(OpCode::Eq, 3);
    blk.jump(OpCode::JmpNot, Some(3), skip);
    blk.op_ab(OpCode::Move, 3, 1);
    blk.load_int(4, 10);
    blk.op_a(OpCode::Mul, 3);
    blk.op_a(OpCode::Break, 3);
    blk.bind(skip);
    let end = blk.mark();
    blk.bind(target);
    blk.op_a(OpCode::Except, 5);
    let count = blk.sym("$count");
    blk.op_ab(OpCode::GetGV, 6, count);
    blk.op_ab(OpCode::AddI, 6, 1);
    blk.op_ab(OpCode::SetGV, 6, count);
    blk.op_a(OpCode::RaiseIf, 5);
    blk.op_a(OpCode::LoadNil, 3);
    blk.op_a(OpCode::Return, 3);
    blk.catch(CatchKind::Ensure, begin, end, target);

    let mut top = IrepBuilder::new(1, 4);
    top.load_int(1, 1);
    top.load_int(2, 2);
    top.load_int(3, 3);
    top.op_ab(OpCode::Array, 1, 3);
    let idx = top.child(blk.build());
    top.op_ab(OpCode::Block, 2, idx);
    top.send_block(1, "each", 0);
    top.op_a(OpCode::Return, 1);
    assert_eq!(run(&mut vm, top.build()), "20");
    assert_eq!(vm.get_global("$count"), Value::Integer(2));
}

#[test]
fn test_leaving_ensure_by_jump_forgets_its_exception() {
    let mut vm = Vm::new();
    // loop { begin; raise "first"; ensure; break; end }
    // begin; raise "second"; rescue => e; e.cause; end
    let mut top = IrepBuilder::new(1, 4);
    let target = top.label();
    let after = top.label();
    let rescue = top.label();
    let begin = top.mark();
    top.load_string(2, "first");
    top.ssend(1, "raise", 1);
    let end = top.mark();
    top.bind(target);
    top.op_a(OpCode::Except, 3);
    top.jump(OpCode::JmpUw, None, after);
    top.op_a(OpCode::RaiseIf, 3);
    top.bind(after);
    let begin2 = top.mark();
    top.load_string(2, "second");
    top.ssend(1, "raise", 1);
    let end2 = top.mark();
    top.op_a(OpCode::Return, 1);
    top.bind(rescue);
    top.op_a(OpCode::Except, 1);
    top.send(1, "cause", 0);
    top.op_a(OpCode::Return, 1);
    top.catch(CatchKind::Ensure, begin, end, target);
    top.catch(CatchKind::Rescue, begin2, end2, rescue);
    assert_eq!(run(&mut vm, top.build()), "nil");
}
