//! `Proc` and `Fiber`.

use garnet_bytecode::{ArgSpec, InstContainer, OpCode};

use crate::class::Method;
use crate::error::VmResult;
use crate::gc::ObjRef;
use crate::value::Value;
use crate::vm::Vm;

pub(super) fn init(vm: &mut Vm) -> VmResult<()> {
    let proc = vm.core.proc;
    // `call` re-enters the interpreter through a one-instruction body that
    // swaps its own frame for the receiver's
    let stub = vm.new_proc(vm.call_irep.clone(), None, None, proc, true);
    for name in ["call", "[]", "yield", "==="] {
        let name = vm.intern(name);
        vm.add_method(proc, name, Method::Proc(stub));
    }
    vm.define_method(proc, "lambda?", |vm, this, _| {
        let r = vm.expect_proc(this)?;
        Ok(vm.is_strict(r).into())
    })?;
    vm.define_method(proc, "arity", |vm, this, _| {
        let r = vm.expect_proc(this)?;
        Ok(Value::Integer(arity(vm, r)))
    })?;

    let fiber = vm.core.fiber;
    let meta = vm.singleton_class(Value::Object(fiber))?;
    vm.define_method(meta, "new", |vm, _, args| match args.block() {
        Some(block) => vm.new_fiber(block),
        None => Err(vm.argument_error("tried to create Proc object without a block")),
    })?;
    vm.define_method(meta, "yield", |vm, _, args| vm.yield_fiber(args))?;
    vm.define_method(fiber, "resume", |vm, this, args| vm.resume(this, args.positional()))?;
    vm.define_method(fiber, "alive?", |vm, this, _| {
        Ok(vm.fiber_state(this).map_or(false, |s| s.is_alive()).into())
    })?;
    Ok(())
}

/// Required argument count, negated and less one when more are accepted.
fn arity(vm: &Vm, proc: ObjRef) -> i64 {
    let irep = match vm.heap.get(proc).as_proc() {
        Some(p) => &p.irep,
        None => return 0,
    };
    let spec = match irep.fetch(0) {
        Some(inst) if inst.op == OpCode::Enter => ArgSpec(inst.operands.a),
        _ => return 0,
    };
    let required = (spec.req() + spec.post()) as i64;
    if spec.rest() || spec.opt() > 0 {
        -required - 1
    } else {
        required
    }
}
