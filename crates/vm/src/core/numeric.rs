//! `Integer` and `Float`.

use crate::args::Args;
use crate::error::VmResult;
use crate::value::Value;
use crate::vm::{fast_eq, format_float, int_neg, numeric_cmp, ArithOp, CmpOp, Vm};

const ARITH: [(&str, ArithOp); 5] = [
    ("+", ArithOp::Add),
    ("-", ArithOp::Sub),
    ("*", ArithOp::Mul),
    ("/", ArithOp::Div),
    ("%", ArithOp::Mod),
];

const CMP: [(&str, CmpOp); 4] = [
    ("<", CmpOp::Lt),
    ("<=", CmpOp::Le),
    (">", CmpOp::Gt),
    (">=", CmpOp::Ge),
];

pub(super) fn init(vm: &mut Vm) -> VmResult<()> {
    for class in [vm.core.integer, vm.core.float] {
        for (name, op) in ARITH {
            vm.define_method(class, name, move |vm, this, args| {
                vm.check_arity(args, 1, 1)?;
                let other = args.get(0);
                match vm.numeric_op(op, this, other)? {
                    Some(v) => Ok(v),
                    None => {
                        let msg = format!(
                            "{} can't be coerced into {}",
                            vm.type_name(other),
                            vm.type_name(this)
                        );
                        Err(vm.type_error(msg))
                    }
                }
            })?;
        }
        for (name, op) in CMP {
            vm.define_method(class, name, move |vm, this, args| {
                vm.check_arity(args, 1, 1)?;
                let other = args.get(0);
                match numeric_cmp(op, this, other) {
                    Some(b) => Ok(b.into()),
                    None => {
                        let msg = format!(
                            "comparison of {} with {} failed",
                            vm.type_name(this),
                            vm.type_name(other)
                        );
                        Err(vm.argument_error(msg))
                    }
                }
            })?;
        }
        vm.define_method(class, "==", |_, this, args| {
            Ok(fast_eq(this, args.get(0)).unwrap_or(false).into())
        })?;
        vm.define_method(class, "-@", |_, this, _| {
            Ok(match this {
                Value::Integer(i) => int_neg(i),
                Value::Float(f) => Value::Float(-f),
                v => v,
            })
        })?;
        vm.define_method(class, "to_f", |_, this, _| {
            Ok(this.as_float().map_or(Value::Nil, Value::Float))
        })?;
        vm.define_method(class, "to_i", to_i)?;
        vm.define_method(class, "to_s", |vm, this, _| {
            let s = vm.inspect(this);
            Ok(vm.new_string(s))
        })?;
        vm.define_method(class, "inspect", |vm, this, _| {
            let s = vm.inspect(this);
            Ok(vm.new_string(s))
        })?;
    }
    let float = vm.core.float;
    vm.define_method(float, "nan?", |_, this, _| {
        Ok(this.as_float().map_or(false, f64::is_nan).into())
    })?;
    let integer = vm.core.integer;
    vm.define_method(integer, "times", |vm, this, args| {
        let n = this.as_int().unwrap_or(0);
        let block = match args.block() {
            Some(b) => b,
            None => return Err(vm.local_jump_error("no block given (yield)")),
        };
        for i in 0..n {
            vm.call_proc(block, &[Value::Integer(i)])?;
        }
        Ok(this)
    })?;
    Ok(())
}

/// Truncate toward zero. Floats outside the integer range raise
/// `FloatDomainError`.
fn to_i(vm: &mut Vm, this: Value, _: &Args) -> VmResult<Value> {
    match this {
        Value::Float(f) => {
            let t = f.trunc();
            if f.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64 {
                Ok(Value::Integer(t as i64))
            } else {
                let class = vm.core.float_domain_error;
                Err(vm.raise_error(class, format_float(f)))
            }
        }
        v => Ok(v),
    }
}
