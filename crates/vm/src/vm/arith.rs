//! Numeric semantics shared by the arithmetic instructions and the numeric
//! methods.
//!
//! Integer results that do not fit in 64 bits become floats. Integer division
//! and modulo round toward negative infinity.

use std::cmp::Ordering;

use crate::error::VmResult;
use crate::symbol::{sym, Symbol};
use crate::value::Value;
use crate::vm::Vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub fn method(self, vm: &mut Vm) -> Symbol {
        match self {
            ArithOp::Add => sym::OP_ADD,
            ArithOp::Sub => sym::OP_SUB,
            ArithOp::Mul => sym::OP_MUL,
            ArithOp::Div => sym::OP_DIV,
            ArithOp::Mod => vm.intern("%"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn method(self) -> Symbol {
        match self {
            CmpOp::Lt => sym::OP_LT,
            CmpOp::Le => sym::OP_LE,
            CmpOp::Gt => sym::OP_GT,
            CmpOp::Ge => sym::OP_GE,
        }
    }

    fn test(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

/// `None` on division by zero.
pub(crate) fn int_op(op: ArithOp, x: i64, y: i64) -> Option<Value> {
    let promote = |f: fn(f64, f64) -> f64| Value::Float(f(x as f64, y as f64));
    let v = match op {
        ArithOp::Add => x
            .checked_add(y)
            .map_or_else(|| promote(|a, b| a + b), Value::Integer),
        ArithOp::Sub => x
            .checked_sub(y)
            .map_or_else(|| promote(|a, b| a - b), Value::Integer),
        ArithOp::Mul => x
            .checked_mul(y)
            .map_or_else(|| promote(|a, b| a * b), Value::Integer),
        ArithOp::Div => {
            if y == 0 {
                return None;
            }
            match x.checked_div(y) {
                // i64::MIN / -1
                None => promote(|a, b| a / b),
                Some(q) if x % y != 0 && (x < 0) != (y < 0) => Value::Integer(q - 1),
                Some(q) => Value::Integer(q),
            }
        }
        ArithOp::Mod => {
            if y == 0 {
                return None;
            }
            let r = x.checked_rem(y).unwrap_or(0);
            if r != 0 && (r < 0) != (y < 0) {
                Value::Integer(r + y)
            } else {
                Value::Integer(r)
            }
        }
    };
    Some(v)
}

pub(crate) fn float_op(op: ArithOp, x: f64, y: f64) -> f64 {
    match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Mod => {
            let r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) {
                r + y
            } else {
                r
            }
        }
    }
}

pub(crate) fn int_neg(x: i64) -> Value {
    x.checked_neg()
        .map_or_else(|| Value::Float(-(x as f64)), Value::Integer)
}

/// Compare two numerics. `None` unless both operands are numeric; NaN
/// compares false.
pub(crate) fn numeric_cmp(op: CmpOp, a: Value, b: Value) -> Option<bool> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(op.test(x.cmp(&y))),
        _ if a.is_numeric() && b.is_numeric() => {
            let (x, y) = (a.as_float()?, b.as_float()?);
            Some(x.partial_cmp(&y).map_or(false, |o| op.test(o)))
        }
        _ => None,
    }
}

/// `==` between values whose equality needs no method call.
pub(crate) fn fast_eq(a: Value, b: Value) -> Option<bool> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x == y),
        _ if a.is_numeric() && b.is_numeric() => Some(a.as_float() == b.as_float()),
        (Value::Object(_), _) | (_, Value::Object(_)) => None,
        _ => Some(a == b),
    }
}

impl Vm {
    /// Arithmetic on two numerics. `Ok(None)` when either operand is not a
    /// number and the operation needs a method call.
    pub(crate) fn numeric_op(&mut self, op: ArithOp, a: Value, b: Value) -> VmResult<Option<Value>> {
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => match int_op(op, x, y) {
                Some(v) => Ok(Some(v)),
                None => Err(self.zero_div_error()),
            },
            _ if a.is_numeric() && b.is_numeric() => {
                let x = a.as_float().unwrap_or_default();
                let y = b.as_float().unwrap_or_default();
                Ok(Some(Value::Float(float_op(op, x, y))))
            }
            _ => Ok(None),
        }
    }
}
