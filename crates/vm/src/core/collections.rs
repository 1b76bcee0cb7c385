//! `String`, `Symbol`, `Array`, `Hash` and `Range`.

use crate::args::Args;
use crate::error::VmResult;
use crate::symbol::sym;
use crate::value::Value;
use crate::vm::{fast_eq, Vm};

pub(super) fn init(vm: &mut Vm) -> VmResult<()> {
    init_string(vm)?;
    init_array(vm)?;
    init_hash(vm)?;
    init_range(vm)
}

/// `a == b` with the shortcuts the `EQ` instruction takes.
fn values_equal(vm: &mut Vm, a: Value, b: Value) -> VmResult<bool> {
    if let Some(eq) = fast_eq(a, b) {
        return Ok(eq);
    }
    if a == b {
        return Ok(true);
    }
    if let (Some(x), Some(y)) = (vm.string_bytes(a), vm.string_bytes(b)) {
        return Ok(x == y);
    }
    let eq = vm.call_with_args(a, sym::OP_EQ, &Args::new(vec![b]))?;
    Ok(eq.is_truthy())
}

fn block_of(vm: &mut Vm, args: &Args) -> VmResult<Value> {
    match args.block() {
        Some(b) => Ok(b),
        None => Err(vm.local_jump_error("no block given (yield)")),
    }
}

fn init_string(vm: &mut Vm) -> VmResult<()> {
    let string = vm.core.string;
    vm.define_method(string, "+", |vm, this, args| {
        vm.check_arity(args, 1, 1)?;
        let other = args.get(0);
        let mut bytes = vm.string_bytes(this).unwrap_or_default().to_vec();
        match vm.string_bytes(other) {
            Some(b) => bytes.extend_from_slice(b),
            None => {
                let msg = format!("no implicit conversion of {} into String", vm.type_name(other));
                return Err(vm.type_error(msg));
            }
        }
        Ok(vm.new_string(bytes))
    })?;
    vm.define_method(string, "==", |vm, this, args| {
        let eq = match (vm.string_bytes(this), vm.string_bytes(args.get(0))) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        Ok(eq.into())
    })?;
    let length = |vm: &mut Vm, this: Value, _: &Args| -> VmResult<Value> {
        let s = vm.string_lossy(this).unwrap_or_default();
        Ok(Value::Integer(s.chars().count() as i64))
    };
    vm.define_method(string, "length", length)?;
    vm.define_method(string, "size", length)?;
    vm.define_method(string, "to_sym", |vm, this, _| {
        let s = vm.string_bytes(this).unwrap_or_default().to_vec();
        Ok(Value::Symbol(vm.intern_bytes(&s)))
    })?;
    vm.define_method(string, "to_s", |_, this, _| Ok(this))?;
    vm.define_method(string, "inspect", |vm, this, _| {
        let s = vm.inspect(this);
        Ok(vm.new_string(s))
    })?;

    let symbol = vm.core.symbol;
    vm.define_method(symbol, "to_s", |vm, this, _| {
        let name = this.as_symbol().map(|s| vm.symbol_bytes(s).to_vec());
        Ok(vm.new_string(name.unwrap_or_default()))
    })?;
    vm.define_method(symbol, "to_sym", |_, this, _| Ok(this))?;
    vm.define_method(symbol, "inspect", |vm, this, _| {
        let s = vm.inspect(this);
        Ok(vm.new_string(s))
    })?;
    Ok(())
}

fn init_array(vm: &mut Vm) -> VmResult<()> {
    let array = vm.core.array;
    vm.define_method(array, "[]", |vm, this, args| {
        vm.check_arity(args, 1, 2)?;
        let start = vm.int_arg(args, 0)?;
        if args.len() == 1 {
            return Ok(vm.array_index(this, start).unwrap_or(Value::Nil));
        }
        let count = vm.int_arg(args, 1)?;
        let items = vm.array_items(this).unwrap_or_default();
        let len = items.len() as i64;
        let start = if start < 0 { start + len } else { start };
        if start < 0 || start > len || count < 0 {
            return Ok(Value::Nil);
        }
        let end = start.saturating_add(count).min(len);
        let slice = items[start as usize..end as usize].to_vec();
        Ok(vm.new_array(slice))
    })?;
    vm.define_method(array, "[]=", |vm, this, args| {
        vm.check_arity(args, 2, 2)?;
        let idx = vm.int_arg(args, 0)?;
        vm.array_store(this, idx, args.get(1))?;
        Ok(args.get(1))
    })?;
    vm.define_method(array, "push", |vm, this, args| {
        for &v in args.positional() {
            vm.array_push(this, v)?;
        }
        Ok(this)
    })?;
    vm.define_method(array, "<<", |vm, this, args| {
        vm.check_arity(args, 1, 1)?;
        vm.array_push(this, args.get(0))?;
        Ok(this)
    })?;
    vm.define_method(array, "pop", |vm, this, _| {
        vm.check_frozen(this)?;
        let popped = this
            .as_object()
            .and_then(|r| vm.heap.get_mut(r).as_array_mut())
            .and_then(Vec::pop);
        Ok(popped.unwrap_or(Value::Nil))
    })?;
    let length = |vm: &mut Vm, this: Value, _: &Args| -> VmResult<Value> {
        let n = vm.array_items(this).map_or(0, <[Value]>::len);
        Ok(Value::Integer(n as i64))
    };
    vm.define_method(array, "length", length)?;
    vm.define_method(array, "size", length)?;
    vm.define_method(array, "first", |vm, this, _| Ok(vm.array_index(this, 0).unwrap_or(Value::Nil)))?;
    vm.define_method(array, "last", |vm, this, _| Ok(vm.array_index(this, -1).unwrap_or(Value::Nil)))?;
    vm.define_method(array, "each", |vm, this, args| {
        let block = block_of(vm, args)?;
        // the block may grow or shrink the array
        let mut i = 0;
        while let Some(v) = vm.array_index(this, i) {
            vm.call_proc(block, &[v])?;
            i += 1;
        }
        Ok(this)
    })?;
    vm.define_method(array, "==", |vm, this, args| {
        let other = args.get(0);
        let (a, b) = match (vm.array_items(this), vm.array_items(other)) {
            (Some(a), Some(b)) if a.len() == b.len() => (a.to_vec(), b.to_vec()),
            _ => return Ok(Value::False),
        };
        for (x, y) in a.into_iter().zip(b) {
            if !values_equal(vm, x, y)? {
                return Ok(Value::False);
            }
        }
        Ok(Value::True)
    })?;
    Ok(())
}

fn init_hash(vm: &mut Vm) -> VmResult<()> {
    let hash = vm.core.hash;
    vm.define_method(hash, "[]", |vm, this, args| {
        vm.check_arity(args, 1, 1)?;
        Ok(vm.hash_get(this, args.get(0)).unwrap_or(Value::Nil))
    })?;
    vm.define_method(hash, "[]=", |vm, this, args| {
        vm.check_arity(args, 2, 2)?;
        vm.hash_set(this, args.get(0), args.get(1))?;
        Ok(args.get(1))
    })?;
    let length = |vm: &mut Vm, this: Value, _: &Args| -> VmResult<Value> {
        let n = this
            .as_object()
            .and_then(|r| vm.heap.get(r).as_hash())
            .map_or(0, |h| h.len());
        Ok(Value::Integer(n as i64))
    };
    vm.define_method(hash, "length", length)?;
    vm.define_method(hash, "size", length)?;
    vm.define_method(hash, "key?", |vm, this, args| {
        vm.check_arity(args, 1, 1)?;
        Ok(vm.hash_get(this, args.get(0)).is_some().into())
    })?;
    vm.define_method(hash, "delete", |vm, this, args| {
        vm.check_arity(args, 1, 1)?;
        Ok(vm.hash_delete(this, args.get(0))?.unwrap_or(Value::Nil))
    })?;
    vm.define_method(hash, "each", |vm, this, args| {
        let block = block_of(vm, args)?;
        for (k, v) in vm.hash_pairs(this).unwrap_or_default() {
            let pair = vm.new_array(vec![k, v]);
            vm.call_proc(block, &[pair])?;
        }
        Ok(this)
    })?;
    vm.define_method(hash, "keys", |vm, this, _| {
        let keys = vm.hash_pairs(this).unwrap_or_default().into_iter().map(|(k, _)| k).collect();
        Ok(vm.new_array(keys))
    })?;
    vm.define_method(hash, "values", |vm, this, _| {
        let values = vm.hash_pairs(this).unwrap_or_default().into_iter().map(|(_, v)| v).collect();
        Ok(vm.new_array(values))
    })?;
    Ok(())
}

fn init_range(vm: &mut Vm) -> VmResult<()> {
    let range = vm.core.range;
    let begin = |vm: &mut Vm, this: Value, _: &Args| -> VmResult<Value> {
        Ok(vm.range_parts(this).map_or(Value::Nil, |r| r.begin))
    };
    let end = |vm: &mut Vm, this: Value, _: &Args| -> VmResult<Value> {
        Ok(vm.range_parts(this).map_or(Value::Nil, |r| r.end))
    };
    vm.define_method(range, "begin", begin)?;
    vm.define_method(range, "first", begin)?;
    vm.define_method(range, "end", end)?;
    vm.define_method(range, "last", end)?;
    vm.define_method(range, "exclude_end?", |vm, this, _| {
        Ok(vm.range_parts(this).map_or(false, |r| r.exclusive).into())
    })?;
    vm.define_method(range, "each", |vm, this, args| {
        let block = block_of(vm, args)?;
        for v in vm.splat(this) {
            vm.call_proc(block, &[v])?;
        }
        Ok(this)
    })?;
    Ok(())
}
