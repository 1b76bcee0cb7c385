//! `BasicObject`, `Kernel`, `Module` and `Class`.

use itertools::Itertools;

use crate::args::Args;
use crate::class::{object_id, ClassKind, Method};
use crate::error::{Error, VmResult};
use crate::gc::ObjRef;
use crate::object::{InstanceKind, ObjFlags, ObjectKind, RHash, RObject};
use crate::symbol::{sym, Symbol};
use crate::value::Value;
use crate::vm::Vm;

pub(super) fn init(vm: &mut Vm) -> VmResult<()> {
    let basic = vm.core.basic_object;
    vm.define_method(basic, "initialize", |_, _, _| Ok(Value::Nil))?;
    vm.define_method(basic, "==", |_, this, args| Ok((this == args.get(0)).into()))?;
    vm.define_method(basic, "equal?", |_, this, args| Ok((this == args.get(0)).into()))?;
    vm.define_method(basic, "!", |_, this, _| Ok(this.is_falsy().into()))?;
    vm.define_method(basic, "!=", |vm, this, args| {
        let eq = vm.call_with_args(this, sym::OP_EQ, &Args::new(vec![args.get(0)]))?;
        Ok(eq.is_falsy().into())
    })?;
    vm.define_method(basic, "__id__", |_, this, _| Ok(Value::Integer(identity(this))))?;
    vm.define_method(basic, "method_missing", |vm, this, args| {
        let name = vm.symbol_arg(args, 0)?;
        Err(vm.undefined_method(this, name))
    })?;
    vm.define_method(basic, "__send__", send)?;

    let kernel = vm.core.kernel;
    vm.define_method(kernel, "send", send)?;
    vm.define_method(kernel, "object_id", |_, this, _| Ok(Value::Integer(identity(this))))?;
    vm.define_method(kernel, "raise", raise)?;
    vm.define_method(kernel, "class", |vm, this, _| Ok(Value::Object(vm.real_class_of(this))))?;
    vm.define_method(kernel, "is_a?", is_a)?;
    vm.define_method(kernel, "kind_of?", is_a)?;
    vm.define_method(kernel, "respond_to?", |vm, this, args| {
        let name = vm.symbol_arg(args, 0)?;
        let class = vm.class_of(this);
        Ok(vm.find_method(class, name).is_some().into())
    })?;
    vm.define_method(kernel, "nil?", |_, this, _| Ok(this.is_nil().into()))?;
    vm.define_method(kernel, "freeze", |vm, this, _| {
        vm.freeze(this);
        Ok(this)
    })?;
    vm.define_method(kernel, "frozen?", |vm, this, _| Ok(vm.is_frozen(this).into()))?;
    vm.define_method(kernel, "singleton_class", |vm, this, _| {
        Ok(Value::Object(vm.singleton_class(this)?))
    })?;
    vm.define_method(kernel, "lambda", |vm, _, args| {
        let block = block_arg(vm, args)?;
        Ok(Value::Object(vm.strict_copy(block)))
    })?;
    vm.define_method(kernel, "proc", |vm, _, args| Ok(Value::Object(block_arg(vm, args)?)))?;
    vm.define_method(kernel, "inspect", |vm, this, _| {
        let s = vm.inspect(this);
        Ok(vm.new_string(s))
    })?;
    vm.define_method(kernel, "to_s", |vm, this, _| {
        let s = match this {
            Value::Object(r) => format!("#<{}:{:#x}>", vm.type_name(this), object_id(r)),
            _ => vm.inspect(this),
        };
        Ok(vm.new_string(s))
    })?;
    vm.define_method(kernel, "===", |vm, this, args| {
        let eq = vm.call_with_args(this, sym::OP_EQ, &Args::new(vec![args.get(0)]))?;
        Ok(eq.is_truthy().into())
    })?;
    vm.define_method(kernel, "instance_variable_get", |vm, this, args| {
        let name = vm.symbol_arg(args, 0)?;
        Ok(vm.ivar_get(this, name))
    })?;
    vm.define_method(kernel, "instance_variable_set", |vm, this, args| {
        let name = vm.symbol_arg(args, 0)?;
        vm.ivar_set(this, name, args.get(1))?;
        Ok(args.get(1))
    })?;
    vm.define_method(kernel, "block_given?", |vm, _, _| Ok((!vm.caller_block().is_nil()).into()))?;
    let nil = vm.core.nil;
    vm.define_method(nil, "nil?", |_, _, _| Ok(Value::True))?;
    vm.define_method(nil, "to_s", |vm, _, _| Ok(vm.new_string("")))?;

    init_module(vm)?;
    init_class(vm)
}

/// Stable integer identity; equal for equal immediates.
fn identity(v: Value) -> i64 {
    match v {
        Value::False => 0,
        Value::Nil => 8,
        Value::True => 20,
        Value::Integer(i) => i.wrapping_mul(2).wrapping_add(1),
        Value::Float(f) => f.to_bits() as i64 & !3 | 2,
        Value::Symbol(s) => (s.id() as i64) << 8 | 12,
        Value::Object(r) => (object_id(r) << 3) as i64,
    }
}

fn send(vm: &mut Vm, this: Value, args: &Args) -> VmResult<Value> {
    vm.check_arity(args, 1, usize::MAX)?;
    let name = vm.symbol_arg(args, 0)?;
    let forwarded = Args {
        positional: args.rest(1).to_vec(),
        keywords: args.keywords.clone(),
        block: args.block,
    };
    vm.call_with_args(this, name, &forwarded)
}

/// `raise`, `raise "msg"`, `raise Class`, `raise Class, "msg"`,
/// `raise exc`.
fn raise(vm: &mut Vm, _: Value, args: &Args) -> VmResult<Value> {
    vm.check_arity(args, 0, 2)?;
    let exc = match (args.get(0), args.len()) {
        (_, 0) => return Err(vm.runtime_error("unhandled exception")),
        (v, 1) if vm.string_bytes(v).is_some() => {
            let class = vm.core.runtime_error;
            let exc = vm.new_exception(class, v);
            return Err(raised(vm, exc));
        }
        (v, _) => {
            let rest = args.rest(1).to_vec();
            match v {
                Value::Object(r) if vm.heap.get(r).as_class().is_some() => {
                    vm.call_with_args(v, sym::EXCEPTION, &Args::new(rest))?
                }
                Value::Object(r) if vm.heap.get(r).as_exception().is_some() => {
                    if rest.is_empty() {
                        v
                    } else {
                        vm.call_with_args(v, sym::EXCEPTION, &Args::new(rest))?
                    }
                }
                _ => return Err(vm.type_error("exception class/object expected")),
            }
        }
    };
    match exc {
        Value::Object(r) if vm.heap.get(r).as_exception().is_some() => Err(raised(vm, r)),
        _ => Err(vm.type_error("exception object expected")),
    }
}

fn raised(vm: &mut Vm, exc: ObjRef) -> Error {
    vm.fill_backtrace(exc);
    Error::Raise(exc)
}

fn is_a(vm: &mut Vm, this: Value, args: &Args) -> VmResult<Value> {
    let class = vm.expect_module(args.get(0))?;
    Ok(vm.is_kind_of(this, class).into())
}

fn block_arg(vm: &mut Vm, args: &Args) -> VmResult<ObjRef> {
    match args.block() {
        Some(b) => vm.expect_proc(b),
        None => Err(vm.argument_error("tried to create Proc object without a block")),
    }
}

impl Vm {
    /// A lambda sharing the code and captured scope of `proc`.
    pub(crate) fn strict_copy(&mut self, proc: ObjRef) -> ObjRef {
        if self.is_strict(proc) {
            return proc;
        }
        let p = self.heap.get(proc).as_proc().cloned().expect("expected a proc");
        let mut obj = RObject::new(self.core.proc, ObjectKind::Proc(p));
        obj.flags |= ObjFlags::STRICT;
        self.heap.alloc(obj)
    }

    /// Allocate an uninitialized instance of `class`.
    pub(crate) fn allocate(&mut self, class: ObjRef) -> VmResult<Value> {
        let (kind, instance_kind) = {
            let c = self.class_ref(class);
            (c.kind, c.instance_kind)
        };
        if kind == ClassKind::Singleton {
            return Err(self.type_error("can't create instance of singleton class"));
        }
        if kind == ClassKind::Module {
            let msg = format!("undefined method 'new' for module {}", self.class_name(class));
            return Err(self.no_method_error(msg, Value::Object(class), sym::NEW));
        }
        let kind = match instance_kind {
            InstanceKind::Object => ObjectKind::Object,
            InstanceKind::String => ObjectKind::String(vec![]),
            InstanceKind::Array => ObjectKind::Array(vec![]),
            InstanceKind::Hash => ObjectKind::Hash(RHash::new()),
            InstanceKind::Exception => ObjectKind::Exception(Default::default()),
            InstanceKind::Special => {
                let msg = format!("allocator undefined for {}", self.class_name(class));
                return Err(self.type_error(msg));
            }
        };
        Ok(Value::Object(self.heap.alloc(RObject::new(class, kind))))
    }
}

fn module_of(vm: &mut Vm, this: Value) -> VmResult<ObjRef> {
    vm.expect_module(this)
}

fn symbols(vm: &mut Vm, args: &Args) -> VmResult<Vec<Symbol>> {
    (0..args.len()).map(|i| vm.symbol_arg(args, i)).collect()
}

fn init_module(vm: &mut Vm) -> VmResult<()> {
    let module = vm.core.module;
    vm.define_method(module, "include", |vm, this, args| {
        vm.check_arity(args, 1, usize::MAX)?;
        let class = module_of(vm, this)?;
        // the last argument ends up first in the ancestors
        for &m in args.positional().iter().rev() {
            let m = vm.expect_module(m)?;
            vm.include_module(class, m)?;
        }
        Ok(this)
    })?;
    vm.define_method(module, "include?", |vm, this, args| {
        let class = module_of(vm, this)?;
        let m = vm.expect_module(args.get(0))?;
        let found = m != class && vm.is_module(Value::Object(m)) && vm.ancestors(class).contains(&m);
        Ok(found.into())
    })?;
    vm.define_method(module, "ancestors", |vm, this, _| {
        let class = module_of(vm, this)?;
        let items = vm
            .ancestors(class)
            .iter()
            .copied()
            .filter(|&c| vm.class_ref(c).kind != ClassKind::Singleton)
            .map(Value::Object)
            .collect_vec();
        Ok(vm.new_array(items))
    })?;
    vm.define_method(module, "name", |vm, this, _| {
        let class = module_of(vm, this)?;
        Ok(match vm.class_ref(class).name.clone() {
            Some(name) => vm.new_string(name.as_str()),
            None => Value::Nil,
        })
    })?;
    let to_s = |vm: &mut Vm, this: Value, _: &Args| -> VmResult<Value> {
        let class = module_of(vm, this)?;
        let name = vm.class_name(class);
        Ok(vm.new_string(name))
    };
    vm.define_method(module, "to_s", to_s)?;
    vm.define_method(module, "inspect", to_s)?;
    vm.define_method(module, "===", |vm, this, args| {
        let class = module_of(vm, this)?;
        Ok(vm.is_kind_of(args.get(0), class).into())
    })?;
    vm.define_method(module, "remove_method", |vm, this, args| {
        let class = module_of(vm, this)?;
        for name in symbols(vm, args)? {
            vm.remove_method(class, name)?;
        }
        Ok(this)
    })?;
    vm.define_method(module, "undef_method", |vm, this, args| {
        let class = module_of(vm, this)?;
        for name in symbols(vm, args)? {
            vm.undef_method(class, name)?;
        }
        Ok(this)
    })?;
    vm.define_method(module, "alias_method", |vm, this, args| {
        vm.check_arity(args, 2, 2)?;
        let class = module_of(vm, this)?;
        let (new, old) = (vm.symbol_arg(args, 0)?, vm.symbol_arg(args, 1)?);
        vm.alias_method(class, new, old)?;
        Ok(Value::Symbol(new))
    })?;
    vm.define_method(module, "define_method", |vm, this, args| {
        vm.check_arity(args, 1, 2)?;
        let class = module_of(vm, this)?;
        let name = vm.symbol_arg(args, 0)?;
        let body = match (args.get(1), args.block()) {
            (Value::Nil, Some(b)) => b,
            (Value::Nil, None) => return Err(vm.argument_error("tried to create Proc object without a block")),
            (p, _) => p,
        };
        let body = vm.expect_proc(body)?;
        let body = vm.strict_copy(body);
        vm.set_method(class, name, Method::Proc(body))?;
        Ok(Value::Symbol(name))
    })?;
    vm.define_method(module, "const_get", |vm, this, args| {
        let class = module_of(vm, this)?;
        let name = vm.symbol_arg(args, 0)?;
        match vm.const_in_ancestors(class, name) {
            Some(v) => Ok(v),
            None => {
                let msg = format!("uninitialized constant {}", vm.symbol_name(name));
                Err(vm.name_error(msg, name))
            }
        }
    })?;
    vm.define_method(module, "const_set", |vm, this, args| {
        let class = module_of(vm, this)?;
        let name = vm.symbol_arg(args, 0)?;
        vm.set_const(class, name, args.get(1))?;
        Ok(args.get(1))
    })?;
    vm.define_method(module, "attr_reader", |vm, this, args| attr(vm, this, args, true, false))?;
    vm.define_method(module, "attr_writer", |vm, this, args| attr(vm, this, args, false, true))?;
    vm.define_method(module, "attr_accessor", |vm, this, args| attr(vm, this, args, true, true))?;
    Ok(())
}

/// Define ivar accessors for each named attribute.
fn attr(vm: &mut Vm, this: Value, args: &Args, reader: bool, writer: bool) -> VmResult<Value> {
    let class = module_of(vm, this)?;
    let mut defined = vec![];
    for name in symbols(vm, args)? {
        let attr = vm.symbol_name(name).to_owned();
        let ivar = vm.intern(&format!("@{}", attr));
        if reader {
            vm.define_method(class, &attr, move |vm, this, _| Ok(vm.ivar_get(this, ivar)))?;
            defined.push(Value::Symbol(name));
        }
        if writer {
            let setter = format!("{}=", attr);
            vm.define_method(class, &setter, move |vm, this, args| {
                vm.check_arity(args, 1, 1)?;
                vm.ivar_set(this, ivar, args.get(0))?;
                Ok(args.get(0))
            })?;
            defined.push(Value::Symbol(vm.intern(&setter)));
        }
    }
    Ok(vm.new_array(defined))
}

fn init_class(vm: &mut Vm) -> VmResult<()> {
    let class = vm.core.class;
    vm.define_method(class, "new", |vm, this, args| {
        let c = module_of(vm, this)?;
        if c == vm.core.class {
            return new_class(vm, args);
        }
        let obj = vm.allocate(c)?;
        vm.protect(obj);
        vm.call_with_args(obj, sym::INITIALIZE, args)?;
        Ok(obj)
    })?;
    vm.define_method(class, "allocate", |vm, this, _| {
        let c = module_of(vm, this)?;
        vm.allocate(c)
    })?;
    vm.define_method(class, "superclass", |vm, this, _| {
        let mut c = module_of(vm, this)?;
        loop {
            match vm.class_ref(c).superclass {
                Some(s) if vm.class_ref(s).kind == ClassKind::Singleton => c = s,
                Some(s) => return Ok(Value::Object(s)),
                None => return Ok(Value::Nil),
            }
        }
    })?;
    Ok(())
}

/// `Class.new(superclass = Object)`: an anonymous class.
fn new_class(vm: &mut Vm, args: &Args) -> VmResult<Value> {
    vm.check_arity(args, 0, 1)?;
    let superclass = match args.get(0) {
        Value::Nil => vm.core.object,
        v => vm.expect_module(v)?,
    };
    let (kind, instance_kind) = {
        let s = vm.class_ref(superclass);
        (s.kind, s.instance_kind)
    };
    if kind != ClassKind::Class {
        return Err(vm.type_error("superclass must be a Class"));
    }
    let class = vm.alloc_class(ClassKind::Class, Some(superclass), instance_kind);
    vm.singleton_class(Value::Object(class))?;
    if let Some(body) = args.block() {
        let body = vm.expect_proc(body)?;
        vm.protect(Value::Object(class));
        let args = Args::new(vec![Value::Object(class)]);
        vm.call_with_args(Value::Object(body), sym::CALL, &args)?;
    }
    Ok(Value::Object(class))
}
