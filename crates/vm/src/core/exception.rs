//! The exception hierarchy, `Exception` methods and the constructors the VM
//! raises its own errors through.

use crate::args::Args;
use crate::error::{Error, VmResult};
use crate::gc::ObjRef;
use crate::object::{InstanceKind, ObjectKind, RException, RObject};
use crate::symbol::{sym, Symbol};
use crate::value::Value;
use crate::vm::Vm;

use super::class_with;

pub(super) fn init(vm: &mut Vm) -> VmResult<()> {
    let exception = class_with(vm, "Exception", None, InstanceKind::Exception)?;
    vm.core.exception = exception;
    let script = vm.define_class("ScriptError", Some(exception))?;
    vm.core.script_error = script;
    vm.core.not_implemented_error = vm.define_class("NotImplementedError", Some(script))?;
    let standard = vm.define_class("StandardError", Some(exception))?;
    vm.core.standard_error = standard;
    vm.core.argument_error = vm.define_class("ArgumentError", Some(standard))?;
    vm.core.local_jump_error = vm.define_class("LocalJumpError", Some(standard))?;
    let range = vm.define_class("RangeError", Some(standard))?;
    vm.core.range_error = range;
    vm.core.float_domain_error = vm.define_class("FloatDomainError", Some(range))?;
    let runtime = vm.define_class("RuntimeError", Some(standard))?;
    vm.core.runtime_error = runtime;
    vm.core.frozen_error = vm.define_class("FrozenError", Some(runtime))?;
    vm.core.type_error = vm.define_class("TypeError", Some(standard))?;
    let name = vm.define_class("NameError", Some(standard))?;
    vm.core.name_error = name;
    vm.core.no_method_error = vm.define_class("NoMethodError", Some(name))?;
    let index = vm.define_class("IndexError", Some(standard))?;
    vm.core.index_error = index;
    vm.core.key_error = vm.define_class("KeyError", Some(index))?;
    vm.core.zero_division_error = vm.define_class("ZeroDivisionError", Some(standard))?;
    vm.core.fiber_error = vm.define_class("FiberError", Some(standard))?;
    vm.core.system_stack_error = vm.define_class("SystemStackError", Some(exception))?;
    vm.core.no_memory_error = vm.define_class("NoMemoryError", Some(exception))?;

    let meta = vm.singleton_class(Value::Object(exception))?;
    vm.define_method(meta, "exception", |vm, this, args| {
        vm.call_with_args(this, sym::NEW, args)
    })?;
    vm.define_method(exception, "initialize", exc_initialize)?;
    vm.define_method(exception, "exception", exc_exception)?;
    vm.define_method(exception, "message", exc_message)?;
    vm.define_method(exception, "to_s", exc_message)?;
    vm.define_method(exception, "cause", |vm, this, _| {
        let cause = vm.exception_ref(this)?.cause;
        Ok(cause.map_or(Value::Nil, Value::Object))
    })?;
    vm.define_method(exception, "backtrace", |vm, this, _| {
        let bt = vm.exception_ref(this)?.backtrace.clone();
        Ok(match bt {
            Some(lines) => {
                let items = lines.into_iter().map(|l| vm.new_string(l)).collect();
                vm.new_array(items)
            }
            None => Value::Nil,
        })
    })?;
    vm.define_method(name, "name", |vm, this, _| {
        Ok(vm.exception_ref(this)?.name.map_or(Value::Nil, Value::Symbol))
    })?;
    let no_method = vm.core.no_method_error;
    vm.define_method(no_method, "receiver", |vm, this, _| {
        Ok(vm.exception_ref(this)?.receiver.unwrap_or(Value::Nil))
    })?;
    Ok(())
}

fn exc_initialize(vm: &mut Vm, this: Value, args: &Args) -> VmResult<Value> {
    vm.check_arity(args, 0, 1)?;
    let message = vm.message_value(args.get(0))?;
    vm.exception_mut(this)?.message = message;
    Ok(Value::Nil)
}

/// `exc.exception(msg)`: the receiver itself, or a copy with a new message.
fn exc_exception(vm: &mut Vm, this: Value, args: &Args) -> VmResult<Value> {
    vm.check_arity(args, 0, 1)?;
    let arg = args.get(0);
    if args.is_empty() || arg == this {
        return Ok(this);
    }
    let message = vm.message_value(arg)?;
    let r = vm.exception_obj(this)?;
    let (class, ivars, mut record) = {
        let obj = vm.heap.get(r);
        let record = obj.as_exception().cloned().unwrap_or_default();
        (obj.class, obj.ivars.clone(), record)
    };
    record.message = message;
    record.backtrace = None;
    let mut obj = RObject::new(class, ObjectKind::Exception(record));
    obj.ivars = ivars;
    Ok(Value::Object(vm.heap.alloc(obj)))
}

fn exc_message(vm: &mut Vm, this: Value, _: &Args) -> VmResult<Value> {
    let message = vm.exception_ref(this)?.message;
    if message.is_nil() {
        let name = vm.class_name(vm.real_class_of(this));
        return Ok(vm.new_string(name));
    }
    Ok(message)
}

impl Vm {
    fn exception_obj(&mut self, v: Value) -> VmResult<ObjRef> {
        match v {
            Value::Object(r) if self.heap.get(r).as_exception().is_some() => Ok(r),
            _ => {
                let msg = format!("{} is not an exception", self.inspect(v));
                Err(self.type_error(msg))
            }
        }
    }

    fn exception_ref(&mut self, v: Value) -> VmResult<&RException> {
        let r = self.exception_obj(v)?;
        Ok(self.heap.get(r).as_exception().expect("checked above"))
    }

    fn exception_mut(&mut self, v: Value) -> VmResult<&mut RException> {
        let r = self.exception_obj(v)?;
        Ok(self.heap.get_mut(r).as_exception_mut().expect("checked above"))
    }

    /// Messages are strings; anything else is converted with `to_s`.
    fn message_value(&mut self, v: Value) -> VmResult<Value> {
        if v.is_nil() || self.string_bytes(v).is_some() {
            return Ok(v);
        }
        let bytes = self.to_s_bytes(v)?;
        Ok(self.new_string(bytes))
    }

    /// Allocate an exception of `class` without running `initialize`.
    pub(crate) fn new_exception(&mut self, class: ObjRef, message: Value) -> ObjRef {
        let record = RException {
            message,
            ..Default::default()
        };
        self.heap
            .alloc(RObject::new(class, ObjectKind::Exception(record)))
    }

    /// An exception of `class`, ready to be raised from the current frame.
    pub fn raise_error(&mut self, class: ObjRef, msg: impl Into<String>) -> Error {
        let message = self.new_string(msg.into());
        let exc = self.new_exception(class, message);
        self.fill_backtrace(exc);
        Error::Raise(exc)
    }

    pub fn type_error(&mut self, msg: impl Into<String>) -> Error {
        self.raise_error(self.core.type_error, msg)
    }

    pub fn argument_error(&mut self, msg: impl Into<String>) -> Error {
        self.raise_error(self.core.argument_error, msg)
    }

    pub fn runtime_error(&mut self, msg: impl Into<String>) -> Error {
        self.raise_error(self.core.runtime_error, msg)
    }

    pub(crate) fn name_error(&mut self, msg: impl Into<String>, name: Symbol) -> Error {
        let e = self.raise_error(self.core.name_error, msg);
        self.annotate(&e, None, name);
        e
    }

    pub(crate) fn no_method_error(&mut self, msg: impl Into<String>, recv: Value, name: Symbol) -> Error {
        let e = self.raise_error(self.core.no_method_error, msg);
        self.annotate(&e, Some(recv), name);
        e
    }

    fn annotate(&mut self, e: &Error, recv: Option<Value>, name: Symbol) {
        if let Error::Raise(r) = e {
            if let Some(exc) = self.heap.get_mut(*r).as_exception_mut() {
                exc.receiver = recv;
                exc.name = Some(name);
            }
        }
    }

    pub(crate) fn frozen_error(&mut self, msg: impl Into<String>) -> Error {
        self.raise_error(self.core.frozen_error, msg)
    }

    pub(crate) fn zero_div_error(&mut self) -> Error {
        self.raise_error(self.core.zero_division_error, "divided by 0")
    }

    pub(crate) fn local_jump_error(&mut self, msg: impl Into<String>) -> Error {
        self.raise_error(self.core.local_jump_error, msg)
    }

    pub(crate) fn fiber_error(&mut self, msg: impl Into<String>) -> Error {
        self.raise_error(self.core.fiber_error, msg)
    }

    pub(crate) fn stack_error(&mut self) -> Error {
        self.raise_error(self.core.system_stack_error, "stack level too deep")
    }

    /// Class name of an exception, or `None` for other values.
    pub fn exception_class_name(&self, exc: ObjRef) -> Option<String> {
        self.heap.try_get(exc)?.as_exception()?;
        Some(self.class_name(self.real_class_of(Value::Object(exc))))
    }

    /// The message of an exception, the class name when it has none.
    pub fn exception_message(&self, exc: ObjRef) -> Option<String> {
        let e = self.heap.try_get(exc)?.as_exception()?;
        self.string_lossy(e.message)
            .or_else(|| self.exception_class_name(exc))
    }

    /// Where the exception was raised, innermost frame first.
    pub fn exception_backtrace(&self, exc: ObjRef) -> Vec<String> {
        self.heap
            .try_get(exc)
            .and_then(|o| o.as_exception())
            .and_then(|e| e.backtrace.clone())
            .unwrap_or_default()
    }

    /// One-line description of an error, `Class: message` for exceptions.
    pub fn describe_error(&self, e: &Error) -> String {
        match e {
            Error::Raise(exc) => format!(
                "{}: {}",
                self.exception_class_name(*exc).unwrap_or_default(),
                self.exception_message(*exc).unwrap_or_default()
            ),
            e => e.to_string(),
        }
    }
}
