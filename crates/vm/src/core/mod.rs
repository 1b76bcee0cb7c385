//! The classes every VM starts with and their native methods.

mod collections;
mod exception;
mod kernel;
mod numeric;
mod proc;

use crate::class::ClassKind;
use crate::error::VmResult;
use crate::gc::{ObjRef, Tracer};
use crate::object::InstanceKind;
use crate::value::Value;
use crate::vm::Vm;

macro_rules! core_classes {
    ($($field:ident),* $(,)?) => {
        /// Handles of the built-in classes, filled in by [`init`].
        #[derive(Debug, Default, Clone, Copy)]
        pub(crate) struct CoreClasses {
            $(pub $field: ObjRef,)*
        }

        impl CoreClasses {
            pub fn trace(&self, tracer: &mut Tracer) {
                $(tracer.mark(self.$field);)*
            }
        }
    };
}

core_classes! {
    basic_object,
    object,
    module,
    class,
    kernel,
    nil,
    true_,
    false_,
    numeric,
    integer,
    float,
    symbol,
    string,
    array,
    hash,
    range,
    proc,
    fiber,
    exception,
    script_error,
    not_implemented_error,
    standard_error,
    argument_error,
    local_jump_error,
    range_error,
    float_domain_error,
    runtime_error,
    type_error,
    name_error,
    no_method_error,
    index_error,
    key_error,
    zero_division_error,
    frozen_error,
    fiber_error,
    system_stack_error,
    no_memory_error,
    main,
}

/// Build the class hierarchy and register the native methods.
pub(crate) fn init(vm: &mut Vm) -> VmResult<()> {
    boot_hierarchy(vm)?;
    exception::init(vm)?;
    kernel::init(vm)?;
    numeric::init(vm)?;
    collections::init(vm)?;
    proc::init(vm)?;
    tracing::debug!(symbols = vm.symbols.len(), "core classes ready");
    Ok(())
}

/// `BasicObject`, `Object`, `Module` and `Class` refer to each other, so
/// they are allocated first and given their class afterwards.
fn boot_hierarchy(vm: &mut Vm) -> VmResult<()> {
    let basic = vm.alloc_class(ClassKind::Class, None, InstanceKind::Object);
    let object = vm.alloc_class(ClassKind::Class, Some(basic), InstanceKind::Object);
    let module = vm.alloc_class(ClassKind::Class, Some(object), InstanceKind::Special);
    let class = vm.alloc_class(ClassKind::Class, Some(module), InstanceKind::Special);
    for r in [basic, object, module, class] {
        vm.heap.get_mut(r).class = class;
    }
    vm.core.basic_object = basic;
    vm.core.object = object;
    vm.core.module = module;
    vm.core.class = class;
    vm.define_const(object, "BasicObject", Value::Object(basic))?;
    vm.define_const(object, "Object", Value::Object(object))?;
    vm.define_const(object, "Module", Value::Object(module))?;
    vm.define_const(object, "Class", Value::Object(class))?;

    let kernel = vm.define_module("Kernel")?;
    vm.include_module(object, kernel)?;
    vm.core.kernel = kernel;

    vm.core.nil = special_class(vm, "NilClass", None)?;
    vm.core.true_ = special_class(vm, "TrueClass", None)?;
    vm.core.false_ = special_class(vm, "FalseClass", None)?;
    let numeric = special_class(vm, "Numeric", None)?;
    vm.core.numeric = numeric;
    vm.core.integer = special_class(vm, "Integer", Some(numeric))?;
    vm.core.float = special_class(vm, "Float", Some(numeric))?;
    vm.core.symbol = special_class(vm, "Symbol", None)?;
    vm.core.range = special_class(vm, "Range", None)?;
    vm.core.proc = special_class(vm, "Proc", None)?;
    vm.core.fiber = special_class(vm, "Fiber", None)?;
    vm.core.string = class_with(vm, "String", None, InstanceKind::String)?;
    vm.core.array = class_with(vm, "Array", None, InstanceKind::Array)?;
    vm.core.hash = class_with(vm, "Hash", None, InstanceKind::Hash)?;

    vm.core.main = vm.new_object(object).as_object().expect("objects live on the heap");
    let main = vm.main_object();
    vm.define_singleton_method(main, "to_s", |vm, _, _| Ok(vm.new_string("main")))?;
    vm.define_singleton_method(main, "inspect", |vm, _, _| Ok(vm.new_string("main")))?;
    Ok(())
}

/// Define a top-level class whose instances are of `kind`.
pub(crate) fn class_with(
    vm: &mut Vm,
    name: &str,
    superclass: Option<ObjRef>,
    kind: InstanceKind,
) -> VmResult<ObjRef> {
    let class = vm.define_class(name, superclass)?;
    vm.class_mut(class).instance_kind = kind;
    Ok(class)
}

/// A class whose instances only the VM creates.
fn special_class(vm: &mut Vm, name: &str, superclass: Option<ObjRef>) -> VmResult<ObjRef> {
    class_with(vm, name, superclass, InstanceKind::Special)
}

#[cfg(test)]
mod test;
