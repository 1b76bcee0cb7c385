//! Classes, modules, method tables and method resolution.

use std::fmt;
use std::rc::Rc;

use fnv::FnvHashMap;
use smol_str::SmolStr;

use crate::args::Args;
use crate::error::VmResult;
use crate::gc::{ObjRef, Trace, Tracer};
use crate::object::{InstanceKind, ObjFlags, ObjectKind, RObject};
use crate::symbol::Symbol;
use crate::value::Value;
use crate::vm::Vm;

/// A method implemented by the host.
pub type NativeFn = Rc<dyn Fn(&mut Vm, Value, &Args) -> VmResult<Value>>;

#[derive(Clone)]
pub enum Method {
    /// Bytecode body
    Proc(ObjRef),
    Native(NativeFn),
    /// Stops lookup as if no method were defined
    Undef,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Proc(p) => f.debug_tuple("Proc").field(p).finish(),
            Method::Native(n) => write!(f, "Native({:p})", Rc::as_ptr(n) as *const ()),
            Method::Undef => f.write_str("Undef"),
        }
    }
}

impl Method {
    pub fn same_as(&self, other: &Method) -> bool {
        match (self, other) {
            (Method::Proc(a), Method::Proc(b)) => a == b,
            (Method::Native(a), Method::Native(b)) => Rc::ptr_eq(a, b),
            (Method::Undef, Method::Undef) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Module,
    Singleton,
}

pub struct RClass {
    pub name: Option<SmolStr>,
    pub kind: ClassKind,
    pub superclass: Option<ObjRef>,
    /// Directly included modules, in inclusion order
    pub includes: Vec<ObjRef>,
    pub methods: FnvHashMap<Symbol, Method>,
    pub consts: FnvHashMap<Symbol, Value>,
    pub cvars: FnvHashMap<Symbol, Value>,
    /// Lexically enclosing class, for constant lookup
    pub outer: Option<ObjRef>,
    pub instance_kind: InstanceKind,
    /// The object a singleton class belongs to
    pub attached: Option<ObjRef>,
    /// Flattened ancestor list and the hierarchy generation it was built at
    ancestors: Option<(u64, Rc<[ObjRef]>)>,
}

impl RClass {
    pub fn new(kind: ClassKind, superclass: Option<ObjRef>, instance_kind: InstanceKind) -> Self {
        RClass {
            name: None,
            kind,
            superclass,
            includes: vec![],
            methods: FnvHashMap::default(),
            consts: FnvHashMap::default(),
            cvars: FnvHashMap::default(),
            outer: None,
            instance_kind,
            attached: None,
            ancestors: None,
        }
    }

    pub fn is_module(&self) -> bool {
        self.kind == ClassKind::Module
    }

    pub(crate) fn table_len(&self) -> usize {
        self.methods.len() + self.consts.len() + self.cvars.len()
    }
}

impl Trace for RClass {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark_opt(self.superclass);
        tracer.mark_opt(self.outer);
        tracer.mark_opt(self.attached);
        for &m in &self.includes {
            tracer.mark(m);
        }
        for m in self.methods.values() {
            if let Method::Proc(p) = m {
                tracer.mark(*p);
            }
        }
        tracer.mark_values(self.consts.values());
        tracer.mark_values(self.cvars.values());
    }
}

#[derive(Clone)]
pub(crate) struct CacheEntry {
    generation: u64,
    method: Method,
    owner: ObjRef,
}

/// Global method cache keyed by (receiver class, name). An entry is valid only
/// while no method table or class hierarchy changed since it was filled.
#[derive(Default)]
pub(crate) struct MethodCache {
    entries: FnvHashMap<(ObjRef, Symbol), CacheEntry>,
    pub(crate) generation: u64,
    /// Bumped when any superclass or include list changes
    pub(crate) hierarchy: u64,
}

impl MethodCache {
    pub fn invalidate(&mut self) {
        self.generation += 1;
    }

    pub fn invalidate_hierarchy(&mut self) {
        self.generation += 1;
        self.hierarchy += 1;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Vm {
    pub(crate) fn class_ref(&self, class: ObjRef) -> &RClass {
        self.heap
            .get(class)
            .as_class()
            .expect("expected a class or module")
    }

    pub(crate) fn class_mut(&mut self, class: ObjRef) -> &mut RClass {
        self.heap
            .get_mut(class)
            .as_class_mut()
            .expect("expected a class or module")
    }

    pub fn is_class_or_module(&self, v: Value) -> bool {
        match v {
            Value::Object(r) => self.heap.get(r).as_class().is_some(),
            _ => false,
        }
    }

    pub fn is_module(&self, v: Value) -> bool {
        match v {
            Value::Object(r) => self.heap.get(r).as_class().map_or(false, RClass::is_module),
            _ => false,
        }
    }

    /// Allocate a class object. Its own class is `Class` or `Module`.
    pub(crate) fn alloc_class(
        &mut self,
        kind: ClassKind,
        superclass: Option<ObjRef>,
        instance_kind: InstanceKind,
    ) -> ObjRef {
        let meta = match kind {
            ClassKind::Module => self.core.module,
            _ => self.core.class,
        };
        let mut obj = RObject::new(
            meta,
            ObjectKind::Class(Box::new(RClass::new(kind, superclass, instance_kind))),
        );
        if kind == ClassKind::Singleton {
            obj.flags |= ObjFlags::SINGLETON;
        }
        self.heap.alloc(obj)
    }

    /// Name a class after the constant it is stored in.
    fn name_class(&mut self, outer: ObjRef, class: ObjRef, name: Symbol) {
        if self.class_ref(class).name.is_some() {
            return;
        }
        let full = if outer == self.core.object {
            SmolStr::new(self.symbols.name(name))
        } else {
            SmolStr::new(format!(
                "{}::{}",
                self.class_name(outer),
                self.symbols.name(name)
            ))
        };
        let c = self.class_mut(class);
        c.name = Some(full);
        if outer != class {
            c.outer = Some(outer);
        }
    }

    pub fn define_class(&mut self, name: &str, superclass: Option<ObjRef>) -> VmResult<ObjRef> {
        let object = self.core.object;
        self.define_class_under(object, name, superclass)
    }

    /// Define a class constant under `outer`, or reopen the existing one.
    pub fn define_class_under(
        &mut self,
        outer: ObjRef,
        name: &str,
        superclass: Option<ObjRef>,
    ) -> VmResult<ObjRef> {
        self.check_class(outer)?;
        if let Some(s) = superclass {
            self.check_class(s)?;
        }
        let sym = self.intern(name);
        self.open_class(outer, sym, superclass)
    }

    pub(crate) fn open_class(
        &mut self,
        outer: ObjRef,
        name: Symbol,
        superclass: Option<ObjRef>,
    ) -> VmResult<ObjRef> {
        if let Some(existing) = self.class_ref(outer).consts.get(&name).copied() {
            let class = match existing {
                Value::Object(r) if self.heap.get(r).as_class().map(|c| c.kind) == Some(ClassKind::Class) => r,
                _ => {
                    let msg = format!("{} is not a class", self.symbols.name(name));
                    return Err(self.type_error(msg));
                }
            };
            if let Some(s) = superclass {
                if self.class_ref(class).superclass != Some(s) {
                    let msg = format!("superclass mismatch for class {}", self.symbols.name(name));
                    return Err(self.type_error(msg));
                }
            }
            return Ok(class);
        }
        let superclass = superclass.unwrap_or(self.core.object);
        let (kind, instance_kind) = {
            let sc = self.class_ref(superclass);
            (sc.kind, sc.instance_kind)
        };
        if kind != ClassKind::Class {
            return Err(self.type_error("superclass must be a Class"));
        }
        let class = self.alloc_class(ClassKind::Class, Some(superclass), instance_kind);
        // class methods of the superclass are reachable through this chain
        self.singleton_class(Value::Object(class))?;
        self.name_class(outer, class, name);
        self.set_const(outer, name, Value::Object(class))?;
        tracing::trace!(class = %self.class_name(class), "defined class");
        Ok(class)
    }

    pub fn define_module(&mut self, name: &str) -> VmResult<ObjRef> {
        let object = self.core.object;
        self.define_module_under(object, name)
    }

    pub fn define_module_under(&mut self, outer: ObjRef, name: &str) -> VmResult<ObjRef> {
        self.check_class(outer)?;
        let sym = self.intern(name);
        self.open_module(outer, sym)
    }

    pub(crate) fn open_module(&mut self, outer: ObjRef, name: Symbol) -> VmResult<ObjRef> {
        if let Some(existing) = self.class_ref(outer).consts.get(&name).copied() {
            return match existing {
                Value::Object(r) if self.is_module(existing) => Ok(r),
                _ => {
                    let msg = format!("{} is not a module", self.symbols.name(name));
                    Err(self.type_error(msg))
                }
            };
        }
        let module = self.alloc_class(ClassKind::Module, None, InstanceKind::Special);
        self.name_class(outer, module, name);
        self.set_const(outer, name, Value::Object(module))?;
        Ok(module)
    }

    /// Fail with `TypeError` unless `class` is a class or module.
    pub(crate) fn check_class(&mut self, class: ObjRef) -> VmResult<()> {
        if self.heap.get(class).as_class().is_none() {
            let msg = format!("{} is not a class/module", self.inspect(Value::Object(class)));
            return Err(self.type_error(msg));
        }
        Ok(())
    }

    fn check_frozen_class(&mut self, class: ObjRef) -> VmResult<()> {
        self.check_class(class)?;
        if self.heap.get(class).is_frozen() {
            let msg = format!("can't modify frozen {}", self.class_name(class));
            return Err(self.frozen_error(msg));
        }
        Ok(())
    }

    /// Install `method` without checks. Used while booting the core classes.
    pub(crate) fn add_method(&mut self, class: ObjRef, name: Symbol, method: Method) {
        self.class_mut(class).methods.insert(name, method);
        self.method_cache.invalidate();
    }

    pub(crate) fn set_method(&mut self, class: ObjRef, name: Symbol, method: Method) -> VmResult<()> {
        self.check_frozen_class(class)?;
        self.add_method(class, name, method);
        Ok(())
    }

    pub fn define_method<F>(&mut self, class: ObjRef, name: &str, f: F) -> VmResult<()>
    where
        F: Fn(&mut Vm, Value, &Args) -> VmResult<Value> + 'static,
    {
        let sym = self.intern(name);
        self.set_method(class, sym, Method::Native(Rc::new(f)))
    }

    pub fn define_singleton_method<F>(&mut self, obj: Value, name: &str, f: F) -> VmResult<()>
    where
        F: Fn(&mut Vm, Value, &Args) -> VmResult<Value> + 'static,
    {
        let meta = self.singleton_class(obj)?;
        self.define_method(meta, name, f)
    }

    pub fn include_module(&mut self, class: ObjRef, module: ObjRef) -> VmResult<()> {
        if !self.is_module(Value::Object(module)) {
            let msg = format!(
                "wrong argument type {} (expected Module)",
                self.class_name(self.class_of(Value::Object(module)))
            );
            return Err(self.type_error(msg));
        }
        self.check_frozen_class(class)?;
        if self.ancestors(class).contains(&module) {
            return Ok(());
        }
        if self.ancestors(module).contains(&class) {
            return Err(self.argument_error("cyclic include detected"));
        }
        self.class_mut(class).includes.push(module);
        self.method_cache.invalidate_hierarchy();
        Ok(())
    }

    /// Linear method resolution order: the class, its included modules (last
    /// included first), then the same for the superclass.
    pub fn ancestors(&mut self, class: ObjRef) -> Rc<[ObjRef]> {
        let generation = self.method_cache.hierarchy;
        let c = self.class_ref(class);
        if let Some((g, list)) = &c.ancestors {
            if *g == generation {
                return list.clone();
            }
        }
        let includes = c.includes.clone();
        let superclass = c.superclass;

        let mut out = vec![class];
        for &m in includes.iter().rev() {
            for a in self.ancestors(m).iter() {
                if !out.contains(a) {
                    out.push(*a);
                }
            }
        }
        if let Some(s) = superclass {
            for a in self.ancestors(s).iter() {
                if !out.contains(a) {
                    out.push(*a);
                }
            }
        }
        let list: Rc<[ObjRef]> = out.into();
        self.class_mut(class).ancestors = Some((generation, list.clone()));
        list
    }

    /// Resolve `name` for instances of `class`, returning the method and the
    /// class it was found in.
    pub(crate) fn find_method(&mut self, class: ObjRef, name: Symbol) -> Option<(Method, ObjRef)> {
        if let Some(e) = self.method_cache.entries.get(&(class, name)) {
            if e.generation == self.method_cache.generation {
                return Some((e.method.clone(), e.owner));
            }
        }
        tracing::trace!(method = self.symbols.name(name), "method cache miss");
        let ancestors = self.ancestors(class);
        let found = self.lookup_in(&ancestors, name)?;
        let entry = CacheEntry {
            generation: self.method_cache.generation,
            method: found.0.clone(),
            owner: found.1,
        };
        self.method_cache.entries.insert((class, name), entry);
        Some(found)
    }

    fn lookup_in(&self, ancestors: &[ObjRef], name: Symbol) -> Option<(Method, ObjRef)> {
        for &a in ancestors {
            match self.class_ref(a).methods.get(&name) {
                Some(Method::Undef) => return None,
                Some(m) => return Some((m.clone(), a)),
                None => {}
            }
        }
        None
    }

    /// Resolve `name` starting after `owner` in the ancestors of `class`, for
    /// `super`. `None` in the outer option means `owner` is not an ancestor.
    pub(crate) fn find_super_method(
        &mut self,
        class: ObjRef,
        owner: ObjRef,
        name: Symbol,
    ) -> Option<Option<(Method, ObjRef)>> {
        let ancestors = self.ancestors(class);
        let pos = ancestors.iter().position(|&a| a == owner)?;
        Some(self.lookup_in(&ancestors[pos + 1..], name))
    }

    pub fn respond_to(&mut self, v: Value, name: &str) -> bool {
        let sym = self.intern(name);
        let class = self.class_of(v);
        self.find_method(class, sym).is_some()
    }

    pub fn remove_method(&mut self, class: ObjRef, name: Symbol) -> VmResult<()> {
        self.check_frozen_class(class)?;
        match self.class_mut(class).methods.remove(&name) {
            Some(Method::Undef) | None => {
                let msg = format!(
                    "method '{}' not defined in {}",
                    self.symbols.name(name),
                    self.class_name(class)
                );
                Err(self.name_error(msg, name))
            }
            Some(_) => {
                self.method_cache.invalidate();
                Ok(())
            }
        }
    }

    pub fn undef_method(&mut self, class: ObjRef, name: Symbol) -> VmResult<()> {
        self.check_class(class)?;
        if self.find_method(class, name).is_none() {
            let msg = format!(
                "undefined method '{}' for class '{}'",
                self.symbols.name(name),
                self.class_name(class)
            );
            return Err(self.name_error(msg, name));
        }
        self.set_method(class, name, Method::Undef)
    }

    pub fn alias_method(&mut self, class: ObjRef, new: Symbol, old: Symbol) -> VmResult<()> {
        self.check_class(class)?;
        match self.find_method(class, old) {
            Some((m, _)) => self.set_method(class, new, m),
            None => {
                let msg = format!(
                    "undefined method '{}' for class '{}'",
                    self.symbols.name(old),
                    self.class_name(class)
                );
                Err(self.name_error(msg, old))
            }
        }
    }

    /// The class used for method lookup, singleton classes included.
    pub fn class_of(&self, v: Value) -> ObjRef {
        match v {
            Value::Nil => self.core.nil,
            Value::False => self.core.false_,
            Value::True => self.core.true_,
            Value::Integer(_) => self.core.integer,
            Value::Float(_) => self.core.float,
            Value::Symbol(_) => self.core.symbol,
            Value::Object(r) => self.heap.get(r).class,
        }
    }

    /// The nominal class of `v`, skipping singleton classes.
    pub fn real_class_of(&self, v: Value) -> ObjRef {
        let mut class = self.class_of(v);
        while self.heap.get(class).flags.contains(ObjFlags::SINGLETON) {
            class = self
                .class_ref(class)
                .superclass
                .expect("singleton classes have a superclass");
        }
        class
    }

    pub fn singleton_class(&mut self, v: Value) -> VmResult<ObjRef> {
        let r = match v {
            Value::Object(r) => r,
            Value::Nil | Value::True | Value::False => return Ok(self.class_of(v)),
            _ => return Err(self.type_error("can't define singleton")),
        };
        let current = self.heap.get(r).class;
        if self.heap.get(current).flags.contains(ObjFlags::SINGLETON)
            && self.class_ref(current).attached == Some(r)
        {
            return Ok(current);
        }
        let class_info = self.heap.get(r).as_class().map(|c| (c.kind, c.superclass));
        let superclass = match class_info {
            Some((ClassKind::Module, _)) | None => current,
            Some((_, Some(s))) => self.singleton_class(Value::Object(s))?,
            Some((_, None)) => self.core.class,
        };
        let meta = self.alloc_class(ClassKind::Singleton, Some(superclass), InstanceKind::Special);
        self.class_mut(meta).attached = Some(r);
        self.heap.get_mut(r).class = meta;
        self.method_cache.invalidate_hierarchy();
        Ok(meta)
    }

    pub fn is_kind_of(&mut self, v: Value, class: ObjRef) -> bool {
        let c = self.class_of(v);
        self.ancestors(c).contains(&class)
    }

    pub fn class_name(&self, class: ObjRef) -> String {
        let c = self.class_ref(class);
        if let Some(name) = &c.name {
            return name.to_string();
        }
        match (c.kind, c.attached) {
            (ClassKind::Singleton, Some(obj)) => match self.heap.get(obj).as_class() {
                Some(_) => format!("#<Class:{}>", self.class_name(obj)),
                None => format!("#<Class:#<{}>>", self.class_name(self.real_class_of(Value::Object(obj)))),
            },
            (ClassKind::Module, _) => format!("#<Module:{:#x}>", object_id(class)),
            _ => format!("#<Class:{:#x}>", object_id(class)),
        }
    }

    pub(crate) fn set_const(&mut self, class: ObjRef, name: Symbol, value: Value) -> VmResult<()> {
        self.check_frozen_class(class)?;
        if let Value::Object(r) = value {
            if self.heap.get(r).as_class().is_some() {
                self.name_class(class, r, name);
            }
        }
        self.class_mut(class).consts.insert(name, value);
        Ok(())
    }

    pub fn define_const(&mut self, class: ObjRef, name: &str, value: Value) -> VmResult<()> {
        let sym = self.intern(name);
        self.set_const(class, sym, value)
    }

    /// Look a constant up in `class` and its ancestors (and `Object` for
    /// modules).
    pub fn get_const(&mut self, class: ObjRef, name: &str) -> Option<Value> {
        self.heap.get(class).as_class()?;
        let sym = self.symbols.lookup(name)?;
        self.const_in_ancestors(class, sym)
    }

    pub(crate) fn const_in_ancestors(&mut self, class: ObjRef, name: Symbol) -> Option<Value> {
        let ancestors = self.ancestors(class);
        ancestors
            .iter()
            .find_map(|&a| self.class_ref(a).consts.get(&name).copied())
            .or_else(|| self.class_ref(self.core.object).consts.get(&name).copied())
    }

    /// Constant lookup from code whose lexical class is `cref`: the lexical
    /// scopes outward first, then the ancestors of `cref`.
    pub(crate) fn lexical_const(&mut self, cref: ObjRef, name: Symbol) -> VmResult<Value> {
        let mut scope = Some(cref);
        while let Some(c) = scope {
            let class = self.class_ref(c);
            if let Some(v) = class.consts.get(&name) {
                return Ok(*v);
            }
            scope = class.outer;
        }
        match self.const_in_ancestors(cref, name) {
            Some(v) => Ok(v),
            None => {
                let msg = format!("uninitialized constant {}", self.symbols.name(name));
                Err(self.name_error(msg, name))
            }
        }
    }
}

/// Stable numeric identity of an object.
pub(crate) fn object_id(r: ObjRef) -> u64 {
    slotmap::Key::data(&r).as_ffi()
}
