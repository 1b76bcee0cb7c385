//! Constructing and reading values from the host side.

use std::any::Any;
use std::mem::size_of;
use std::sync::Arc;

use garnet_bytecode::Irep;
use itertools::Itertools;

use crate::class::object_id;
use crate::error::{Error, VmResult};
use crate::gc::{Heap, ObjRef};
use crate::object::{
    BreakTag, EnvStorage, ObjFlags, ObjectKind, RBreak, RData, RHash, RObject, RProc, RRange,
};
use crate::symbol::Symbol;
use crate::value::{Value, ValueType};
use crate::vm::Vm;

impl Vm {
    pub fn new_string(&mut self, bytes: impl Into<Vec<u8>>) -> Value {
        let class = self.core.string;
        Value::Object(self.heap.alloc(RObject::new(class, ObjectKind::String(bytes.into()))))
    }

    pub fn string_bytes(&self, v: Value) -> Option<&[u8]> {
        self.heap.get(v.as_object()?).as_string()
    }

    pub fn string_lossy(&self, v: Value) -> Option<String> {
        self.string_bytes(v)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn new_array(&mut self, items: Vec<Value>) -> Value {
        let class = self.core.array;
        Value::Object(self.heap.alloc(RObject::new(class, ObjectKind::Array(items))))
    }

    pub fn array_items(&self, v: Value) -> Option<&[Value]> {
        self.heap.get(v.as_object()?).as_array()
    }

    pub fn array_push(&mut self, array: Value, item: Value) -> VmResult<()> {
        self.check_frozen(array)?;
        let items = array
            .as_object()
            .and_then(|r| self.heap.get_mut(r).as_array_mut());
        match items {
            Some(items) => items.push(item),
            None => return Err(self.type_error("expected an Array")),
        }
        self.heap.grew(size_of::<Value>());
        Ok(())
    }

    pub fn new_hash(&mut self) -> Value {
        let class = self.core.hash;
        Value::Object(self.heap.alloc(RObject::new(class, ObjectKind::Hash(RHash::new()))))
    }

    /// A hash from a flat `[k0, v0, k1, v1, ...]` slice.
    pub(crate) fn new_hash_from_pairs(&mut self, flat: &[Value]) -> Value {
        let mut hash = RHash::new();
        for (k, v) in flat.iter().copied().tuples() {
            hash.insert(&self.heap, k, v);
        }
        let class = self.core.hash;
        Value::Object(self.heap.alloc(RObject::new(class, ObjectKind::Hash(hash))))
    }

    /// Move the hash out of `h` while `f` modifies it, so that keys can still
    /// be read from the heap.
    pub(crate) fn with_hash<R>(&mut self, h: ObjRef, f: impl FnOnce(&Heap, &mut RHash) -> R) -> R {
        let mut hash = match &mut self.heap.get_mut(h).kind {
            ObjectKind::Hash(hash) => std::mem::take(hash),
            _ => panic!("expected a hash"),
        };
        let before = hash.capacity();
        let r = f(&self.heap, &mut hash);
        let after = hash.capacity();
        if let ObjectKind::Hash(slot) = &mut self.heap.get_mut(h).kind {
            *slot = hash;
        }
        if after > before {
            self.heap.grew((after - before) * 3 * size_of::<Value>());
        }
        r
    }

    fn expect_hash(&mut self, h: Value) -> VmResult<ObjRef> {
        match h {
            Value::Object(r) if self.heap.get(r).as_hash().is_some() => Ok(r),
            _ => {
                let msg = format!("no implicit conversion of {} into Hash", self.type_name(h));
                Err(self.type_error(msg))
            }
        }
    }

    pub fn hash_get(&self, h: Value, key: Value) -> Option<Value> {
        self.heap.get(h.as_object()?).as_hash()?.get(&self.heap, key)
    }

    pub fn hash_set(&mut self, h: Value, key: Value, value: Value) -> VmResult<()> {
        self.check_frozen(h)?;
        let r = self.expect_hash(h)?;
        // string keys are copied and frozen so later mutation cannot move them
        let key = match self.string_bytes(key) {
            Some(bytes) if !self.is_frozen(key) => {
                let copy = self.new_string(bytes.to_vec());
                self.freeze(copy);
                copy
            }
            _ => key,
        };
        self.with_hash(r, |heap, hash| hash.insert(heap, key, value));
        Ok(())
    }

    pub fn hash_delete(&mut self, h: Value, key: Value) -> VmResult<Option<Value>> {
        self.check_frozen(h)?;
        let r = self.expect_hash(h)?;
        Ok(self.with_hash(r, |heap, hash| hash.remove(heap, key)))
    }

    /// Entries in insertion order
    pub fn hash_pairs(&self, h: Value) -> Option<Vec<(Value, Value)>> {
        Some(self.heap.get(h.as_object()?).as_hash()?.iter().collect())
    }

    pub(crate) fn hash_is_empty(&self, h: Value) -> bool {
        h.as_object()
            .and_then(|r| self.heap.get(r).as_hash())
            .map_or(true, RHash::is_empty)
    }

    /// Copy every entry of `from` into `into`.
    pub(crate) fn hash_merge(&mut self, into: Value, from: Value) -> VmResult<()> {
        self.expect_hash(from)?;
        let pairs = self.hash_pairs(from).unwrap_or_default();
        for (k, v) in pairs {
            self.hash_set(into, k, v)?;
        }
        Ok(())
    }

    pub fn new_range(&mut self, begin: Value, end: Value, exclusive: bool) -> Value {
        let class = self.core.range;
        let range = RRange {
            begin,
            end,
            exclusive,
        };
        Value::Object(self.heap.alloc(RObject::new(class, ObjectKind::Range(range))))
    }

    pub fn range_parts(&self, v: Value) -> Option<RRange> {
        self.heap.get(v.as_object()?).as_range().copied()
    }

    pub fn new_object(&mut self, class: ObjRef) -> Value {
        Value::Object(self.heap.alloc(RObject::new(class, ObjectKind::Object)))
    }

    pub fn value_type(&self, v: Value) -> ValueType {
        match v {
            Value::Nil => ValueType::Nil,
            Value::False => ValueType::False,
            Value::True => ValueType::True,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Symbol(_) => ValueType::Symbol,
            Value::Object(r) => self.heap.get(r).value_type(),
        }
    }

    /// Name of the nominal class of `v`
    pub(crate) fn type_name(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".into(),
            Value::True => "true".into(),
            Value::False => "false".into(),
            _ => self.class_name(self.real_class_of(v)),
        }
    }

    pub fn is_frozen(&self, v: Value) -> bool {
        match v {
            Value::Object(r) => self.heap.get(r).is_frozen(),
            _ => true,
        }
    }

    pub fn freeze(&mut self, v: Value) {
        if let Value::Object(r) = v {
            self.heap.get_mut(r).flags |= ObjFlags::FROZEN;
        }
    }

    pub(crate) fn check_frozen(&mut self, v: Value) -> VmResult<()> {
        if self.is_frozen(v) {
            let msg = format!("can't modify frozen {}: {}", self.type_name(v), self.inspect(v));
            return Err(self.frozen_error(msg));
        }
        Ok(())
    }

    pub fn get_ivar(&mut self, obj: Value, name: &str) -> Value {
        let sym = self.intern(name);
        self.ivar_get(obj, sym)
    }

    pub fn set_ivar(&mut self, obj: Value, name: &str, value: Value) -> VmResult<()> {
        let sym = self.intern(name);
        self.ivar_set(obj, sym, value)
    }

    pub(crate) fn ivar_get(&self, obj: Value, name: Symbol) -> Value {
        match obj {
            Value::Object(r) => self.heap.get(r).ivar(name).unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    pub(crate) fn ivar_set(&mut self, obj: Value, name: Symbol, value: Value) -> VmResult<()> {
        self.check_frozen(obj)?;
        if let Value::Object(r) = obj {
            self.heap.get_mut(r).set_ivar(name, value);
            self.heap.grew(size_of::<(Symbol, Value)>());
        }
        Ok(())
    }

    pub fn get_global(&mut self, name: &str) -> Value {
        let sym = self.intern(name);
        self.globals.get(&sym).copied().unwrap_or(Value::Nil)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let sym = self.intern(name);
        self.globals.insert(sym, value);
    }

    /// Wrap a host value. `release` receives it back when the object is
    /// reclaimed or the VM is dropped.
    pub fn new_data<T: Any>(
        &mut self,
        class: ObjRef,
        type_name: &'static str,
        payload: T,
        release: impl FnOnce(T) + 'static,
    ) -> Value {
        let data = RData {
            type_name,
            payload: Some(Box::new(payload)),
            release: Some(Box::new(move |p: Box<dyn Any>| {
                if let Ok(p) = p.downcast::<T>() {
                    release(*p)
                }
            })),
        };
        Value::Object(self.heap.alloc(RObject::new(class, ObjectKind::Data(data))))
    }

    pub fn data_ref<T: Any>(&self, v: Value) -> Option<&T> {
        match &self.heap.get(v.as_object()?).kind {
            ObjectKind::Data(d) => d.payload.as_ref()?.downcast_ref(),
            _ => None,
        }
    }

    pub fn data_mut<T: Any>(&mut self, v: Value) -> Option<&mut T> {
        match &mut self.heap.get_mut(v.as_object()?).kind {
            ObjectKind::Data(d) => d.payload.as_mut()?.downcast_mut(),
            _ => None,
        }
    }

    pub(crate) fn new_proc(
        &mut self,
        irep: Arc<Irep>,
        upper: Option<ObjRef>,
        env: Option<ObjRef>,
        target_class: ObjRef,
        strict: bool,
    ) -> ObjRef {
        let class = self.core.proc;
        let mut obj = RObject::new(
            class,
            ObjectKind::Proc(RProc {
                irep,
                upper,
                env,
                target_class: Some(target_class),
            }),
        );
        if strict {
            obj.flags |= ObjFlags::STRICT;
        }
        self.heap.alloc(obj)
    }

    pub(crate) fn is_strict(&self, proc: ObjRef) -> bool {
        self.heap.get(proc).flags.contains(ObjFlags::STRICT)
    }

    pub(crate) fn new_break(&mut self, tag: BreakTag, value: Value) -> ObjRef {
        let class = self.core.object;
        self.heap
            .alloc(RObject::new(class, ObjectKind::Break(RBreak { tag, value })))
    }

    /// Read local `idx` of a captured environment.
    pub(crate) fn env_get(&self, env: ObjRef, idx: usize) -> Value {
        let env = self.heap.get(env).as_env().expect("expected an env");
        match &env.storage {
            EnvStorage::OnStack { ctx, base, len, .. } if idx < *len => self
                .contexts
                .get(*ctx)
                .and_then(|c| c.stack.get(base + idx))
                .copied()
                .unwrap_or(Value::Nil),
            EnvStorage::OnStack { .. } => Value::Nil,
            EnvStorage::Detached(vs) => vs.get(idx).copied().unwrap_or(Value::Nil),
        }
    }

    pub(crate) fn env_set(&mut self, env: ObjRef, idx: usize, value: Value) {
        let env = self.heap.get_mut(env).as_env_mut().expect("expected an env");
        match &mut env.storage {
            EnvStorage::OnStack { ctx, base, len, .. } if idx < *len => {
                let (ctx, slot) = (*ctx, *base + idx);
                if let Some(v) = self.contexts.get_mut(ctx).and_then(|c| c.stack.get_mut(slot)) {
                    *v = value;
                }
            }
            EnvStorage::OnStack { .. } => {}
            EnvStorage::Detached(vs) => {
                if let Some(v) = vs.get_mut(idx) {
                    *v = value;
                }
            }
        }
    }

    /// Elements `v` contributes to a splat: an array's items, nothing for nil,
    /// the integers of an integer range, otherwise `v` itself.
    pub(crate) fn splat(&self, v: Value) -> Vec<Value> {
        if v.is_nil() {
            return vec![];
        }
        if let Some(items) = self.array_items(v) {
            return items.to_vec();
        }
        if let Some(r) = self.range_parts(v) {
            if let (Value::Integer(b), Value::Integer(e)) = (r.begin, r.end) {
                let end = if r.exclusive { e } else { e.saturating_add(1) };
                return (b..end).map(Value::Integer).collect();
            }
        }
        vec![v]
    }

    /// The bytes `to_s` produces for `v`, as used by string interpolation.
    pub(crate) fn to_s_bytes(&mut self, v: Value) -> VmResult<Vec<u8>> {
        match v {
            Value::Nil => Ok(vec![]),
            Value::Symbol(s) => Ok(self.symbols.bytes(s).to_vec()),
            Value::Integer(_) | Value::Float(_) | Value::True | Value::False => {
                Ok(self.inspect(v).into_bytes())
            }
            Value::Object(_) => {
                if let Some(b) = self.string_bytes(v) {
                    return Ok(b.to_vec());
                }
                let s = self.call_with_args(v, crate::symbol::sym::TO_S, &Default::default())?;
                match self.string_bytes(s) {
                    Some(b) => Ok(b.to_vec()),
                    None => Ok(self.inspect(v).into_bytes()),
                }
            }
        }
    }

    /// A structural, side-effect free rendering of `v`.
    pub fn inspect(&self, v: Value) -> String {
        let mut out = String::new();
        self.inspect_into(v, &mut out, &mut vec![]);
        out
    }

    fn inspect_into(&self, v: Value, out: &mut String, seen: &mut Vec<ObjRef>) {
        use std::fmt::Write;
        let r = match v {
            Value::Nil => return out.push_str("nil"),
            Value::True => return out.push_str("true"),
            Value::False => return out.push_str("false"),
            Value::Integer(i) => return write!(out, "{}", i).unwrap_or_default(),
            Value::Float(f) => return out.push_str(&format_float(f)),
            Value::Symbol(s) => return write!(out, ":{}", self.symbols.name(s)).unwrap_or_default(),
            Value::Object(r) => r,
        };
        if seen.contains(&r) {
            return out.push_str(match self.heap.get(r).kind {
                ObjectKind::Hash(_) => "{...}",
                _ => "[...]",
            });
        }
        let obj = self.heap.get(r);
        let class = self.class_name(self.real_class_of(v));
        match &obj.kind {
            ObjectKind::String(s) => write!(out, "{:?}", String::from_utf8_lossy(s)).unwrap_or_default(),
            ObjectKind::Array(items) => {
                seen.push(r);
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.inspect_into(*item, out, seen);
                }
                out.push(']');
                seen.pop();
            }
            ObjectKind::Hash(h) => {
                seen.push(r);
                out.push('{');
                for (i, (k, v)) in h.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.inspect_into(k, out, seen);
                    out.push_str(" => ");
                    self.inspect_into(v, out, seen);
                }
                out.push('}');
                seen.pop();
            }
            ObjectKind::Range(range) => {
                self.inspect_into(range.begin, out, seen);
                out.push_str(if range.exclusive { "..." } else { ".." });
                self.inspect_into(range.end, out, seen);
            }
            ObjectKind::Class(_) => out.push_str(&self.class_name(r)),
            ObjectKind::Proc(_) => {
                let lambda = if obj.flags.contains(ObjFlags::STRICT) { " (lambda)" } else { "" };
                write!(out, "#<Proc:{:#x}{}>", object_id(r), lambda).unwrap_or_default()
            }
            ObjectKind::Fiber(f) => {
                write!(out, "#<Fiber:{:#x} ({})>", object_id(r), f.state).unwrap_or_default()
            }
            ObjectKind::Exception(e) => {
                let msg = self.string_lossy(e.message).unwrap_or_else(|| class.clone());
                write!(out, "#<{}: {}>", class, msg).unwrap_or_default()
            }
            ObjectKind::Data(d) => write!(out, "#<{}:{}>", class, d.type_name).unwrap_or_default(),
            ObjectKind::Object | ObjectKind::Env(_) | ObjectKind::Break(_) => {
                seen.push(r);
                write!(out, "#<{}", class).unwrap_or_default();
                for (i, (name, value)) in obj.ivars.iter().enumerate() {
                    out.push_str(if i == 0 { " " } else { ", " });
                    write!(out, "{}=", self.symbols.name(*name)).unwrap_or_default();
                    self.inspect_into(*value, out, seen);
                }
                out.push('>');
                seen.pop();
            }
        }
    }

    /// Raise unless `v` is a class or module.
    pub(crate) fn expect_module(&mut self, v: Value) -> VmResult<ObjRef> {
        match v {
            Value::Object(r) if self.heap.get(r).as_class().is_some() => Ok(r),
            _ => {
                let msg = format!("{} is not a class/module", self.inspect(v));
                Err(self.type_error(msg))
            }
        }
    }

    pub(crate) fn expect_proc(&mut self, v: Value) -> VmResult<ObjRef> {
        match v {
            Value::Object(r) if self.heap.get(r).as_proc().is_some() => Ok(r),
            _ => {
                let msg = format!("wrong argument type {} (expected Proc)", self.type_name(v));
                Err(self.type_error(msg))
            }
        }
    }

    /// Keep `v` alive until the running native method returns.
    pub fn protect(&mut self, v: Value) -> Value {
        self.heap.protect(v);
        v
    }

    pub(crate) fn fatal(msg: impl Into<String>) -> Error {
        Error::Fatal(msg.into())
    }
}

/// Floats print with at least one fractional digit.
pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".into()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.into()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}
