//! Heap object records.

pub mod hash;
pub mod proc;

use std::any::Any;
use std::fmt;
use std::mem::size_of;

use bitflags::bitflags;

use crate::class::RClass;
use crate::fiber::RFiber;
use crate::gc::{ObjRef, Trace, Tracer};
use crate::symbol::Symbol;
use crate::value::{Value, ValueType};

pub use hash::RHash;
pub use proc::{EnvStorage, REnv, RProc};

bitflags! {
    pub struct ObjFlags: u8 {
        const FROZEN = 0b0001;
        /// The class is the singleton class of a single object
        const SINGLETON = 0b0010;
        /// Methods and lambdas: strict arity, `return` leaves the proc itself
        const STRICT = 0b0100;
    }
}

pub struct RObject {
    pub class: ObjRef,
    pub flags: ObjFlags,
    /// Instance variables in definition order
    pub ivars: Vec<(Symbol, Value)>,
    pub kind: ObjectKind,
}

pub enum ObjectKind {
    /// An instance with instance variables only
    Object,
    String(Vec<u8>),
    Array(Vec<Value>),
    Hash(RHash),
    Range(RRange),
    Class(Box<RClass>),
    Proc(RProc),
    Env(REnv),
    Fiber(Box<RFiber>),
    Exception(RException),
    Data(RData),
    Break(RBreak),
}

/// Which kind of record `Class#new` allocates for a class and its
/// descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Object,
    String,
    Array,
    Hash,
    Exception,
    /// Instances are only created natively
    Special,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RRange {
    pub begin: Value,
    pub end: Value,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RException {
    /// A string, or nil for the class name
    pub message: Value,
    pub cause: Option<ObjRef>,
    /// `method@pc` entries, innermost first; `None` until raised
    pub backtrace: Option<Vec<String>>,
    /// Receiver and method name of a `NoMethodError`
    pub receiver: Option<Value>,
    pub name: Option<Symbol>,
}

pub type ReleaseFn = Box<dyn FnOnce(Box<dyn Any>)>;

/// Host-owned payload.
pub struct RData {
    pub type_name: &'static str,
    pub(crate) payload: Option<Box<dyn Any>>,
    pub(crate) release: Option<ReleaseFn>,
}

impl RData {
    /// Hand the payload to the release callback. Does nothing the second time.
    pub(crate) fn release(&mut self) {
        let payload = self.payload.take();
        if let (Some(payload), Some(release)) = (payload, self.release.take()) {
            release(payload)
        }
    }
}

/// Where a pending non-local exit resumes once the ensure clause that
/// intercepted it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakTag {
    /// Pop frames up to and including `target`, whose caller receives the value
    Break { target: usize },
    /// Continue at `pc` in the current frame
    Jump { pc: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct RBreak {
    pub tag: BreakTag,
    pub value: Value,
}

impl RObject {
    pub fn new(class: ObjRef, kind: ObjectKind) -> RObject {
        RObject {
            class,
            flags: ObjFlags::empty(),
            ivars: vec![],
            kind,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.flags.contains(ObjFlags::FROZEN)
    }

    pub fn ivar(&self, name: Symbol) -> Option<Value> {
        self.ivars.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
    }

    pub fn set_ivar(&mut self, name: Symbol, value: Value) {
        match self.ivars.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.ivars.push((name, value)),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match &self.kind {
            ObjectKind::Object | ObjectKind::Env(_) | ObjectKind::Break(_) => ValueType::Object,
            ObjectKind::String(_) => ValueType::String,
            ObjectKind::Array(_) => ValueType::Array,
            ObjectKind::Hash(_) => ValueType::Hash,
            ObjectKind::Range(_) => ValueType::Range,
            ObjectKind::Class(c) if c.is_module() => ValueType::Module,
            ObjectKind::Class(_) => ValueType::Class,
            ObjectKind::Proc(_) => ValueType::Proc,
            ObjectKind::Fiber(_) => ValueType::Fiber,
            ObjectKind::Exception(_) => ValueType::Exception,
            ObjectKind::Data(_) => ValueType::Data,
        }
    }

    /// Rough number of bytes this object keeps alive, for GC pacing.
    pub fn heap_size(&self) -> usize {
        let payload = match &self.kind {
            ObjectKind::String(s) => s.capacity(),
            ObjectKind::Array(a) => a.capacity() * size_of::<Value>(),
            ObjectKind::Hash(h) => h.capacity() * 3 * size_of::<Value>(),
            ObjectKind::Class(c) => size_of::<RClass>() + c.table_len() * 4 * size_of::<Value>(),
            ObjectKind::Env(e) => e.detached_len() * size_of::<Value>(),
            ObjectKind::Fiber(_) => size_of::<RFiber>(),
            ObjectKind::Exception(e) => e.backtrace.as_ref().map_or(0, |b| b.len() * 32),
            _ => 0,
        };
        size_of::<RObject>() + 8 + self.ivars.len() * size_of::<(Symbol, Value)>() + payload
    }

    pub fn as_class(&self) -> Option<&RClass> {
        match &self.kind {
            ObjectKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut RClass> {
        match &mut self.kind {
            ObjectKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&[u8]> {
        match &self.kind {
            ObjectKind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match &self.kind {
            ObjectKind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.kind {
            ObjectKind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&RHash> {
        match &self.kind {
            ObjectKind::Hash(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_proc(&self) -> Option<&RProc> {
        match &self.kind {
            ObjectKind::Proc(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_env(&self) -> Option<&REnv> {
        match &self.kind {
            ObjectKind::Env(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_env_mut(&mut self) -> Option<&mut REnv> {
        match &mut self.kind {
            ObjectKind::Env(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_exception(&self) -> Option<&RException> {
        match &self.kind {
            ObjectKind::Exception(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_exception_mut(&mut self) -> Option<&mut RException> {
        match &mut self.kind {
            ObjectKind::Exception(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_fiber(&self) -> Option<&RFiber> {
        match &self.kind {
            ObjectKind::Fiber(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_fiber_mut(&mut self) -> Option<&mut RFiber> {
        match &mut self.kind {
            ObjectKind::Fiber(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<&RRange> {
        match &self.kind {
            ObjectKind::Range(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_break(&self) -> Option<&RBreak> {
        match &self.kind {
            ObjectKind::Break(b) => Some(b),
            _ => None,
        }
    }
}

impl Trace for RObject {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark(self.class);
        for (_, v) in &self.ivars {
            tracer.mark_value(*v);
        }
        match &self.kind {
            ObjectKind::Object | ObjectKind::String(_) | ObjectKind::Data(_) => {}
            ObjectKind::Array(a) => tracer.mark_values(a),
            ObjectKind::Hash(h) => h.trace(tracer),
            ObjectKind::Range(r) => {
                tracer.mark_value(r.begin);
                tracer.mark_value(r.end);
            }
            ObjectKind::Class(c) => c.trace(tracer),
            ObjectKind::Proc(p) => p.trace(tracer),
            ObjectKind::Env(e) => e.trace(tracer),
            ObjectKind::Fiber(f) => f.trace(tracer),
            ObjectKind::Exception(e) => {
                tracer.mark_value(e.message);
                tracer.mark_opt(e.cause);
                if let Some(r) = e.receiver {
                    tracer.mark_value(r);
                }
            }
            ObjectKind::Break(b) => tracer.mark_value(b.value),
        }
    }
}

impl fmt::Debug for RObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RObject")
            .field("class", &self.class)
            .field("type", &self.value_type())
            .field("flags", &self.flags)
            .finish()
    }
}
