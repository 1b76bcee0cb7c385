//! Tracing garbage collection over an arena of heap objects.
//!
//! Objects live in a generational slot map and are referred to by [`ObjRef`]
//! handles. A handle to a reclaimed slot never resolves again, so a stale
//! handle is detected instead of aliasing a newer object.

pub mod alloc;
#[cfg(test)]
mod test;

use modular_bitfield::prelude::*;

use crate::value::Value;
use crate::vm::frame::ContextId;

pub use alloc::{GcStats, Heap, Persistent, RootSetHandle};

slotmap::new_key_type! {
    /// A handle to a heap object.
    pub struct ObjRef;
}

/// Tri-color marking state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
#[bits = 2]
pub enum GcColor {
    /// Not yet reached during the current cycle
    White,
    /// Reached, children being scanned
    Gray,
    /// Reached and fully scanned
    Black,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    pub color: GcColor,
    /// Number of collections this object survived, saturating
    pub age: B6,
}

impl GcHeader {
    pub(crate) fn survive(&mut self) {
        let age = self.age();
        if age < 0b11_1111 {
            self.set_age(age + 1);
        }
        self.set_color(GcColor::White);
    }
}

/// Types holding references the collector must follow.
pub trait Trace {
    fn trace(&self, tracer: &mut Tracer);
}

/// Worklist of objects and fiber contexts reached but not yet scanned.
#[derive(Debug, Default)]
pub struct Tracer {
    pub(crate) objects: Vec<ObjRef>,
    pub(crate) contexts: Vec<ContextId>,
}

impl Tracer {
    pub fn mark(&mut self, obj: ObjRef) {
        self.objects.push(obj);
    }

    pub fn mark_value(&mut self, v: Value) {
        if let Value::Object(obj) = v {
            self.mark(obj)
        }
    }

    pub fn mark_opt(&mut self, obj: Option<ObjRef>) {
        if let Some(obj) = obj {
            self.mark(obj)
        }
    }

    pub fn mark_values<'a>(&mut self, vs: impl IntoIterator<Item = &'a Value>) {
        for v in vs {
            self.mark_value(*v)
        }
    }

    pub(crate) fn mark_context(&mut self, ctx: ContextId) {
        self.contexts.push(ctx);
    }
}

impl Trace for Value {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark_value(*self)
    }
}
