use std::sync::Arc;

use garnet_bytecode::{CatchKind, Irep};

use crate::gc::{ObjRef, Trace, Tracer};
use crate::symbol::Symbol;
use crate::value::Value;

slotmap::new_key_type! {
    /// An execution context: the root context or the one owned by a fiber.
    pub struct ContextId;
}

/// Number of positional arguments meaning "packed into one array".
pub(crate) const PACKED: u8 = 15;

/// One activation record.
#[derive(Debug, Clone)]
pub(crate) struct CallInfo {
    /// Stack index of `R[0]`
    pub base: usize,
    /// One past the highest register of this frame
    pub top: usize,
    pub proc: Option<ObjRef>,
    /// `None` for a native method
    pub irep: Option<Arc<Irep>>,
    /// Address of the next instruction
    pub pc: usize,
    /// Positional argument count as passed, [`PACKED`] for a splat array
    pub argc: u8,
    /// Whether a keyword hash follows the positional arguments
    pub kw: bool,
    pub method_id: Option<Symbol>,
    /// Class the running method was found in
    pub owner: Option<ObjRef>,
    /// Where `def`, constants and class variables resolve
    pub target_class: ObjRef,
    /// Captured locals, created on first closure creation
    pub env: Option<ObjRef>,
    /// Pushed by a host-level call, which runs its own interpreter loop
    pub boundary: bool,
    /// Exception whose ensure clause is running in this frame
    pub errinfo: Option<ObjRef>,
    /// Register holding the keyword dictionary, set by `ENTER`
    pub kdict: Option<usize>,
    pub block: Value,
}

impl CallInfo {
    pub fn is_native(&self) -> bool {
        self.irep.is_none()
    }
}

/// An exception or break record waiting for `EXCEPT` at a handler.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pending {
    pub value: ObjRef,
    pub kind: CatchKind,
}

/// A register stack and the frames running on it.
#[derive(Debug, Default)]
pub(crate) struct Context {
    pub stack: Vec<Value>,
    pub frames: Vec<CallInfo>,
    pub pending: Option<Pending>,
    /// The fiber running on this context, `None` for the root context
    pub owner: Option<ObjRef>,
}

impl Context {
    pub fn new(owner: Option<ObjRef>, initial_stack: usize) -> Context {
        Context {
            stack: Vec::with_capacity(initial_stack),
            frames: vec![],
            pending: None,
            owner,
        }
    }

    /// First free stack slot above every frame.
    pub fn stack_top(&self) -> usize {
        self.frames.iter().map(|f| f.top).max().unwrap_or(0)
    }

    pub fn ensure_stack(&mut self, len: usize) {
        if self.stack.len() < len {
            self.stack.resize(len, Value::Nil);
        }
    }
}

impl Trace for Context {
    fn trace(&self, tracer: &mut Tracer) {
        let live = self.stack_top().min(self.stack.len());
        tracer.mark_values(&self.stack[..live]);
        for f in &self.frames {
            tracer.mark_opt(f.proc);
            tracer.mark_opt(f.owner);
            tracer.mark(f.target_class);
            tracer.mark_opt(f.env);
            tracer.mark_opt(f.errinfo);
            tracer.mark_value(f.block);
        }
        if let Some(p) = self.pending {
            tracer.mark(p.value);
        }
        tracer.mark_opt(self.owner);
    }
}
