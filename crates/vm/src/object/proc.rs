use std::sync::Arc;

use garnet_bytecode::Irep;

use crate::gc::{ObjRef, Trace, Tracer};
use crate::symbol::Symbol;
use crate::value::Value;
use crate::vm::frame::ContextId;

/// A closure over a code unit.
#[derive(Debug, Clone)]
pub struct RProc {
    pub irep: Arc<Irep>,
    /// The proc whose frame created this one
    pub upper: Option<ObjRef>,
    /// Local variables of the creating frame
    pub env: Option<ObjRef>,
    /// Where `def` and constant assignment inside the body land
    pub target_class: Option<ObjRef>,
}

impl Trace for RProc {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark_opt(self.upper);
        tracer.mark_opt(self.env);
        tracer.mark_opt(self.target_class);
    }
}

/// Captured local variables of a frame.
///
/// While the frame is live the variables stay in its register window;
/// popping the frame copies them out.
#[derive(Debug, Clone)]
pub struct REnv {
    pub storage: EnvStorage,
    /// Method the frame was running, for `super` inside blocks
    pub mid: Option<Symbol>,
    /// Class the method was found in
    pub owner: Option<ObjRef>,
}

#[derive(Debug, Clone)]
pub enum EnvStorage {
    OnStack {
        ctx: ContextId,
        /// Fiber owning the context, `None` for the root context
        fiber: Option<ObjRef>,
        base: usize,
        len: usize,
    },
    Detached(Vec<Value>),
}

impl REnv {
    pub fn is_on_stack(&self) -> bool {
        matches!(self.storage, EnvStorage::OnStack { .. })
    }

    pub(crate) fn detached_len(&self) -> usize {
        match &self.storage {
            EnvStorage::Detached(v) => v.len(),
            EnvStorage::OnStack { .. } => 0,
        }
    }
}

impl Trace for REnv {
    fn trace(&self, tracer: &mut Tracer) {
        match &self.storage {
            EnvStorage::OnStack { ctx, fiber, .. } => {
                tracer.mark_context(*ctx);
                tracer.mark_opt(*fiber);
            }
            EnvStorage::Detached(vs) => tracer.mark_values(vs),
        }
        tracer.mark_opt(self.owner);
    }
}
