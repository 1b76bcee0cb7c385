//! Non-local exits: exception dispatch, returns and breaks through ensure
//! clauses, and frame popping.

use garnet_bytecode::CatchKind;

use super::frame::{CallInfo, Pending};
use super::{Exit, Vm};
use crate::error::{Error, Unwind, VmResult};
use crate::gc::ObjRef;
use crate::object::{BreakTag, EnvStorage, ObjectKind};
use crate::value::Value;

impl Vm {
    /// Pop the top frame, moving its captured locals off the stack.
    pub(crate) fn pop_frame(&mut self) -> Option<CallInfo> {
        let frame = self.ctx_mut().frames.pop()?;
        if let Some(env) = frame.env {
            self.detach_env(env);
        }
        Some(frame)
    }

    fn detach_env(&mut self, env: ObjRef) {
        let (ctx, base, len) = match self.heap.get(env).as_env().map(|e| &e.storage) {
            Some(EnvStorage::OnStack { ctx, base, len, .. }) => (*ctx, *base, *len),
            _ => return,
        };
        let values = self
            .contexts
            .get(ctx)
            .map(|c| {
                (base..base + len)
                    .map(|i| c.stack.get(i).copied().unwrap_or(Value::Nil))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(e) = self.heap.get_mut(env).as_env_mut() {
            e.storage = EnvStorage::Detached(values);
        }
        self.heap.grew(len * std::mem::size_of::<Value>());
    }

    /// The ensure handler of the top frame that covers its current pc.
    fn covering_ensure(&self) -> Option<(u32, u32, u32)> {
        let f = self.frame();
        let irep = f.irep.as_ref()?;
        irep.catch_handler(f.pc, Some(CatchKind::Ensure))
            .map(|h| (h.begin, h.end, h.target))
    }

    /// Divert the top frame into its ensure clause, carrying `record`.
    fn enter_ensure(&mut self, target: u32, record: ObjRef) {
        tracing::trace!(target, "running ensure clause");
        self.frame_mut().pc = target as usize;
        self.ctx_mut().pending = Some(Pending {
            value: record,
            kind: CatchKind::Ensure,
        });
    }

    /// Pop frames down to and including `target`, whose caller receives
    /// `value`. Ensure clauses on the way run first; the exit resumes from
    /// `RAISEIF` once they finish.
    pub(crate) fn return_jump(&mut self, target: usize, value: Value, stop: usize) -> VmResult<Option<Exit>> {
        loop {
            let top = self.ctx().frames.len() - 1;
            if let Some((_, _, handler)) = self.covering_ensure() {
                // leaving an ensure clause drops the exception it ran for
                self.frame_mut().errinfo = None;
                let record = self.new_break(BreakTag::Break { target }, value);
                self.enter_ensure(handler, record);
                return Ok(None);
            }
            let frame = self.pop_frame().expect("unwinding past the bottom frame");
            if top == target {
                if top == stop {
                    return Ok(Some(Exit::Return(value)));
                }
                let ctx = self.ctx_mut();
                ctx.ensure_stack(frame.base + 1);
                ctx.stack[frame.base] = value;
                return Ok(None);
            }
            if top == stop {
                return Err(Error::Unwind(Unwind { target, value }));
            }
        }
    }

    /// Transfer control to the innermost handler for `exc`, popping frames
    /// that have none. Fails with the exception once frame `stop` is popped.
    pub(crate) fn handle_raise(&mut self, exc: ObjRef, stop: usize) -> VmResult<()> {
        self.fill_backtrace(exc);
        loop {
            let top = self.ctx().frames.len() - 1;
            let (errinfo, handler) = {
                let f = self.frame();
                let handler = f
                    .irep
                    .as_ref()
                    .and_then(|irep| irep.catch_handler(f.pc, None).copied());
                (f.errinfo, handler)
            };
            // a raise from inside an ensure clause replaces the exception the
            // clause was running for
            if let Some(prev) = errinfo.filter(|&p| p != exc) {
                if let Some(e) = self.heap.get_mut(exc).as_exception_mut() {
                    if e.cause.is_none() {
                        e.cause = Some(prev);
                    }
                }
            }
            if let Some(h) = handler {
                tracing::trace!(kind = ?h.kind, target = h.target, "dispatching to catch handler");
                self.frame_mut().pc = h.target as usize;
                self.ctx_mut().pending = Some(Pending {
                    value: exc,
                    kind: h.kind,
                });
                return Ok(());
            }
            self.pop_frame();
            if top == stop {
                return Err(Error::Raise(exc));
            }
        }
    }

    /// `JMPUW`: jump to `target`, first running every ensure clause the jump
    /// leaves.
    pub(crate) fn op_jmpuw(&mut self, target: usize) -> VmResult<()> {
        if let Some((begin, end, handler)) = self.covering_ensure() {
            if target < begin as usize || target >= end as usize {
                let record = self.new_break(BreakTag::Jump { pc: target }, Value::Nil);
                self.enter_ensure(handler, record);
                return Ok(());
            }
        }
        self.ctx_mut().pending = None;
        let frame = self.frame_mut();
        frame.errinfo = None;
        frame.pc = target;
        Ok(())
    }

    /// `RAISEIF`: at the end of an ensure clause, resume whatever exit it
    /// intercepted.
    pub(crate) fn op_raise_if(&mut self, v: Value, stop: usize) -> VmResult<Option<Exit>> {
        self.frame_mut().errinfo = None;
        let r = match v {
            Value::Nil => return Ok(None),
            Value::Object(r) => r,
            _ => return Err(self.type_error("exception object expected")),
        };
        match &self.heap.get(r).kind {
            ObjectKind::Exception(_) => Err(Error::Raise(r)),
            ObjectKind::Break(b) => match b.tag {
                BreakTag::Break { target } => {
                    let value = b.value;
                    self.return_jump(target, value, stop)
                }
                BreakTag::Jump { pc } => self.op_jmpuw(pc).map(|()| None),
            },
            _ => Err(self.type_error("exception object expected")),
        }
    }

    /// `BREAK`: leave the block and the method that yielded to it.
    pub(crate) fn op_break(&mut self, v: Value, stop: usize) -> VmResult<Option<Exit>> {
        let proc = self.frame().proc;
        let top = self.ctx().frames.len() - 1;
        let env = match proc {
            Some(p) if self.is_strict(p) => return self.return_jump(top, v, stop),
            Some(p) => self.heap.get(p).as_proc().and_then(|p| p.env),
            None => None,
        };
        let frames = &self.ctx().frames;
        let home = env.and_then(|e| frames.iter().rposition(|f| f.env == Some(e)));
        match home {
            Some(j) if j + 1 < frames.len() => self.return_jump(j + 1, v, stop),
            _ => Err(self.local_jump_error("break from proc-closure")),
        }
    }

    /// `RETURN_BLK`: return from the method the block was written in.
    pub(crate) fn op_return_blk(&mut self, v: Value, stop: usize) -> VmResult<Option<Exit>> {
        let top = self.ctx().frames.len() - 1;
        let mut p = match self.frame().proc {
            Some(p) if !self.is_strict(p) => p,
            _ => return self.return_jump(top, v, stop),
        };
        // the outermost non-strict proc holds the env of the home method
        loop {
            let upper = self.heap.get(p).as_proc().and_then(|p| p.upper);
            match upper {
                Some(u) if !self.is_strict(u) => p = u,
                _ => break,
            }
        }
        let env = match self.heap.get(p).as_proc().and_then(|p| p.env) {
            Some(e) => e,
            None => return self.return_jump(top, v, stop),
        };
        let home = self.ctx().frames.iter().rposition(|f| f.env == Some(env));
        match home {
            Some(j) => self.return_jump(j, v, stop),
            None => Err(self.local_jump_error("unexpected return")),
        }
    }

    /// Record where `exc` was raised, unless it already knows.
    pub(crate) fn fill_backtrace(&mut self, exc: ObjRef) {
        let missing = self
            .heap
            .get(exc)
            .as_exception()
            .map_or(false, |e| e.backtrace.is_none());
        if missing {
            let bt = self.backtrace_here();
            if let Some(e) = self.heap.get_mut(exc).as_exception_mut() {
                e.backtrace = Some(bt);
            }
        }
    }

    /// `label@pc` for every frame of the running context, innermost first.
    pub(crate) fn backtrace_here(&self) -> Vec<String> {
        self.ctx()
            .frames
            .iter()
            .rev()
            .map(|f| {
                let name = f.method_id.map(|m| self.symbol_name(m));
                if f.is_native() {
                    return format!("{}@native", name.unwrap_or("?"));
                }
                let label = name.unwrap_or("<main>");
                match f.proc {
                    Some(p) if !self.is_strict(p) => format!("block in {}@{}", label, f.pc),
                    _ => format!("{}@{}", label, f.pc),
                }
            })
            .collect()
    }
}
