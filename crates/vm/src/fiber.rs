//! Fibers: coroutines running on their own register stack.
//!
//! A fiber owns a [`Context`] of its own. `resume` makes that context current
//! and runs an interpreter loop on it until the fiber yields or finishes;
//! `Fiber.yield` leaves its native frame on top of the fiber's stack, which
//! the next `resume` pops and completes with the resumed value.
//!
//! [`Context`]: crate::vm::frame::Context

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll, Waker};

use crate::args::Args;
use crate::error::{Error, VmResult};
use crate::gc::{ObjRef, Trace, Tracer};
use crate::object::{ObjectKind, RObject};
use crate::value::Value;
use crate::vm::frame::{Context, ContextId};
use crate::vm::{Exit, Vm};

#[cfg(test)]
mod test;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Not resumed yet
    Created,
    Running,
    /// Running, but waiting for a fiber it resumed
    Resumed,
    /// Waiting in `Fiber.yield`
    Suspended,
    /// The body returned
    Dead,
    /// The body raised
    Error,
}

impl FiberState {
    pub fn is_alive(self) -> bool {
        !matches!(self, FiberState::Dead | FiberState::Error)
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FiberState::Created => "created",
            FiberState::Running => "running",
            FiberState::Resumed => "resumed",
            FiberState::Suspended => "suspended",
            FiberState::Dead => "terminated",
            FiberState::Error => "terminated with error",
        })
    }
}

/// Observers of a fiber, shared with the futures handed out to hosts.
#[derive(Debug, Default)]
pub(crate) struct FiberHooks {
    /// Completed resume cycles
    cycles: u64,
    /// Final state once the fiber ended
    finished: Option<FiberState>,
    resume_wakers: Vec<Waker>,
    termination_wakers: Vec<Waker>,
}

impl FiberHooks {
    fn cycle_done(&mut self, state: FiberState) {
        self.cycles += 1;
        if !state.is_alive() {
            self.finished = Some(state);
            self.termination_wakers.drain(..).for_each(Waker::wake);
        }
        self.resume_wakers.drain(..).for_each(Waker::wake);
    }
}

fn register(wakers: &mut Vec<Waker>, waker: &Waker) {
    if !wakers.iter().any(|w| w.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

pub struct RFiber {
    pub(crate) ctx: ContextId,
    /// The body block
    pub(crate) proc: ObjRef,
    pub state: FiberState,
    pub(crate) hooks: Rc<RefCell<FiberHooks>>,
}

impl Trace for RFiber {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark(self.proc);
        tracer.mark_context(self.ctx);
    }
}

/// Completes once the fiber finishes its next resume cycle, or right away if
/// it can no longer be resumed.
#[must_use = "futures do nothing unless polled"]
pub struct ResumeWaiter {
    hooks: Rc<RefCell<FiberHooks>>,
    after: u64,
}

impl Future for ResumeWaiter {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let mut hooks = self.hooks.borrow_mut();
        if hooks.cycles > self.after || hooks.finished.is_some() {
            return Poll::Ready(());
        }
        register(&mut hooks.resume_wakers, cx.waker());
        Poll::Pending
    }
}

/// Completes with the final state, [`FiberState::Dead`] or
/// [`FiberState::Error`], once the fiber ends.
#[must_use = "futures do nothing unless polled"]
pub struct TerminationWaiter {
    hooks: Rc<RefCell<FiberHooks>>,
}

impl Future for TerminationWaiter {
    type Output = FiberState;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<FiberState> {
        let mut hooks = self.hooks.borrow_mut();
        if let Some(state) = hooks.finished {
            return Poll::Ready(state);
        }
        register(&mut hooks.termination_wakers, cx.waker());
        Poll::Pending
    }
}

/// Values passed through `resume` and `yield`: none is nil, one is itself,
/// several become an array.
fn pack(vm: &mut Vm, values: &[Value]) -> Value {
    match values {
        [] => Value::Nil,
        [v] => *v,
        vs => vm.new_array(vs.to_vec()),
    }
}

impl Vm {
    /// Create a fiber running `block` on first resume.
    pub fn new_fiber(&mut self, block: Value) -> VmResult<Value> {
        let proc = self.expect_proc(block)?;
        let ctx = self
            .contexts
            .insert(Context::new(None, self.config.initial_stack));
        let fiber = RFiber {
            ctx,
            proc,
            state: FiberState::Created,
            hooks: Default::default(),
        };
        let class = self.core.fiber;
        let r = self
            .heap
            .alloc(RObject::new(class, ObjectKind::Fiber(Box::new(fiber))));
        self.contexts[ctx].owner = Some(r);
        Ok(Value::Object(r))
    }

    fn expect_fiber(&mut self, v: Value) -> VmResult<ObjRef> {
        match v {
            Value::Object(r) if self.heap.get(r).as_fiber().is_some() => Ok(r),
            _ => {
                let msg = format!("wrong argument type {} (expected Fiber)", self.type_name(v));
                Err(self.type_error(msg))
            }
        }
    }

    fn fiber_mut(&mut self, r: ObjRef) -> &mut RFiber {
        self.heap.get_mut(r).as_fiber_mut().expect("expected a fiber")
    }

    fn set_fiber_state(&mut self, r: ObjRef, state: FiberState) {
        tracing::debug!(fiber = ?r, %state, "fiber state changed");
        self.fiber_mut(r).state = state;
    }

    /// State of `fiber`, or `None` if it is not a fiber.
    pub fn fiber_state(&self, fiber: Value) -> Option<FiberState> {
        Some(self.heap.get(fiber.as_object()?).as_fiber()?.state)
    }

    /// Run `fiber` until it yields or finishes. The first resume passes
    /// `args` to the body block; later ones make them the value of the
    /// pending `Fiber.yield`.
    pub fn resume(&mut self, fiber: Value, args: &[Value]) -> VmResult<Value> {
        let r = self.expect_fiber(fiber)?;
        let (state, ctx, proc) = {
            let f = self.heap.get(r).as_fiber().expect("checked above");
            (f.state, f.ctx, f.proc)
        };
        match state {
            FiberState::Running | FiberState::Resumed => {
                return Err(self.fiber_error("double resume"))
            }
            FiberState::Dead | FiberState::Error => {
                return Err(self.fiber_error("resuming dead fiber"))
            }
            FiberState::Created | FiberState::Suspended => {}
        }
        if self.resumers.len() >= self.config.max_call_depth {
            return Err(self.stack_error());
        }
        self.check_native_depth()?;

        if let Some(outer) = self.current_fiber {
            self.set_fiber_state(outer, FiberState::Resumed);
        }
        self.resumers.push((self.current, self.current_fiber));
        self.current = ctx;
        self.current_fiber = Some(r);
        self.set_fiber_state(r, FiberState::Running);

        let entered = if state == FiberState::Created {
            self.enter_fiber_body(proc, args)
        } else {
            let frame = self.pop_frame().expect("suspended fiber without a yield frame");
            let v = pack(self, args);
            self.set_reg(frame.base, 0, v);
            Ok(())
        };
        let outcome = entered.and_then(|()| self.reenter(|vm| vm.exec(0)));

        let (prev_ctx, prev_fiber) = self.resumers.pop().expect("resumer stack underflow");
        self.current = prev_ctx;
        self.current_fiber = prev_fiber;
        if let Some(outer) = prev_fiber {
            self.set_fiber_state(outer, FiberState::Running);
        }

        let (next, result) = match outcome {
            Ok(Exit::Yield(v)) => (FiberState::Suspended, Ok(v)),
            Ok(Exit::Return(v)) => (FiberState::Dead, Ok(v)),
            Err(Error::Unwind(_)) => {
                let e = self.local_jump_error("break from proc-closure");
                (FiberState::Error, Err(e))
            }
            Err(e) => (FiberState::Error, Err(e)),
        };
        self.set_fiber_state(r, next);
        if !next.is_alive() {
            self.contexts.remove(ctx);
        }
        let hooks = self.fiber_mut(r).hooks.clone();
        hooks.borrow_mut().cycle_done(next);
        result
    }

    /// Push the body frame of a fresh fiber onto its own stack.
    fn enter_fiber_body(&mut self, proc: ObjRef, args: &[Value]) -> VmResult<()> {
        let env = self.heap.get(proc).as_proc().and_then(|p| p.env);
        let (this, mid, owner) = match env {
            Some(e) => {
                let record = self.heap.get(e).as_env().expect("expected an env");
                let (mid, owner) = (record.mid, record.owner);
                (self.env_get(e, 0), mid, owner)
            }
            None => (self.main_object(), None, None),
        };
        let site = self.lay_out_args(0, this, &Args::new(args.to_vec()));
        self.push_proc_frame(site, proc, None, None, Value::Nil, true)?;
        let f = self.frame_mut();
        f.method_id = mid;
        f.owner = owner;
        Ok(())
    }

    /// Body of `Fiber.yield`. The value reaches the resumer once the native
    /// frame returns.
    pub(crate) fn yield_fiber(&mut self, args: &Args) -> VmResult<Value> {
        if self.current_fiber.is_none() {
            return Err(self.fiber_error("can't yield from root fiber"));
        }
        let frames = &self.ctx().frames;
        let crosses = frames[1..frames.len() - 1]
            .iter()
            .any(|f| f.is_native() || f.boundary);
        if crosses {
            return Err(self.fiber_error("can't cross native function boundary"));
        }
        let v = pack(self, args.positional());
        self.fiber_yield = Some(v);
        Ok(Value::Nil)
    }

    /// A future completing after the next resume cycle of `fiber` finishes.
    pub fn resume_waiter(&mut self, fiber: Value) -> VmResult<ResumeWaiter> {
        let r = self.expect_fiber(fiber)?;
        let hooks = self.fiber_mut(r).hooks.clone();
        let after = hooks.borrow().cycles;
        Ok(ResumeWaiter { hooks, after })
    }

    /// A future completing once `fiber` is dead.
    pub fn termination_waiter(&mut self, fiber: Value) -> VmResult<TerminationWaiter> {
        let r = self.expect_fiber(fiber)?;
        let hooks = self.fiber_mut(r).hooks.clone();
        Ok(TerminationWaiter { hooks })
    }
}
