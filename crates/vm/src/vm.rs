//! The virtual machine instance and its host-facing entry points.

mod arith;
mod call;
mod exec;
pub(crate) mod frame;
mod unwind;
mod values;

#[cfg(test)]
mod test;

use std::sync::Arc;

use fnv::FnvHashMap;
use garnet_bytecode::{Irep, IrepBuilder, OpCode};
use slotmap::SlotMap;

use crate::args::Args;
use crate::class::MethodCache;
use crate::config::VmConfig;
use crate::core::CoreClasses;
use crate::error::{Error, VmResult};
use crate::gc::{GcStats, Heap, ObjRef, Persistent, Tracer};
use crate::object::ObjectKind;
use crate::symbol::{Symbol, SymbolTable};
use crate::value::Value;

use frame::{CallInfo, Context, ContextId};

pub(crate) use arith::{fast_eq, int_neg, numeric_cmp, ArithOp, CmpOp};
pub(crate) use values::format_float;

/// How an interpreter loop finished.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Exit {
    /// The stop frame returned
    Return(Value),
    /// The running fiber yielded
    Yield(Value),
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) symbols: SymbolTable,

    pub(crate) contexts: SlotMap<ContextId, Context>,
    pub(crate) root_ctx: ContextId,
    /// Context whose top frame is executing
    pub(crate) current: ContextId,
    pub(crate) current_fiber: Option<ObjRef>,
    /// Contexts suspended in `resume`, innermost last
    pub(crate) resumers: Vec<(ContextId, Option<ObjRef>)>,
    /// Value handed over by `Fiber.yield`, picked up by the `SEND` that
    /// called it
    pub(crate) fiber_yield: Option<Value>,
    /// Interpreter loops currently nested on the host stack
    pub(crate) native_depth: usize,

    pub(crate) globals: FnvHashMap<Symbol, Value>,
    pub(crate) core: CoreClasses,
    pub(crate) method_cache: MethodCache,
    pub(crate) config: VmConfig,

    /// Body of `Proc#call`: a single `CALL`
    pub(crate) call_irep: Arc<Irep>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Vm {
        let mut contexts = SlotMap::with_key();
        let root_ctx = contexts.insert(Context::new(None, config.initial_stack));
        let mut b = IrepBuilder::new(1, 2);
        b.op(OpCode::Call);
        let mut vm = Vm {
            heap: Heap::new(config.gc),
            symbols: SymbolTable::new(),
            contexts,
            root_ctx,
            current: root_ctx,
            current_fiber: None,
            resumers: vec![],
            fiber_yield: None,
            native_depth: 0,
            globals: FnvHashMap::default(),
            core: CoreClasses::default(),
            method_cache: MethodCache::default(),
            config,
            call_irep: b.build(),
        };
        crate::core::init(&mut vm).expect("core classes failed to boot");
        // boot objects are reachable from `Object`
        vm.heap.arena_restore(0);
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    /// Intern a name that need not be UTF-8.
    pub fn intern_bytes(&mut self, name: &[u8]) -> Symbol {
        self.symbols.intern_bytes(name)
    }

    /// Printable name of `sym`; invalid UTF-8 is replaced.
    pub fn symbol_name(&self, sym: Symbol) -> &str {
        self.symbols.name(sym)
    }

    pub fn symbol_bytes(&self, sym: Symbol) -> &[u8] {
        self.symbols.bytes(sym)
    }

    /// The `Object` class
    pub fn object_class(&self) -> ObjRef {
        self.core.object
    }

    /// The top-level `self`
    pub fn main_object(&self) -> Value {
        Value::Object(self.core.main)
    }

    pub(crate) fn ctx(&self) -> &Context {
        &self.contexts[self.current]
    }

    pub(crate) fn ctx_mut(&mut self) -> &mut Context {
        &mut self.contexts[self.current]
    }

    pub(crate) fn frame(&self) -> &CallInfo {
        self.ctx().frames.last().expect("no active frame")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut CallInfo {
        self.ctx_mut().frames.last_mut().expect("no active frame")
    }

    /// Load a RITE binary and run its top-level code with the main object as
    /// `self`.
    pub fn load(&mut self, bin: &[u8]) -> VmResult<Value> {
        let irep = garnet_bytecode::load(bin)?;
        tracing::debug!(units = irep.unit_count(), "loaded bytecode");
        self.run(irep)
    }

    /// Load a RITE binary and run it as the body of `target`, like a class
    /// definition.
    pub fn load_into(&mut self, bin: &[u8], target: ObjRef) -> VmResult<Value> {
        let irep = garnet_bytecode::load(bin)?;
        tracing::debug!(units = irep.unit_count(), "loaded bytecode");
        self.exec_toplevel(irep, Value::Object(target), target)
    }

    pub fn run(&mut self, irep: Arc<Irep>) -> VmResult<Value> {
        irep.validate()?;
        let main = self.main_object();
        let object = self.core.object;
        self.exec_toplevel(irep, main, object)
    }

    fn exec_toplevel(&mut self, irep: Arc<Irep>, this: Value, target: ObjRef) -> VmResult<Value> {
        let proc = self.new_proc(irep.clone(), None, None, target, true);
        let base = self.ctx().stack_top();
        let stop = self.ctx().frames.len();
        self.check_depth()?;
        self.check_native_depth()?;
        let top = base + (irep.nregs as usize).max(1);
        let ctx = self.ctx_mut();
        ctx.ensure_stack(top);
        ctx.stack[base..top].fill(Value::Nil);
        ctx.stack[base] = this;
        ctx.frames.push(CallInfo {
            base,
            top,
            proc: Some(proc),
            irep: Some(irep),
            pc: 0,
            argc: 0,
            kw: false,
            method_id: None,
            owner: None,
            target_class: target,
            env: None,
            boundary: true,
            errinfo: None,
            kdict: None,
            block: Value::Nil,
        });
        let r = self.reenter(|vm| vm.exec(stop));
        self.finish_call(r)
    }

    /// Translate the result of a nested interpreter loop for a host caller.
    pub(crate) fn finish_call(&mut self, r: VmResult<Exit>) -> VmResult<Value> {
        match r {
            Ok(Exit::Return(v)) => Ok(v),
            Ok(Exit::Yield(_)) => Err(Error::Fatal("fiber yielded across a host call".into())),
            Err(Error::Unwind(u)) if u.target >= self.ctx().frames.len() => {
                Err(self.local_jump_error("break from proc-closure"))
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn check_depth(&mut self) -> VmResult<()> {
        if self.ctx().frames.len() >= self.config.max_call_depth {
            return Err(self.stack_error());
        }
        Ok(())
    }

    pub(crate) fn check_native_depth(&mut self) -> VmResult<()> {
        if self.native_depth >= self.config.max_native_depth {
            return Err(self.stack_error());
        }
        Ok(())
    }

    /// Run `f` one host-level nesting deeper. The counter is restored on
    /// every return path.
    pub(crate) fn reenter<T>(&mut self, f: impl FnOnce(&mut Vm) -> VmResult<T>) -> VmResult<T> {
        self.check_native_depth()?;
        self.native_depth += 1;
        let r = f(self);
        self.native_depth -= 1;
        r
    }

    /// Call `name` on `recv` with positional arguments.
    pub fn funcall(&mut self, recv: Value, name: &str, args: &[Value]) -> VmResult<Value> {
        let sym = self.intern(name);
        self.call_with_args(recv, sym, &Args::new(args.to_vec()))
    }

    pub fn funcall_with_block(
        &mut self,
        recv: Value,
        name: &str,
        args: &[Value],
        block: Value,
    ) -> VmResult<Value> {
        let sym = self.intern(name);
        self.call_with_args(recv, sym, &Args::new(args.to_vec()).with_block(block))
    }

    /// Call a proc the way `yield` does.
    pub fn call_proc(&mut self, proc: Value, args: &[Value]) -> VmResult<Value> {
        self.call_with_args(proc, crate::symbol::sym::CALL, &Args::new(args.to_vec()))
    }

    /// Pin `value` as a GC root until [`unpin`](Self::unpin).
    pub fn pin(&mut self, value: Value) -> Persistent {
        self.heap.pin(value)
    }

    pub fn unpin(&mut self, p: Persistent) {
        self.heap.unpin(p)
    }

    pub fn arena_save(&self) -> usize {
        self.heap.arena_save()
    }

    /// Release the temporaries allocated since `mark`. Values still needed
    /// must be stored somewhere reachable first.
    pub fn arena_restore(&mut self, mark: usize) {
        self.heap.arena_restore(mark)
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    /// Run a full collection now.
    pub fn gc_collect(&mut self) {
        let mut tracer = Tracer::default();
        self.heap.trace_roots(&mut tracer);
        tracer.mark_context(self.root_ctx);
        tracer.mark_context(self.current);
        tracer.mark_opt(self.current_fiber);
        for &(ctx, fiber) in &self.resumers {
            tracer.mark_context(ctx);
            tracer.mark_opt(fiber);
        }
        if let Some(v) = self.fiber_yield {
            tracer.mark_value(v);
        }
        tracer.mark_values(self.globals.values());
        self.core.trace(&mut tracer);

        self.heap.mark(&mut tracer, &self.contexts);
        let freed = self.heap.sweep();
        // cached `Method::Proc` handles are not roots
        self.method_cache.clear();
        for obj in freed {
            self.release_object(obj.kind);
        }
    }

    fn release_object(&mut self, kind: ObjectKind) {
        match kind {
            ObjectKind::Data(mut d) => d.release(),
            ObjectKind::Fiber(f) => {
                self.contexts.remove(f.ctx);
            }
            _ => {}
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        for obj in self.heap.drain() {
            if let ObjectKind::Data(mut d) = obj.kind {
                d.release();
            }
        }
    }
}
