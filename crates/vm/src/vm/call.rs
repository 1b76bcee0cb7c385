//! Method dispatch and argument passing.
//!
//! A call site places the receiver in a register, followed by the positional
//! arguments (or a single packed array), an optional keyword hash and the
//! block slot. The callee frame starts at the receiver register.

use std::borrow::Cow;

use garnet_bytecode::ArgSpec;
use itertools::Itertools;

use super::frame::{CallInfo, PACKED};
use super::{Exit, Vm};
use crate::args::Args;
use crate::class::{Method, NativeFn};
use crate::error::{Error, VmResult};
use crate::gc::ObjRef;
use crate::symbol::{sym, Symbol};
use crate::value::Value;

/// Positional arguments a call passes in registers before packing them
const MAX_REG_ARGS: usize = 14;

/// Register layout of one call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallSite {
    /// Stack index of the receiver
    pub recv_at: usize,
    pub argc: u8,
    pub kw: bool,
}

impl CallSite {
    fn arg_slots(&self) -> usize {
        if self.argc == PACKED {
            1
        } else {
            self.argc as usize
        }
    }

    pub fn kw_at(&self) -> usize {
        self.recv_at + 1 + self.arg_slots()
    }

    pub fn block_at(&self) -> usize {
        self.kw_at() + self.kw as usize
    }
}

impl Vm {
    fn slot(&self, idx: usize) -> Value {
        self.ctx().stack.get(idx).copied().unwrap_or(Value::Nil)
    }

    fn set_slot(&mut self, idx: usize, v: Value) {
        let ctx = self.ctx_mut();
        ctx.ensure_stack(idx + 1);
        ctx.stack[idx] = v;
    }

    /// Bring the arguments of a `SEND`-style instruction into canonical form:
    /// keyword pairs packed into one hash and the block right after them.
    fn normalize_args(&mut self, recv_at: usize, c: u32, with_block: bool) -> VmResult<CallSite> {
        let argc = (c & 0xf) as u8;
        let kargc = ((c >> 4) & 0xf) as u8;
        let mut site = CallSite {
            recv_at,
            argc,
            kw: false,
        };
        let kw_at = site.kw_at();
        let block_src = match kargc {
            0 => kw_at,
            PACKED => kw_at + 1,
            n => kw_at + 2 * n as usize,
        };
        let block = if with_block {
            self.slot(block_src)
        } else {
            Value::Nil
        };
        match kargc {
            0 => {}
            PACKED => site.kw = !self.hash_is_empty(self.slot(kw_at)),
            n => {
                let flat: Vec<Value> = (0..2 * n as usize).map(|i| self.slot(kw_at + i)).collect();
                let h = self.new_hash_from_pairs(&flat);
                self.set_slot(kw_at, h);
                site.kw = true;
            }
        }
        if !block.is_nil() {
            self.expect_proc(block)?;
        }
        self.set_slot(site.block_at(), block);
        Ok(site)
    }

    pub(crate) fn op_send(
        &mut self,
        base: usize,
        a: u32,
        mid: Symbol,
        c: u32,
        self_call: bool,
        with_block: bool,
    ) -> VmResult<Option<Exit>> {
        let recv_at = base + a as usize;
        if self_call {
            let this = self.slot(base);
            self.set_slot(recv_at, this);
        }
        let site = self.normalize_args(recv_at, c, with_block)?;
        self.dispatch(site, mid)
    }

    fn dispatch(&mut self, site: CallSite, mid: Symbol) -> VmResult<Option<Exit>> {
        let recv = self.slot(site.recv_at);
        let class = self.class_of(recv);
        if let Some((method, owner)) = self.find_method(class, mid) {
            return self.call_method(site, method, owner, mid);
        }
        match self.find_method(class, sym::METHOD_MISSING) {
            Some((method, owner)) => {
                let site = self.pack_for_missing(site, mid);
                self.call_method(site, method, owner, sym::METHOD_MISSING)
            }
            None => Err(self.undefined_method(recv, mid)),
        }
    }

    /// Rewrite the arguments as `[name, *args]` for `method_missing`.
    fn pack_for_missing(&mut self, site: CallSite, mid: Symbol) -> CallSite {
        let mut items = vec![Value::Symbol(mid)];
        items.extend(self.site_positional(site));
        let kw = self.slot(site.kw_at());
        let block = self.slot(site.block_at());
        let packed = self.new_array(items);
        let out = CallSite {
            recv_at: site.recv_at,
            argc: PACKED,
            kw: site.kw,
        };
        self.set_slot(site.recv_at + 1, packed);
        if site.kw {
            self.set_slot(out.kw_at(), kw);
        }
        self.set_slot(out.block_at(), block);
        out
    }

    fn site_positional(&self, site: CallSite) -> Vec<Value> {
        let first = site.recv_at + 1;
        if site.argc == PACKED {
            self.array_items(self.slot(first))
                .map(<[Value]>::to_vec)
                .unwrap_or_default()
        } else {
            (first..first + site.argc as usize).map(|i| self.slot(i)).collect()
        }
    }

    pub(crate) fn undefined_method(&mut self, recv: Value, mid: Symbol) -> Error {
        let msg = format!(
            "undefined method '{}' for {}",
            self.symbol_name(mid),
            self.describe_receiver(recv)
        );
        self.no_method_error(msg, recv, mid)
    }

    fn describe_receiver(&self, recv: Value) -> String {
        match recv {
            Value::Nil => "nil".into(),
            Value::True => "true".into(),
            Value::False => "false".into(),
            Value::Object(r) if self.heap.get(r).as_class().is_some() => {
                let kind = if self.is_module(recv) { "module" } else { "class" };
                format!("{} {}", kind, self.class_name(r))
            }
            _ => format!("an instance of {}", self.type_name(recv)),
        }
    }

    fn call_method(
        &mut self,
        site: CallSite,
        method: Method,
        owner: ObjRef,
        mid: Symbol,
    ) -> VmResult<Option<Exit>> {
        match method {
            Method::Proc(p) => {
                let block = self.slot(site.block_at());
                self.push_proc_frame(site, p, Some(owner), Some(mid), block, false)?;
                Ok(None)
            }
            Method::Native(f) => self.call_native(site, f, owner, mid),
            Method::Undef => Err(Vm::fatal("dispatched to an undefined method")),
        }
    }

    /// Push a frame running `proc` with the arguments laid out at `site`.
    pub(crate) fn push_proc_frame(
        &mut self,
        site: CallSite,
        proc: ObjRef,
        owner: Option<ObjRef>,
        mid: Option<Symbol>,
        block: Value,
        boundary: bool,
    ) -> VmResult<()> {
        self.check_depth()?;
        let (irep, proc_target) = {
            let p = self.heap.get(proc).as_proc().expect("expected a proc");
            (p.irep.clone(), p.target_class)
        };
        let base = site.recv_at;
        let args_top = site.block_at() + 1;
        let top = (base + irep.nregs as usize).max(args_top);
        let ctx = self.ctx_mut();
        ctx.ensure_stack(top);
        ctx.stack[args_top..top].fill(Value::Nil);
        let target_class = proc_target.or(owner).unwrap_or(self.core.object);
        self.ctx_mut().frames.push(CallInfo {
            base,
            top,
            proc: Some(proc),
            irep: Some(irep),
            pc: 0,
            argc: site.argc,
            kw: site.kw,
            method_id: mid,
            owner,
            target_class,
            env: None,
            boundary,
            errinfo: None,
            kdict: None,
            block,
        });
        Ok(())
    }

    fn collect_native_args(&self, site: CallSite) -> Args {
        let keywords = if site.kw {
            self.hash_pairs(self.slot(site.kw_at())).unwrap_or_default()
        } else {
            vec![]
        };
        Args {
            positional: self.site_positional(site),
            keywords,
            block: self.slot(site.block_at()),
        }
    }

    fn native_frame(&self, site: CallSite, owner: ObjRef, mid: Symbol, block: Value) -> CallInfo {
        CallInfo {
            base: site.recv_at,
            top: (site.block_at() + 1).max(self.ctx().stack_top()),
            proc: None,
            irep: None,
            pc: 0,
            argc: site.argc,
            kw: site.kw,
            method_id: Some(mid),
            owner: Some(owner),
            target_class: owner,
            env: None,
            boundary: false,
            errinfo: None,
            kdict: None,
            block,
        }
    }

    fn call_native(
        &mut self,
        site: CallSite,
        f: NativeFn,
        owner: ObjRef,
        mid: Symbol,
    ) -> VmResult<Option<Exit>> {
        self.check_depth()?;
        let args = self.collect_native_args(site);
        let recv = self.slot(site.recv_at);
        let frame = self.native_frame(site, owner, mid, args.block);
        self.ctx_mut().frames.push(frame);
        // the frame stays on error so the unwinder can report and pop it
        let v = f(self, recv, &args)?;
        if let Some(y) = self.fiber_yield.take() {
            return Ok(Some(Exit::Yield(y)));
        }
        self.pop_frame();
        self.set_slot(site.recv_at, v);
        Ok(None)
    }

    /// Call a method from host code with its own interpreter loop.
    pub(crate) fn call_with_args(&mut self, recv: Value, mid: Symbol, args: &Args) -> VmResult<Value> {
        self.check_native_depth()?;
        let class = self.class_of(recv);
        let (method, owner, mid, args) = match self.find_method(class, mid) {
            Some((m, o)) => (m, o, mid, Cow::Borrowed(args)),
            None => match self.find_method(class, sym::METHOD_MISSING) {
                Some((m, o)) => {
                    let mut positional = vec![Value::Symbol(mid)];
                    positional.extend_from_slice(&args.positional);
                    let repacked = Args {
                        positional,
                        keywords: args.keywords.clone(),
                        block: args.block,
                    };
                    (m, o, sym::METHOD_MISSING, Cow::Owned(repacked))
                }
                None => return Err(self.undefined_method(recv, mid)),
            },
        };
        let base = self.ctx().stack_top();
        match method {
            Method::Native(f) => {
                self.check_depth()?;
                let site = CallSite {
                    recv_at: base,
                    argc: 0,
                    kw: false,
                };
                self.set_slot(base, recv);
                self.set_slot(site.block_at(), args.block);
                let frame = self.native_frame(site, owner, mid, args.block);
                self.ctx_mut().frames.push(frame);
                let depth = self.ctx().frames.len() - 1;
                let r = self.reenter(|vm| f(vm, recv, &args));
                self.ctx_mut().frames.truncate(depth);
                match r {
                    Err(Error::Unwind(u)) if u.target == depth => Ok(u.value),
                    r => self.finish_call(r.map(Exit::Return)),
                }
            }
            Method::Proc(p) => {
                let site = self.lay_out_args(base, recv, &args);
                let stop = self.ctx().frames.len();
                self.push_proc_frame(site, p, Some(owner), Some(mid), args.block, true)?;
                let r = self.reenter(|vm| vm.exec(stop));
                self.finish_call(r)
            }
            Method::Undef => Err(Vm::fatal("dispatched to an undefined method")),
        }
    }

    /// Write host arguments into registers starting at `base`.
    pub(crate) fn lay_out_args(&mut self, base: usize, recv: Value, args: &Args) -> CallSite {
        let n = args.positional.len();
        let packed = n > MAX_REG_ARGS;
        let site = CallSite {
            recv_at: base,
            argc: if packed { PACKED } else { n as u8 },
            kw: !args.keywords.is_empty(),
        };
        self.set_slot(base, recv);
        if packed {
            let ary = self.new_array(args.positional.clone());
            self.set_slot(base + 1, ary);
        } else {
            for (i, v) in args.positional.iter().enumerate() {
                self.set_slot(base + 1 + i, *v);
            }
        }
        if site.kw {
            let flat: Vec<Value> = args.keywords.iter().flat_map(|&(k, v)| [k, v]).collect();
            let h = self.new_hash_from_pairs(&flat);
            self.set_slot(site.kw_at(), h);
        }
        self.set_slot(site.block_at(), args.block);
        site
    }

    /// `ENTER`: check the passed arguments against the spec and lay them out
    /// as locals.
    pub(crate) fn op_enter(&mut self, base: usize, aspec: u32) -> VmResult<()> {
        let spec = ArgSpec(aspec);
        let (m1, o, r, m2) = (spec.req(), spec.opt(), spec.rest(), spec.post());
        let (argc, kw, proc) = {
            let f = self.frame();
            (f.argc, f.kw, f.proc)
        };
        let site = CallSite {
            recv_at: base,
            argc,
            kw,
        };
        let strict = proc.map_or(true, |p| self.is_strict(p));
        let mut args = self.site_positional(site);
        let mut kdict = if kw { Some(self.slot(site.kw_at())) } else { None };
        let block = self.slot(site.block_at());

        if !spec.has_keywords() {
            if let Some(h) = kdict.take() {
                if !self.hash_is_empty(h) {
                    args.push(h);
                }
            }
        }
        if !strict && args.len() == 1 && m1 + o + r as usize + m2 > 1 {
            if let Some(items) = self.array_items(args[0]) {
                args = items.to_vec();
            }
        }
        let n = args.len();
        if strict && (n < m1 + m2 || (!r && n > m1 + o + m2)) {
            let expected = if r {
                format!("{}+", m1 + m2)
            } else if o > 0 {
                format!("{}..{}", m1 + m2, m1 + o + m2)
            } else {
                (m1 + m2).to_string()
            };
            let msg = format!("wrong number of arguments (given {}, expected {})", n, expected);
            return Err(self.argument_error(msg));
        }
        if !r {
            args.truncate(m1 + o + m2);
        }
        let n = args.len();

        let len = m1 + o + r as usize + m2;
        let mut locals = vec![Value::Nil; len];
        let opt_given;
        if n >= m1 + m2 {
            opt_given = (n - m1 - m2).min(o);
            locals[..m1 + opt_given].copy_from_slice(&args[..m1 + opt_given]);
            if r {
                let rest = args[m1 + opt_given..n - m2].to_vec();
                locals[m1 + o] = self.new_array(rest);
            }
            locals[m1 + o + r as usize..].copy_from_slice(&args[n - m2..]);
        } else {
            opt_given = 0;
            let pre = n.min(m1);
            locals[..pre].copy_from_slice(&args[..pre]);
            let post_start = m1 + o + r as usize;
            for (i, v) in args[pre..].iter().enumerate() {
                locals[post_start + i] = *v;
            }
            if r {
                locals[m1 + o] = self.new_array(vec![]);
            }
        }

        for (i, v) in locals.into_iter().enumerate() {
            self.set_slot(base + 1 + i, v);
        }
        let mut next = base + 1 + len;
        if spec.has_keywords() {
            let dict = match kdict {
                Some(h) => {
                    let copy = self.new_hash();
                    self.hash_merge(copy, h)?;
                    copy
                }
                None => self.new_hash(),
            };
            self.set_slot(next, dict);
            self.frame_mut().kdict = Some(1 + len);
            next += 1;
        }
        self.set_slot(next, block);

        let nlocals = self.frame().irep.as_ref().map_or(0, |i| i.nlocals as usize);
        for idx in next + 1..base + nlocals {
            self.set_slot(idx, Value::Nil);
        }
        let f = self.frame_mut();
        f.top = f.top.max(next + 1);
        f.pc += opt_given * 3;
        Ok(())
    }

    fn kdict(&self, base: usize) -> Option<Value> {
        self.frame().kdict.map(|k| self.slot(base + k))
    }

    pub(crate) fn op_karg(&mut self, base: usize, key: Symbol) -> VmResult<Value> {
        let found = match self.kdict(base).and_then(Value::as_object) {
            Some(h) => self.with_hash(h, |heap, hash| hash.remove(heap, Value::Symbol(key))),
            None => None,
        };
        match found {
            Some(v) => Ok(v),
            None => {
                let msg = format!("missing keyword: {}", self.symbol_name(key));
                Err(self.argument_error(msg))
            }
        }
    }

    pub(crate) fn op_keyend(&mut self, base: usize) -> VmResult<()> {
        let first = self
            .kdict(base)
            .and_then(|h| self.hash_pairs(h))
            .and_then(|pairs| pairs.first().map(|&(k, _)| k));
        match first {
            Some(key) => {
                let msg = format!("unknown keyword: {}", self.inspect(key));
                Err(self.argument_error(msg))
            }
            None => Ok(()),
        }
    }

    /// Read argument slot `idx` of the method `lv` scopes out.
    fn outer_arg(&self, base: usize, lv: u32, idx: usize) -> VmResult<Value> {
        if lv == 0 {
            return Ok(self.slot(base + 1 + idx));
        }
        let env = self.up_env(lv - 1)?;
        Ok(self.env_get(env, 1 + idx))
    }

    /// `ARGARY`: rebuild the arguments of the enclosing method for a
    /// zero-argument `super`.
    pub(crate) fn op_argary(&mut self, base: usize, a: u32, b: u32) -> VmResult<()> {
        let m1 = ((b >> 11) & 0x3f) as usize;
        let r = ((b >> 10) & 1) as usize;
        let m2 = ((b >> 5) & 0x1f) as usize;
        let kd = ((b >> 4) & 1) as usize;
        let lv = b & 0xf;
        if self.frame().method_id.is_none() {
            let msg = "super called outside of method";
            let class = self.core.no_method_error;
            return Err(self.raise_error(class, msg));
        }
        let mut items = Vec::with_capacity(m1 + m2);
        for i in 0..m1 {
            items.push(self.outer_arg(base, lv, i)?);
        }
        if r == 1 {
            let rest = self.outer_arg(base, lv, m1)?;
            items.extend(self.array_items(rest).unwrap_or_default().iter().copied());
        }
        for i in 0..m2 {
            items.push(self.outer_arg(base, lv, m1 + r + i)?);
        }
        let ary = self.new_array(items);
        self.set_reg(base, a, ary);
        let tail = m1 + r + m2;
        if kd == 1 {
            let dict = self.outer_arg(base, lv, tail)?;
            let block = self.outer_arg(base, lv, tail + 1)?;
            self.set_reg(base, a + 1, dict);
            self.set_reg(base, a + 2, block);
        } else {
            let block = self.outer_arg(base, lv, tail)?;
            self.set_reg(base, a + 1, block);
        }
        Ok(())
    }

    /// `BLKPUSH`: load the block passed to the enclosing method.
    pub(crate) fn op_blkpush(&mut self, base: usize, a: u32, b: u32) -> VmResult<()> {
        let m1 = ((b >> 11) & 0x3f) as usize;
        let r = ((b >> 10) & 1) as usize;
        let m2 = ((b >> 5) & 0x1f) as usize;
        let kd = ((b >> 4) & 1) as usize;
        let lv = b & 0xf;
        let block = self.outer_arg(base, lv, m1 + r + m2 + kd)?;
        if block.is_nil() {
            return Err(self.local_jump_error("no block given (yield)"));
        }
        self.set_reg(base, a, block);
        Ok(())
    }

    pub(crate) fn op_super(&mut self, base: usize, a: u32, b: u32) -> VmResult<Option<Exit>> {
        let (mid, owner) = {
            let f = self.frame();
            (f.method_id, f.owner)
        };
        let (mid, owner) = match (mid, owner) {
            (Some(m), Some(o)) => (m, o),
            _ => {
                let class = self.core.no_method_error;
                return Err(self.raise_error(class, "super called outside of method"));
            }
        };
        let recv = self.slot(base);
        let class = self.class_of(recv);
        let (method, found_in) = match self.find_super_method(class, owner, mid) {
            None => {
                return Err(self.type_error("self has wrong type to call super in this context"))
            }
            Some(None) => {
                let msg = format!("no superclass method '{}'", self.symbol_name(mid));
                return Err(self.no_method_error(msg, recv, mid));
            }
            Some(Some(found)) => found,
        };
        let recv_at = base + a as usize;
        self.set_slot(recv_at, recv);
        let site = self.normalize_args(recv_at, b, true)?;
        self.call_method(site, method, found_in, mid)
    }

    /// `CALL`: turn the running `Proc#call` frame into a frame of the receiver
    /// proc, keeping the arguments in place.
    pub(crate) fn op_call(&mut self) -> VmResult<()> {
        let base = self.frame().base;
        let recv = self.slot(base);
        let p = self.expect_proc(recv)?;
        let (irep, env, target) = {
            let p = self.heap.get(p).as_proc().expect("checked above");
            (p.irep.clone(), p.env, p.target_class)
        };
        let nregs = irep.nregs as usize;
        let (this, mid, owner) = match env {
            Some(e) => {
                let record = self.heap.get(e).as_env().expect("expected an env");
                (self.env_get(e, 0), record.mid, record.owner)
            }
            None => (recv, None, None),
        };
        self.set_slot(base, this);
        let old_top = self.frame().top;
        let top = old_top.max(base + nregs);
        {
            let ctx = self.ctx_mut();
            ctx.ensure_stack(top);
            ctx.stack[old_top..top].fill(Value::Nil);
        }
        let f = self.frame_mut();
        f.proc = Some(p);
        f.irep = Some(irep);
        f.pc = 0;
        f.env = None;
        f.top = top;
        if let Some(t) = target {
            f.target_class = t;
        }
        if env.is_some() {
            f.method_id = mid;
            f.owner = owner;
        }
        Ok(())
    }

    /// The block of the innermost method frame below the running native
    /// method, for `block_given?`.
    pub(crate) fn caller_block(&self) -> Value {
        let frames = &self.ctx().frames;
        frames
            .iter()
            .rev()
            .skip(1)
            .find(|f| f.proc.map_or(false, |p| self.is_strict(p)))
            .map_or(Value::Nil, |f| f.block)
    }

    /// `self` of the frame that called the running native method.
    pub(crate) fn caller_self(&self) -> Option<Value> {
        let frames = &self.ctx().frames;
        let f = frames.iter().rev().nth(1)?;
        Some(self.slot(f.base))
    }

    /// Flat keyword list of `args` turned into a hash, or nil.
    pub(crate) fn keywords_hash(&mut self, args: &Args) -> Value {
        if args.keywords.is_empty() {
            return Value::Nil;
        }
        let flat = args
            .keywords
            .iter()
            .flat_map(|&(k, v)| [k, v])
            .collect_vec();
        self.new_hash_from_pairs(&flat)
    }
}
