//! The interpreter loop.

use std::sync::Arc;

use garnet_bytecode::{CatchKind, InstContainer, Irep, OpCode, PoolValue};

use super::arith::{fast_eq, numeric_cmp, ArithOp, CmpOp};
use super::frame::Pending;
use super::{Exit, Vm};
use crate::class::Method;
use crate::error::{Error, VmResult};
use crate::gc::ObjRef;
use crate::object::{EnvStorage, ObjectKind, REnv, RObject};
use crate::symbol::{sym, Symbol};
use crate::value::Value;

impl Vm {
    /// Run the current context until frame `stop` returns or the fiber
    /// yields. Frames below `stop` belong to outer loops and are never popped
    /// here, except by an unwind that has to cross them.
    pub(crate) fn exec(&mut self, stop: usize) -> VmResult<Exit> {
        loop {
            if self.heap.should_collect() {
                self.gc_collect();
            }
            let mark = self.heap.arena_save();
            let mut r = self.step(stop);
            self.heap.arena_restore(mark);
            loop {
                match r {
                    Err(Error::Raise(exc)) if self.ctx().frames.len() > stop => {
                        r = self.handle_raise(exc, stop).map(|()| None);
                    }
                    Err(Error::Unwind(u)) if self.ctx().frames.len() > stop => {
                        r = self.return_jump(u.target, u.value, stop);
                    }
                    _ => break,
                }
            }
            match r {
                Ok(None) => {}
                Ok(Some(exit)) => {
                    let (Exit::Return(v) | Exit::Yield(v)) = exit;
                    self.heap.protect(v);
                    return Ok(exit);
                }
                Err(e) => {
                    match &e {
                        Error::Raise(exc) => self.heap.protect(Value::Object(*exc)),
                        Error::Unwind(u) => self.heap.protect(u.value),
                        _ => {}
                    }
                    return Err(e);
                }
            }
        }
    }

    pub(crate) fn reg(&self, base: usize, i: u32) -> Value {
        self.ctx()
            .stack
            .get(base + i as usize)
            .copied()
            .unwrap_or(Value::Nil)
    }

    pub(crate) fn set_reg(&mut self, base: usize, i: u32, v: Value) {
        let idx = base + i as usize;
        let ctx = self.ctx_mut();
        ctx.ensure_stack(idx + 1);
        ctx.stack[idx] = v;
    }

    fn irep_sym(&mut self, irep: &Irep, idx: u32) -> VmResult<Symbol> {
        match irep.sym(idx) {
            Some(name) => Ok(self.symbols.intern_bytes(name)),
            None => Err(Vm::fatal(format!("symbol {} has no name", idx))),
        }
    }

    fn pool_str(irep: &Irep, idx: u32) -> VmResult<&[u8]> {
        match irep.pool.get(idx as usize) {
            Some(PoolValue::Str(s)) => Ok(s),
            _ => Err(Vm::fatal(format!("pool entry {} is not a string", idx))),
        }
    }

    /// The env capturing the current frame's locals, created on first use.
    pub(crate) fn frame_env(&mut self) -> ObjRef {
        if let Some(env) = self.frame().env {
            return env;
        }
        let f = self.frame();
        let len = f.irep.as_ref().map_or(1, |i| i.nlocals as usize);
        let env = REnv {
            storage: EnvStorage::OnStack {
                ctx: self.current,
                fiber: self.current_fiber,
                base: f.base,
                len,
            },
            mid: f.method_id,
            owner: f.owner,
        };
        let class = self.core.object;
        let env = self.heap.alloc(RObject::new(class, ObjectKind::Env(env)));
        self.frame_mut().env = Some(env);
        env
    }

    /// The env `lv` levels out from the running proc.
    pub(crate) fn up_env(&self, lv: u32) -> VmResult<ObjRef> {
        let mut proc = self.frame().proc;
        for _ in 0..lv {
            proc = proc.and_then(|p| self.heap.get(p).as_proc().and_then(|p| p.upper));
        }
        proc.and_then(|p| self.heap.get(p).as_proc().and_then(|p| p.env))
            .ok_or_else(|| Vm::fatal(format!("no enclosing scope at level {}", lv)))
    }

    fn cvar_get(&mut self, class: ObjRef, name: Symbol) -> VmResult<Value> {
        let ancestors = self.ancestors(class);
        let found = ancestors
            .iter()
            .find_map(|&c| self.class_ref(c).cvars.get(&name).copied());
        match found {
            Some(v) => Ok(v),
            None => {
                let msg = format!(
                    "uninitialized class variable {} in {}",
                    self.symbol_name(name),
                    self.class_name(class)
                );
                Err(self.name_error(msg, name))
            }
        }
    }

    fn cvar_set(&mut self, class: ObjRef, name: Symbol, value: Value) {
        let ancestors = self.ancestors(class);
        let owner = ancestors
            .iter()
            .copied()
            .find(|&c| self.class_ref(c).cvars.contains_key(&name))
            .unwrap_or(class);
        self.class_mut(owner).cvars.insert(name, value);
    }

    pub(crate) fn array_index(&self, ary: Value, idx: i64) -> Option<Value> {
        let items = self.array_items(ary)?;
        let idx = if idx < 0 { idx + items.len() as i64 } else { idx };
        if idx < 0 {
            return None;
        }
        items.get(idx as usize).copied()
    }

    /// `ary[idx] = v`, padding with nil past the end.
    pub(crate) fn array_store(&mut self, ary: Value, idx: i64, v: Value) -> VmResult<()> {
        self.check_frozen(ary)?;
        let len = self.array_items(ary).map_or(0, <[Value]>::len) as i64;
        let pos = if idx < 0 { idx + len } else { idx };
        if pos < 0 {
            let msg = format!("index {} too small for array; minimum: -{}", idx, len);
            let class = self.core.index_error;
            return Err(self.raise_error(class, msg));
        }
        let pos = pos as usize;
        let items = match ary.as_object().and_then(|r| self.heap.get_mut(r).as_array_mut()) {
            Some(items) => items,
            None => {
                let msg = format!("no implicit conversion of {} into Array", self.type_name(ary));
                return Err(self.type_error(msg));
            }
        };
        let grow = (pos + 1).saturating_sub(items.len());
        if grow > 0 {
            items.resize(pos + 1, Value::Nil);
        }
        items[pos] = v;
        self.heap.grew(grow * std::mem::size_of::<Value>());
        Ok(())
    }

    fn array_extend(&mut self, ary: Value, items: Vec<Value>) -> VmResult<()> {
        self.check_frozen(ary)?;
        let added = items.len();
        match ary.as_object().and_then(|r| self.heap.get_mut(r).as_array_mut()) {
            Some(dst) => dst.extend(items),
            None => {
                let msg = format!("no implicit conversion of {} into Array", self.type_name(ary));
                return Err(self.type_error(msg));
            }
        }
        self.heap.grew(added * std::mem::size_of::<Value>());
        Ok(())
    }

    /// Send `mid` to `R[a]` with `argc` arguments following it.
    fn send_op(&mut self, base: usize, a: u32, mid: Symbol, argc: u32) -> VmResult<Option<Exit>> {
        self.op_send(base, a, mid, argc, false, false)
    }

    fn arith(&mut self, base: usize, a: u32, op: ArithOp) -> VmResult<Option<Exit>> {
        let (x, y) = (self.reg(base, a), self.reg(base, a + 1));
        match self.numeric_op(op, x, y)? {
            Some(v) => {
                self.set_reg(base, a, v);
                Ok(None)
            }
            None => {
                let mid = op.method(self);
                self.send_op(base, a, mid, 1)
            }
        }
    }

    fn arith_imm(&mut self, base: usize, a: u32, op: ArithOp, b: u32) -> VmResult<Option<Exit>> {
        let (x, y) = (self.reg(base, a), Value::Integer(b as i64));
        match self.numeric_op(op, x, y)? {
            Some(v) => {
                self.set_reg(base, a, v);
                Ok(None)
            }
            None => {
                self.set_reg(base, a + 1, y);
                let mid = op.method(self);
                self.send_op(base, a, mid, 1)
            }
        }
    }

    fn compare(&mut self, base: usize, a: u32, op: CmpOp) -> VmResult<Option<Exit>> {
        let (x, y) = (self.reg(base, a), self.reg(base, a + 1));
        match numeric_cmp(op, x, y) {
            Some(r) => {
                self.set_reg(base, a, r.into());
                Ok(None)
            }
            None => self.send_op(base, a, op.method(), 1),
        }
    }

    /// Outer scope of `CLASS` and `MODULE`: nil stands for the lexical class.
    fn class_scope(&mut self, outer: Value) -> VmResult<ObjRef> {
        if outer.is_nil() {
            return Ok(self.frame().target_class);
        }
        self.expect_module(outer)
    }

    /// Execute one instruction of the top frame.
    fn step(&mut self, stop: usize) -> VmResult<Option<Exit>> {
        let (irep, pc, base, target_class) = {
            let f = self.frame();
            (f.irep.clone(), f.pc, f.base, f.target_class)
        };
        let irep: Arc<Irep> = irep.ok_or_else(|| Vm::fatal("native frame in the interpreter loop"))?;
        let inst = irep
            .fetch(pc)
            .ok_or_else(|| Vm::fatal(format!("invalid instruction at {}", pc)))?;
        self.frame_mut().pc = inst.next;
        let (a, b, c) = (inst.operands.a, inst.operands.b, inst.operands.c);
        let jump_to = || inst.jump_target().map_or(inst.next, |t| t as usize);

        match inst.op {
            OpCode::Nop | OpCode::Debug => {}
            OpCode::Move => {
                let v = self.reg(base, b);
                self.set_reg(base, a, v);
            }
            OpCode::LoadL => {
                let v = match irep.pool.get(b as usize) {
                    Some(PoolValue::Str(s)) => self.new_string(s.to_vec()),
                    Some(PoolValue::Int(i)) => Value::Integer(*i),
                    Some(PoolValue::Float(f)) => Value::Float(*f),
                    None => return Err(Vm::fatal(format!("pool index {} out of range", b))),
                };
                self.set_reg(base, a, v);
            }
            OpCode::LoadI8 => self.set_reg(base, a, Value::Integer(b as i64)),
            OpCode::LoadINeg => self.set_reg(base, a, Value::Integer(-(b as i64))),
            OpCode::LoadIMinus1
            | OpCode::LoadI0
            | OpCode::LoadI1
            | OpCode::LoadI2
            | OpCode::LoadI3
            | OpCode::LoadI4
            | OpCode::LoadI5
            | OpCode::LoadI6
            | OpCode::LoadI7 => {
                let n = inst.op as u8 as i64 - OpCode::LoadI0 as u8 as i64;
                self.set_reg(base, a, Value::Integer(n));
            }
            OpCode::LoadI16 => self.set_reg(base, a, Value::Integer(b as u16 as i16 as i64)),
            OpCode::LoadI32 => {
                let n = ((b << 16) | (c & 0xffff)) as i32;
                self.set_reg(base, a, Value::Integer(n as i64));
            }
            OpCode::LoadSym => {
                let s = self.irep_sym(&irep, b)?;
                self.set_reg(base, a, Value::Symbol(s));
            }
            OpCode::LoadNil => self.set_reg(base, a, Value::Nil),
            OpCode::LoadSelf => {
                let this = self.reg(base, 0);
                self.set_reg(base, a, this);
            }
            OpCode::LoadT => self.set_reg(base, a, Value::True),
            OpCode::LoadF => self.set_reg(base, a, Value::False),

            OpCode::GetGV | OpCode::GetSV => {
                let s = self.irep_sym(&irep, b)?;
                let v = self.globals.get(&s).copied().unwrap_or(Value::Nil);
                self.set_reg(base, a, v);
            }
            OpCode::SetGV | OpCode::SetSV => {
                let s = self.irep_sym(&irep, b)?;
                let v = self.reg(base, a);
                self.globals.insert(s, v);
            }
            OpCode::GetIV => {
                let s = self.irep_sym(&irep, b)?;
                let v = self.ivar_get(self.reg(base, 0), s);
                self.set_reg(base, a, v);
            }
            OpCode::SetIV => {
                let s = self.irep_sym(&irep, b)?;
                let (this, v) = (self.reg(base, 0), self.reg(base, a));
                self.ivar_set(this, s, v)?;
            }
            OpCode::GetCV => {
                let s = self.irep_sym(&irep, b)?;
                let v = self.cvar_get(target_class, s)?;
                self.set_reg(base, a, v);
            }
            OpCode::SetCV => {
                let s = self.irep_sym(&irep, b)?;
                let v = self.reg(base, a);
                self.cvar_set(target_class, s, v);
            }
            OpCode::GetConst => {
                let s = self.irep_sym(&irep, b)?;
                let v = self.lexical_const(target_class, s)?;
                self.set_reg(base, a, v);
            }
            OpCode::SetConst => {
                let s = self.irep_sym(&irep, b)?;
                let v = self.reg(base, a);
                self.set_const(target_class, s, v)?;
            }
            OpCode::GetMCnst => {
                let s = self.irep_sym(&irep, b)?;
                let m = self.expect_module(self.reg(base, a))?;
                match self.const_in_ancestors(m, s) {
                    Some(v) => self.set_reg(base, a, v),
                    None => {
                        let msg = format!(
                            "uninitialized constant {}::{}",
                            self.class_name(m),
                            self.symbol_name(s)
                        );
                        return Err(self.name_error(msg, s));
                    }
                }
            }
            OpCode::SetMCnst => {
                let s = self.irep_sym(&irep, b)?;
                let m = self.expect_module(self.reg(base, a + 1))?;
                let v = self.reg(base, a);
                self.set_const(m, s, v)?;
            }
            OpCode::GetUpVar => {
                let env = self.up_env(c)?;
                let v = self.env_get(env, b as usize);
                self.set_reg(base, a, v);
            }
            OpCode::SetUpVar => {
                let env = self.up_env(c)?;
                let v = self.reg(base, a);
                self.env_set(env, b as usize, v);
            }
            OpCode::GetIdx => {
                let (recv, idx) = (self.reg(base, a), self.reg(base, a + 1));
                let fast = match (self.heap_kind(recv), idx) {
                    (Some(Kind::Array), Value::Integer(i)) => {
                        Some(self.array_index(recv, i).unwrap_or(Value::Nil))
                    }
                    (Some(Kind::Hash), _) => Some(self.hash_get(recv, idx).unwrap_or(Value::Nil)),
                    _ => None,
                };
                match fast {
                    Some(v) => self.set_reg(base, a, v),
                    None => return self.send_op(base, a, sym::OP_AREF, 1),
                }
            }
            OpCode::SetIdx => {
                let (recv, idx, v) = (self.reg(base, a), self.reg(base, a + 1), self.reg(base, a + 2));
                match (self.heap_kind(recv), idx) {
                    (Some(Kind::Array), Value::Integer(i)) => self.array_store(recv, i, v)?,
                    (Some(Kind::Hash), _) => self.hash_set(recv, idx, v)?,
                    _ => return self.send_op(base, a, sym::OP_ASET, 2),
                }
            }

            OpCode::Jmp => self.frame_mut().pc = jump_to(),
            OpCode::JmpIf => {
                if self.reg(base, a).is_truthy() {
                    self.frame_mut().pc = jump_to();
                }
            }
            OpCode::JmpNot => {
                if self.reg(base, a).is_falsy() {
                    self.frame_mut().pc = jump_to();
                }
            }
            OpCode::JmpNil => {
                if self.reg(base, a).is_nil() {
                    self.frame_mut().pc = jump_to();
                }
            }
            OpCode::JmpUw => return self.op_jmpuw(jump_to()).map(|()| None),

            OpCode::Except => {
                let v = match self.ctx_mut().pending.take() {
                    Some(Pending { value, kind }) => {
                        if kind == CatchKind::Ensure {
                            let exc = self.heap.get(value).as_exception().map(|_| value);
                            self.frame_mut().errinfo = exc;
                        }
                        Value::Object(value)
                    }
                    None => Value::Nil,
                };
                self.set_reg(base, a, v);
            }
            OpCode::Rescue => {
                let (exc, class) = (self.reg(base, a), self.reg(base, b));
                let class = match class {
                    Value::Object(r) if self.heap.get(r).as_class().is_some() => r,
                    _ => return Err(self.type_error("class or module required for rescue clause")),
                };
                let matched = self.is_kind_of(exc, class);
                self.set_reg(base, b, matched.into());
            }
            OpCode::RaiseIf => {
                let v = self.reg(base, a);
                return self.op_raise_if(v, stop);
            }

            OpCode::SSend | OpCode::SSendB | OpCode::Send | OpCode::SendB => {
                let mid = self.irep_sym(&irep, b)?;
                let self_call = matches!(inst.op, OpCode::SSend | OpCode::SSendB);
                let with_block = matches!(inst.op, OpCode::SSendB | OpCode::SendB);
                return self.op_send(base, a, mid, c, self_call, with_block);
            }
            OpCode::Call => self.op_call()?,
            OpCode::Super => return self.op_super(base, a, b),
            OpCode::ArgAry => self.op_argary(base, a, b)?,
            OpCode::Enter => self.op_enter(base, a)?,
            OpCode::KeyP => {
                let s = self.irep_sym(&irep, b)?;
                let found = match self.frame().kdict {
                    Some(k) => self.hash_get(self.reg(base, k as u32), Value::Symbol(s)).is_some(),
                    None => false,
                };
                self.set_reg(base, a, found.into());
            }
            OpCode::KeyEnd => self.op_keyend(base)?,
            OpCode::KArg => {
                let s = self.irep_sym(&irep, b)?;
                let v = self.op_karg(base, s)?;
                self.set_reg(base, a, v);
            }
            OpCode::Return => {
                let v = self.reg(base, a);
                let top = self.ctx().frames.len() - 1;
                return self.return_jump(top, v, stop);
            }
            OpCode::ReturnBlk => {
                let v = self.reg(base, a);
                return self.op_return_blk(v, stop);
            }
            OpCode::Break => {
                let v = self.reg(base, a);
                return self.op_break(v, stop);
            }
            OpCode::BlkPush => self.op_blkpush(base, a, b)?,

            OpCode::Add => return self.arith(base, a, ArithOp::Add),
            OpCode::AddI => return self.arith_imm(base, a, ArithOp::Add, b),
            OpCode::Sub => return self.arith(base, a, ArithOp::Sub),
            OpCode::SubI => return self.arith_imm(base, a, ArithOp::Sub, b),
            OpCode::Mul => return self.arith(base, a, ArithOp::Mul),
            OpCode::Div => return self.arith(base, a, ArithOp::Div),
            OpCode::Eq => {
                let (x, y) = (self.reg(base, a), self.reg(base, a + 1));
                match fast_eq(x, y) {
                    Some(r) => self.set_reg(base, a, r.into()),
                    None => return self.send_op(base, a, sym::OP_EQ, 1),
                }
            }
            OpCode::Lt => return self.compare(base, a, CmpOp::Lt),
            OpCode::Le => return self.compare(base, a, CmpOp::Le),
            OpCode::Gt => return self.compare(base, a, CmpOp::Gt),
            OpCode::Ge => return self.compare(base, a, CmpOp::Ge),

            OpCode::Array => {
                let items = self.regs(base, a, b);
                let v = self.new_array(items);
                self.set_reg(base, a, v);
            }
            OpCode::Array2 => {
                let items = self.regs(base, b, c);
                let v = self.new_array(items);
                self.set_reg(base, a, v);
            }
            OpCode::AryCat => {
                let (dst, src) = (self.reg(base, a), self.reg(base, a + 1));
                let items = self.splat(src);
                if dst.is_nil() {
                    let v = self.new_array(items);
                    self.set_reg(base, a, v);
                } else {
                    self.array_extend(dst, items)?;
                }
            }
            OpCode::AryPush => {
                let items = self.regs(base, a + 1, b);
                self.array_extend(self.reg(base, a), items)?;
            }
            OpCode::ArySplat => {
                let items = self.splat(self.reg(base, a));
                let v = self.new_array(items);
                self.set_reg(base, a, v);
            }
            OpCode::ARef => {
                let v = self.reg(base, b);
                let item = match self.array_items(v) {
                    Some(items) => items.get(c as usize).copied().unwrap_or(Value::Nil),
                    None if c == 0 => v,
                    None => Value::Nil,
                };
                self.set_reg(base, a, item);
            }
            OpCode::ASet => {
                let (v, ary) = (self.reg(base, a), self.reg(base, b));
                self.array_store(ary, c as i64, v)?;
            }
            OpCode::APost => self.op_apost(base, a, b as usize, c as usize),

            OpCode::Intern => {
                let v = self.reg(base, a);
                let name = match self.string_bytes(v) {
                    Some(s) => s.to_vec(),
                    None => {
                        let msg = format!("{} is not a string", self.inspect(v));
                        return Err(self.type_error(msg));
                    }
                };
                let s = self.intern_bytes(&name);
                self.set_reg(base, a, Value::Symbol(s));
            }
            OpCode::Symbol => {
                let s = self.symbols.intern_bytes(Vm::pool_str(&irep, b)?);
                self.set_reg(base, a, Value::Symbol(s));
            }
            OpCode::String => {
                let bytes = Vm::pool_str(&irep, b)?.to_vec();
                let v = self.new_string(bytes);
                self.set_reg(base, a, v);
            }
            OpCode::StrCat => {
                let dst = self.reg(base, a);
                let tail = self.to_s_bytes(self.reg(base, a + 1))?;
                self.check_frozen(dst)?;
                let added = tail.len();
                let r = dst
                    .as_object()
                    .ok_or_else(|| Vm::fatal("STRCAT on an immediate"))?;
                match &mut self.heap.get_mut(r).kind {
                    ObjectKind::String(s) => s.extend(tail),
                    _ => return Err(Vm::fatal("STRCAT on a non-string")),
                }
                self.heap.grew(added);
            }
            OpCode::Hash => {
                let flat = self.regs(base, a, b * 2);
                let v = self.new_hash_from_pairs(&flat);
                self.set_reg(base, a, v);
            }
            OpCode::HashAdd => {
                let h = self.reg(base, a);
                for i in 0..b {
                    let (k, v) = (self.reg(base, a + 1 + i * 2), self.reg(base, a + 2 + i * 2));
                    self.hash_set(h, k, v)?;
                }
            }
            OpCode::HashCat => {
                let (h, other) = (self.reg(base, a), self.reg(base, a + 1));
                self.hash_merge(h, other)?;
            }

            OpCode::Lambda | OpCode::Block => {
                let child = self.child_irep(&irep, b)?;
                let env = self.frame_env();
                let upper = self.frame().proc;
                let strict = inst.op == OpCode::Lambda;
                let p = self.new_proc(child, upper, Some(env), target_class, strict);
                self.set_reg(base, a, Value::Object(p));
            }
            OpCode::Method => {
                let child = self.child_irep(&irep, b)?;
                let p = self.new_proc(child, None, None, target_class, true);
                self.set_reg(base, a, Value::Object(p));
            }
            OpCode::RangeInc | OpCode::RangeExc => {
                let (x, y) = (self.reg(base, a), self.reg(base, a + 1));
                let v = self.new_range(x, y, inst.op == OpCode::RangeExc);
                self.set_reg(base, a, v);
            }

            OpCode::OClass => {
                let object = self.core.object;
                self.set_reg(base, a, Value::Object(object));
            }
            OpCode::Class => {
                let s = self.irep_sym(&irep, b)?;
                let outer = self.class_scope(self.reg(base, a))?;
                let superclass = match self.reg(base, a + 1) {
                    Value::Nil => None,
                    v if self.is_class_or_module(v) && !self.is_module(v) => v.as_object(),
                    v => {
                        let msg = format!("superclass must be a Class ({} given)", self.type_name(v));
                        return Err(self.type_error(msg));
                    }
                };
                let class = self.open_class(outer, s, superclass)?;
                self.set_reg(base, a, Value::Object(class));
            }
            OpCode::Module => {
                let s = self.irep_sym(&irep, b)?;
                let outer = self.class_scope(self.reg(base, a))?;
                let module = self.open_module(outer, s)?;
                self.set_reg(base, a, Value::Object(module));
            }
            OpCode::Exec => {
                let recv = self.reg(base, a);
                let target = self.expect_module(recv)?;
                let child = self.child_irep(&irep, b)?;
                let upper = self.frame().proc;
                let p = self.new_proc(child, upper, None, target, true);
                let site = super::call::CallSite {
                    recv_at: base + a as usize,
                    argc: 0,
                    kw: false,
                };
                self.set_reg(base, a + 1, Value::Nil);
                self.push_proc_frame(site, p, None, None, Value::Nil, false)?;
            }
            OpCode::Def => {
                let s = self.irep_sym(&irep, b)?;
                let class = self.expect_module(self.reg(base, a))?;
                let body = self.expect_proc(self.reg(base, a + 1))?;
                self.set_method(class, s, Method::Proc(body))?;
                self.set_reg(base, a, Value::Symbol(s));
            }
            OpCode::Alias => {
                let new = self.irep_sym(&irep, a)?;
                let old = self.irep_sym(&irep, b)?;
                self.alias_method(target_class, new, old)?;
            }
            OpCode::Undef => {
                let s = self.irep_sym(&irep, a)?;
                self.undef_method(target_class, s)?;
            }
            OpCode::SClass => {
                let class = self.singleton_class(self.reg(base, a))?;
                self.set_reg(base, a, Value::Object(class));
            }
            OpCode::TClass => self.set_reg(base, a, Value::Object(target_class)),
            OpCode::Err => {
                let msg = String::from_utf8_lossy(Vm::pool_str(&irep, a)?).into_owned();
                return Err(self.local_jump_error(msg));
            }
            OpCode::Ext1 | OpCode::Ext2 | OpCode::Ext3 => {
                return Err(Vm::fatal(format!("unsupported prefix {}", inst.op)));
            }
            OpCode::Stop => {
                let v = self.reg(base, irep.nlocals as u32);
                let top = self.ctx().frames.len() - 1;
                return self.return_jump(top, v, stop);
            }
        }
        Ok(None)
    }

    /// `R[from..from+n]`
    fn regs(&self, base: usize, from: u32, n: u32) -> Vec<Value> {
        (from..from + n).map(|i| self.reg(base, i)).collect()
    }

    fn child_irep(&self, irep: &Irep, idx: u32) -> VmResult<Arc<Irep>> {
        irep.reps
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| Vm::fatal(format!("child {} out of range", idx)))
    }

    fn heap_kind(&self, v: Value) -> Option<Kind> {
        match &self.heap.get(v.as_object()?).kind {
            ObjectKind::Array(_) => Some(Kind::Array),
            ObjectKind::Hash(_) => Some(Kind::Hash),
            _ => None,
        }
    }

    /// Destructure `R[a]` into a rest array of everything after the first
    /// `pre` items and before the last `post`, followed by those `post`.
    fn op_apost(&mut self, base: usize, a: u32, pre: usize, post: usize) {
        let v = self.reg(base, a);
        let items = match self.array_items(v) {
            Some(items) => items.to_vec(),
            None => vec![v],
        };
        let len = items.len();
        if len > pre + post {
            let rest = self.new_array(items[pre..len - post].to_vec());
            self.set_reg(base, a, rest);
            for (i, item) in items[len - post..].iter().enumerate() {
                self.set_reg(base, a + 1 + i as u32, *item);
            }
        } else {
            let rest = self.new_array(vec![]);
            self.set_reg(base, a, rest);
            for i in 0..post {
                let item = items.get(pre + i).copied().unwrap_or(Value::Nil);
                self.set_reg(base, a + 1 + i as u32, item);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Array,
    Hash,
}
