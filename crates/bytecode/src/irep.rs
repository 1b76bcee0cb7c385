use std::borrow::Cow;
use std::fmt::{self, Display, Write};
use std::sync::Arc;

use bytes::Bytes;

use crate::inst::{Inst, InstContainer, OpCode, OperandFormat};
use crate::LoadError;

/// A compiled code unit: one instruction sequence with its literal pool,
/// symbol table, catch handlers and nested children (blocks, methods and
/// class bodies).
#[derive(Debug, Clone, PartialEq)]
pub struct Irep {
    /// Number of local variable slots, `self` included
    pub nlocals: u16,
    /// Number of registers the sequence uses, locals included
    pub nregs: u16,
    pub iseq: Bytes,
    pub catch_handlers: Vec<CatchHandler>,
    pub pool: Vec<PoolValue>,
    /// Symbol table, raw name bytes. `None` marks a slot that was dumped
    /// without a name.
    pub syms: Vec<Option<Bytes>>,
    pub reps: Vec<Arc<Irep>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolValue {
    Str(Bytes),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CatchKind {
    Rescue = 0,
    Ensure = 1,
}

/// A protected region `(begin, end]` of the sequence and the address control
/// moves to when an exception (or, for ensure handlers, any exit) leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchHandler {
    pub kind: CatchKind,
    pub begin: u32,
    pub end: u32,
    pub target: u32,
}

impl CatchHandler {
    /// `pc` is the address following the instruction that left the region.
    pub fn covers(&self, pc: usize) -> bool {
        (self.begin as usize) < pc && pc <= self.end as usize
    }
}

impl InstContainer for Irep {
    fn code(&self) -> &[u8] {
        &self.iseq
    }
}

impl Irep {
    /// Find the innermost handler covering `pc`. With `kind` set, only
    /// handlers of that kind are considered.
    pub fn catch_handler(&self, pc: usize, kind: Option<CatchKind>) -> Option<&CatchHandler> {
        // inner regions are registered after the regions enclosing them
        self.catch_handlers
            .iter()
            .rev()
            .find(|h| kind.map_or(true, |k| h.kind == k) && h.covers(pc))
    }

    pub fn sym(&self, idx: u32) -> Option<&[u8]> {
        self.syms.get(idx as usize)?.as_deref()
    }

    /// Check every instruction of this unit and its children, so that the
    /// interpreter never meets an undecodable opcode or an out-of-range index.
    pub fn validate(&self) -> Result<(), LoadError> {
        let len = self.iseq.len();
        let mut pc = 0;
        while pc < len {
            let inst = self.fetch(pc).ok_or_else(|| {
                let reason = match OpCode::from_byte(self.iseq[pc]) {
                    Some(_) => "truncated operand",
                    None => "unknown opcode",
                };
                LoadError::Instruction { pc, reason }
            })?;
            self.validate_inst(&inst)?;
            pc = inst.next;
        }
        for (index, h) in self.catch_handlers.iter().enumerate() {
            if h.begin > h.end || h.end as usize > len || h.target as usize >= len {
                return Err(LoadError::CatchHandler { index });
            }
        }
        for child in &self.reps {
            child.validate()?;
        }
        Ok(())
    }

    fn validate_inst(&self, inst: &Inst) -> Result<(), LoadError> {
        let err = |reason| LoadError::Instruction {
            pc: inst.pc,
            reason,
        };
        let ops = inst.operands;
        let sym_ok = |i: u32| (i as usize) < self.syms.len();
        let str_ok = |i: u32| matches!(self.pool.get(i as usize), Some(PoolValue::Str(_)));
        match inst.op {
            OpCode::Ext1 | OpCode::Ext2 | OpCode::Ext3 => return Err(err("operand extension")),
            OpCode::LoadL if (ops.b as usize) >= self.pool.len() => {
                return Err(err("pool index out of range"))
            }
            OpCode::String | OpCode::Symbol if !str_ok(ops.b) => {
                return Err(err("string literal expected"))
            }
            OpCode::Err if !str_ok(ops.a) => return Err(err("string literal expected")),
            OpCode::LoadSym
            | OpCode::GetGV
            | OpCode::SetGV
            | OpCode::GetSV
            | OpCode::SetSV
            | OpCode::GetIV
            | OpCode::SetIV
            | OpCode::GetCV
            | OpCode::SetCV
            | OpCode::GetConst
            | OpCode::SetConst
            | OpCode::GetMCnst
            | OpCode::SetMCnst
            | OpCode::SSend
            | OpCode::SSendB
            | OpCode::Send
            | OpCode::SendB
            | OpCode::KeyP
            | OpCode::KArg
            | OpCode::Def
            | OpCode::Class
            | OpCode::Module
                if !sym_ok(ops.b) =>
            {
                return Err(err("symbol index out of range"))
            }
            OpCode::Alias if !sym_ok(ops.a) || !sym_ok(ops.b) => {
                return Err(err("symbol index out of range"))
            }
            OpCode::Undef if !sym_ok(ops.a) => return Err(err("symbol index out of range")),
            OpCode::Lambda | OpCode::Block | OpCode::Method | OpCode::Exec
                if (ops.b as usize) >= self.reps.len() =>
            {
                return Err(err("child index out of range"))
            }
            _ => {}
        }
        if let Some(target) = inst.jump_target() {
            if target < 0 || target as usize > self.iseq.len() {
                return Err(err("jump target out of range"));
            }
        }
        Ok(())
    }

    /// Total number of units in this tree
    pub fn unit_count(&self) -> usize {
        1 + self.reps.iter().map(|r| r.unit_count()).sum::<usize>()
    }
}

/// Argument signature decoded from the `ENTER` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgSpec(pub u32);

impl ArgSpec {
    pub fn new(req: u32, opt: u32, rest: bool, post: u32, key: u32, kdict: bool, block: bool) -> Self {
        ArgSpec(
            (req & 0x1f) << 18
                | (opt & 0x1f) << 13
                | (rest as u32) << 12
                | (post & 0x1f) << 7
                | (key & 0x1f) << 2
                | (kdict as u32) << 1
                | block as u32,
        )
    }

    /// Only `n` mandatory arguments
    pub fn required(n: u32) -> Self {
        Self::new(n, 0, false, 0, 0, false, false)
    }

    pub fn req(self) -> usize {
        (self.0 >> 18 & 0x1f) as usize
    }

    pub fn opt(self) -> usize {
        (self.0 >> 13 & 0x1f) as usize
    }

    pub fn rest(self) -> bool {
        self.0 >> 12 & 1 == 1
    }

    pub fn post(self) -> usize {
        (self.0 >> 7 & 0x1f) as usize
    }

    pub fn key(self) -> usize {
        (self.0 >> 2 & 0x1f) as usize
    }

    pub fn kdict(self) -> bool {
        self.0 >> 1 & 1 == 1
    }

    pub fn block(self) -> bool {
        self.0 & 1 == 1
    }

    /// Whether the method takes keywords in any form
    pub fn has_keywords(self) -> bool {
        self.key() > 0 || self.kdict()
    }
}

impl Display for Irep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.disassemble(f, &mut vec![])
    }
}

impl Irep {
    fn disassemble(&self, f: &mut fmt::Formatter<'_>, path: &mut Vec<usize>) -> fmt::Result {
        write!(f, "irep")?;
        for p in path.iter() {
            write!(f, ".{}", p)?;
        }
        writeln!(
            f,
            " nlocals={} nregs={} iseq={}",
            self.nlocals,
            self.nregs,
            self.iseq.len()
        )?;
        for h in &self.catch_handlers {
            writeln!(
                f,
                "  catch {:?} ({:03}, {:03}] -> {:03}",
                h.kind, h.begin, h.end, h.target
            )?;
        }
        for inst in self.insts() {
            let mut line = format!("  {:03} {:<10}", inst.pc, inst.op.mnemonic());
            self.write_operands(&inst, &mut line)?;
            writeln!(f, "{}", line.trim_end())?;
        }
        for (i, child) in self.reps.iter().enumerate() {
            path.push(i);
            child.disassemble(f, path)?;
            path.pop();
        }
        Ok(())
    }

    fn write_operands(&self, inst: &Inst, out: &mut String) -> fmt::Result {
        let ops = inst.operands;
        if let Some(target) = inst.jump_target() {
            if inst.op.format() == OperandFormat::BS {
                write!(out, "R{} ", ops.a)?;
            }
            return write!(out, "-> {:03}", target);
        }
        let sym = |i: u32| self.sym(i).map_or(Cow::Borrowed("?"), String::from_utf8_lossy);
        match inst.op {
            OpCode::LoadSym
            | OpCode::GetGV
            | OpCode::SetGV
            | OpCode::GetIV
            | OpCode::SetIV
            | OpCode::GetConst
            | OpCode::SetConst
            | OpCode::GetMCnst
            | OpCode::SetMCnst
            | OpCode::Def
            | OpCode::Class
            | OpCode::Module
            | OpCode::KArg
            | OpCode::KeyP => write!(out, "R{} :{}", ops.a, sym(ops.b)),
            OpCode::SSend | OpCode::SSendB | OpCode::Send | OpCode::SendB => {
                write!(out, "R{} :{} {}", ops.a, sym(ops.b), ops.c & 0xf)?;
                if ops.c >> 4 > 0 {
                    write!(out, " k{}", ops.c >> 4)?;
                }
                Ok(())
            }
            OpCode::LoadI16 => write!(out, "R{} {}", ops.a, ops.b_signed()),
            OpCode::LoadI32 => write!(out, "R{} {}", ops.a, (ops.b << 16 | ops.c) as i32),
            OpCode::Enter => {
                let s = ArgSpec(ops.a);
                write!(
                    out,
                    "{}:{}:{}:{}:{}:{}:{}",
                    s.req(),
                    s.opt(),
                    s.rest() as u8,
                    s.post(),
                    s.key(),
                    s.kdict() as u8,
                    s.block() as u8
                )
            }
            _ => match inst.op.format() {
                OperandFormat::Z => Ok(()),
                OperandFormat::B => write!(out, "R{}", ops.a),
                OperandFormat::BB => write!(out, "R{} {}", ops.a, ops.b),
                OperandFormat::BBB => write!(out, "R{} {} {}", ops.a, ops.b, ops.c),
                OperandFormat::BS => write!(out, "R{} {}", ops.a, ops.b),
                OperandFormat::BSS => write!(out, "R{} {} {}", ops.a, ops.b, ops.c),
                OperandFormat::S | OperandFormat::W => write!(out, "{}", ops.a),
            },
        }
    }
}

#[cfg(test)]
mod test;
