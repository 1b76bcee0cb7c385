//! An assembler for code units, for hosts and tests that need bytecode
//! without going through the compiler.

use std::sync::Arc;

use bytes::Bytes;
use fnv::FnvHashMap;
use smol_str::SmolStr;

use crate::inst::{InstContainerMut, JumpOperand, OpCode, Operands};
use crate::irep::{ArgSpec, CatchHandler, CatchKind, Irep, PoolValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

struct Fixup {
    /// Address of the 16-bit offset operand
    at: usize,
    /// Address the offset is relative to
    from: usize,
    label: Label,
}

struct PendingCatch {
    kind: CatchKind,
    begin: Label,
    end: Label,
    target: Label,
}

pub struct IrepBuilder {
    nlocals: u16,
    nregs: u16,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    catches: Vec<PendingCatch>,
    pool: Vec<PoolValue>,
    syms: Vec<Option<Bytes>>,
    sym_index: FnvHashMap<SmolStr, u32>,
    reps: Vec<Arc<Irep>>,
}

impl IrepBuilder {
    pub fn new(nlocals: u16, nregs: u16) -> IrepBuilder {
        assert!(nlocals >= 1, "register 0 always holds self");
        assert!(nregs >= nlocals);
        IrepBuilder {
            nlocals,
            nregs,
            code: vec![],
            labels: vec![],
            fixups: vec![],
            catches: vec![],
            pool: vec![],
            syms: vec![],
            sym_index: FnvHashMap::default(),
            reps: vec![],
        }
    }

    /// Current emit address
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Intern `name` into the symbol table, returning its index
    pub fn sym(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.sym_index.get(name) {
            return idx;
        }
        let idx = self.syms.len() as u32;
        self.syms.push(Some(Bytes::copy_from_slice(name.as_bytes())));
        self.sym_index.insert(SmolStr::new(name), idx);
        idx
    }

    fn push_pool(&mut self, v: PoolValue) -> u32 {
        if let Some(idx) = self.pool.iter().position(|p| p == &v) {
            return idx as u32;
        }
        self.pool.push(v);
        (self.pool.len() - 1) as u32
    }

    pub fn string(&mut self, s: &str) -> u32 {
        self.push_pool(PoolValue::Str(Bytes::copy_from_slice(s.as_bytes())))
    }

    pub fn int(&mut self, i: i64) -> u32 {
        self.push_pool(PoolValue::Int(i))
    }

    pub fn float(&mut self, f: f64) -> u32 {
        self.push_pool(PoolValue::Float(f))
    }

    pub fn child(&mut self, irep: Arc<Irep>) -> u32 {
        self.reps.push(irep);
        (self.reps.len() - 1) as u32
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current address
    pub fn bind(&mut self, label: Label) -> &mut Self {
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label bound twice");
        *slot = Some(self.code.len());
        self
    }

    /// A fresh label bound to the current address
    pub fn mark(&mut self) -> Label {
        let l = self.label();
        self.bind(l);
        l
    }

    pub fn emit_ops(&mut self, op: OpCode, ops: &[u32]) -> &mut Self {
        let format = op.format();
        assert_eq!(ops.len(), format.arity(), "operand count of {}", op);
        assert!(op.jump_operand().is_none(), "use `jump` for {}", op);
        for (v, limit) in ops.iter().zip(format.limits()) {
            assert!(*v <= limit, "operand {} out of range for {}", v, op);
        }
        let get = |i: usize| ops.get(i).copied().unwrap_or(0);
        self.code.emit(op, Operands::new(get(0), get(1), get(2)));
        self
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.emit_ops(op, &[])
    }

    pub fn op_a(&mut self, op: OpCode, a: u32) -> &mut Self {
        self.emit_ops(op, &[a])
    }

    pub fn op_ab(&mut self, op: OpCode, a: u32, b: u32) -> &mut Self {
        self.emit_ops(op, &[a, b])
    }

    pub fn op_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> &mut Self {
        self.emit_ops(op, &[a, b, c])
    }

    /// Emit a jump to `label`. `reg` is the tested register of conditional jumps.
    pub fn jump(&mut self, op: OpCode, reg: Option<u32>, label: Label) -> &mut Self {
        let which = op
            .jump_operand()
            .unwrap_or_else(|| panic!("{} is not a jump", op));
        let start = self.code.len();
        match which {
            JumpOperand::A => {
                assert!(reg.is_none());
                self.code.emit(op, Operands::default());
            }
            JumpOperand::B => {
                let reg = reg.expect("conditional jump needs a register");
                self.code.emit(op, Operands::new(reg, 0, 0));
            }
        }
        let next = self.code.len();
        self.fixups.push(Fixup {
            at: next - 2,
            from: next,
            label,
        });
        debug_assert_eq!(next - start, op.len());
        self
    }

    pub fn enter(&mut self, spec: ArgSpec) -> &mut Self {
        self.emit_ops(OpCode::Enter, &[spec.0])
    }

    /// Load an integer literal using the shortest encoding.
    pub fn load_int(&mut self, reg: u32, i: i64) -> &mut Self {
        match i {
            -1..=7 => {
                let op = OpCode::from_byte((OpCode::LoadI0 as u8 as i64 + i) as u8)
                    .expect("LOADI_n opcodes are contiguous");
                self.op_a(op, reg)
            }
            8..=255 => self.op_ab(OpCode::LoadI8, reg, i as u32),
            -255..=-2 => self.op_ab(OpCode::LoadINeg, reg, (-i) as u32),
            -32768..=32767 => self.op_ab(OpCode::LoadI16, reg, i as i16 as u16 as u32),
            _ if i32::try_from(i).is_ok() => {
                let bits = i as i32 as u32;
                self.op_abc(OpCode::LoadI32, reg, bits >> 16, bits & 0xffff)
            }
            _ => {
                let idx = self.int(i);
                self.op_ab(OpCode::LoadL, reg, idx)
            }
        }
    }

    pub fn load_float(&mut self, reg: u32, f: f64) -> &mut Self {
        let idx = self.float(f);
        self.op_ab(OpCode::LoadL, reg, idx)
    }

    pub fn load_sym(&mut self, reg: u32, name: &str) -> &mut Self {
        let idx = self.sym(name);
        self.op_ab(OpCode::LoadSym, reg, idx)
    }

    pub fn load_string(&mut self, reg: u32, s: &str) -> &mut Self {
        let idx = self.string(s);
        self.op_ab(OpCode::String, reg, idx)
    }

    /// `R[a] = R[a].name(R[a+1]..R[a+argc])`
    pub fn send(&mut self, a: u32, name: &str, argc: u32) -> &mut Self {
        let idx = self.sym(name);
        self.op_abc(OpCode::Send, a, idx, argc)
    }

    /// Like [`send`](Self::send) with a block in `R[a+argc+1]`
    pub fn send_block(&mut self, a: u32, name: &str, argc: u32) -> &mut Self {
        let idx = self.sym(name);
        self.op_abc(OpCode::SendB, a, idx, argc)
    }

    /// `R[a] = self.name(R[a+1]..R[a+argc])`
    pub fn ssend(&mut self, a: u32, name: &str, argc: u32) -> &mut Self {
        let idx = self.sym(name);
        self.op_abc(OpCode::SSend, a, idx, argc)
    }

    pub fn ssend_block(&mut self, a: u32, name: &str, argc: u32) -> &mut Self {
        let idx = self.sym(name);
        self.op_abc(OpCode::SSendB, a, idx, argc)
    }

    /// Emit `DEF` of `child` named `name` on the class in `R[a]`, using `R[a+1]`
    /// as scratch.
    pub fn def(&mut self, a: u32, name: &str, child: Arc<Irep>) -> &mut Self {
        let idx = self.child(child);
        self.op_ab(OpCode::Method, a + 1, idx);
        let sym = self.sym(name);
        self.op_ab(OpCode::Def, a, sym)
    }

    /// Register a catch handler protecting `(begin, end]`.
    pub fn catch(&mut self, kind: CatchKind, begin: Label, end: Label, target: Label) -> &mut Self {
        self.catches.push(PendingCatch {
            kind,
            begin,
            end,
            target,
        });
        self
    }

    fn resolve(&self, label: Label) -> usize {
        self.labels[label.0].unwrap_or_else(|| panic!("label {} never bound", label.0))
    }

    /// Resolve labels and produce the code unit. Panics on unbound labels or
    /// jumps whose offset does not fit the operand.
    pub fn build(mut self) -> Arc<Irep> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.resolve(fixup.label) as isize;
            let offset = target - fixup.from as isize;
            let offset = i16::try_from(offset).expect("jump offset out of range");
            self.code[fixup.at..fixup.at + 2].copy_from_slice(&offset.to_be_bytes());
        }
        let catch_handlers = self
            .catches
            .iter()
            .map(|c| CatchHandler {
                kind: c.kind,
                begin: self.resolve(c.begin) as u32,
                end: self.resolve(c.end) as u32,
                target: self.resolve(c.target) as u32,
            })
            .collect();
        Arc::new(Irep {
            nlocals: self.nlocals,
            nregs: self.nregs,
            iseq: Bytes::from(self.code),
            catch_handlers,
            pool: self.pool,
            syms: self.syms,
            reps: self.reps,
        })
    }
}

#[cfg(test)]
mod test;
